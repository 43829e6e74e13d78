use serde::{Deserialize, Serialize};

/// A recursive endpoint: one layer's context stacked on the next layer's
/// endpoint.
///
/// Comparison order is part of the contract: set-state first, then this
/// layer's context, then the next layer — the field order below, so the
/// derived impls are exactly that.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint<C, N> {
    set: bool,
    context: C,
    next: N,
}

// === impl Endpoint ===

impl<C, N> Endpoint<C, N> {
    pub fn new(context: C, next: N) -> Self {
        Self {
            set: true,
            context,
            next,
        }
    }

    pub fn is_set(&self) -> bool {
        self.set
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn next(&self) -> &N {
        &self.next
    }

    pub fn into_parts(self) -> (C, N) {
        (self.context, self.next)
    }
}

impl<C: Default, N: Default> Default for Endpoint<C, N> {
    fn default() -> Self {
        Self {
            set: false,
            context: C::default(),
            next: N::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_orders_before_set() {
        let unset = Endpoint::<u8, ()>::default();
        let set = Endpoint::new(0u8, ());
        assert!(unset < set);
    }

    #[test]
    fn equality_requires_set_context_and_next() {
        let a = Endpoint::new(1u8, Endpoint::new(2u8, ()));
        let b = Endpoint::new(1u8, Endpoint::new(2u8, ()));
        let c = Endpoint::new(1u8, Endpoint::new(3u8, ()));
        let d = Endpoint::new(4u8, Endpoint::new(2u8, ()));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(a, Endpoint::default());
    }

    #[test]
    fn ordering_prefers_context_over_next() {
        let low_ctx = Endpoint::new(1u8, Endpoint::new(9u8, ()));
        let high_ctx = Endpoint::new(2u8, Endpoint::new(0u8, ()));
        assert!(low_ctx < high_ctx);
    }
}

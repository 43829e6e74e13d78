#[cfg(test)]
use skein_error::ErrorKind;
use skein_error::Result;
use skein_stack::{params, Endpoint, ParamStack, Params};

pub type CircuitEndpoint<N> = Endpoint<CircuitContext, N>;

/// The circuit endpoint context.
///
/// `forward` marks intermediate hops: their acceptors relay flagged
/// connections onward instead of surfacing them. `next_nodes` is the
/// ordered remaining-hop list, one parameter stack per hop, the real
/// server last.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CircuitContext {
    pub id: String,
    pub details: String,
    pub forward: bool,
    pub default_parameters: ParamStack,
    pub next_nodes: Vec<ParamStack>,
}

// === impl CircuitContext ===

impl CircuitContext {
    pub(crate) fn resolve(params: &mut ParamStack, layer: &str) -> Result<Self> {
        let map = params.pop_layer(layer)?;
        let id = skein_stack::required(&map, "circuit_id")?.to_string();
        let next_nodes = match map.get("next_nodes") {
            Some(s) => ParamStack::parse_list(s)?,
            None => Vec::new(),
        };
        let default_parameters = match map.get("default_parameters") {
            Some(s) => ParamStack::parse(s)?,
            None => ParamStack::new(),
        };
        Ok(Self {
            id,
            details: map.get("details").cloned().unwrap_or_default(),
            forward: map.get("forward").map(|v| v == "true").unwrap_or(false),
            default_parameters,
            next_nodes,
        })
    }

    pub(crate) fn params(&self, layer: &str) -> Params {
        let mut map = params!["layer" => layer, "circuit_id" => self.id];
        if !self.details.is_empty() {
            map.insert("details".into(), self.details.clone());
        }
        if self.forward {
            map.insert("forward".into(), "true".into());
        }
        if !self.default_parameters.is_empty() {
            map.insert(
                "default_parameters".into(),
                self.default_parameters.serialize(),
            );
        }
        if !self.next_nodes.is_empty() {
            map.insert(
                "next_nodes".into(),
                ParamStack::serialize_list(&self.next_nodes),
            );
        }
        map
    }

    /// Reads the circuit id off the head of a hop's parameter stack
    /// without consuming it.
    pub(crate) fn peek_id(stack: &ParamStack) -> Result<String> {
        let mut probe = stack.clone();
        let map = probe.pop_layer("circuit")?;
        skein_stack::required(&map, "circuit_id").map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop_stack(id: &str, port: u16) -> ParamStack {
        let mut stack = ParamStack::new();
        stack.push(params!["layer" => "circuit", "circuit_id" => id]);
        stack.push(params!["layer" => "tcp", "addr" => "127.0.0.1", "port" => port]);
        stack
    }

    #[test]
    fn resolve_round_trips_hop_lists() {
        let hops = vec![hop_stack("h2", 8001), hop_stack("server", 9000)];
        let mut stack = ParamStack::new();
        stack.push(params![
            "layer" => "circuit",
            "circuit_id" => "h1",
            "next_nodes" => ParamStack::serialize_list(&hops),
        ]);
        let context = CircuitContext::resolve(&mut stack, "circuit").expect("resolve");
        assert_eq!(context.id, "h1");
        assert_eq!(context.next_nodes, hops);

        let mut again = ParamStack::new();
        again.push(context.params("circuit"));
        let reparsed = CircuitContext::resolve(&mut again, "circuit").expect("re-resolve");
        assert_eq!(reparsed, context);
    }

    #[test]
    fn hop_serialization_is_stable() {
        let hops = vec![hop_stack("a", 1), hop_stack("b", 2)];
        let s = ParamStack::serialize_list(&hops);
        let reparsed = ParamStack::parse_list(&s).expect("parse");
        assert_eq!(ParamStack::serialize_list(&reparsed), s);
    }

    #[test]
    fn peek_id_leaves_the_stack_intact() {
        let stack = hop_stack("h2", 8001);
        assert_eq!(CircuitContext::peek_id(&stack).expect("peek"), "h2");
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn missing_id_is_missing_config() {
        let mut stack = ParamStack::new();
        stack.push(params!["layer" => "circuit"]);
        assert!(CircuitContext::resolve(&mut stack, "circuit")
            .expect_err("no id")
            .is(ErrorKind::MissingConfigParameters));
    }
}

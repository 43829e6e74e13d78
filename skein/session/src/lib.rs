//! Tracks actionable sessions so shutdown can stop them all.

#![deny(warnings, rust_2018_idioms)]

use skein_error::{Error, ErrorKind, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace};

/// Something the manager can start once and stop later (a forwarder, a
/// service loop).
pub trait Session: Send + Sync + 'static {
    /// Begins the session's work. The handle lets the session retire
    /// itself from the manager when it finishes on its own.
    fn start(&self, handle: SessionHandle) -> Result<()>;

    /// Stops the session's work. Must be idempotent.
    fn stop(&self);
}

/// Registry of active sessions, each under a monotonic nonzero id.
///
/// The manager holds the only strong references it needs to execute `stop`
/// at shutdown; sessions otherwise manage their own lifetimes.
#[derive(Default)]
pub struct ItemManager {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_id: u32,
    items: HashMap<u32, Arc<dyn Session>>,
}

/// A session's link back to its manager.
#[derive(Clone)]
pub struct SessionHandle {
    manager: Weak<ItemManager>,
    id: u32,
}

// === impl ItemManager ===

impl ItemManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts and registers a session, returning its id.
    pub fn start(self: &Arc<Self>, item: Arc<dyn Session>) -> Result<u32> {
        let id = {
            let mut state = self.state.lock().expect("manager lock");
            let id = state
                .next_id
                .checked_add(1)
                .ok_or_else(|| Error::new(ErrorKind::DeviceOrResourceBusy))?;
            state.next_id = id;
            state.items.insert(id, item.clone());
            id
        };
        trace!(session.id = id, "starting session");
        let handle = SessionHandle {
            manager: Arc::downgrade(self),
            id,
        };
        if let Err(e) = item.start(handle) {
            self.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Stops the session registered under `id`.
    pub fn stop_with_id(&self, id: u32) -> Result<()> {
        let item = self
            .remove(id)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument))?;
        debug!(session.id = id, "stopping session");
        item.stop();
        Ok(())
    }

    /// Stops every registered session.
    pub fn stop_all(&self) {
        let items = {
            let mut state = self.state.lock().expect("manager lock");
            std::mem::take(&mut state.items)
        };
        debug!(sessions = items.len(), "stopping all sessions");
        for (_, item) in items {
            item.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("manager lock").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u32) -> Option<Arc<dyn Session>> {
        self.state.lock().expect("manager lock").items.remove(&id)
    }
}

// === impl SessionHandle ===

impl SessionHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Unregisters the session without invoking `stop`; called by sessions
    /// that finished on their own.
    pub fn retire(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self.id);
        }
    }
}

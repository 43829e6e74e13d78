//! Shared support for the end-to-end scenario tests.

#![deny(warnings, rust_2018_idioms)]

use skein_stack::{ParamStack, Params};
use skein_tls::test_util::{Ca, Identity};

/// Installs a fmt subscriber once so failing scenarios are debuggable.
pub fn trace_init() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                std::env::var("SKEIN_LOG").unwrap_or_else(|_| "warn".to_string()),
            )
            .try_init();
    });
}

/// One CA and two identities, shared by both sides of a scenario.
pub struct TlsFixture {
    pub ca: Ca,
    pub server_id: Identity,
    pub client_id: Identity,
}

// === impl TlsFixture ===

impl TlsFixture {
    pub fn new() -> Self {
        let ca = Ca::new();
        Self {
            server_id: ca.issue("localhost"),
            client_id: ca.issue("localhost"),
            ca,
        }
    }

    pub fn server_params(&self) -> Params {
        self.ca.tls_params(&self.server_id, "localhost")
    }

    pub fn client_params(&self) -> Params {
        self.ca.tls_params(&self.client_id, "localhost")
    }
}

impl Default for TlsFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A parameter stack ending in a TCP bind map.
pub fn tcp_bind(port: u16) -> Params {
    let mut map = Params::new();
    map.insert("layer".into(), "tcp".into());
    map.insert("port".into(), port.to_string());
    map
}

/// A parameter stack ending in a TCP connect map.
pub fn tcp_connect(host: &str, port: u16) -> Params {
    let mut map = tcp_bind(port);
    map.insert("addr".into(), host.into());
    map
}

/// Builds a stack from maps, top layer first.
pub fn stack_of(maps: Vec<Params>) -> ParamStack {
    ParamStack::from(maps)
}

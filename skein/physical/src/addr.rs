use serde::{Deserialize, Serialize};
use skein_error::{Error, ErrorKind, Result};
use skein_stack::{ParamStack, Params};
use std::net::SocketAddr;

/// The context of a physical endpoint: an optional host (present for
/// connect endpoints, absent for bind endpoints) and a port.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysicalContext {
    pub host: Option<String>,
    pub port: u16,
}

/// Addresses a remote as `host:port`. Layers that tunnel (proxy CONNECT)
/// use this to name the target carried in the endpoint below them.
pub trait HostPort {
    fn host(&self) -> Option<&str>;
    fn port(&self) -> u16;
}

// TCP and UDP endpoints share this context, so one impl covers both.
impl HostPort for skein_stack::Endpoint<PhysicalContext, ()> {
    fn host(&self) -> Option<&str> {
        self.context().host.as_deref()
    }

    fn port(&self) -> u16 {
        self.context().port
    }
}

// === impl PhysicalContext ===

impl PhysicalContext {
    pub(crate) fn resolve(params: &mut ParamStack, layer: &str) -> Result<Self> {
        let map = params.pop_layer(layer)?;
        let port = skein_stack::required_parsed::<u16>(&map, "port")?;
        let host = map.get("addr").cloned();
        Ok(Self { host, port })
    }

    pub(crate) fn params(&self, layer: &str) -> Params {
        let mut map = Params::new();
        map.insert("layer".into(), layer.into());
        if let Some(ref host) = self.host {
            map.insert("addr".into(), host.clone());
        }
        map.insert("port".into(), self.port.to_string());
        map
    }

    /// The local address this context binds: wildcard host, given port.
    pub(crate) fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Resolves the remote address for connect/send.
    pub(crate) async fn lookup(&self) -> Result<SocketAddr> {
        let host = self
            .host
            .as_deref()
            .ok_or_else(|| Error::new(ErrorKind::BadAddress))?;
        tokio::net::lookup_host((host, self.port))
            .await
            .map_err(|e| Error::with_source(ErrorKind::BadAddress, e))?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::BadAddress))
    }
}

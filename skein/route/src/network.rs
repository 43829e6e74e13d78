use crate::interface::{Interface, InterfaceEndpoint, InterfaceSocket};
use async_trait::async_trait;
use skein_error::{Error, ErrorKind, Result};
use skein_stack::{params, DatagramSocket, DatagramTransport, Endpoint, ParamStack, Params};
use std::collections::HashSet;
use std::convert::TryInto;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Bytes of `(source_id, dest_id)` framing per datagram.
const HEADER_LEN: usize = 4;

/// The network endpoint context: a 16-bit id on an interface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkContext {
    pub network_id: u16,
}

pub type NetworkEndpoint<N> = Endpoint<NetworkContext, InterfaceEndpoint<N>>;

/// The network layer: stamps datagrams with source and destination ids
/// and filters on receive. Several network sockets share one interface.
#[derive(Clone)]
pub struct Network<N: DatagramTransport> {
    next: Interface<N>,
    bound: Arc<Mutex<HashSet<(String, u16)>>>,
}

// === impl Network ===

impl<N: DatagramTransport> Network<N> {
    pub fn new(next: Interface<N>) -> Self {
        Self {
            next,
            bound: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn next(&self) -> &Interface<N> {
        &self.next
    }

    fn claim(&self, interface_id: &str, network_id: u16) -> Result<()> {
        let mut bound = self.bound.lock().expect("network bind set");
        if !bound.insert((interface_id.to_string(), network_id)) {
            return Err(Error::new(ErrorKind::AddressInUse));
        }
        Ok(())
    }
}

#[async_trait]
impl<N: DatagramTransport> DatagramTransport for Network<N> {
    const ID: u8 = 13;
    const NAME: &'static str = "network";
    const OVERHEAD: usize = HEADER_LEN;

    type Endpoint = NetworkEndpoint<N::Endpoint>;
    type Socket = NetworkSocket<N>;

    fn mtu(&self) -> usize {
        self.next.mtu() - Self::OVERHEAD
    }

    fn stack_depth(&self) -> usize {
        1 + self.next.stack_depth()
    }

    fn resolve(&self, params: &mut ParamStack) -> Result<Self::Endpoint> {
        let map = params.pop_layer(Self::NAME)?;
        let network_id = skein_stack::required_parsed(&map, "network_id")?;
        let next = self.next.resolve(params)?;
        Ok(Endpoint::new(NetworkContext { network_id }, next))
    }

    fn endpoint_params(&self, endpoint: &Self::Endpoint) -> ParamStack {
        let mut stack = ParamStack::new();
        stack.push(endpoint.context().params(Self::NAME));
        stack.append(self.next.endpoint_params(endpoint.next()));
        stack
    }

    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Socket> {
        let id = endpoint.context().network_id;
        let interface_id = &endpoint.next().context().interface_id;
        self.claim(interface_id, id)?;
        let iface = match self.next.attach_or_bind(endpoint.next()).await {
            Ok(iface) => iface,
            Err(e) => {
                self.release(interface_id, id);
                return Err(e);
            }
        };
        Ok(NetworkSocket {
            local_id: id,
            remote_id: None,
            iface,
            network: self.clone(),
        })
    }

    async fn connect(&self, endpoint: &Self::Endpoint) -> Result<Self::Socket> {
        // `endpoint` names the remote id; the local id is ephemeral and
        // not registered.
        let iface = self.next.attach_or_bind(endpoint.next()).await?;
        Ok(NetworkSocket {
            local_id: 0,
            remote_id: Some(endpoint.context().network_id),
            iface,
            network: self.clone(),
        })
    }
}

impl<N: DatagramTransport> Network<N> {
    fn release(&self, interface_id: &str, network_id: u16) {
        self.bound
            .lock()
            .expect("network bind set")
            .remove(&(interface_id.to_string(), network_id));
    }
}

impl NetworkContext {
    fn params(&self, layer: &str) -> Params {
        params!["layer" => layer, "network_id" => self.network_id]
    }
}

/// A network socket: one id over a (possibly shared) interface.
pub struct NetworkSocket<N: DatagramTransport> {
    local_id: u16,
    remote_id: Option<u16>,
    iface: InterfaceSocket<N>,
    network: Network<N>,
}

impl<N: DatagramTransport> std::fmt::Debug for NetworkSocket<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSocket")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .finish()
    }
}

// === impl NetworkSocket ===

impl<N: DatagramTransport> NetworkSocket<N> {
    pub fn local_id(&self) -> u16 {
        self.local_id
    }

    fn frame(&self, dest: u16, buf: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_LEN + buf.len());
        frame.extend_from_slice(&self.local_id.to_le_bytes());
        frame.extend_from_slice(&dest.to_le_bytes());
        frame.extend_from_slice(buf);
        frame
    }

    /// Receives the next frame addressed to this socket's id, discarding
    /// frames for other ids on the shared interface.
    async fn recv_filtered(&self, buf: &mut [u8]) -> Result<(usize, u16)> {
        let mut storage = vec![0u8; HEADER_LEN + self.network.mtu()];
        loop {
            let n = self.iface.recv(&mut storage).await?;
            if n < HEADER_LEN {
                trace!(bytes = n, "runt network frame dropped");
                continue;
            }
            let source = u16::from_le_bytes(storage[0..2].try_into().expect("2 bytes"));
            let dest = u16::from_le_bytes(storage[2..4].try_into().expect("2 bytes"));
            if dest != self.local_id {
                trace!(dest, local = self.local_id, "frame for another id dropped");
                continue;
            }
            let payload = &storage[HEADER_LEN..n];
            if payload.len() > buf.len() {
                return Err(Error::new(ErrorKind::MessageSize));
            }
            buf[..payload.len()].copy_from_slice(payload);
            return Ok((payload.len(), source));
        }
    }
}

impl<N: DatagramTransport> Drop for NetworkSocket<N> {
    fn drop(&mut self) {
        self.network
            .release(self.iface.interface_id(), self.local_id);
    }
}

#[async_trait]
impl<N: DatagramTransport> DatagramSocket for NetworkSocket<N> {
    type Endpoint = NetworkEndpoint<N::Endpoint>;

    async fn send_to(&self, buf: &[u8], dst: &Self::Endpoint) -> Result<usize> {
        if buf.len() > self.network.mtu() {
            return Err(Error::new(ErrorKind::MessageSize));
        }
        let frame = self.frame(dst.context().network_id, buf);
        let n = self.iface.send_to(&frame, dst.next()).await?;
        Ok(n.saturating_sub(HEADER_LEN))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Self::Endpoint)> {
        let (n, source) = self.recv_filtered(buf).await?;
        let from = Endpoint::new(
            NetworkContext { network_id: source },
            self.iface.local_endpoint()?,
        );
        Ok((n, from))
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        if buf.len() > self.network.mtu() {
            return Err(Error::new(ErrorKind::MessageSize));
        }
        let dest = self
            .remote_id
            .ok_or_else(|| Error::new(ErrorKind::NotConnected))?;
        let frame = self.frame(dest, buf);
        let n = self.iface.send(&frame).await?;
        Ok(n.saturating_sub(HEADER_LEN))
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _source) = self.recv_filtered(buf).await?;
        Ok(n)
    }

    fn local_endpoint(&self) -> Result<Self::Endpoint> {
        Ok(Endpoint::new(
            NetworkContext {
                network_id: self.local_id,
            },
            self.iface.local_endpoint()?,
        ))
    }

    async fn close(&self) -> Result<()> {
        self.iface.close().await
    }
}

use async_trait::async_trait;
use skein_error::{Error, ErrorKind, Result};
use skein_stack::{params, DatagramSocket, DatagramTransport, Endpoint, ParamStack, Params};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace};

/// The interface endpoint context: just a name.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceContext {
    pub interface_id: String,
}

pub type InterfaceEndpoint<N> = Endpoint<InterfaceContext, N>;

/// Tracks live interfaces by name. An entry exists while any holder of
/// the underlying socket is alive; a second live bind of the same name is
/// refused.
pub struct InterfaceRegistry<N: DatagramTransport> {
    inner: Arc<Mutex<HashMap<String, Weak<N::Socket>>>>,
}

// === impl InterfaceRegistry ===

impl<N: DatagramTransport> InterfaceRegistry<N> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The live socket registered under `name`, if any. Prunes dead
    /// entries as a side effect.
    fn live(&self, name: &str) -> Option<Arc<N::Socket>> {
        let mut map = self.inner.lock().expect("interface registry lock");
        map.retain(|_, weak| weak.strong_count() > 0);
        map.get(name).and_then(Weak::upgrade)
    }

    fn insert(&self, name: &str, socket: &Arc<N::Socket>) -> Result<()> {
        let mut map = self.inner.lock().expect("interface registry lock");
        map.retain(|_, weak| weak.strong_count() > 0);
        if map.contains_key(name) {
            return Err(Error::new(ErrorKind::AddressInUse));
        }
        map.insert(name.to_string(), Arc::downgrade(socket));
        Ok(())
    }

    pub fn len(&self) -> usize {
        let mut map = self.inner.lock().expect("interface registry lock");
        map.retain(|_, weak| weak.strong_count() > 0);
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<N: DatagramTransport> Clone for InterfaceRegistry<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: DatagramTransport> Default for InterfaceRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The interface layer: binds the next layer once per name.
#[derive(Clone)]
pub struct Interface<N: DatagramTransport> {
    next: N,
    registry: InterfaceRegistry<N>,
}

// === impl Interface ===

impl<N: DatagramTransport> Interface<N> {
    pub fn new(next: N, registry: InterfaceRegistry<N>) -> Self {
        Self { next, registry }
    }

    pub fn registry(&self) -> &InterfaceRegistry<N> {
        &self.registry
    }

    /// Shares the live interface of the same name, or binds a fresh one.
    /// Upper layers attach through this so one interface can carry many
    /// sockets.
    pub async fn attach_or_bind(
        &self,
        endpoint: &InterfaceEndpoint<N::Endpoint>,
    ) -> Result<InterfaceSocket<N>> {
        let name = &endpoint.context().interface_id;
        if let Some(inner) = self.registry.live(name) {
            trace!(interface = %name, "sharing live interface");
            return Ok(InterfaceSocket {
                context: endpoint.context().clone(),
                inner,
            });
        }
        self.bind(endpoint).await
    }
}

#[async_trait]
impl<N: DatagramTransport> DatagramTransport for Interface<N> {
    const ID: u8 = 12;
    const NAME: &'static str = "interface";
    const OVERHEAD: usize = 0;

    type Endpoint = InterfaceEndpoint<N::Endpoint>;
    type Socket = InterfaceSocket<N>;

    fn mtu(&self) -> usize {
        self.next.mtu()
    }

    fn stack_depth(&self) -> usize {
        1 + self.next.stack_depth()
    }

    fn resolve(&self, params: &mut ParamStack) -> Result<Self::Endpoint> {
        let map = params.pop_layer(Self::NAME)?;
        let interface_id = skein_stack::required(&map, "interface_id")?.to_string();
        let next = self.next.resolve(params)?;
        Ok(Endpoint::new(InterfaceContext { interface_id }, next))
    }

    fn endpoint_params(&self, endpoint: &Self::Endpoint) -> ParamStack {
        let mut stack = ParamStack::new();
        stack.push(endpoint.context().params(Self::NAME));
        stack.append(self.next.endpoint_params(endpoint.next()));
        stack
    }

    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Socket> {
        let name = &endpoint.context().interface_id;
        let inner = Arc::new(self.next.bind(endpoint.next()).await?);
        self.registry.insert(name, &inner)?;
        debug!(interface = %name, "interface bound");
        Ok(InterfaceSocket {
            context: endpoint.context().clone(),
            inner,
        })
    }

    async fn connect(&self, endpoint: &Self::Endpoint) -> Result<Self::Socket> {
        let name = &endpoint.context().interface_id;
        let inner = Arc::new(self.next.connect(endpoint.next()).await?);
        self.registry.insert(name, &inner)?;
        debug!(interface = %name, "interface connected");
        Ok(InterfaceSocket {
            context: endpoint.context().clone(),
            inner,
        })
    }
}

impl InterfaceContext {
    fn params(&self, layer: &str) -> Params {
        params!["layer" => layer, "interface_id" => self.interface_id]
    }
}

/// A named datagram socket, possibly shared between several holders.
pub struct InterfaceSocket<N: DatagramTransport> {
    context: InterfaceContext,
    inner: Arc<N::Socket>,
}

impl<N: DatagramTransport> std::fmt::Debug for InterfaceSocket<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceSocket")
            .field("context", &self.context)
            .finish()
    }
}

// === impl InterfaceSocket ===

impl<N: DatagramTransport> InterfaceSocket<N> {
    pub fn interface_id(&self) -> &str {
        &self.context.interface_id
    }
}

impl<N: DatagramTransport> Clone for InterfaceSocket<N> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl<N: DatagramTransport> DatagramSocket for InterfaceSocket<N> {
    type Endpoint = InterfaceEndpoint<N::Endpoint>;

    async fn send_to(&self, buf: &[u8], dst: &Self::Endpoint) -> Result<usize> {
        self.inner.send_to(buf, dst.next()).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Self::Endpoint)> {
        let (n, from) = self.inner.recv_from(buf).await?;
        Ok((n, Endpoint::new(self.context.clone(), from)))
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.inner.send(buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.recv(buf).await
    }

    fn local_endpoint(&self) -> Result<Self::Endpoint> {
        Ok(Endpoint::new(
            self.context.clone(),
            self.inner.local_endpoint()?,
        ))
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

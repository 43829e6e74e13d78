use crate::network::{Network, NetworkEndpoint, NetworkSocket};
use async_trait::async_trait;
use skein_error::{Error, ErrorKind, Result};
use skein_stack::{params, DatagramSocket, DatagramTransport, Endpoint, ParamStack, Params};
use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Bytes of `(source, dest)` network-address framing per routed datagram.
const HEADER_LEN: usize = 8;
/// Per-address receive queue depth; overflow drops the newest datagram.
const QUEUE_DEPTH: usize = 128;

/// The routing endpoint context: a 32-bit network address on a named
/// router.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutedContext {
    pub router: String,
    pub network_address: u32,
}

pub type RoutedEndpoint<N> = Endpoint<RoutedContext, NetworkEndpoint<N>>;

/// Tracks named routers. Explicit context object, one per process scope
/// that wants isolation.
pub struct RouterRegistry<N: DatagramTransport> {
    inner: Arc<Mutex<HashMap<String, Arc<Router<N>>>>>,
}

// === impl RouterRegistry ===

impl<N: DatagramTransport> RouterRegistry<N> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<Router<N>> {
        let mut map = self.inner.lock().expect("router registry lock");
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(Router::new(name)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Router<N>>> {
        self.inner
            .lock()
            .expect("router registry lock")
            .get(name)
            .cloned()
    }
}

impl<N: DatagramTransport> Clone for RouterRegistry<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: DatagramTransport> Default for RouterRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes datagrams between interfaces by destination network address:
/// locally bound addresses deliver to their receive queue, everything
/// else resolves through the table to an egress interface.
pub struct Router<N: DatagramTransport> {
    name: String,
    locals: Mutex<HashMap<u32, mpsc::Sender<(u32, Vec<u8>)>>>,
    table: Mutex<HashMap<u32, Arc<NetworkSocket<N>>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

// === impl Router ===

impl<N: DatagramTransport> Router<N> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            locals: Mutex::new(HashMap::new()),
            table: Mutex::new(HashMap::new()),
            pumps: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a table route: datagrams for `dest` leave through `egress`.
    pub fn add_route(&self, dest: u32, egress: Arc<NetworkSocket<N>>) {
        debug!(router = %self.name, dest, "route added");
        self.table.lock().expect("router table lock").insert(dest, egress);
    }

    pub fn remove_route(&self, dest: u32) {
        self.table.lock().expect("router table lock").remove(&dest);
    }

    fn bind_local(&self, address: u32) -> Result<mpsc::Receiver<(u32, Vec<u8>)>> {
        let mut locals = self.locals.lock().expect("router locals lock");
        if locals.contains_key(&address) {
            return Err(Error::new(ErrorKind::AddressInUse));
        }
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        locals.insert(address, tx);
        Ok(rx)
    }

    fn unbind_local(&self, address: u32) {
        self.locals.lock().expect("router locals lock").remove(&address);
    }

    /// Spawns a pump that drains `ingress` and routes every datagram.
    pub fn attach_interface(self: &Arc<Self>, ingress: Arc<NetworkSocket<N>>) {
        let router = self.clone();
        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match ingress.recv(&mut buf).await {
                    Ok(n) => {
                        if let Err(e) = router.route_frame(&buf[..n]).await {
                            trace!(error = %e, "frame not routed");
                        }
                    }
                    Err(e) => {
                        debug!(router = %router.name, error = %e, "pump stopped");
                        return;
                    }
                }
            }
        });
        self.pumps.lock().expect("router pumps lock").push(pump);
    }

    /// Routes one already-framed datagram.
    async fn route_frame(&self, frame: &[u8]) -> Result<()> {
        if frame.len() < HEADER_LEN {
            return Err(Error::new(ErrorKind::ProtocolError));
        }
        let source = u32::from_le_bytes(frame[0..4].try_into().expect("4 bytes"));
        let dest = u32::from_le_bytes(frame[4..8].try_into().expect("4 bytes"));
        let payload = &frame[HEADER_LEN..];
        self.route(source, dest, payload).await
    }

    /// Delivers locally or forwards through the table.
    async fn route(&self, source: u32, dest: u32, payload: &[u8]) -> Result<()> {
        let local = self
            .locals
            .lock()
            .expect("router locals lock")
            .get(&dest)
            .cloned();
        if let Some(queue) = local {
            // Queue full: drop, per the windowed queue-drop policy.
            if queue.try_send((source, payload.to_vec())).is_err() {
                warn!(router = %self.name, dest, "receive queue full, dropping");
            }
            return Ok(());
        }

        let egress = self.table.lock().expect("router table lock").get(&dest).cloned();
        match egress {
            Some(egress) => {
                let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
                frame.extend_from_slice(&source.to_le_bytes());
                frame.extend_from_slice(&dest.to_le_bytes());
                frame.extend_from_slice(payload);
                egress.send(&frame).await?;
                Ok(())
            }
            None => Err(Error::new(ErrorKind::NoLink)),
        }
    }

    fn stop(&self) {
        for pump in self.pumps.lock().expect("router pumps lock").drain(..) {
            pump.abort();
        }
    }
}

impl<N: DatagramTransport> Drop for Router<N> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The routing layer over the network layer.
#[derive(Clone)]
pub struct Routed<N: DatagramTransport> {
    next: Network<N>,
    registry: RouterRegistry<N>,
}

// === impl Routed ===

impl<N: DatagramTransport> Routed<N> {
    pub fn new(next: Network<N>, registry: RouterRegistry<N>) -> Self {
        Self { next, registry }
    }

    pub fn registry(&self) -> &RouterRegistry<N> {
        &self.registry
    }
}

#[async_trait]
impl<N: DatagramTransport> DatagramTransport for Routed<N> {
    const ID: u8 = 14;
    const NAME: &'static str = "routing";
    const OVERHEAD: usize = HEADER_LEN;

    type Endpoint = RoutedEndpoint<N::Endpoint>;
    type Socket = RoutedSocket<N>;

    fn mtu(&self) -> usize {
        self.next.mtu() - Self::OVERHEAD
    }

    fn stack_depth(&self) -> usize {
        1 + self.next.stack_depth()
    }

    fn resolve(&self, params: &mut ParamStack) -> Result<Self::Endpoint> {
        let map = params.pop_layer(Self::NAME)?;
        let context = RoutedContext {
            router: skein_stack::required(&map, "router")?.to_string(),
            network_address: skein_stack::required_parsed(&map, "network_address")?,
        };
        let next = self.next.resolve(params)?;
        Ok(Endpoint::new(context, next))
    }

    fn endpoint_params(&self, endpoint: &Self::Endpoint) -> ParamStack {
        let mut stack = ParamStack::new();
        stack.push(endpoint.context().params(Self::NAME));
        stack.append(self.next.endpoint_params(endpoint.next()));
        stack
    }

    /// Binds the network socket beneath, attaches it to the named router
    /// as an ingress interface, and claims the local network address.
    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Socket> {
        let context = endpoint.context();
        let router = self.registry.get_or_create(&context.router);
        let queue = router.bind_local(context.network_address)?;
        let ingress = match self.next.bind(endpoint.next()).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                router.unbind_local(context.network_address);
                return Err(e);
            }
        };
        router.attach_interface(ingress.clone());
        Ok(RoutedSocket {
            context: context.clone(),
            router,
            queue: tokio::sync::Mutex::new(queue),
            ingress,
        })
    }

    async fn connect(&self, endpoint: &Self::Endpoint) -> Result<Self::Socket> {
        self.bind(endpoint).await
    }
}

impl RoutedContext {
    fn params(&self, layer: &str) -> Params {
        params![
            "layer" => layer,
            "router" => self.router,
            "network_address" => self.network_address,
        ]
    }
}

/// A datagram socket bound to a network address on a router.
pub struct RoutedSocket<N: DatagramTransport> {
    context: RoutedContext,
    router: Arc<Router<N>>,
    queue: tokio::sync::Mutex<mpsc::Receiver<(u32, Vec<u8>)>>,
    ingress: Arc<NetworkSocket<N>>,
}

// === impl RoutedSocket ===

impl<N: DatagramTransport> RoutedSocket<N> {
    pub fn router(&self) -> &Arc<Router<N>> {
        &self.router
    }

    /// The ingress network socket, for installing as another router's
    /// egress.
    pub fn network_socket(&self) -> &Arc<NetworkSocket<N>> {
        &self.ingress
    }
}

impl<N: DatagramTransport> Drop for RoutedSocket<N> {
    fn drop(&mut self) {
        self.router.unbind_local(self.context.network_address);
    }
}

#[async_trait]
impl<N: DatagramTransport> DatagramSocket for RoutedSocket<N> {
    type Endpoint = RoutedEndpoint<N::Endpoint>;

    async fn send_to(&self, buf: &[u8], dst: &Self::Endpoint) -> Result<usize> {
        if dst.context().router != self.context.router {
            return Err(Error::new(ErrorKind::NetworkDown));
        }
        self.router
            .route(self.context.network_address, dst.context().network_address, buf)
            .await?;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Self::Endpoint)> {
        let (source, payload) = self
            .queue
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::new(ErrorKind::NetworkDown))?;
        if payload.len() > buf.len() {
            return Err(Error::new(ErrorKind::MessageSize));
        }
        buf[..payload.len()].copy_from_slice(&payload);
        let from = Endpoint::new(
            RoutedContext {
                router: self.context.router.clone(),
                network_address: source,
            },
            self.ingress.local_endpoint()?,
        );
        Ok((payload.len(), from))
    }

    async fn send(&self, _buf: &[u8]) -> Result<usize> {
        // Routed sockets are unconnected; destinations are explicit.
        Err(Error::new(ErrorKind::NotConnected))
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _from) = self.recv_from(buf).await?;
        Ok(n)
    }

    fn local_endpoint(&self) -> Result<Self::Endpoint> {
        Ok(Endpoint::new(
            self.context.clone(),
            self.ingress.local_endpoint()?,
        ))
    }

    async fn close(&self) -> Result<()> {
        self.router.unbind_local(self.context.network_address);
        self.ingress.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Interface, InterfaceRegistry};
    use skein_physical::Udp;

    fn routed() -> Routed<Udp> {
        let interfaces = Interface::new(Udp::new(), InterfaceRegistry::new());
        Routed::new(Network::new(interfaces), RouterRegistry::new())
    }

    fn endpoint(
        layer: &Routed<Udp>,
        router: &str,
        address: u32,
        network_id: u16,
        interface: &str,
        port_params: (&str, u16),
    ) -> RoutedEndpoint<skein_physical::UdpEndpoint> {
        let mut stack = ParamStack::new();
        stack.push(params![
            "layer" => "routing",
            "router" => router,
            "network_address" => address,
        ]);
        stack.push(params!["layer" => "network", "network_id" => network_id]);
        stack.push(params!["layer" => "interface", "interface_id" => interface]);
        let (key, port) = port_params;
        if key == "addr" {
            stack.push(params!["layer" => "udp", "addr" => "127.0.0.1", "port" => port]);
        } else {
            stack.push(params!["layer" => "udp", "port" => port]);
        }
        layer.resolve(&mut stack).expect("resolve")
    }

    #[tokio::test]
    async fn local_delivery_between_addresses() {
        let layer = routed();
        let a = layer
            .bind(&endpoint(&layer, "r", 1, 1, "if-a", ("port", 0)))
            .await
            .expect("bind a");
        let b = layer
            .bind(&endpoint(&layer, "r", 2, 2, "if-b", ("port", 0)))
            .await
            .expect("bind b");

        let dst = endpoint(&layer, "r", 2, 2, "if-b2", ("port", 0));
        a.send_to(b"hello b", &dst).await.expect("send");

        let mut buf = [0u8; 32];
        let (n, from) = b.recv_from(&mut buf).await.expect("recv");
        assert_eq!(&buf[..n], b"hello b");
        assert_eq!(from.context().network_address, 1);
    }

    #[tokio::test]
    async fn duplicate_address_is_address_in_use() {
        let layer = routed();
        let _held = layer
            .bind(&endpoint(&layer, "r", 1, 1, "if-a", ("port", 0)))
            .await
            .expect("bind");
        let err = layer
            .bind(&endpoint(&layer, "r", 1, 2, "if-b", ("port", 0)))
            .await
            .expect_err("dup address");
        assert!(err.is(ErrorKind::AddressInUse));
    }

    #[tokio::test]
    async fn unrouteable_address_is_no_link() {
        let layer = routed();
        let a = layer
            .bind(&endpoint(&layer, "r", 1, 1, "if-a", ("port", 0)))
            .await
            .expect("bind");
        let dst = endpoint(&layer, "r", 99, 2, "if-x", ("port", 0));
        let err = a.send_to(b"nowhere", &dst).await.expect_err("no route");
        assert!(err.is(ErrorKind::NoLink));
    }

    #[tokio::test]
    async fn table_route_forwards_between_routers() {
        // Two routers in one process, linked by UDP: r1's egress for
        // address 2 is a network socket connected to r2's interface.
        let layer = routed();

        let receiver = layer
            .bind(&endpoint(&layer, "r2", 2, 5, "r2-in", ("port", 0)))
            .await
            .expect("bind receiver");
        let r2_port = receiver
            .network_socket()
            .local_endpoint()
            .expect("local")
            .next()
            .next()
            .context()
            .port;

        let sender = layer
            .bind(&endpoint(&layer, "r1", 1, 5, "r1-in", ("port", 0)))
            .await
            .expect("bind sender");

        // Egress from r1 toward r2's UDP port, same network id.
        let mut egress_stack = ParamStack::new();
        egress_stack.push(params!["layer" => "network", "network_id" => 5u16]);
        egress_stack.push(params!["layer" => "interface", "interface_id" => "r1-out"]);
        egress_stack.push(params!["layer" => "udp", "addr" => "127.0.0.1", "port" => r2_port]);
        let network = Network::new(Interface::new(Udp::new(), InterfaceRegistry::new()));
        let egress = Arc::new(
            network
                .connect(&network.resolve(&mut egress_stack).expect("egress ep"))
                .await
                .expect("egress"),
        );
        sender.router().add_route(2, egress);

        let dst = endpoint(&layer, "r1", 2, 5, "unused", ("port", 0));
        sender.send_to(b"across routers", &dst).await.expect("send");

        let mut buf = [0u8; 64];
        let (n, from) = receiver.recv_from(&mut buf).await.expect("recv");
        assert_eq!(&buf[..n], b"across routers");
        assert_eq!(from.context().network_address, 1);
    }
}

use crate::addr::PhysicalContext;
use async_trait::async_trait;
use skein_error::{Error, ErrorKind, Result};
use skein_stack::{Acceptor, Endpoint, ParamStack, Transport};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, trace};

pub type TcpEndpoint = Endpoint<PhysicalContext, ()>;

/// The terminal TCP layer.
#[derive(Clone, Debug, Default)]
pub struct Tcp(());

// === impl Tcp ===

impl Tcp {
    pub fn new() -> Self {
        Self(())
    }
}

#[async_trait]
impl Transport for Tcp {
    const ID: u8 = 1;
    const NAME: &'static str = "tcp";
    const OVERHEAD: usize = 0;

    type Endpoint = TcpEndpoint;
    type Io = TcpStream;
    type Acceptor = TcpAcceptor;

    fn mtu(&self) -> usize {
        // A stream layer; bounded only by what one frame-building caller
        // may reasonably buffer.
        65536
    }

    fn stack_depth(&self) -> usize {
        1
    }

    fn resolve(&self, params: &mut ParamStack) -> Result<Self::Endpoint> {
        let context = PhysicalContext::resolve(params, Self::NAME)?;
        Ok(Endpoint::new(context, ()))
    }

    fn endpoint_params(&self, endpoint: &Self::Endpoint) -> ParamStack {
        let mut stack = ParamStack::new();
        stack.push(endpoint.context().params(Self::NAME));
        stack
    }

    async fn connect(&self, endpoint: &Self::Endpoint) -> Result<Self::Io> {
        let addr = endpoint.context().lookup().await?;
        trace!(%addr, "connecting");
        let stream = TcpStream::connect(addr).await.map_err(Error::from)?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Acceptor> {
        let addr = endpoint.context().bind_addr();
        let listener = listen_reuse_addr(addr)?;
        let local = listener.local_addr().map_err(Error::from)?;
        debug!(%local, "listening");
        let (close_tx, close_rx) = watch::channel(false);
        Ok(TcpAcceptor {
            listener,
            local: Endpoint::new(
                PhysicalContext {
                    host: None,
                    port: local.port(),
                },
                (),
            ),
            close_tx,
            close_rx,
        })
    }
}

/// Binds a listener with SO_REUSEADDR so restarting servers can rebind
/// without waiting out TIME_WAIT.
fn listen_reuse_addr(addr: SocketAddr) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::ipv4(),
        socket2::Type::stream(),
        Some(socket2::Protocol::tcp()),
    )
    .map_err(Error::from)?;
    socket.set_reuse_address(true).map_err(Error::from)?;
    socket.bind(&addr.into()).map_err(Error::from)?;
    socket.listen(1024).map_err(Error::from)?;
    let std_listener: std::net::TcpListener = socket.into_tcp_listener();
    std_listener.set_nonblocking(true).map_err(Error::from)?;
    TcpListener::from_std(std_listener).map_err(Error::from)
}

/// Accepts TCP peers until closed.
pub struct TcpAcceptor {
    listener: TcpListener,
    local: TcpEndpoint,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
}

// === impl TcpAcceptor ===

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Io = TcpStream;
    type Endpoint = TcpEndpoint;

    async fn accept(&self) -> Result<(Self::Io, Self::Endpoint)> {
        let mut closed = self.close_rx.clone();
        if *closed.borrow() {
            return Err(Error::new(ErrorKind::Interrupted));
        }
        tokio::select! {
            res = self.listener.accept() => {
                let (stream, peer) = res.map_err(Error::from)?;
                stream.set_nodelay(true).ok();
                trace!(%peer, "accepted");
                let endpoint = Endpoint::new(
                    PhysicalContext {
                        host: Some(peer.ip().to_string()),
                        port: peer.port(),
                    },
                    (),
                );
                Ok((stream, endpoint))
            }
            _ = closed.changed() => Err(Error::new(ErrorKind::Interrupted)),
        }
    }

    fn local_endpoint(&self) -> Self::Endpoint {
        self.local.clone()
    }

    async fn close(&self) -> Result<()> {
        self.close_tx.send(true).ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_io::{AsyncReadExt, AsyncWriteExt};
    use skein_stack::params;

    fn connect_endpoint(port: u16) -> TcpEndpoint {
        Endpoint::new(
            PhysicalContext {
                host: Some("127.0.0.1".into()),
                port,
            },
            (),
        )
    }

    #[test]
    fn protocol_constants() {
        assert_eq!(Tcp::ID, 1);
        assert_eq!(Tcp::OVERHEAD, 0);
        assert!(matches!(Tcp::FACILITIES, skein_stack::Facilities::Stream));
        assert_eq!(Tcp::new().stack_depth(), 1);
    }

    #[test]
    fn resolve_connect_and_bind_forms() {
        let tcp = Tcp::new();

        let mut stack = ParamStack::new();
        stack.push(params!["layer" => "tcp", "addr" => "127.0.0.1", "port" => "9000"]);
        let ep = tcp.resolve(&mut stack).expect("resolve");
        assert_eq!(ep.context().host.as_deref(), Some("127.0.0.1"));
        assert_eq!(ep.context().port, 9000);

        let mut stack = ParamStack::new();
        stack.push(params!["port" => "9000"]);
        let ep = tcp.resolve(&mut stack).expect("resolve bind");
        assert_eq!(ep.context().host, None);

        let mut stack = ParamStack::new();
        stack.push(params!["addr" => "127.0.0.1"]);
        assert!(tcp
            .resolve(&mut stack)
            .expect_err("port required")
            .is(ErrorKind::MissingConfigParameters));
    }

    #[test]
    fn endpoint_params_round_trip() {
        let tcp = Tcp::new();
        let ep = connect_endpoint(9000);
        let mut params = tcp.endpoint_params(&ep);
        assert_eq!(tcp.resolve(&mut params).expect("round trip"), ep);
    }

    #[tokio::test]
    async fn loopback_ping_pong() {
        let tcp = Tcp::new();
        let acceptor = tcp
            .bind(&Endpoint::new(PhysicalContext { host: None, port: 0 }, ()))
            .await
            .expect("bind");
        let port = acceptor.local_endpoint().context().port;

        let server = tokio::spawn(async move {
            let (mut stream, _peer) = acceptor.accept().await.expect("accept");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.expect("read ping");
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.expect("write pong");
        });

        let mut client = tcp.connect(&connect_endpoint(port)).await.expect("connect");
        client.write_all(b"ping").await.expect("write ping");
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.expect("read pong");
        assert_eq!(&buf, b"pong");
        server.await.expect("server");
    }

    #[tokio::test]
    async fn close_cancels_pending_accept() {
        let tcp = Tcp::new();
        let acceptor = std::sync::Arc::new(
            tcp.bind(&Endpoint::new(PhysicalContext { host: None, port: 0 }, ()))
                .await
                .expect("bind"),
        );

        let pending = {
            let acceptor = acceptor.clone();
            tokio::spawn(async move { acceptor.accept().await })
        };
        tokio::task::yield_now().await;
        acceptor.close().await.expect("close");
        let err = pending.await.expect("join").expect_err("interrupted");
        assert!(err.is(ErrorKind::Interrupted));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_refused() {
        let tcp = Tcp::new();
        // Bind then immediately drop to find a port that is very likely
        // closed.
        let acceptor = tcp
            .bind(&Endpoint::new(PhysicalContext { host: None, port: 0 }, ()))
            .await
            .expect("bind");
        let port = acceptor.local_endpoint().context().port;
        drop(acceptor);

        let err = tcp
            .connect(&connect_endpoint(port))
            .await
            .expect_err("refused");
        assert!(err.is(ErrorKind::ConnectionRefused));
    }
}

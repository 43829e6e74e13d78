use crate::addr::PhysicalContext;
use async_trait::async_trait;
use skein_error::{Error, ErrorKind, Result};
use skein_stack::{DatagramSocket, DatagramTransport, Endpoint, ParamStack};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

pub type UdpEndpoint = Endpoint<PhysicalContext, ()>;

/// The terminal UDP layer. Stateless; one datagram per send/receive.
#[derive(Clone, Debug, Default)]
pub struct Udp(());

// === impl Udp ===

impl Udp {
    pub fn new() -> Self {
        Self(())
    }

    async fn bound(&self, endpoint: &UdpEndpoint) -> Result<UdpSocket> {
        let socket = tokio::net::UdpSocket::bind(endpoint.context().bind_addr())
            .await
            .map_err(Error::from)?;
        let (close_tx, close_rx) = watch::channel(false);
        Ok(UdpSocket {
            socket: Arc::new(socket),
            close_tx: Arc::new(close_tx),
            close_rx,
        })
    }
}

#[async_trait]
impl DatagramTransport for Udp {
    const ID: u8 = 11;
    const NAME: &'static str = "udp";
    const OVERHEAD: usize = 0;

    type Endpoint = UdpEndpoint;
    type Socket = UdpSocket;

    fn mtu(&self) -> usize {
        // Maximum UDP payload over IPv4.
        65507
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

    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Socket> {
        self.bound(endpoint).await
    }

    async fn connect(&self, endpoint: &Self::Endpoint) -> Result<Self::Socket> {
        let remote = endpoint.context().lookup().await?;
        let socket = self
            .bound(&Endpoint::new(PhysicalContext { host: None, port: 0 }, ()))
            .await?;
        socket.socket.connect(remote).await.map_err(Error::from)?;
        Ok(socket)
    }
}

/// A bound UDP socket.
#[derive(Clone)]
pub struct UdpSocket {
    socket: Arc<tokio::net::UdpSocket>,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
}

// === impl UdpSocket ===

impl UdpSocket {
    fn check_open(&self) -> Result<()> {
        if *self.close_rx.borrow() {
            return Err(Error::new(ErrorKind::BadFileDescriptor));
        }
        Ok(())
    }
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    type Endpoint = UdpEndpoint;

    async fn send_to(&self, buf: &[u8], dst: &Self::Endpoint) -> Result<usize> {
        self.check_open()?;
        let addr = dst.context().lookup().await?;
        self.socket.send_to(buf, addr).await.map_err(Error::from)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Self::Endpoint)> {
        self.check_open()?;
        let mut storage = vec![0u8; 65536];
        let mut closed = self.close_rx.clone();
        let (n, peer) = tokio::select! {
            res = self.socket.recv_from(&mut storage) => res.map_err(Error::from)?,
            _ = closed.changed() => return Err(Error::new(ErrorKind::OperationAborted)),
        };
        if n > buf.len() {
            return Err(Error::new(ErrorKind::MessageSize));
        }
        buf[..n].copy_from_slice(&storage[..n]);
        trace!(bytes = n, %peer, "received datagram");
        let endpoint = Endpoint::new(
            PhysicalContext {
                host: Some(peer.ip().to_string()),
                port: peer.port(),
            },
            (),
        );
        Ok((n, endpoint))
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        self.socket.send(buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotConnected {
                Error::new(ErrorKind::NotConnected)
            } else {
                Error::from(e)
            }
        })
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _peer) = self.recv_from(buf).await?;
        Ok(n)
    }

    fn local_endpoint(&self) -> Result<Self::Endpoint> {
        let local = self.socket.local_addr().map_err(Error::from)?;
        Ok(Endpoint::new(
            PhysicalContext {
                host: None,
                port: local.port(),
            },
            (),
        ))
    }

    async fn close(&self) -> Result<()> {
        self.close_tx.send(true).ok();
        Ok(())
    }
}

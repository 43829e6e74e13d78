use crate::context::{TlsContext, TlsParams};
use async_trait::async_trait;
use skein_error::{Error, ErrorKind, Result};
use skein_stack::{Acceptor, Endpoint, ParamStack, Transport};
use tokio_rustls::TlsStream;
use tracing::{debug, trace};

pub type TlsEndpoint<N> = Endpoint<TlsContext, N>;

/// The thin TLS layer: handshake on connect/accept, then the engine is
/// driven directly. Engine access is serialized by construction — the
/// stream is owned exclusively, and split halves never run the same
/// direction concurrently.
#[derive(Clone, Debug)]
pub struct Tls<N> {
    next: N,
}

// === impl Tls ===

impl<N> Tls<N> {
    pub fn new(next: N) -> Self {
        Self { next }
    }

    pub fn next(&self) -> &N {
        &self.next
    }
}

impl<N: Transport> Tls<N> {
    pub(crate) async fn client_handshake(
        context: &TlsContext,
        io: N::Io,
    ) -> Result<TlsStream<N::Io>> {
        let connector = tokio_rustls::TlsConnector::from(context.client_config());
        let name = context.peer_name()?;
        trace!(peer = ?name, "tls client handshake");
        let stream = connector
            .connect(name, io)
            .await
            .map_err(|e| Error::with_source(ErrorKind::BadAddress, e))?;
        Ok(TlsStream::Client(stream))
    }

    pub(crate) async fn server_handshake(
        context: &TlsContext,
        io: N::Io,
    ) -> Result<TlsStream<N::Io>> {
        let acceptor = tokio_rustls::TlsAcceptor::from(context.server_config());
        let stream = acceptor
            .accept(io)
            .await
            .map_err(|e| Error::with_source(ErrorKind::BadAddress, e))?;
        debug!("accepted tls connection");
        Ok(TlsStream::Server(stream))
    }

    pub(crate) fn resolve_endpoint(&self, params: &mut ParamStack) -> Result<TlsEndpoint<N::Endpoint>> {
        let tls = TlsParams::resolve(params, <Self as Transport>::NAME)?;
        let context = TlsContext::assemble(tls)?;
        let next = self.next.resolve(params)?;
        Ok(Endpoint::new(context, next))
    }

    pub(crate) fn params_of(&self, endpoint: &TlsEndpoint<N::Endpoint>) -> ParamStack {
        let mut stack = ParamStack::new();
        stack.push(endpoint.context().params().params(<Self as Transport>::NAME));
        stack.append(self.next.endpoint_params(endpoint.next()));
        stack
    }
}

#[async_trait]
impl<N: Transport> Transport for Tls<N> {
    const ID: u8 = 3;
    const NAME: &'static str = "tls";
    // TLS records add framing below the application payload; data moved
    // per call is otherwise unbounded.
    const OVERHEAD: usize = 0;

    type Endpoint = TlsEndpoint<N::Endpoint>;
    type Io = TlsStream<N::Io>;
    type Acceptor = TlsAcceptor<N>;

    fn mtu(&self) -> usize {
        self.next.mtu() - Self::OVERHEAD
    }

    fn stack_depth(&self) -> usize {
        1 + self.next.stack_depth()
    }

    fn resolve(&self, params: &mut ParamStack) -> Result<Self::Endpoint> {
        self.resolve_endpoint(params)
    }

    fn endpoint_params(&self, endpoint: &Self::Endpoint) -> ParamStack {
        self.params_of(endpoint)
    }

    async fn connect(&self, endpoint: &Self::Endpoint) -> Result<Self::Io> {
        let io = self.next.connect(endpoint.next()).await?;
        Self::client_handshake(endpoint.context(), io).await
    }

    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Acceptor> {
        let next = self.next.bind(endpoint.next()).await?;
        Ok(TlsAcceptor {
            next,
            context: endpoint.context().clone(),
        })
    }
}

/// Accepts next-layer peers and completes the server-side handshake before
/// yielding the stream.
pub struct TlsAcceptor<N: Transport> {
    next: N::Acceptor,
    context: TlsContext,
}

// === impl TlsAcceptor ===

#[async_trait]
impl<N: Transport> Acceptor for TlsAcceptor<N> {
    type Io = TlsStream<N::Io>;
    type Endpoint = TlsEndpoint<N::Endpoint>;

    async fn accept(&self) -> Result<(Self::Io, Self::Endpoint)> {
        let (io, peer) = self.next.accept().await?;
        let io = Tls::<N>::server_handshake(&self.context, io).await?;
        Ok((io, Endpoint::new(self.context.clone(), peer)))
    }

    fn local_endpoint(&self) -> Self::Endpoint {
        Endpoint::new(self.context.clone(), self.next.local_endpoint())
    }

    async fn close(&self) -> Result<()> {
        self.next.close().await
    }
}

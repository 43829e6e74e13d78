use crate::context::{CircuitContext, CircuitEndpoint};
use crate::wire::{self, InitConnection, VALIDATE_OK, VALIDATE_REFUSED};
use async_trait::async_trait;
use skein_duplex::SessionForwarder;
use skein_error::{Error, ErrorKind, Result};
use skein_session::ItemManager;
use skein_stack::{Acceptor, Endpoint, ParamStack, Transport};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Terminal connections waiting for `accept` beyond this are refused.
const BACKLOG: usize = 128;

/// A circuit acceptor with both roles of a split acceptor: `forward`
/// flagged inits are spliced onward in the background (when the bound
/// context carries the forward role), terminal inits surface from
/// `accept`.
pub struct CircuitAcceptor<N: Transport> {
    inner: Arc<Inner<N>>,
    queue: Mutex<mpsc::Receiver<(N::Io, CircuitEndpoint<N::Endpoint>)>>,
    accept_loop: JoinHandle<()>,
}

struct Inner<N: Transport> {
    transport: N,
    next: N::Acceptor,
    context: CircuitContext,
    local: CircuitEndpoint<N::Endpoint>,
    manager: Arc<ItemManager>,
}

// === impl CircuitAcceptor ===

impl<N: Transport> CircuitAcceptor<N> {
    pub(crate) async fn bind(
        transport: N,
        endpoint: CircuitEndpoint<N::Endpoint>,
        manager: Arc<ItemManager>,
    ) -> Result<Self> {
        let next = transport.bind(endpoint.next()).await?;
        let local = Endpoint::new(
            endpoint.context().clone(),
            next.local_endpoint(),
        );
        let inner = Arc::new(Inner {
            transport,
            next,
            context: endpoint.context().clone(),
            local,
            manager,
        });
        let (tx, rx) = mpsc::channel(BACKLOG);
        let accept_loop = tokio::spawn(accept_loop(inner.clone(), tx));
        Ok(Self {
            inner,
            queue: Mutex::new(rx),
            accept_loop,
        })
    }

    /// The session manager splicing this acceptor's forwarded circuits.
    pub fn manager(&self) -> &Arc<ItemManager> {
        &self.inner.manager
    }
}

#[async_trait]
impl<N: Transport> Acceptor for CircuitAcceptor<N> {
    type Io = N::Io;
    type Endpoint = CircuitEndpoint<N::Endpoint>;

    async fn accept(&self) -> Result<(Self::Io, Self::Endpoint)> {
        self.queue
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::new(ErrorKind::Interrupted))
    }

    fn local_endpoint(&self) -> Self::Endpoint {
        self.inner.local.clone()
    }

    async fn close(&self) -> Result<()> {
        self.accept_loop.abort();
        self.inner.manager.stop_all();
        self.inner.next.close().await
    }
}

impl<N: Transport> Drop for CircuitAcceptor<N> {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

/// Accepts next-layer peers continuously; each connection's init decides
/// whether it forwards or terminates here.
async fn accept_loop<N: Transport>(
    inner: Arc<Inner<N>>,
    terminal: mpsc::Sender<(N::Io, CircuitEndpoint<N::Endpoint>)>,
) {
    loop {
        match inner.next.accept().await {
            Ok((io, peer)) => {
                let inner = inner.clone();
                let terminal = terminal.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(inner, terminal, io, peer).await {
                        debug!(error = %e, "circuit connection failed");
                    }
                });
            }
            Err(e) if e.is(ErrorKind::Interrupted) => return,
            Err(e) => {
                // One peer's failed transport handshake must not kill the
                // acceptor.
                warn!(error = %e, "circuit accept failed");
            }
        }
    }
}

async fn handle_connection<N: Transport>(
    inner: Arc<Inner<N>>,
    terminal: mpsc::Sender<(N::Io, CircuitEndpoint<N::Endpoint>)>,
    mut io: N::Io,
    peer: N::Endpoint,
) -> Result<()> {
    let init = wire::read_init(&mut io).await?;
    trace!(hop.id = %init.id, forward = init.forward != 0, "incoming circuit init");

    if init.forward != 0 {
        if !inner.context.forward {
            debug!(hop.id = %init.id, "forward refused: acceptor has no forward role");
            wire::write_validate(&mut io, VALIDATE_REFUSED).await?;
            return Ok(());
        }
        return forward_connection(inner, io, init).await;
    }

    if init.id != inner.context.id {
        debug!(hop.id = %init.id, bound.id = %inner.context.id, "unknown circuit id");
        wire::write_validate(&mut io, VALIDATE_REFUSED).await?;
        return Ok(());
    }
    wire::write_validate(&mut io, VALIDATE_OK).await?;
    let endpoint = Endpoint::new(
        CircuitContext {
            id: init.id,
            ..CircuitContext::default()
        },
        peer,
    );
    terminal
        .send((io, endpoint))
        .await
        .map_err(|_| Error::new(ErrorKind::Interrupted))
}

/// Connects the next hop named at the head of the remaining list, then
/// splices upstream and downstream.
async fn forward_connection<N: Transport>(
    inner: Arc<Inner<N>>,
    mut upstream: N::Io,
    init: InitConnection,
) -> Result<()> {
    let outbound = async {
        let mut stack: ParamStack = init
            .remaining
            .first()
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::ProtocolError))?;
        // The head map names the next hop's circuit id; the rest is its
        // transport endpoint.
        let hop = stack.pop_layer("circuit")?;
        let hop_id = skein_stack::required(&hop, "circuit_id")?.to_string();
        let next_endpoint = inner.transport.resolve(&mut stack)?;
        trace!(next.id = %hop_id, "forwarding circuit");
        inner.transport.connect(&next_endpoint).await
    }
    .await;

    match outbound {
        Ok(outbound) => {
            wire::write_validate(&mut upstream, VALIDATE_OK).await?;
            inner
                .manager
                .start(SessionForwarder::new(upstream, outbound))?;
            Ok(())
        }
        Err(e) => {
            debug!(error = %e, "next hop unreachable");
            wire::write_validate(&mut upstream, VALIDATE_REFUSED).await?;
            Ok(())
        }
    }
}

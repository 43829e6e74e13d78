//! The data-link circuit layer.
//!
//! A circuit chains N transport hops: the client negotiates each hop in
//! order on one logical byte stream, every intermediate upgrades itself
//! into a plain forwarder once validated, and the last hop terminates at
//! the real server. Intermediates splice upstream and downstream via the
//! session forwarder under an item manager.

#![deny(warnings, rust_2018_idioms)]

mod acceptor;
mod context;
mod wire;

pub use self::acceptor::CircuitAcceptor;
pub use self::context::{CircuitContext, CircuitEndpoint};
pub use self::wire::{InitConnection, VALIDATE_OK};

use async_trait::async_trait;
use skein_error::{Error, ErrorKind, Result};
use skein_session::ItemManager;
use skein_stack::{Endpoint, ParamStack, Transport};
use std::sync::Arc;
use tracing::{debug, trace};

/// The circuit layer over a stream transport.
#[derive(Clone)]
pub struct Circuit<N> {
    next: N,
    manager: Arc<ItemManager>,
}

/// The blessed full composition, named the way deployments stack it.
pub type CircuitOverTlsOverTcp = Circuit<skein_tls::Tls<skein_physical::Tcp>>;

// === impl Circuit ===

impl<N> Circuit<N> {
    pub fn new(next: N) -> Self {
        Self {
            next,
            manager: ItemManager::new(),
        }
    }

    /// Shares a session manager with the rest of the process so shutdown
    /// can stop forwarders from one place.
    pub fn with_manager(next: N, manager: Arc<ItemManager>) -> Self {
        Self { next, manager }
    }

    pub fn manager(&self) -> &Arc<ItemManager> {
        &self.manager
    }
}

#[async_trait]
impl<N: Transport> Transport for Circuit<N> {
    const ID: u8 = 5;
    const NAME: &'static str = "circuit";
    const OVERHEAD: usize = 0;

    type Endpoint = CircuitEndpoint<N::Endpoint>;
    type Io = N::Io;
    type Acceptor = CircuitAcceptor<N>;

    fn mtu(&self) -> usize {
        self.next.mtu()
    }

    fn stack_depth(&self) -> usize {
        1 + self.next.stack_depth()
    }

    fn resolve(&self, params: &mut ParamStack) -> Result<Self::Endpoint> {
        let context = CircuitContext::resolve(params, Self::NAME)?;
        let next = self.next.resolve(params)?;
        Ok(Endpoint::new(context, next))
    }

    fn endpoint_params(&self, endpoint: &Self::Endpoint) -> ParamStack {
        let mut stack = ParamStack::new();
        stack.push(endpoint.context().params(Self::NAME));
        stack.append(self.next.endpoint_params(endpoint.next()));
        stack
    }

    /// Negotiates every hop in order on the same byte stream. Any nonzero
    /// validate status aborts the chain; dropping the stream unwinds the
    /// partial splices behind it.
    async fn connect(&self, endpoint: &Self::Endpoint) -> Result<Self::Io> {
        let context = endpoint.context();
        let mut io = self.next.connect(endpoint.next()).await?;

        let mut current_id = context.id.clone();
        let mut remaining = context.next_nodes.clone();
        loop {
            let forward = !remaining.is_empty();
            let init = InitConnection {
                id: current_id.clone(),
                forward: forward as u8,
                remaining: remaining.clone(),
            };
            trace!(hop.id = %init.id, forward, "negotiating hop");
            wire::write_init(&mut io, &init).await?;
            let status = wire::read_validate(&mut io).await?;
            if status != VALIDATE_OK {
                debug!(hop.id = %init.id, status, "hop refused circuit");
                return Err(Error::new(ErrorKind::ConnectionRefused));
            }
            if !forward {
                debug!(circuit.id = %context.id, "circuit established");
                return Ok(io);
            }
            let next_stack = remaining.remove(0);
            current_id = CircuitContext::peek_id(&next_stack)?;
        }
    }

    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Acceptor> {
        CircuitAcceptor::bind(
            self.next.clone(),
            endpoint.clone(),
            self.manager.clone(),
        )
        .await
    }
}

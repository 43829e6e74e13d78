//! The generic layer framework.
//!
//! A protocol stack is a value like `Circuit::new(Tls::new(Tcp::new()))`:
//! each layer implements [`Transport`] (or [`DatagramTransport`]) and
//! recursively drives the layer below it. Endpoints mirror the stack shape
//! — every layer contributes its own context on top of the next layer's
//! endpoint — and are resolved from ordered [`ParamStack`]s, one parameter
//! map per layer, top first.

#![deny(warnings, rust_2018_idioms)]

mod endpoint;
mod params;

pub use self::endpoint::Endpoint;
pub use self::params::{required, required_parsed, ParamStack, Params};

use async_trait::async_trait;
use skein_error::Result;
use skein_io::Io;
use std::fmt;

/// What a layer's sockets carry: ordered bytes or discrete messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Facilities {
    Stream,
    Datagram,
}

/// A stream-facility protocol layer.
///
/// Operations either delegate to the next layer, run a bounded in-layer
/// state machine over next-layer operations, or terminate the recursion at
/// the physical layer.
#[async_trait]
pub trait Transport: Clone + Send + Sync + 'static {
    /// Numeric layer id.
    const ID: u8;
    /// The layer tag recognized at the head of a parameter stack.
    const NAME: &'static str;
    /// Per-frame bytes this layer adds below its payload.
    const OVERHEAD: usize;
    const FACILITIES: Facilities = Facilities::Stream;

    type Endpoint: Clone + Eq + Ord + fmt::Debug + Send + Sync + 'static;
    type Io: Io + 'static;
    type Acceptor: Acceptor<Io = Self::Io, Endpoint = Self::Endpoint>;

    /// Maximum payload this layer can move in one frame: the next layer's
    /// mtu minus this layer's overhead.
    fn mtu(&self) -> usize;

    /// Number of layers at or below this one.
    fn stack_depth(&self) -> usize;

    /// Consumes the head parameter map (and, recursively, the tail) to
    /// produce a fully populated endpoint.
    fn resolve(&self, params: &mut ParamStack) -> Result<Self::Endpoint>;

    /// The inverse of [`Transport::resolve`]: re-serializes an endpoint
    /// into the parameter stack it resolves from.
    fn endpoint_params(&self, endpoint: &Self::Endpoint) -> ParamStack;

    async fn connect(&self, endpoint: &Self::Endpoint) -> Result<Self::Io>;

    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Acceptor>;
}

/// The passive side of a stream-facility layer.
///
/// Closing an acceptor cancels every pending accept with `Interrupted` and
/// closes any next-layer resource it uniquely owns.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    type Io: Io + 'static;
    type Endpoint;

    /// Waits for the next peer, yielding its stream and remote endpoint.
    async fn accept(&self) -> Result<(Self::Io, Self::Endpoint)>;

    fn local_endpoint(&self) -> Self::Endpoint;

    async fn close(&self) -> Result<()>;
}

/// A datagram-facility protocol layer.
#[async_trait]
pub trait DatagramTransport: Clone + Send + Sync + 'static {
    const ID: u8;
    const NAME: &'static str;
    const OVERHEAD: usize;
    const FACILITIES: Facilities = Facilities::Datagram;

    type Endpoint: Clone + Eq + Ord + fmt::Debug + Send + Sync + 'static;
    type Socket: DatagramSocket<Endpoint = Self::Endpoint>;

    fn mtu(&self) -> usize;

    fn stack_depth(&self) -> usize;

    fn resolve(&self, params: &mut ParamStack) -> Result<Self::Endpoint>;

    fn endpoint_params(&self, endpoint: &Self::Endpoint) -> ParamStack;

    /// Binds a socket to a local endpoint.
    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Socket>;

    /// Binds an ephemeral socket with `endpoint` as its default remote.
    async fn connect(&self, endpoint: &Self::Endpoint) -> Result<Self::Socket>;
}

/// A bound datagram socket: whole messages in, whole messages out.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    type Endpoint: Clone + Send + Sync;

    async fn send_to(&self, buf: &[u8], dst: &Self::Endpoint) -> Result<usize>;

    /// Receives one whole datagram. A `buf` shorter than the payload fails
    /// with `MessageSize`.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Self::Endpoint)>;

    /// Sends to the connected default remote.
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    fn local_endpoint(&self) -> Result<Self::Endpoint>;

    async fn close(&self) -> Result<()>;
}

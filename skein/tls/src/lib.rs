//! The cryptography layer.
//!
//! Wraps any stream layer in mutual TLS. Two variants share one endpoint
//! context: [`Tls`] drives the engine directly, while [`BufferedTls`] adds
//! a per-socket pull task that reads ahead into a bounded buffer so small
//! application reads don't each pay a TLS record's latency.

#![deny(warnings, rust_2018_idioms)]

mod buffered;
mod context;
mod layer;

pub use self::buffered::{BufferedTls, BufferedTlsStream};
pub use self::context::{Material, Source, TlsContext, TlsParams};
pub use self::layer::{Tls, TlsAcceptor, TlsEndpoint};

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

/// The blessed thin composition, named the way deployments stack it.
pub type TlsOverTcp = Tls<skein_physical::Tcp>;

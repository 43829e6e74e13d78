//! The interface, network and routing layers.
//!
//! An *interface* names a bound or connected datagram transport so
//! several upper-layer sockets can share it. The *network* layer stamps
//! each datagram with 16-bit source/destination ids and filters on
//! receive. The *routing* layer moves datagrams between interfaces by
//! 32-bit network address through named routers.
//!
//! Registries are explicit context objects handed down at construction;
//! nothing here is process-global.

#![deny(warnings, rust_2018_idioms)]

mod interface;
mod network;
mod routing;

pub use self::interface::{
    Interface, InterfaceContext, InterfaceEndpoint, InterfaceRegistry, InterfaceSocket,
};
pub use self::network::{Network, NetworkContext, NetworkEndpoint, NetworkSocket};
pub use self::routing::{Routed, RoutedContext, RoutedEndpoint, RoutedSocket, Router, RouterRegistry};

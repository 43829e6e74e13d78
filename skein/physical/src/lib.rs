//! Terminal physical layers: thin adapters over the OS's TCP and UDP
//! sockets. These end the layer recursion — their endpoints hold concrete
//! addresses and their operations hit the runtime directly.

#![deny(warnings, rust_2018_idioms)]

mod addr;
mod tcp;
mod udp;

pub use self::addr::{HostPort, PhysicalContext};
pub use self::tcp::{Tcp, TcpAcceptor, TcpEndpoint};
pub use self::udp::{Udp, UdpEndpoint, UdpSocket};

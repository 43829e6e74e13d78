//! Proxy traversal.
//!
//! Performs a blocking CONNECT-style handshake against an egress proxy
//! before exposing the next layer's byte stream. Two families: HTTP
//! CONNECT tunneling with `Basic`/`Digest`/`NTLM`/`Negotiate`
//! authentication, and SOCKS 4/4A/5. After the handshake, reads and
//! writes behave exactly like the next-layer stream.

#![deny(warnings, rust_2018_idioms)]

pub mod auth;
mod http;
mod socks;

pub use self::auth::{NoCredentials, SecurityContext};
pub use self::http::{HttpProxy, HttpProxyContext, HttpProxyEndpoint};
pub use self::socks::{Socks, SocksContext, SocksEndpoint, SocksVersion};

//! I/O preliminaries for the layer stack.

#![deny(warnings, rust_2018_idioms)]

mod boxed;

pub use self::boxed::BoxedIo;
pub use std::io::{Error, ErrorKind, Result};
pub use tokio::io::{
    duplex, split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf,
    ReadHalf, WriteHalf,
};

/// A marker for transport streams: readable, writable, sendable, pinnable.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<I: AsyncRead + AsyncWrite + Send + Unpin> Io for I {}

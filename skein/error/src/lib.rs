//! The error namespace shared by every skein layer.
//!
//! Each kind carries a stable numeric code so that failures can cross
//! process boundaries (circuit validate bytes, logs) without losing their
//! identity.

#![deny(warnings, rust_2018_idioms)]

use std::fmt;
use std::io;

/// An opaque, boxed error for source chaining.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    // Address errors.
    #[error("bad address")]
    BadAddress,
    #[error("address in use")]
    AddressInUse,
    #[error("address not available")]
    AddressNotAvailable,

    // Handshake errors.
    #[error("wrong protocol type")]
    WrongProtocolType,
    #[error("protocol error")]
    ProtocolError,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection refused")]
    ConnectionRefused,

    // Flow errors.
    #[error("message too long for buffer")]
    MessageSize,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("not connected")]
    NotConnected,
    #[error("no link")]
    NoLink,
    #[error("network down")]
    NetworkDown,

    // Lifecycle errors.
    #[error("operation aborted")]
    OperationAborted,
    #[error("interrupted")]
    Interrupted,
    #[error("identifier removed")]
    IdentifierRemoved,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("device or resource busy")]
    DeviceOrResourceBusy,

    // Config errors.
    #[error("missing config parameters")]
    MissingConfigParameters,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no credentials")]
    NoCredentials,

    // Everything else.
    #[error("i/o error")]
    Io,
}

impl ErrorKind {
    /// Stable numeric code, errno-flavored where an errno exists.
    pub fn code(self) -> u32 {
        use ErrorKind::*;
        match self {
            BadAddress => 14,
            AddressInUse => 98,
            AddressNotAvailable => 99,
            WrongProtocolType => 91,
            ProtocolError => 71,
            ConnectionAborted => 103,
            ConnectionRefused => 111,
            MessageSize => 90,
            BrokenPipe => 32,
            NotConnected => 107,
            NoLink => 67,
            NetworkDown => 100,
            OperationAborted => 125,
            Interrupted => 4,
            IdentifierRemoved => 43,
            BadFileDescriptor => 9,
            DeviceOrResourceBusy => 16,
            MissingConfigParameters => 4000,
            InvalidArgument => 22,
            NoCredentials => 4001,
            Io => 5,
        }
    }
}

/// A layer error: a kind plus an optional underlying cause.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<BoxError>,
}

// === impl Error ===

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn with_source(kind: ErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: Some(source.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Converts into an `io::Error`, preserving `self` as the source so
    /// that callers of `AsyncRead`/`AsyncWrite` can recover the kind.
    pub fn into_io(self) -> io::Error {
        let kind = match self.kind {
            ErrorKind::AddressInUse => io::ErrorKind::AddrInUse,
            ErrorKind::AddressNotAvailable => io::ErrorKind::AddrNotAvailable,
            ErrorKind::ConnectionAborted => io::ErrorKind::ConnectionAborted,
            ErrorKind::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            ErrorKind::BrokenPipe => io::ErrorKind::BrokenPipe,
            ErrorKind::NotConnected => io::ErrorKind::NotConnected,
            ErrorKind::OperationAborted => io::ErrorKind::Other,
            ErrorKind::Interrupted => io::ErrorKind::Interrupted,
            ErrorKind::InvalidArgument => io::ErrorKind::InvalidInput,
            ErrorKind::ProtocolError | ErrorKind::WrongProtocolType => {
                io::ErrorKind::InvalidData
            }
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Recovers the skein kind from an `io::Error`, looking through the
    /// source chain planted by [`Error::into_io`].
    pub fn kind_of(err: &io::Error) -> Option<ErrorKind> {
        let mut source = err.get_ref().map(|e| e as &(dyn std::error::Error + 'static));
        while let Some(e) = source {
            if let Some(err) = e.downcast_ref::<Error>() {
                return Some(err.kind);
            }
            source = e.source();
        }
        None
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            Some(ref s) => write!(f, "{}: {}", self.kind, s),
            None => self.kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if let Some(kind) = Error::kind_of(&err) {
            return Self::with_source(kind, err);
        }
        let kind = match err.kind() {
            io::ErrorKind::AddrInUse => ErrorKind::AddressInUse,
            io::ErrorKind::AddrNotAvailable => ErrorKind::AddressNotAvailable,
            io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected => ErrorKind::NotConnected,
            io::ErrorKind::Interrupted => ErrorKind::Interrupted,
            io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
            io::ErrorKind::InvalidData => ErrorKind::ProtocolError,
            _ => ErrorKind::Io,
        };
        Self::with_source(kind, err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        err.into_io()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        use ErrorKind::*;
        let kinds = [
            BadAddress,
            AddressInUse,
            AddressNotAvailable,
            WrongProtocolType,
            ProtocolError,
            ConnectionAborted,
            ConnectionRefused,
            MessageSize,
            BrokenPipe,
            NotConnected,
            NoLink,
            NetworkDown,
            OperationAborted,
            Interrupted,
            IdentifierRemoved,
            BadFileDescriptor,
            DeviceOrResourceBusy,
            MissingConfigParameters,
            InvalidArgument,
            NoCredentials,
            Io,
        ];
        let mut codes = kinds.iter().map(|k| k.code()).collect::<Vec<_>>();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn io_round_trip_preserves_kind() {
        let err = Error::new(ErrorKind::MessageSize);
        let io_err = err.into_io();
        assert_eq!(Error::kind_of(&io_err), Some(ErrorKind::MessageSize));
        let back = Error::from(io_err);
        assert_eq!(back.kind(), ErrorKind::MessageSize);
    }

    #[test]
    fn io_error_maps_by_io_kind() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(Error::from(io_err).kind(), ErrorKind::ConnectionRefused);
    }
}

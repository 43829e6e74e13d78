use bytes::{BufMut, Bytes, BytesMut};
use skein_error::{Error, ErrorKind, Result};
use std::convert::TryInto;

/// Fixed frame header: type, flags, length, then the sender's view of the
/// fiber pair. Little-endian throughout.
pub(crate) const HEADER_LEN: usize = 12;

/// Hard cap on one frame's payload, before lower-layer mtu trimming.
pub const MAX_PAYLOAD: usize = 60 * 1024;

/// A fiber pair: the identity of one fiber endpoint.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId {
    pub local: u32,
    pub remote: u32,
}

// === impl FiberId ===

impl FiberId {
    pub fn new(local: u32, remote: u32) -> Self {
        Self { local, remote }
    }

    /// The peer's view of this pair.
    pub fn flip(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FrameType {
    StreamData = 1,
    DgrData = 2,
    Syn = 3,
    SynAck = 4,
    Rst = 5,
    AckWindow = 6,
}

// === impl FrameType ===

impl FrameType {
    fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(FrameType::StreamData),
            2 => Ok(FrameType::DgrData),
            3 => Ok(FrameType::Syn),
            4 => Ok(FrameType::SynAck),
            5 => Ok(FrameType::Rst),
            6 => Ok(FrameType::AckWindow),
            _ => Err(Error::new(ErrorKind::ProtocolError)),
        }
    }
}

/// One parsed header. `id` is the *sender's* view; flip it to address the
/// receiving side's fiber.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub ty: FrameType,
    pub len: u16,
    pub id: FiberId,
}

// === impl Header ===

impl Header {
    pub(crate) fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let ty = FrameType::from_wire(bytes[0])?;
        if bytes[1] != 0 {
            // Flags are reserved and must be zero.
            return Err(Error::new(ErrorKind::ProtocolError));
        }
        Ok(Self {
            ty,
            len: u16::from_le_bytes(bytes[2..4].try_into().expect("2 bytes")),
            id: FiberId {
                local: u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes")),
                remote: u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes")),
            },
        })
    }
}

/// One outbound frame: a header plus its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    pub ty: FrameType,
    pub id: FiberId,
    pub payload: Bytes,
}

// === impl Frame ===

impl Frame {
    pub(crate) fn new(ty: FrameType, id: FiberId, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= u16::MAX as usize);
        Self { ty, id, payload }
    }

    pub(crate) fn control(ty: FrameType, id: FiberId) -> Self {
        Self::new(ty, id, Bytes::new())
    }

    pub(crate) fn ack_window(id: FiberId, credit: u32) -> Self {
        Self::new(
            FrameType::AckWindow,
            id,
            Bytes::copy_from_slice(&credit.to_le_bytes()),
        )
    }

    pub(crate) fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.ty as u8);
        buf.put_u8(0);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u32_le(self.id.local);
        buf.put_u32_le(self.id.remote);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

use serde::{Deserialize, Serialize};
use skein_error::{Error, ErrorKind, Result};
use skein_io::{AsyncReadExt, AsyncWriteExt};
use skein_stack::ParamStack;

/// A hop accepted the circuit.
pub const VALIDATE_OK: u8 = 0;
/// A hop refused the circuit (unknown id, role mismatch, dead next hop).
pub(crate) const VALIDATE_REFUSED: u8 = 1;

/// Init messages beyond this are a framing error.
const MAX_INIT: u32 = 1024 * 1024;

/// The per-hop circuit handshake request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConnection {
    pub id: String,
    pub forward: u8,
    pub remaining: Vec<ParamStack>,
}

pub(crate) async fn write_init<I: skein_io::Io>(io: &mut I, init: &InitConnection) -> Result<()> {
    let body = serde_json::to_vec(init).map_err(|e| Error::with_source(ErrorKind::Io, e))?;
    io.write_all(&(body.len() as u32).to_le_bytes())
        .await
        .map_err(Error::from)?;
    io.write_all(&body).await.map_err(Error::from)?;
    io.flush().await.map_err(Error::from)?;
    Ok(())
}

pub(crate) async fn read_init<I: skein_io::Io>(io: &mut I) -> Result<InitConnection> {
    let mut len = [0u8; 4];
    io.read_exact(&mut len).await.map_err(Error::from)?;
    let len = u32::from_le_bytes(len);
    if len == 0 || len > MAX_INIT {
        return Err(Error::new(ErrorKind::ProtocolError));
    }
    let mut body = vec![0u8; len as usize];
    io.read_exact(&mut body).await.map_err(Error::from)?;
    serde_json::from_slice(&body).map_err(|e| Error::with_source(ErrorKind::ProtocolError, e))
}

pub(crate) async fn write_validate<I: skein_io::Io>(io: &mut I, status: u8) -> Result<()> {
    io.write_all(&1u32.to_le_bytes()).await.map_err(Error::from)?;
    io.write_all(&[status]).await.map_err(Error::from)?;
    io.flush().await.map_err(Error::from)?;
    Ok(())
}

pub(crate) async fn read_validate<I: skein_io::Io>(io: &mut I) -> Result<u8> {
    let mut len = [0u8; 4];
    io.read_exact(&mut len).await.map_err(Error::from)?;
    if u32::from_le_bytes(len) != 1 {
        return Err(Error::new(ErrorKind::ProtocolError));
    }
    let mut status = [0u8; 1];
    io.read_exact(&mut status).await.map_err(Error::from)?;
    Ok(status[0])
}

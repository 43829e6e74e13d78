//! Full-duplex splice between two streams.
//!
//! Two half-duplex pumps run concurrently, each owning a 50 KiB buffer:
//! one reads from the inbound side and writes exactly what it read to the
//! outbound side, the other pumps the opposite direction. A clean EOF on
//! one direction shuts down the peer's write half and lets the other
//! direction finish; an error tears the splice down.

#![deny(warnings, rust_2018_idioms)]

use skein_error::Result;
use skein_io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Io};
use skein_session::{Session, SessionHandle};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const BUF_CAPACITY: usize = 50 * 1024;

/// Splices `a` and `b` together until both directions have finished or
/// either fails.
pub async fn splice<A, B>(a: A, b: B) -> skein_io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_rx, mut a_tx) = skein_io::split(a);
    let (mut b_rx, mut b_tx) = skein_io::split(b);
    let res = tokio::try_join!(
        half_duplex(&mut a_rx, &mut b_tx),
        half_duplex(&mut b_rx, &mut a_tx),
    )
    .map(|_| ());
    debug!(ok = res.is_ok(), "splice finished");
    res
}

/// Pumps one direction: read some, write exactly that many, repeat until
/// EOF, then propagate the shutdown.
async fn half_duplex<R, W>(rx: &mut R, tx: &mut W) -> skein_io::Result<u64>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut buf = vec![0u8; BUF_CAPACITY];
    let mut forwarded = 0u64;
    loop {
        let n = rx.read(&mut buf).await?;
        if n == 0 {
            tx.shutdown().await.ok();
            trace!(forwarded, "half-duplex done");
            return Ok(forwarded);
        }
        tx.write_all(&buf[..n]).await?;
        tx.flush().await?;
        forwarded += n as u64;
    }
}

/// A splice packaged as a managed session: `start` spawns the pump task,
/// `stop` aborts it (dropping both streams closes them).
pub struct SessionForwarder<A, B> {
    io: Mutex<Option<(A, B)>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

// === impl SessionForwarder ===

impl<A, B> SessionForwarder<A, B>
where
    A: Io + 'static,
    B: Io + 'static,
{
    pub fn new(inbound: A, outbound: B) -> Arc<Self> {
        Arc::new(Self {
            io: Mutex::new(Some((inbound, outbound))),
            task: Mutex::new(None),
        })
    }
}

impl<A, B> Session for SessionForwarder<A, B>
where
    A: Io + 'static,
    B: Io + 'static,
{
    fn start(&self, handle: SessionHandle) -> Result<()> {
        let (inbound, outbound) = self
            .io
            .lock()
            .expect("forwarder lock")
            .take()
            .ok_or(skein_error::ErrorKind::BadFileDescriptor)?;
        let task = tokio::spawn(async move {
            if let Err(e) = splice(inbound, outbound).await {
                debug!(error = %e, "forwarder ended with error");
            }
            handle.retire();
        });
        *self.task.lock().expect("forwarder lock") = Some(task);
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().expect("forwarder lock").take() {
            task.abort();
        }
    }
}

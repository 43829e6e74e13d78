use crate::demux::DemuxShared;
use crate::frame::{FiberId, Frame, FrameType};
use bytes::Bytes;
use futures::future::poll_fn;
use skein_error::{Error, ErrorKind, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::{Poll, Waker};
use tracing::trace;

/// Queued datagrams per fiber; the oldest is dropped on overflow.
pub(crate) const DATAGRAM_QUEUE: usize = 128;

pub(crate) struct DatagramShared {
    id: FiberId,
    demux: Arc<DemuxShared>,
    state: Mutex<DatagramState>,
}

struct DatagramState {
    queue: VecDeque<(u32, Bytes)>,
    error: Option<ErrorKind>,
    waker: Option<Waker>,
}

// === impl DatagramShared ===

impl DatagramShared {
    pub(crate) fn new(id: FiberId, demux: Arc<DemuxShared>) -> Arc<Self> {
        Arc::new(Self {
            id,
            demux,
            state: Mutex::new(DatagramState {
                queue: VecDeque::new(),
                error: None,
                waker: None,
            }),
        })
    }

    #[allow(dead_code)]
    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    /// Enqueues one incoming datagram, dropping the oldest on overflow.
    pub(crate) fn on_datagram(&self, from: u32, payload: Bytes) {
        let mut state = self.state.lock().expect("datagram state");
        if state.error.is_some() {
            return;
        }
        if state.queue.len() >= DATAGRAM_QUEUE {
            trace!(fiber = %self.id, "datagram queue full, dropping oldest");
            state.queue.pop_front();
        }
        state.queue.push_back((from, payload));
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    pub(crate) fn terminal(&self, kind: ErrorKind) {
        let mut state = self.state.lock().expect("datagram state");
        state.error.get_or_insert(kind);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

/// A datagram fiber: discrete messages over the demux, no credit, no
/// retransmission.
pub struct DatagramFiber {
    shared: Arc<DatagramShared>,
    /// Default destination port, set by connect.
    remote: Option<u32>,
}

impl std::fmt::Debug for DatagramFiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramFiber")
            .field("remote", &self.remote)
            .finish()
    }
}

// === impl DatagramFiber ===

impl DatagramFiber {
    pub(crate) fn new(shared: Arc<DatagramShared>, remote: Option<u32>) -> Self {
        Self { shared, remote }
    }

    pub fn local_port(&self) -> u32 {
        self.shared.id.local
    }

    /// Sends one datagram to `remote`. Payloads above the demux mtu fail
    /// with `MessageSize` without transmitting anything.
    pub async fn send_to(&self, buf: &[u8], remote: u32) -> Result<usize> {
        if buf.len() > self.shared.demux.mtu() {
            return Err(Error::new(ErrorKind::MessageSize));
        }
        let id = FiberId::new(self.shared.id.local, remote);
        self.shared
            .demux
            .try_send_frame(Frame::new(
                FrameType::DgrData,
                id,
                Bytes::copy_from_slice(buf),
            ))
            .map_err(Error::new)?;
        Ok(buf.len())
    }

    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        let remote = self
            .remote
            .ok_or_else(|| Error::new(ErrorKind::NotConnected))?;
        self.send_to(buf, remote).await
    }

    /// Receives one whole datagram and the sender's port. A buffer
    /// shorter than the payload fails with `MessageSize`; the datagram is
    /// consumed either way.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, u32)> {
        let (from, payload) = poll_fn(|cx| {
            let mut state = self.shared.state.lock().expect("datagram state");
            if let Some(item) = state.queue.pop_front() {
                return Poll::Ready(Ok(item));
            }
            if let Some(kind) = state.error {
                return Poll::Ready(Err(Error::new(kind)));
            }
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        })
        .await?;
        if payload.len() > buf.len() {
            return Err(Error::new(ErrorKind::MessageSize));
        }
        buf[..payload.len()].copy_from_slice(&payload);
        Ok((payload.len(), from))
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _from) = self.recv_from(buf).await?;
        Ok(n)
    }

    /// Unbinds the fiber; pending receives abort.
    pub fn close(&self) {
        self.shared.terminal(ErrorKind::OperationAborted);
        self.shared.demux.forget_datagram(self.shared.id);
    }
}

impl Drop for DatagramFiber {
    fn drop(&mut self) {
        self.close();
    }
}

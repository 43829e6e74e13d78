use crate::demux::DemuxShared;
use crate::frame::{Frame, FrameType, FiberId};
use bytes::Bytes;
use skein_error::ErrorKind;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::sync::oneshot;
use tracing::trace;

/// Receive-queue watermarks: pause the peer above the upper bound, resume
/// (and re-credit) below the lower bound.
pub(crate) const UPPER_BOUND: usize = 1024 * 1024;
pub(crate) const LOWER_BOUND: usize = 256 * 1024;

/// The stream-fiber state machine of the connection lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// Client sent SYN, awaiting SYN-ACK.
    Connecting,
    Open,
    /// Local shutdown sent; reads may still progress.
    HalfClosedLocal,
    Closed,
}

pub(crate) struct ReadState {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    consumed_since_ack: usize,
    /// We advertised zero credit; a resume ack is owed once drained.
    paused: bool,
    eof: bool,
    error: Option<ErrorKind>,
    waker: Option<Waker>,
}

pub(crate) struct WriteState {
    /// The peer's last advertised credit, in bytes.
    credit: usize,
    error: Option<ErrorKind>,
    wakers: Vec<Waker>,
}

pub(crate) struct StreamShared {
    id: FiberId,
    demux: Arc<DemuxShared>,
    state: Mutex<State>,
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
    /// Fulfilled on SYN-ACK (or refusal) while connecting.
    connected: Mutex<Option<oneshot::Sender<Result<(), ErrorKind>>>>,
}

// === impl StreamShared ===

impl StreamShared {
    pub(crate) fn new(
        id: FiberId,
        demux: Arc<DemuxShared>,
        state: State,
        connected: Option<oneshot::Sender<Result<(), ErrorKind>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            demux,
            state: Mutex::new(state),
            read: Mutex::new(ReadState {
                queue: VecDeque::new(),
                queued_bytes: 0,
                consumed_since_ack: 0,
                paused: false,
                eof: false,
                error: None,
                waker: None,
            }),
            write: Mutex::new(WriteState {
                credit: UPPER_BOUND,
                error: None,
                wakers: Vec::new(),
            }),
            connected: Mutex::new(connected),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    /// SYN-ACK while connecting: the fiber opens.
    pub(crate) fn on_syn_ack(&self) {
        let mut state = self.state.lock().expect("fiber state");
        if *state != State::Connecting {
            // A late or duplicate ack; drop it.
            return;
        }
        *state = State::Open;
        drop(state);
        if let Some(tx) = self.connected.lock().expect("fiber connect").take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Incoming stream payload. Empty payload is the half-close marker.
    pub(crate) fn on_data(&self, payload: Bytes) {
        let mut read = self.read.lock().expect("fiber read");
        if read.error.is_some() {
            return;
        }
        if payload.is_empty() {
            read.eof = true;
        } else {
            read.queued_bytes += payload.len();
            read.queue.push_back(payload);
            if read.queued_bytes > UPPER_BOUND && !read.paused {
                read.paused = true;
                trace!(fiber = %self.id, queued = read.queued_bytes, "pausing peer");
                self.demux.send_frame(Frame::ack_window(self.id, 0));
            }
        }
        if let Some(waker) = read.waker.take() {
            waker.wake();
        }
    }

    /// Peer reset or transport failure: every pending and future op
    /// completes with `kind`.
    pub(crate) fn terminal(&self, kind: ErrorKind) {
        let refused = {
            let mut state = self.state.lock().expect("fiber state");
            let was = *state;
            *state = State::Closed;
            was == State::Connecting
        };
        if let Some(tx) = self.connected.lock().expect("fiber connect").take() {
            let _ = tx.send(Err(if refused {
                ErrorKind::ConnectionRefused
            } else {
                kind
            }));
        }
        {
            let mut read = self.read.lock().expect("fiber read");
            read.error.get_or_insert(kind);
            if let Some(waker) = read.waker.take() {
                waker.wake();
            }
        }
        let mut write = self.write.lock().expect("fiber write");
        write.error.get_or_insert(kind);
        for waker in write.wakers.drain(..) {
            waker.wake();
        }
    }

    /// Peer advanced our send window.
    pub(crate) fn on_ack_window(&self, credit: u32) {
        let mut write = self.write.lock().expect("fiber write");
        write.credit = credit as usize;
        if credit > 0 {
            for waker in write.wakers.drain(..) {
                waker.wake();
            }
        }
    }

    fn poll_read_inner(
        &self,
        cx: &mut Context<'_>,
        buf: &mut skein_io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut read = self.read.lock().expect("fiber read");
        if !read.queue.is_empty() {
            let mut copied = 0;
            while buf.remaining() > 0 {
                let mut front = match read.queue.pop_front() {
                    Some(chunk) => chunk,
                    None => break,
                };
                let n = front.len().min(buf.remaining());
                buf.put_slice(&front.split_to(n));
                copied += n;
                if !front.is_empty() {
                    read.queue.push_front(front);
                }
            }
            read.queued_bytes -= copied;
            read.consumed_since_ack += copied;

            if read.paused && read.queued_bytes < LOWER_BOUND {
                read.paused = false;
                read.consumed_since_ack = 0;
                let credit = (UPPER_BOUND - read.queued_bytes) as u32;
                trace!(fiber = %self.id, credit, "resuming peer");
                self.demux.send_frame(Frame::ack_window(self.id, credit));
            } else if !read.paused && read.consumed_since_ack >= LOWER_BOUND {
                // Re-credit a fast reader so the sender never starves.
                read.consumed_since_ack = 0;
                let credit = (UPPER_BOUND.saturating_sub(read.queued_bytes)) as u32;
                self.demux.send_frame(Frame::ack_window(self.id, credit));
            }
            return Poll::Ready(Ok(()));
        }
        if read.eof {
            return Poll::Ready(Ok(()));
        }
        if let Some(kind) = read.error {
            return Poll::Ready(Err(skein_error::Error::new(kind).into_io()));
        }
        read.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_write_inner(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        {
            let state = self.state.lock().expect("fiber state");
            match *state {
                State::Open => {}
                State::HalfClosedLocal | State::Closed => {
                    return Poll::Ready(Err(
                        skein_error::Error::new(ErrorKind::BrokenPipe).into_io()
                    ));
                }
                State::Connecting => {
                    return Poll::Ready(Err(
                        skein_error::Error::new(ErrorKind::NotConnected).into_io()
                    ));
                }
            }
        }
        let mut write = self.write.lock().expect("fiber write");
        if let Some(kind) = write.error {
            return Poll::Ready(Err(skein_error::Error::new(kind).into_io()));
        }
        if write.credit == 0 {
            write.wakers.push(cx.waker().clone());
            return Poll::Pending;
        }
        let n = buf.len().min(write.credit).min(self.demux.mtu());
        let frame = Frame::new(
            FrameType::StreamData,
            self.id,
            Bytes::copy_from_slice(&buf[..n]),
        );
        write.credit -= n;
        drop(write);
        if let Err(kind) = self.demux.try_send_frame(frame) {
            return Poll::Ready(Err(skein_error::Error::new(kind).into_io()));
        }
        Poll::Ready(Ok(n))
    }

    /// Sends the in-band half-close marker once.
    fn shutdown(&self) -> io::Result<()> {
        let mut state = self.state.lock().expect("fiber state");
        match *state {
            State::Open => {
                *state = State::HalfClosedLocal;
                drop(state);
                self.demux
                    .try_send_frame(Frame::new(FrameType::StreamData, self.id, Bytes::new()))
                    .map_err(|kind| skein_error::Error::new(kind).into_io())
            }
            State::HalfClosedLocal | State::Closed => Ok(()),
            State::Connecting => {
                Err(skein_error::Error::new(ErrorKind::NotConnected).into_io())
            }
        }
    }

    /// Resets the fiber: RST to the peer, local ops aborted.
    pub(crate) fn close(&self) {
        let was_live = {
            let mut state = self.state.lock().expect("fiber state");
            let live = !matches!(*state, State::Closed);
            *state = State::Closed;
            live
        };
        if was_live {
            trace!(fiber = %self.id, "closing fiber");
            self.demux.send_frame(Frame::control(FrameType::Rst, self.id));
        }
        if let Some(tx) = self.connected.lock().expect("fiber connect").take() {
            let _ = tx.send(Err(ErrorKind::OperationAborted));
        }
        {
            let mut read = self.read.lock().expect("fiber read");
            read.error.get_or_insert(ErrorKind::OperationAborted);
            if let Some(waker) = read.waker.take() {
                waker.wake();
            }
        }
        let mut write = self.write.lock().expect("fiber write");
        write.error.get_or_insert(ErrorKind::OperationAborted);
        for waker in write.wakers.drain(..) {
            waker.wake();
        }
    }
}

/// One endpoint of a virtual stream, identified by its port pair. Reads
/// drain the fiber's receive window; writes respect the peer's credit.
pub struct Fiber {
    shared: Arc<StreamShared>,
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber").finish()
    }
}

// === impl Fiber ===

impl Fiber {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> FiberId {
        self.shared.id()
    }

    pub fn local_port(&self) -> u32 {
        self.shared.id().local
    }

    pub fn remote_port(&self) -> u32 {
        self.shared.id().remote
    }

    /// Resets the fiber. Pending reads and writes complete with
    /// `OperationAborted`; the peer sees a terminal error.
    pub fn close(&self) {
        self.shared.close();
        self.shared.demux.forget_stream(self.shared.id());
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        self.close();
    }
}

impl skein_io::AsyncRead for Fiber {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut skein_io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.shared.poll_read_inner(cx, buf)
    }
}

impl skein_io::AsyncWrite for Fiber {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.shared.poll_write_inner(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the demux writer on write; there is no
        // fiber-local buffer to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.shared.shutdown())
    }
}

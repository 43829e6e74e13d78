use crate::demux::DemuxShared;
use crate::frame::{FiberId, Frame, FrameType};
use crate::stream::Fiber;
use skein_error::{Error, ErrorKind, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Unclaimed SYNs queued per acceptor; beyond this they are reset.
pub(crate) const SYN_BACKLOG: usize = 128;

pub(crate) struct AcceptorShared {
    port: u32,
    demux: Arc<DemuxShared>,
    state: Mutex<AcceptState>,
}

struct AcceptState {
    /// Remote ports whose SYN arrived before an accept op (SynReceived).
    backlog: VecDeque<u32>,
    /// Pending accept ops awaiting a SYN.
    ops: VecDeque<oneshot::Sender<Result<Fiber>>>,
    closed: bool,
}

// === impl AcceptorShared ===

impl AcceptorShared {
    pub(crate) fn new(port: u32, demux: Arc<DemuxShared>) -> Arc<Self> {
        Arc::new(Self {
            port,
            demux,
            state: Mutex::new(AcceptState {
                backlog: VecDeque::new(),
                ops: VecDeque::new(),
                closed: false,
            }),
        })
    }

    #[allow(dead_code)]
    pub(crate) fn port(&self) -> u32 {
        self.port
    }

    /// An incoming SYN addressed to this listening port.
    pub(crate) fn on_syn(&self, remote: u32) {
        let id = FiberId::new(self.port, remote);
        let mut state = self.state.lock().expect("acceptor state");
        if state.closed {
            drop(state);
            self.demux.send_frame(Frame::control(FrameType::Rst, id));
            return;
        }
        while let Some(op) = state.ops.pop_front() {
            // An op whose receiver is gone (cancelled accept) is skipped.
            if op.is_closed() {
                continue;
            }
            drop(state);
            match DemuxShared::open_accepted(&self.demux, id) {
                Ok(fiber) => {
                    let _ = op.send(Ok(fiber));
                }
                Err(e) => {
                    let _ = op.send(Err(e));
                }
            }
            return;
        }
        if state.backlog.len() >= SYN_BACKLOG {
            debug!(port = self.port, remote, "syn backlog full, resetting");
            drop(state);
            self.demux.send_frame(Frame::control(FrameType::Rst, id));
            return;
        }
        trace!(port = self.port, remote, "syn queued");
        state.backlog.push_back(remote);
    }

    /// Fails every pending op with `kind` and resets queued SYNs.
    pub(crate) fn shutdown(&self, kind: ErrorKind) {
        let (ops, backlog) = {
            let mut state = self.state.lock().expect("acceptor state");
            state.closed = true;
            (
                std::mem::take(&mut state.ops),
                std::mem::take(&mut state.backlog),
            )
        };
        for op in ops {
            let _ = op.send(Err(Error::new(kind)));
        }
        for remote in backlog {
            self.demux
                .send_frame(Frame::control(FrameType::Rst, FiberId::new(self.port, remote)));
        }
    }
}

/// Listens on one local port with wildcard remote; produces a new fiber
/// per incoming SYN.
pub struct FiberAcceptor {
    shared: Arc<AcceptorShared>,
}

impl std::fmt::Debug for FiberAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberAcceptor").finish()
    }
}

// === impl FiberAcceptor ===

impl FiberAcceptor {
    pub(crate) fn new(shared: Arc<AcceptorShared>) -> Self {
        Self { shared }
    }

    pub fn local_port(&self) -> u32 {
        self.shared.port
    }

    /// Waits for the next incoming fiber, answering its SYN with SYN-ACK.
    pub async fn accept(&self) -> Result<Fiber> {
        let claimed = {
            let mut state = self.shared.state.lock().expect("acceptor state");
            if state.closed {
                return Err(Error::new(ErrorKind::Interrupted));
            }
            match state.backlog.pop_front() {
                Some(remote) => Ok(remote),
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.ops.push_back(tx);
                    Err(rx)
                }
            }
        };
        match claimed {
            Ok(remote) => DemuxShared::open_accepted(
                &self.shared.demux,
                FiberId::new(self.shared.port, remote),
            ),
            Err(rx) => rx
                .await
                .map_err(|_| Error::new(ErrorKind::OperationAborted))?,
        }
    }

    /// Cancels pending accepts with `Interrupted` and unbinds the port.
    pub fn close(&self) {
        self.shared.shutdown(ErrorKind::Interrupted);
        self.shared.demux.forget_acceptor(self.shared.port);
    }
}

impl Drop for FiberAcceptor {
    fn drop(&mut self) {
        self.close();
    }
}

use crate::acceptor::{AcceptorShared, FiberAcceptor};
use crate::datagram::{DatagramFiber, DatagramShared};
use crate::frame::{FiberId, Frame, FrameType, Header, HEADER_LEN, MAX_PAYLOAD};
use crate::stream::{Fiber, State, StreamShared};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;
use skein_error::{Error, ErrorKind, Result};
use skein_io::{AsyncReadExt, AsyncWriteExt, BoxedIo, Io, ReadHalf, WriteHalf};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// The demultiplexer: one underlying reliable stream carrying many
/// fibers. One reader task parses frames and routes them; one writer
/// task serializes outbound frames in enqueue order.
///
/// The demux holds only weak references to fibers and acceptors; user
/// handles own them, and a dropped handle disappears from the routing
/// tables on its next visit.
#[derive(Clone)]
pub struct Demux {
    shared: Arc<DemuxShared>,
}

pub(crate) struct DemuxShared {
    out_tx: mpsc::UnboundedSender<Frame>,
    registry: Mutex<Registry>,
    status: Mutex<Option<ErrorKind>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    mtu: usize,
}

#[derive(Default)]
struct Registry {
    streams: HashMap<FiberId, Weak<StreamShared>>,
    datagrams: HashMap<FiberId, Weak<DatagramShared>>,
    acceptors: HashMap<u32, Weak<AcceptorShared>>,
    next_port: u32,
}

// === impl Demux ===

impl Demux {
    /// Takes ownership of an established stream and starts multiplexing
    /// fibers over it.
    pub fn fiberize<I: Io + 'static>(io: I) -> Self {
        Self::fiberize_with_mtu(io, MAX_PAYLOAD + HEADER_LEN)
    }

    /// As [`Demux::fiberize`], bounding frames to the carrying stack's
    /// mtu.
    pub fn fiberize_with_mtu<I: Io + 'static>(io: I, stack_mtu: usize) -> Self {
        let mtu = MAX_PAYLOAD.min(stack_mtu.saturating_sub(HEADER_LEN)).max(1);
        let (out_tx, out_rx) = mpsc::unbounded();
        let shared = Arc::new(DemuxShared {
            out_tx,
            registry: Mutex::new(Registry {
                next_port: 1,
                ..Registry::default()
            }),
            status: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            mtu,
        });

        let (read, write) = skein_io::split(BoxedIo::new(io));
        let reader = tokio::spawn(read_loop(read, shared.clone()));
        let writer = tokio::spawn(write_loop(write, out_rx, shared.clone()));
        shared.tasks.lock().expect("demux tasks").push(reader);
        shared.tasks.lock().expect("demux tasks").push(writer);
        Self { shared }
    }

    /// Opens a stream fiber to the peer's listening `remote_port`.
    ///
    /// Pends until the peer's acceptor answers; there is no timeout in
    /// the core. Cancelling (dropping) the call leaves a late SYN-ACK to
    /// be answered with RST.
    pub async fn connect(&self, remote_port: u32) -> Result<Fiber> {
        self.shared.check_open()?;
        let (tx, rx) = oneshot::channel();
        let shared = {
            let mut registry = self.shared.registry.lock().expect("demux registry");
            let local = registry.alloc_port()?;
            let id = FiberId::new(local, remote_port);
            let fiber = StreamShared::new(id, self.shared.clone(), State::Connecting, Some(tx));
            registry.streams.insert(id, Arc::downgrade(&fiber));
            fiber
        };
        let id = shared.id();
        trace!(fiber = %id, "sending syn");
        self.shared
            .try_send_frame(Frame::control(FrameType::Syn, id))
            .map_err(Error::new)?;

        match rx.await {
            Ok(Ok(())) => {
                debug!(fiber = %id, "fiber open");
                Ok(Fiber::new(shared))
            }
            Ok(Err(kind)) => {
                self.shared.forget_stream(id);
                Err(Error::new(kind))
            }
            // The demux dropped the sender: closed underneath us.
            Err(_) => {
                self.shared.forget_stream(id);
                Err(Error::new(ErrorKind::OperationAborted))
            }
        }
    }

    /// Binds an acceptor fiber to `local_port` with wildcard remote.
    pub fn bind(&self, local_port: u32) -> Result<FiberAcceptor> {
        self.shared.check_open()?;
        if local_port == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        let mut registry = self.shared.registry.lock().expect("demux registry");
        if registry.acceptor(local_port).is_some() {
            return Err(Error::new(ErrorKind::AddressInUse));
        }
        let shared = AcceptorShared::new(local_port, self.shared.clone());
        registry
            .acceptors
            .insert(local_port, Arc::downgrade(&shared));
        debug!(port = local_port, "acceptor bound");
        Ok(FiberAcceptor::new(shared))
    }

    /// Binds a datagram fiber to `local_port`, receiving from any remote.
    pub fn bind_datagram(&self, local_port: u32) -> Result<DatagramFiber> {
        self.shared.check_open()?;
        if local_port == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        let mut registry = self.shared.registry.lock().expect("demux registry");
        let id = FiberId::new(local_port, 0);
        if registry.datagram_exact(id).is_some() {
            return Err(Error::new(ErrorKind::AddressInUse));
        }
        let shared = DatagramShared::new(id, self.shared.clone());
        registry.datagrams.insert(id, Arc::downgrade(&shared));
        Ok(DatagramFiber::new(shared, None))
    }

    /// Opens a datagram fiber with `remote_port` as its default
    /// destination. Local state only; datagrams have no handshake.
    pub fn connect_datagram(&self, remote_port: u32) -> Result<DatagramFiber> {
        self.shared.check_open()?;
        let mut registry = self.shared.registry.lock().expect("demux registry");
        let local = registry.alloc_port()?;
        let id = FiberId::new(local, 0);
        let shared = DatagramShared::new(id, self.shared.clone());
        registry.datagrams.insert(id, Arc::downgrade(&shared));
        Ok(DatagramFiber::new(shared, Some(remote_port)))
    }

    /// The largest payload one fiber frame can carry.
    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    /// Stops the reader and writer and completes every owned op with
    /// `OperationAborted`.
    pub fn close(&self) {
        self.shared.terminate(ErrorKind::OperationAborted);
    }
}

// === impl DemuxShared ===

impl DemuxShared {
    pub(crate) fn mtu(&self) -> usize {
        self.mtu
    }

    fn check_open(&self) -> Result<()> {
        match *self.status.lock().expect("demux status") {
            Some(kind) => Err(Error::new(kind)),
            None => Ok(()),
        }
    }

    /// Enqueues a frame on the writer strand, ignoring failures (the
    /// demux is already terminal when the channel is gone).
    pub(crate) fn send_frame(&self, frame: Frame) {
        let _ = self.out_tx.unbounded_send(frame);
    }

    pub(crate) fn try_send_frame(&self, frame: Frame) -> std::result::Result<(), ErrorKind> {
        if let Some(kind) = *self.status.lock().expect("demux status") {
            return Err(kind);
        }
        self.out_tx
            .unbounded_send(frame)
            .map_err(|_| ErrorKind::BrokenPipe)
    }

    /// Installs the server-side fiber for an accepted SYN and answers
    /// with SYN-ACK.
    pub(crate) fn open_accepted(this: &Arc<Self>, id: FiberId) -> Result<Fiber> {
        let shared = {
            let mut registry = this.registry.lock().expect("demux registry");
            if registry.stream(id).is_some() {
                // Duplicate SYN for a live pair: exactly-once violated.
                this.send_frame(Frame::control(FrameType::Rst, id));
                return Err(Error::new(ErrorKind::AddressInUse));
            }
            let fiber = StreamShared::new(id, this.clone(), State::Open, None);
            registry.streams.insert(id, Arc::downgrade(&fiber));
            fiber
        };
        this.try_send_frame(Frame::control(FrameType::SynAck, id))
            .map_err(Error::new)?;
        debug!(fiber = %id, "fiber accepted");
        Ok(Fiber::new(shared))
    }

    pub(crate) fn forget_stream(&self, id: FiberId) {
        self.registry
            .lock()
            .expect("demux registry")
            .streams
            .remove(&id);
    }

    pub(crate) fn forget_datagram(&self, id: FiberId) {
        self.registry
            .lock()
            .expect("demux registry")
            .datagrams
            .remove(&id);
    }

    pub(crate) fn forget_acceptor(&self, port: u32) {
        self.registry
            .lock()
            .expect("demux registry")
            .acceptors
            .remove(&port);
    }

    /// Tears the demux down: the terminal status is cached, both tasks
    /// stop, and every fiber and acceptor is flushed with the error.
    fn terminate(&self, kind: ErrorKind) {
        {
            let mut status = self.status.lock().expect("demux status");
            if status.is_some() {
                return;
            }
            *status = Some(kind);
        }
        debug!(?kind, "demux terminating");
        let (streams, datagrams, acceptors) = {
            let mut registry = self.registry.lock().expect("demux registry");
            (
                std::mem::take(&mut registry.streams),
                std::mem::take(&mut registry.datagrams),
                std::mem::take(&mut registry.acceptors),
            )
        };
        for (_, weak) in streams {
            if let Some(stream) = weak.upgrade() {
                stream.terminal(kind);
            }
        }
        for (_, weak) in datagrams {
            if let Some(datagram) = weak.upgrade() {
                datagram.terminal(kind);
            }
        }
        for (_, weak) in acceptors {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.shutdown(ErrorKind::Interrupted);
            }
        }
        for task in self.tasks.lock().expect("demux tasks").drain(..) {
            task.abort();
        }
    }
}

impl Registry {
    fn stream(&mut self, id: FiberId) -> Option<Arc<StreamShared>> {
        match self.streams.get(&id).and_then(Weak::upgrade) {
            Some(stream) => Some(stream),
            None => {
                self.streams.remove(&id);
                None
            }
        }
    }

    fn datagram_exact(&mut self, id: FiberId) -> Option<Arc<DatagramShared>> {
        match self.datagrams.get(&id).and_then(Weak::upgrade) {
            Some(datagram) => Some(datagram),
            None => {
                self.datagrams.remove(&id);
                None
            }
        }
    }

    /// Exact pair first, then the wildcard-bound listener.
    fn datagram(&mut self, id: FiberId) -> Option<Arc<DatagramShared>> {
        self.datagram_exact(id)
            .or_else(|| self.datagram_exact(FiberId::new(id.local, 0)))
    }

    fn acceptor(&mut self, port: u32) -> Option<Arc<AcceptorShared>> {
        match self.acceptors.get(&port).and_then(Weak::upgrade) {
            Some(acceptor) => Some(acceptor),
            None => {
                self.acceptors.remove(&port);
                None
            }
        }
    }

    /// Monotonic wrap-and-reuse allocation among unallocated ports.
    /// Port 0 is reserved as the wildcard.
    fn alloc_port(&mut self) -> Result<u32> {
        for _ in 0..=u32::MAX as u64 {
            let candidate = self.next_port;
            self.next_port = self.next_port.wrapping_add(1).max(1);
            let in_use = self.acceptors.contains_key(&candidate)
                || self.streams.keys().any(|id| id.local == candidate)
                || self.datagrams.keys().any(|id| id.local == candidate);
            if !in_use {
                return Ok(candidate);
            }
        }
        Err(Error::new(ErrorKind::DeviceOrResourceBusy))
    }
}

/// The single reader: one fixed header, one payload, one dispatch.
async fn read_loop(mut read: ReadHalf<BoxedIo>, shared: Arc<DemuxShared>) {
    let mut header = [0u8; HEADER_LEN];
    loop {
        if let Err(e) = read.read_exact(&mut header).await {
            let kind = Error::from(e).kind();
            let kind = match kind {
                // A peer that just went away reads as an eof.
                ErrorKind::Io => ErrorKind::BrokenPipe,
                k => k,
            };
            shared.terminate(kind);
            return;
        }
        let header = match Header::parse(&header) {
            Ok(header) => header,
            Err(_) => {
                warn!("unparseable frame header");
                shared.terminate(ErrorKind::ProtocolError);
                return;
            }
        };
        let mut payload = vec![0u8; header.len as usize];
        if let Err(e) = read.read_exact(&mut payload).await {
            shared.terminate(Error::from(e).kind());
            return;
        }
        dispatch(&shared, header, Bytes::from(payload));
    }
}

/// Routes one inbound frame into the owning fiber or acceptor.
fn dispatch(shared: &Arc<DemuxShared>, header: Header, payload: Bytes) {
    // The sender's (local, remote) is our (remote, local).
    let id = header.id.flip();
    trace!(ty = ?header.ty, fiber = %id, len = header.len, "frame");
    match header.ty {
        FrameType::StreamData => {
            let stream = shared.registry.lock().expect("demux registry").stream(id);
            match stream {
                Some(stream) => stream.on_data(payload),
                None => {
                    // Data for a dead fiber: reset so the peer stops.
                    shared.send_frame(Frame::control(FrameType::Rst, id));
                }
            }
        }
        FrameType::DgrData => {
            let datagram = shared.registry.lock().expect("demux registry").datagram(id);
            if let Some(datagram) = datagram {
                datagram.on_datagram(id.remote, payload);
            }
        }
        FrameType::Syn => {
            let (existing, acceptor) = {
                let mut registry = shared.registry.lock().expect("demux registry");
                (registry.stream(id).is_some(), registry.acceptor(id.local))
            };
            if existing {
                // Duplicate SYN for an existing pair.
                shared.send_frame(Frame::control(FrameType::Rst, id));
                return;
            }
            match acceptor {
                Some(acceptor) => acceptor.on_syn(id.remote),
                None => {
                    trace!(port = id.local, "syn for unbound port");
                    shared.send_frame(Frame::control(FrameType::Rst, id));
                }
            }
        }
        FrameType::SynAck => {
            let stream = shared.registry.lock().expect("demux registry").stream(id);
            match stream {
                Some(stream) => stream.on_syn_ack(),
                // The connect was abandoned; answer the late ack with RST.
                None => shared.send_frame(Frame::control(FrameType::Rst, id)),
            }
        }
        FrameType::Rst => {
            let stream = shared.registry.lock().expect("demux registry").stream(id);
            if let Some(stream) = stream {
                stream.terminal(ErrorKind::BrokenPipe);
                shared.forget_stream(id);
            }
        }
        FrameType::AckWindow => {
            if payload.len() != 4 {
                warn!(fiber = %id, "malformed window update");
                return;
            }
            let credit = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let stream = shared.registry.lock().expect("demux registry").stream(id);
            if let Some(stream) = stream {
                stream.on_ack_window(credit);
            }
        }
    }
}

/// The single writer strand: frames hit the wire in enqueue order, so
/// control frames never overtake the data of the fiber they refer to.
async fn write_loop(
    mut write: WriteHalf<BoxedIo>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<DemuxShared>,
) {
    while let Some(frame) = out_rx.next().await {
        let encoded = frame.encode();
        if let Err(e) = write.write_all(&encoded).await {
            shared.terminate(Error::from(e).kind());
            return;
        }
        if let Err(e) = write.flush().await {
            shared.terminate(Error::from(e).kind());
            return;
        }
    }
}

use crate::context::TlsContext;
use crate::layer::{Tls, TlsEndpoint};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use skein_error::Result;
use skein_io::{AsyncReadExt, ReadHalf, WriteHalf};
use skein_stack::{Acceptor, Endpoint, ParamStack, Transport};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::TlsStream;
use tracing::{debug, trace};

/// One engine read per call is wasteful for small application reads, so
/// this variant runs a puller task per socket that reads ahead into a
/// shared buffer between these marks.
const PULL_CHUNK: usize = 50 * 1024;
const HIGH_WATER: usize = 16 * 1024 * 1024;
const LOW_WATER: usize = 1024 * 1024;

/// The buffered ("pull-loop") TLS layer. Same endpoints as [`Tls`]; its
/// streams read from the pull buffer while writes dispatch straight to
/// the engine.
#[derive(Clone, Debug)]
pub struct BufferedTls<N> {
    thin: Tls<N>,
}

// === impl BufferedTls ===

impl<N> BufferedTls<N> {
    pub fn new(next: N) -> Self {
        Self {
            thin: Tls::new(next),
        }
    }
}

#[async_trait]
impl<N: Transport> Transport for BufferedTls<N> {
    const ID: u8 = 4;
    const NAME: &'static str = "tls";
    const OVERHEAD: usize = 0;

    type Endpoint = TlsEndpoint<N::Endpoint>;
    type Io = BufferedTlsStream<N::Io>;
    type Acceptor = BufferedTlsAcceptor<N>;

    fn mtu(&self) -> usize {
        self.thin.mtu()
    }

    fn stack_depth(&self) -> usize {
        self.thin.stack_depth()
    }

    fn resolve(&self, params: &mut ParamStack) -> Result<Self::Endpoint> {
        self.thin.resolve(params)
    }

    fn endpoint_params(&self, endpoint: &Self::Endpoint) -> ParamStack {
        self.thin.endpoint_params(endpoint)
    }

    async fn connect(&self, endpoint: &Self::Endpoint) -> Result<Self::Io> {
        let io = self.thin.connect(endpoint).await?;
        Ok(BufferedTlsStream::spawn(io))
    }

    async fn bind(&self, endpoint: &Self::Endpoint) -> Result<Self::Acceptor> {
        let next = self.thin.bind(endpoint).await?;
        Ok(BufferedTlsAcceptor {
            next,
            context: endpoint.context().clone(),
        })
    }
}

pub struct BufferedTlsAcceptor<N: Transport> {
    next: crate::layer::TlsAcceptor<N>,
    context: TlsContext,
}

// === impl BufferedTlsAcceptor ===

#[async_trait]
impl<N: Transport> Acceptor for BufferedTlsAcceptor<N> {
    type Io = BufferedTlsStream<N::Io>;
    type Endpoint = TlsEndpoint<N::Endpoint>;

    async fn accept(&self) -> Result<(Self::Io, Self::Endpoint)> {
        let (io, peer) = self.next.accept().await?;
        Ok((BufferedTlsStream::spawn(io), peer))
    }

    fn local_endpoint(&self) -> Self::Endpoint {
        Endpoint::new(self.context.clone(), self.next.local_endpoint().into_parts().1)
    }

    async fn close(&self) -> Result<()> {
        self.next.close().await
    }
}

struct PullState {
    buf: BytesMut,
    /// Terminal status, replayed to every subsequent read.
    err: Option<(io::ErrorKind, String)>,
    eof: bool,
    /// Set by the puller when it parks at the high-water mark.
    paused: bool,
    waker: Option<Waker>,
}

struct PullShared {
    state: Mutex<PullState>,
    resume: Notify,
}

/// A TLS stream with a read-ahead pull task.
pub struct BufferedTlsStream<I> {
    shared: Arc<PullShared>,
    write: WriteHalf<TlsStream<I>>,
    puller: JoinHandle<()>,
}

// === impl BufferedTlsStream ===

impl<I: skein_io::Io + 'static> BufferedTlsStream<I> {
    fn spawn(io: TlsStream<I>) -> Self {
        let (read, write) = skein_io::split(io);
        let shared = Arc::new(PullShared {
            state: Mutex::new(PullState {
                buf: BytesMut::new(),
                err: None,
                eof: false,
                paused: false,
                waker: None,
            }),
            resume: Notify::new(),
        });
        let puller = tokio::spawn(pull_loop(read, shared.clone()));
        Self {
            shared,
            write,
            puller,
        }
    }
}

impl<I> Drop for BufferedTlsStream<I> {
    fn drop(&mut self) {
        self.puller.abort();
    }
}

/// The per-socket puller: reads records ahead of the application until the
/// buffer crosses the high-water mark, resuming when readers drain it
/// below the low-water mark.
async fn pull_loop<I: skein_io::Io>(mut read: ReadHalf<TlsStream<I>>, shared: Arc<PullShared>) {
    let mut chunk = vec![0u8; PULL_CHUNK];
    loop {
        let should_wait = {
            let mut state = shared.state.lock().expect("pull lock");
            if state.buf.len() >= HIGH_WATER {
                state.paused = true;
                true
            } else {
                false
            }
        };
        if should_wait {
            shared.resume.notified().await;
            continue;
        }
        match read.read(&mut chunk).await {
            Ok(0) => {
                let mut state = shared.state.lock().expect("pull lock");
                state.eof = true;
                if let Some(waker) = state.waker.take() {
                    waker.wake();
                }
                trace!("pull loop saw eof");
                return;
            }
            Ok(n) => {
                let mut state = shared.state.lock().expect("pull lock");
                state.buf.extend_from_slice(&chunk[..n]);
                if let Some(waker) = state.waker.take() {
                    waker.wake();
                }
            }
            Err(e) => {
                let mut state = shared.state.lock().expect("pull lock");
                state.err = Some((e.kind(), e.to_string()));
                if let Some(waker) = state.waker.take() {
                    waker.wake();
                }
                debug!(error = %e, "pull loop terminal");
                return;
            }
        }
    }
}

impl<I: skein_io::Io> skein_io::AsyncRead for BufferedTlsStream<I> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut skein_io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.state.lock().expect("pull lock");
        if !state.buf.is_empty() {
            let n = state.buf.len().min(buf.remaining());
            buf.put_slice(&state.buf[..n]);
            state.buf.advance(n);
            if state.paused && state.buf.len() < LOW_WATER {
                state.paused = false;
                self.shared.resume.notify_one();
            }
            return Poll::Ready(Ok(()));
        }
        if let Some((kind, ref msg)) = state.err {
            return Poll::Ready(Err(io::Error::new(kind, msg.clone())));
        }
        if state.eof {
            return Poll::Ready(Ok(()));
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<I: skein_io::Io> skein_io::AsyncWrite for BufferedTlsStream<I> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_shutdown(cx)
    }
}

//! TLS-over-TCP loopback: mutual authentication succeeds with a shared
//! CA and fails before any bytes transit when the client's bundle omits
//! the server's CA.

use skein_error::ErrorKind;
use skein_integration::{stack_of, tcp_bind, tcp_connect, trace_init, TlsFixture};
use skein_io::{AsyncReadExt, AsyncWriteExt};
use skein_physical::Tcp;
use skein_stack::{Acceptor, Transport};
use skein_tls::test_util::Ca;
use skein_tls::Tls;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread")]
async fn mutual_tls_echo() {
    trace_init();
    let fixture = TlsFixture::new();
    let tls = Tls::new(Tcp::new());

    let bind = tls
        .resolve(&mut stack_of(vec![fixture.server_params(), tcp_bind(0)]))
        .expect("bind endpoint");
    let acceptor = tls.bind(&bind).await.expect("bind");
    let port = acceptor.local_endpoint().next().context().port;

    let server = tokio::spawn(async move {
        let (mut io, _peer) = acceptor.accept().await.expect("accept");
        let mut buf = [0u8; 4];
        io.read_exact(&mut buf).await.expect("read");
        io.write_all(&buf).await.expect("write");
        io.shutdown().await.ok();
    });

    let connect = tls
        .resolve(&mut stack_of(vec![
            fixture.client_params(),
            tcp_connect("localhost", port),
        ]))
        .expect("connect endpoint");
    let mut io = tls.connect(&connect).await.expect("connect");
    io.write_all(b"etch").await.expect("write");
    let mut buf = [0u8; 4];
    io.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"etch");
    server.await.expect("server");
}

#[tokio::test(flavor = "multi_thread")]
async fn untrusted_ca_fails_before_any_application_bytes() {
    trace_init();
    let server_side = TlsFixture::new();
    let tls = Tls::new(Tcp::new());

    let bind = tls
        .resolve(&mut stack_of(vec![server_side.server_params(), tcp_bind(0)]))
        .expect("bind endpoint");
    let acceptor = tls.bind(&bind).await.expect("bind");
    let port = acceptor.local_endpoint().next().context().port;

    let bytes_seen = Arc::new(AtomicUsize::new(0));
    let server = {
        let bytes_seen = bytes_seen.clone();
        tokio::spawn(async move {
            // The handshake fails; were it to somehow succeed, any
            // readable byte would be an application byte.
            if let Ok((mut io, _peer)) = acceptor.accept().await {
                let mut buf = [0u8; 1];
                if let Ok(n) = io.read(&mut buf).await {
                    bytes_seen.fetch_add(n, Ordering::SeqCst);
                }
            }
        })
    };

    // The client trusts a different CA entirely.
    let other = Ca::new();
    let client_id = other.issue("localhost");
    let connect = tls
        .resolve(&mut stack_of(vec![
            other.tls_params(&client_id, "localhost"),
            tcp_connect("localhost", port),
        ]))
        .expect("connect endpoint");

    let err = tls.connect(&connect).await.expect_err("handshake fails");
    assert!(err.is(ErrorKind::BadAddress));
    server.await.expect("server");
    assert_eq!(bytes_seen.load(Ordering::SeqCst), 0);
}

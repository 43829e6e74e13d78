use crate::Demux;
use skein_error::ErrorKind;
use skein_io::{AsyncReadExt, AsyncWriteExt};
use std::time::Duration;
use tokio::time::timeout;

fn pair() -> (Demux, Demux) {
    let (a, b) = skein_io::duplex(256 * 1024);
    (Demux::fiberize(a), Demux::fiberize(b))
}

fn kind_of(err: &std::io::Error) -> Option<ErrorKind> {
    skein_error::Error::kind_of(err)
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_accept_and_exchange() {
    let (client, server) = pair();
    let acceptor = server.bind(80).expect("bind");

    let (connected, accepted) = tokio::join!(client.connect(80), acceptor.accept());
    let mut connected = connected.expect("connect");
    let mut accepted = accepted.expect("accept");

    assert_eq!(connected.remote_port(), 80);
    assert_eq!(accepted.local_port(), 80);
    assert_eq!(accepted.remote_port(), connected.local_port());

    connected.write_all(b"ping").await.expect("write");
    let mut buf = [0u8; 4];
    accepted.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"ping");

    accepted.write_all(b"pong").await.expect("write back");
    connected.read_exact(&mut buf).await.expect("read back");
    assert_eq!(&buf, b"pong");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_clean_eof() {
    let (client, server) = pair();
    let acceptor = server.bind(80).expect("bind");
    let (connected, accepted) = tokio::join!(client.connect(80), acceptor.accept());
    let mut connected = connected.expect("connect");
    let mut accepted = accepted.expect("accept");

    connected.write_all(b"last words").await.expect("write");
    connected.shutdown().await.expect("shutdown");

    let mut all = Vec::new();
    accepted.read_to_end(&mut all).await.expect("drain");
    assert_eq!(&all, b"last words");
}

#[tokio::test(flavor = "multi_thread")]
async fn syn_to_unbound_port_is_refused() {
    let (client, _server) = pair();
    let err = client.connect(4444).await.expect_err("refused");
    assert!(err.is(ErrorKind::ConnectionRefused));
}

#[tokio::test(flavor = "multi_thread")]
async fn five_fibers_do_not_interfere() {
    let (client, server) = pair();
    let acceptor = server.bind(7).expect("bind");

    let server_task = tokio::spawn(async move {
        let mut echoes = Vec::new();
        for _ in 0..5 {
            let mut fiber = acceptor.accept().await.expect("accept");
            echoes.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                loop {
                    let n = fiber.read(&mut buf).await.expect("echo read");
                    if n == 0 {
                        return;
                    }
                    fiber.write_all(&buf[..n]).await.expect("echo write");
                }
            }));
        }
        for echo in echoes {
            echo.await.expect("echo");
        }
    });

    let mut tasks = Vec::new();
    for i in 0..5u8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let mut fiber = client.connect(7).await.expect("connect");
            let blob = vec![i; 100 * 1024];
            // The whole transfer fits in one window, so write-then-read
            // cannot deadlock against the echo peer.
            fiber.write_all(&blob).await.expect("write");
            fiber.shutdown().await.expect("shutdown");
            let mut received = vec![0u8; blob.len()];
            fiber.read_exact(&mut received).await.expect("read");
            assert!(received.iter().all(|&b| b == i));
        }));
    }
    for task in tasks {
        task.await.expect("client");
    }
    server_task.await.expect("server");
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_one_fiber_leaves_others_running() {
    let (client, server) = pair();
    let acceptor = server.bind(7).expect("bind");

    let (a, sa) = tokio::join!(client.connect(7), acceptor.accept());
    let (b, sb) = tokio::join!(client.connect(7), acceptor.accept());
    let mut a = a.expect("a");
    let mut sa = sa.expect("sa");
    let mut b = b.expect("b");
    let sb = sb.expect("sb");

    drop(sb); // resets fiber b's peer

    // Fiber b eventually fails...
    let mut buf = [0u8; 1];
    let err = b.read(&mut buf).await.expect_err("reset");
    assert_eq!(kind_of(&err), Some(ErrorKind::BrokenPipe));

    // ...while fiber a is untouched.
    a.write_all(b"still here").await.expect("write");
    let mut buf = [0u8; 10];
    sa.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"still here");
}

#[tokio::test(flavor = "multi_thread")]
async fn acceptor_close_interrupts_pending_accept() {
    let (_client, server) = pair();
    let acceptor = std::sync::Arc::new(server.bind(9).expect("bind"));

    let pending = {
        let acceptor = acceptor.clone();
        tokio::spawn(async move { acceptor.accept().await })
    };
    tokio::task::yield_now().await;
    acceptor.close();
    let err = pending.await.expect("join").expect_err("interrupted");
    assert!(err.is(ErrorKind::Interrupted));
}

#[tokio::test(flavor = "multi_thread")]
async fn demux_close_aborts_everything() {
    let (client, server) = pair();
    let acceptor = server.bind(5).expect("bind");
    let (fiber, accepted) = tokio::join!(client.connect(5), acceptor.accept());
    let mut fiber = fiber.expect("connect");
    let _accepted = accepted.expect("accept");

    // A connect that will never complete: no acceptor at 6 on a closed
    // demux.
    let pending_connect = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(6).await })
    };
    tokio::task::yield_now().await;

    client.close();

    let err = fiber.read(&mut [0u8; 4]).await.expect_err("aborted");
    assert_eq!(kind_of(&err), Some(ErrorKind::OperationAborted));
    let err = pending_connect
        .await
        .expect("join")
        .expect_err("connect aborted");
    assert!(err.is(ErrorKind::OperationAborted) || err.is(ErrorKind::ConnectionRefused));

    // New ops on a terminal demux fail immediately with the cached
    // status.
    assert!(client.bind(10).expect_err("terminal").is(ErrorKind::OperationAborted));
}

#[tokio::test(flavor = "multi_thread")]
async fn writer_stalls_until_credit_returns() {
    let (client, server) = pair();
    let acceptor = server.bind(3).expect("bind");
    let (fiber, accepted) = tokio::join!(client.connect(3), acceptor.accept());
    let mut fiber = fiber.expect("connect");
    let mut accepted = accepted.expect("accept");

    // More than one window of data; the receiver reads nothing yet.
    let blob = vec![0x5a; 2 * 1024 * 1024];
    let mut write = tokio::spawn(async move {
        fiber.write_all(&blob).await.expect("write");
        fiber
    });

    // The writer must stall with the receiver idle: credit is spent.
    let stalled = timeout(Duration::from_millis(200), &mut write).await;
    assert!(stalled.is_err(), "writer should be blocked on credit");

    // Draining the receiver re-credits the sender and the write
    // completes.
    let drain = tokio::spawn(async move {
        let mut total = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        while total < 2 * 1024 * 1024 {
            let n = accepted.read(&mut buf).await.expect("read");
            assert!(n > 0);
            assert!(buf[..n].iter().all(|&b| b == 0x5a));
            total += n;
        }
        total
    });

    write.await.expect("writer joins");
    assert_eq!(drain.await.expect("drain"), 2 * 1024 * 1024);
}

#[tokio::test(flavor = "multi_thread")]
async fn datagram_fibers_move_whole_messages() {
    let (client, server) = pair();
    let bound = server.bind_datagram(40).expect("bind");
    let sender = client.connect_datagram(40).expect("connect");

    sender.send(b"first").await.expect("send");
    sender.send(b"second").await.expect("send");

    let mut buf = [0u8; 16];
    let (n, from) = bound.recv_from(&mut buf).await.expect("recv");
    assert_eq!(&buf[..n], b"first");
    assert_eq!(from, sender.local_port());
    let n = bound.recv(&mut buf).await.expect("recv");
    assert_eq!(&buf[..n], b"second");
}

#[tokio::test(flavor = "multi_thread")]
async fn short_datagram_buffer_is_message_size() {
    let (client, server) = pair();
    let bound = server.bind_datagram(41).expect("bind");
    let sender = client.connect_datagram(41).expect("connect");

    sender.send(b"too big for four").await.expect("send");
    let mut buf = [0u8; 4];
    let err = bound.recv_from(&mut buf).await.expect_err("short buffer");
    assert!(err.is(ErrorKind::MessageSize));
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_datagram_is_message_size() {
    let (client, server) = pair();
    let _bound = server.bind_datagram(42).expect("bind");
    let sender = client.connect_datagram(42).expect("connect");

    let oversized = vec![0u8; client.mtu() + 1];
    let err = sender.send(&oversized).await.expect_err("over mtu");
    assert!(err.is(ErrorKind::MessageSize));
}

#[tokio::test(flavor = "multi_thread")]
async fn datagram_overflow_drops_oldest() {
    let (client, server) = pair();
    let bound = server.bind_datagram(43).expect("bind");
    let sender = client.connect_datagram(43).expect("connect");

    // Far more than the queue holds; each datagram carries its index.
    let total: u32 = 300;
    for i in 0..total {
        sender.send(&i.to_le_bytes()).await.expect("send");
    }

    // The newest datagram always survives; count what else did.
    let mut received = 0usize;
    let mut buf = [0u8; 4];
    loop {
        let n = bound.recv(&mut buf).await.expect("recv");
        assert_eq!(n, 4);
        received += 1;
        if u32::from_le_bytes(buf) == total - 1 {
            break;
        }
    }
    assert!(received <= 128, "queue bound exceeded: {}", received);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_bind_is_address_in_use() {
    let (_client, server) = pair();
    let _held = server.bind(70).expect("bind");
    assert!(server.bind(70).expect_err("dup").is(ErrorKind::AddressInUse));

    let _dgram = server.bind_datagram(71).expect("bind");
    assert!(server
        .bind_datagram(71)
        .expect_err("dup")
        .is(ErrorKind::AddressInUse));
}

#[tokio::test(flavor = "multi_thread")]
async fn allocated_ports_are_distinct() {
    let (client, server) = pair();
    let acceptor = server.bind(1).expect("bind");

    let mut seen = std::collections::HashSet::new();
    for _ in 0..10 {
        let (fiber, accepted) = tokio::join!(client.connect(1), acceptor.accept());
        let fiber = fiber.expect("connect");
        let _accepted = accepted.expect("accept");
        assert!(seen.insert(fiber.local_port()), "port reused while live");
        std::mem::forget(fiber); // hold the port for the test's duration
    }
}

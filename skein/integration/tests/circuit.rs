//! Two-hop circuit over TLS: the client reaches the server through two
//! forwarding intermediaries and echoes a large transfer.

use skein_circuit::Circuit;
use skein_integration::{stack_of, tcp_bind, tcp_connect, trace_init, TlsFixture};
use skein_io::{AsyncReadExt, AsyncWriteExt};
use skein_physical::Tcp;
use skein_stack::{params, Acceptor, ParamStack, Params, Transport};
use skein_tls::Tls;

const TRANSFER: usize = 10 * 1024 * 1024;

fn circuit_map(id: &str, forward: bool, hops: &[ParamStack]) -> Params {
    let mut map = params!["layer" => "circuit", "circuit_id" => id];
    if forward {
        map.insert("forward".into(), "true".into());
    }
    if !hops.is_empty() {
        map.insert("next_nodes".into(), ParamStack::serialize_list(hops));
    }
    map
}

fn hop_stack(fixture: &TlsFixture, id: &str, port: u16) -> ParamStack {
    stack_of(vec![
        params!["layer" => "circuit", "circuit_id" => id],
        fixture.client_params(),
        tcp_connect("localhost", port),
    ])
}

#[tokio::test(flavor = "multi_thread")]
async fn two_hop_circuit_echoes_ten_megabytes() {
    trace_init();
    let fixture = TlsFixture::new();
    // Each node runs its own stack, as separate processes would.
    let client = Circuit::new(Tls::new(Tcp::new()));
    let server_node = Circuit::new(Tls::new(Tcp::new()));
    let h1_node = Circuit::new(Tls::new(Tcp::new()));
    let h2_node = Circuit::new(Tls::new(Tcp::new()));

    // The terminating server.
    let server_acceptor = server_node
        .bind(
            &server_node
                .resolve(&mut stack_of(vec![
                    circuit_map("server", false, &[]),
                    fixture.server_params(),
                    tcp_bind(0),
                ]))
                .expect("server endpoint"),
        )
        .await
        .expect("bind server");
    let server_port = server_acceptor.local_endpoint().next().next().context().port;

    // Two forwarding intermediaries.
    let h1_acceptor = h1_node
        .bind(
            &h1_node
                .resolve(&mut stack_of(vec![
                    circuit_map("h1", true, &[]),
                    fixture.server_params(),
                    tcp_bind(0),
                ]))
                .expect("h1 endpoint"),
        )
        .await
        .expect("bind h1");
    let h1_port = h1_acceptor.local_endpoint().next().next().context().port;

    let h2_acceptor = h2_node
        .bind(
            &h2_node
                .resolve(&mut stack_of(vec![
                    circuit_map("h2", true, &[]),
                    fixture.server_params(),
                    tcp_bind(0),
                ]))
                .expect("h2 endpoint"),
        )
        .await
        .expect("bind h2");
    let h2_port = h2_acceptor.local_endpoint().next().next().context().port;

    let server = tokio::spawn(async move {
        let (mut io, _peer) = server_acceptor.accept().await.expect("accept");
        let mut echoed = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        while echoed < TRANSFER {
            let n = io.read(&mut buf).await.expect("read");
            assert!(n > 0, "early eof at {}", echoed);
            io.write_all(&buf[..n]).await.expect("write");
            echoed += n;
        }
        echoed
    });

    // Client: h1 first, then h2, then the server.
    let hops = vec![
        hop_stack(&fixture, "h2", h2_port),
        hop_stack(&fixture, "server", server_port),
    ];
    let connect = client
        .resolve(&mut stack_of(vec![
            circuit_map("h1", false, &hops),
            fixture.client_params(),
            tcp_connect("localhost", h1_port),
        ]))
        .expect("client endpoint");
    let io = client.connect(&connect).await.expect("connect chain");

    let payload: Vec<u8> = (0..TRANSFER).map(|i| (i % 251) as u8).collect();
    let (mut rx, mut tx) = skein_io::split(io);
    let write = {
        let payload = payload.clone();
        tokio::spawn(async move {
            tx.write_all(&payload).await.expect("write");
            tx.flush().await.expect("flush");
        })
    };
    let mut received = vec![0u8; TRANSFER];
    rx.read_exact(&mut received).await.expect("read back");
    assert!(received == payload, "echoed bytes differ");
    write.await.expect("writer");

    assert_eq!(server.await.expect("server"), TRANSFER);

    // Both intermediaries carried exactly one splice each.
    assert_eq!(h1_acceptor.manager().len(), 1);
    assert_eq!(h2_acceptor.manager().len(), 1);
    h1_acceptor.close().await.expect("close h1");
    h2_acceptor.close().await.expect("close h2");
}

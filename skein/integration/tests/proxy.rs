//! HTTP-proxy traversal with NTLM: three messages on one proxy
//! connection, then a TLS handshake with the real server through the
//! tunnel.

use skein_integration::{stack_of, tcp_bind, tcp_connect, trace_init, TlsFixture};
use skein_io::{AsyncReadExt, AsyncWriteExt};
use skein_physical::Tcp;
use skein_proxy::HttpProxy;
use skein_stack::{params, Acceptor, Transport};
use skein_tls::Tls;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

async fn read_head(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read line");
        let line = line.trim_end().to_string();
        if line.is_empty() {
            return lines;
        }
        lines.push(line);
    }
}

/// A CONNECT proxy that demands NTLM and then splices to the target.
async fn ntlm_proxy(listener: TcpListener, target_port: u16) {
    let (stream, _) = listener.accept().await.expect("accept");
    let (rx, mut tx) = stream.into_split();
    let mut reader = BufReader::new(rx);

    let first = read_head(&mut reader).await;
    assert!(first[0].starts_with("CONNECT localhost:"));
    assert!(!first.iter().any(|l| l.starts_with("Proxy-Authorization")));
    tx.write_all(
        b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM\r\n\r\n",
    )
    .await
    .expect("challenge");

    let second = read_head(&mut reader).await;
    let type1 = second
        .iter()
        .find_map(|l| l.strip_prefix("Proxy-Authorization: NTLM "))
        .expect("type1");
    let type1 = base64::decode(type1).expect("base64 type1");
    assert_eq!(&type1[..8], b"NTLMSSP\0");
    assert_eq!(type1[8], 1);

    let mut type2 = Vec::new();
    type2.extend_from_slice(b"NTLMSSP\0");
    type2.extend_from_slice(&2u32.to_le_bytes());
    type2.extend_from_slice(&[0u8; 8]);
    type2.extend_from_slice(&0x0008_8205u32.to_le_bytes());
    type2.extend_from_slice(&[0x42; 8]);
    type2.extend_from_slice(&[0u8; 8]);
    type2.extend_from_slice(&[0, 0, 0, 0, 48, 0, 0, 0]);
    tx.write_all(
        format!(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM {}\r\n\r\n",
            base64::encode(&type2)
        )
        .as_bytes(),
    )
    .await
    .expect("type2");

    let third = read_head(&mut reader).await;
    let type3 = third
        .iter()
        .find_map(|l| l.strip_prefix("Proxy-Authorization: NTLM "))
        .expect("type3");
    let type3 = base64::decode(type3).expect("base64 type3");
    assert_eq!(type3[8], 3);

    tx.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .expect("established");

    // Tunnel: splice the proxy client to the real server.
    let upstream = TcpStream::connect(("127.0.0.1", target_port))
        .await
        .expect("connect upstream");
    let downstream = reader.into_inner().reunite(tx).expect("reunite");
    let _ = skein_duplex::splice(downstream, upstream).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ntlm_tunnel_then_tls_echo() {
    trace_init();
    let fixture = TlsFixture::new();

    // The real TLS server.
    let tls = Tls::new(Tcp::new());
    let acceptor = tls
        .bind(
            &tls.resolve(&mut stack_of(vec![fixture.server_params(), tcp_bind(0)]))
                .expect("server endpoint"),
        )
        .await
        .expect("bind server");
    let server_port = acceptor.local_endpoint().next().context().port;

    let server = tokio::spawn(async move {
        let (mut io, _peer) = acceptor.accept().await.expect("accept");
        let mut buf = [0u8; 5];
        io.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"relay");
        io.write_all(b"nice!").await.expect("write");
        io.shutdown().await.ok();
    });

    // The NTLM proxy in front of it.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let proxy_port = listener.local_addr().expect("addr").port();
    let proxy_task = tokio::spawn(ntlm_proxy(listener, server_port));

    // Client stack: TLS over HTTP proxy over TCP.
    let stack = Tls::new(HttpProxy::new(Tcp::new()));
    let connect = stack
        .resolve(&mut stack_of(vec![
            fixture.client_params(),
            params![
                "layer" => "http_proxy",
                "http_host" => "127.0.0.1",
                "http_port" => proxy_port,
                "http_username" => "user",
                "http_domain" => "WORKGROUP",
                "http_password" => "secret",
            ],
            tcp_connect("localhost", server_port),
        ]))
        .expect("client endpoint");

    let mut io = stack.connect(&connect).await.expect("connect via proxy");
    io.write_all(b"relay").await.expect("write");
    let mut buf = [0u8; 5];
    io.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"nice!");

    server.await.expect("server");
    drop(io);
    proxy_task.await.expect("proxy");
}

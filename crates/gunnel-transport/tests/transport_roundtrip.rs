//! Integration tests for the QUIC transport: framed message round-trips,
//! raw byte phases, and half-close semantics over a real connection pair.

use gunnel_metrics::MetricsRegistry;
use gunnel_proto::{Message, Register, RegisterResp};
use gunnel_transport::{ClientTls, ServerTls, TransportConfig, TunnelConnector, TunnelListener};

fn init() {
    let _ = rustls::crypto::ring::default_provider().install_default();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

fn listener() -> TunnelListener {
    TunnelListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        ServerTls::self_signed("localhost").unwrap(),
        TransportConfig::default(),
        MetricsRegistry::new(),
    )
    .unwrap()
}

fn connector() -> TunnelConnector {
    TunnelConnector::new(
        ClientTls::insecure(),
        TransportConfig::default(),
        MetricsRegistry::new(),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn framed_messages_round_trip() {
    init();

    let listener = listener();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (session, _) = listener.accept().await.unwrap();
        let mut stream = session.accept_stream().await.unwrap().unwrap();

        let msg = stream.recv_message().await.unwrap().unwrap();
        let reg = match msg {
            Message::Register(reg) => reg,
            other => panic!("expected Register, got {other:?}"),
        };
        assert_eq!(reg.subdomain, "test");
        assert_eq!(reg.token, "sekret");

        stream
            .send_message(&Message::RegisterResp(RegisterResp {
                success: true,
                subdomain: reg.subdomain,
                message: "success".into(),
            }))
            .await
            .unwrap();
    });

    let session = connector().connect(addr, "localhost").await.unwrap();
    let mut stream = session.open_stream().await.unwrap();

    stream
        .send_message(&Message::Register(Register {
            subdomain: "test".into(),
            host: "localhost".into(),
            port: 3000,
            protocol: gunnel_proto::Protocol::Http,
            token: "sekret".into(),
        }))
        .await
        .unwrap();

    match stream.recv_message().await.unwrap().unwrap() {
        Message::RegisterResp(resp) => {
            assert!(resp.success);
            assert_eq!(resp.subdomain, "test");
        }
        other => panic!("expected RegisterResp, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn half_close_propagates_eof_and_keeps_read_side_open() {
    init();

    let listener = listener();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (session, _) = listener.accept().await.unwrap();
        let mut stream = session.accept_stream().await.unwrap().unwrap();

        // Drain the request until EOF from the peer's half-close.
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        assert_eq!(request, b"request-bytes");

        // Read side closed on the peer; our write side must still work.
        stream.write_all(b"response-bytes").await.unwrap();
        stream.close_write().unwrap();
    });

    let session = connector().connect(addr, "localhost").await.unwrap();
    let mut stream = session.open_stream().await.unwrap();

    stream.write_all(b"request-bytes").await.unwrap();
    stream.close_write().unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
    }
    assert_eq!(response, b"response-bytes");

    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_frame_kinds_are_skipped() {
    init();

    let listener = listener();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (session, _) = listener.accept().await.unwrap();
        let mut stream = session.accept_stream().await.unwrap().unwrap();

        // The unknown kind-42 frame must be dropped, not kill the stream.
        match stream.recv_message().await.unwrap().unwrap() {
            Message::Heartbeat { .. } => {}
            other => panic!("expected Heartbeat, got {other:?}"),
        }
    });

    let session = connector().connect(addr, "localhost").await.unwrap();
    let mut stream = session.open_stream().await.unwrap();

    stream.write_all(&[42, 0, 0, 0, 0]).await.unwrap();
    stream
        .send_message(&Message::Heartbeat {
            message: String::new(),
        })
        .await
        .unwrap();

    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_reads_drain_bytes_buffered_past_the_framed_phase() {
    init();

    let listener = listener();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (session, _) = listener.accept().await.unwrap();
        let mut stream = session.accept_stream().await.unwrap().unwrap();

        match stream.recv_message().await.unwrap().unwrap() {
            Message::BeginStream { subdomain } => assert_eq!(subdomain, "test"),
            other => panic!("expected BeginStream, got {other:?}"),
        }

        // The raw payload following the frame may already sit in the
        // receive buffer; read() must yield it before new transport reads.
        let mut body = vec![0u8; 9];
        let mut filled = 0;
        while filled < body.len() {
            let n = stream.read(&mut body[filled..]).await.unwrap();
            assert_ne!(n, 0, "unexpected EOF");
            filled += n;
        }
        assert_eq!(&body, b"raw-bytes");
    });

    let session = connector().connect(addr, "localhost").await.unwrap();
    let mut stream = session.open_stream().await.unwrap();

    // Frame and raw payload in a single write so they arrive together.
    let mut bytes = Message::BeginStream {
        subdomain: "test".into(),
    }
    .encode()
    .unwrap()
    .to_vec();
    bytes.extend_from_slice(b"raw-bytes");
    stream.write_all(&bytes).await.unwrap();

    server.await.unwrap();
}

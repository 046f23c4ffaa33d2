//! End-to-end tests: hub, agent, and a local HTTP backend wired over real
//! QUIC. Covers the happy path, unknown subdomains, auth rejection,
//! readiness timeouts, superseding sessions, and agent reconnection.

use gunnel_agent::{Agent, AgentConfig, BackendConfig};
use gunnel_hub::{Manager, ManagerConfig, TokenValidator};
use gunnel_metrics::MetricsRegistry;
use gunnel_proto::{Message, Protocol, Register};
use gunnel_transport::{
    ClientTls, ServerTls, Session, TransportConfig, TunnelConnector, TunnelListener, TunnelStream,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn init() {
    let _ = rustls::crypto::ring::default_provider().install_default();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

struct TestHub {
    manager: Arc<Manager>,
    quic_addr: SocketAddr,
    http_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_hub(token: Option<&str>, readiness_timeout: Duration) -> TestHub {
    let metrics = MetricsRegistry::new();
    let manager = Manager::new(
        metrics.clone(),
        ManagerConfig {
            readiness_timeout,
            ..ManagerConfig::default()
        },
    );

    if let Some(expected) = token {
        let expected = expected.to_string();
        let validator: TokenValidator = Arc::new(move |presented: &str| presented == expected);
        manager.set_token_validator(validator);
    }

    let quic_listener = TunnelListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        ServerTls::self_signed("localhost").unwrap(),
        TransportConfig::default(),
        metrics.clone(),
    )
    .unwrap();
    let quic_addr = quic_listener.local_addr().unwrap();

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();

    {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    accepted = quic_listener.accept() => accepted,
                };
                let Ok((session, _)) = accepted else { return };
                let manager = manager.clone();
                tokio::spawn(async move { manager.handle_session(session).await });
            }
        });
    }

    {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    accepted = http_listener.accept() => accepted,
                };
                let Ok((conn, peer)) = accepted else { return };
                let manager = manager.clone();
                tokio::spawn(async move { manager.handle_http_conn(conn, peer).await });
            }
        });
    }

    TestHub {
        manager,
        quic_addr,
        http_addr,
        shutdown,
    }
}

/// Minimal HTTP backend returning a fixed 200 response per connection.
async fn start_backend(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                // Drain the request head before answering.
                let mut buf = [0u8; 4096];
                let mut head = Vec::new();
                loop {
                    let Ok(n) = conn.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = conn.write_all(response.as_bytes()).await;
                let _ = conn.shutdown().await;
            });
        }
    });

    addr
}

fn agent_config(quic_addr: SocketAddr, subdomain: &str, backend_addr: SocketAddr) -> AgentConfig {
    let mut config = AgentConfig {
        server_addr: quic_addr.to_string(),
        insecure: true,
        reconnect_delay_secs: 1,
        ..AgentConfig::default()
    };
    config.backend.insert(
        "test".to_string(),
        BackendConfig {
            host: backend_addr.ip().to_string(),
            port: backend_addr.port(),
            subdomain: subdomain.to_string(),
            protocol: Protocol::Http,
        },
    );
    config
}

async fn wait_for_clients(hub: &TestHub, want: usize) {
    for _ in 0..100 {
        if hub.manager.client_count().await == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "registry never reached {want} clients (has {})",
        hub.manager.client_count().await
    );
}

/// Issue a GET and return `(status, body)`.
async fn http_get(addr: SocketAddr, host: &str) -> (u16, String) {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(
        format!("GET / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n").as_bytes(),
    )
    .await
    .unwrap();

    let mut raw = Vec::new();
    conn.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();

    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

/// Register a subdomain by hand, without a full agent behind it.
async fn raw_register(
    quic_addr: SocketAddr,
    subdomain: &str,
    token: &str,
) -> (Session, TunnelStream, Message) {
    let connector = TunnelConnector::new(
        ClientTls::insecure(),
        TransportConfig::default(),
        MetricsRegistry::new(),
    )
    .unwrap();
    let session = connector.connect(quic_addr, "127.0.0.1").await.unwrap();
    let mut control = session.open_stream().await.unwrap();

    control
        .send_message(&Message::Register(Register {
            subdomain: subdomain.to_string(),
            host: "localhost".to_string(),
            port: 1,
            protocol: Protocol::Http,
            token: token.to_string(),
        }))
        .await
        .unwrap();
    let resp = control.recv_message().await.unwrap().unwrap();

    (session, control, resp)
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_get_round_trip() {
    init();

    let hub = start_hub(None, Duration::from_secs(30)).await;
    let backend_addr = start_backend("hello-through-gunnel").await;

    let shutdown = CancellationToken::new();
    let mut agent = Agent::new(
        agent_config(hub.quic_addr, "test", backend_addr),
        MetricsRegistry::new(),
    );
    let agent_shutdown = shutdown.clone();
    tokio::spawn(async move { agent.run(agent_shutdown).await });

    wait_for_clients(&hub, 1).await;

    let (status, body) = http_get(hub.http_addr, "test.localhost").await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello-through-gunnel");

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_subdomain_is_404() {
    init();

    let hub = start_hub(None, Duration::from_secs(30)).await;

    let (status, body) = http_get(hub.http_addr, "ghost.localhost").await;
    assert_eq!(status, 404);
    assert_eq!(body, r#"{"message":"no service found for subdomain ghost"}"#);
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_token_is_rejected_and_registry_untouched() {
    init();

    let hub = start_hub(Some("sekret"), Duration::from_secs(30)).await;

    let (_session, _control, resp) = raw_register(hub.quic_addr, "test", "wrong").await;
    match resp {
        Message::RegisterResp(resp) => {
            assert!(!resp.success);
            assert!(resp.message.contains("unauthorized"), "{}", resp.message);
        }
        other => panic!("expected RegisterResp, got {other:?}"),
    }

    assert_eq!(hub.manager.client_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn correct_token_is_accepted() {
    init();

    let hub = start_hub(Some("sekret"), Duration::from_secs(30)).await;

    let (_session, _control, resp) = raw_register(hub.quic_addr, "test", "sekret").await;
    match resp {
        Message::RegisterResp(resp) => assert!(resp.success, "{}", resp.message),
        other => panic!("expected RegisterResp, got {other:?}"),
    }

    assert_eq!(hub.manager.client_count().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn stuck_agent_hits_readiness_timeout() {
    init();

    // Short readiness window so the test stays fast.
    let hub = start_hub(None, Duration::from_secs(1)).await;

    // Registers, then never services data streams.
    let (_session, _control, resp) = raw_register(hub.quic_addr, "test", "").await;
    match resp {
        Message::RegisterResp(resp) => assert!(resp.success),
        other => panic!("expected RegisterResp, got {other:?}"),
    }

    let (status, body) = http_get(hub.http_addr, "test.localhost").await;
    assert_eq!(status, 500);
    assert_eq!(body, r#"{"message":"client connection not ready in time"}"#);
}

#[tokio::test(flavor = "multi_thread")]
async fn new_session_supersedes_a_dead_one() {
    init();

    let hub = start_hub(None, Duration::from_secs(30)).await;

    let (session_a, _control_a, resp_a) = raw_register(hub.quic_addr, "test", "").await;
    match resp_a {
        Message::RegisterResp(resp) => assert!(resp.success),
        other => panic!("expected RegisterResp, got {other:?}"),
    }

    session_a.close(0, "gone");

    // B may register while A's teardown is still in flight; either way it
    // must win and end up as the only owner. Keep the winning session
    // alive past the assertion.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut winner = None;
    while winner.is_none() {
        let (session_b, control_b, resp_b) = raw_register(hub.quic_addr, "test", "").await;
        match resp_b {
            Message::RegisterResp(resp) if resp.success => {
                winner = Some((session_b, control_b));
            }
            Message::RegisterResp(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Message::RegisterResp(resp) => {
                panic!("replacement session was never accepted: {}", resp.message)
            }
            other => panic!("expected RegisterResp, got {other:?}"),
        }
    }

    assert_eq!(hub.manager.client_count().await, 1);
    drop(winner);
}

#[tokio::test(flavor = "multi_thread")]
async fn reserved_subdomain_routes_to_the_dashboard_hook() {
    init();

    let hub = start_hub(None, Duration::from_secs(30)).await;

    // Without a handler the reserved label reports its absence.
    let (status, body) = http_get(hub.http_addr, "gunnel.localhost").await;
    assert_eq!(status, 500);
    assert_eq!(body, r#"{"message":"gunnel subdomain handler not set"}"#);

    hub.manager.set_dashboard_handler(Arc::new(|head| {
        gunnel_hub::HttpResponse::json(
            200,
            &serde_json::json!({ "path": head.path, "dashboard": true }),
        )
    }));

    let (status, body) = http_get(hub.http_addr, "gunnel.localhost").await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""dashboard":true"#), "{body}");
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_snapshot_reflects_proxied_traffic() {
    init();

    let hub = start_hub(None, Duration::from_secs(30)).await;
    let backend_addr = start_backend("hello-through-gunnel").await;

    let shutdown = CancellationToken::new();
    let mut agent = Agent::new(
        agent_config(hub.quic_addr, "test", backend_addr),
        MetricsRegistry::new(),
    );
    let agent_shutdown = shutdown.clone();
    tokio::spawn(async move { agent.run(agent_shutdown).await });

    wait_for_clients(&hub, 1).await;
    let (status, _) = http_get(hub.http_addr, "test.localhost").await;
    assert_eq!(status, 200);

    let stats = hub.manager.stats_snapshot().await;
    assert_eq!(stats.total_clients, 1);
    assert_eq!(stats.clients[0].subdomain, "test");
    assert!(stats.clients[0].connected);
    // The control stream and at least one data stream moved bytes.
    assert!(stats.stats.total_streams >= 2, "{:?}", stats.stats);
    assert!(stats.stats.total_bytes_in > 0);
    assert!(stats.stats.total_bytes_out > 0);

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_reconnects_after_hub_drops_the_session() {
    init();

    let hub = start_hub(None, Duration::from_secs(30)).await;
    let backend_addr = start_backend("hello-through-gunnel").await;

    let shutdown = CancellationToken::new();
    let mut agent = Agent::new(
        agent_config(hub.quic_addr, "test", backend_addr),
        MetricsRegistry::new(),
    );
    let agent_shutdown = shutdown.clone();
    tokio::spawn(async move { agent.run(agent_shutdown).await });

    wait_for_clients(&hub, 1).await;

    // Kill the session from the hub side.
    let mut victims = Vec::new();
    hub.manager
        .for_each_client(|_, conn| victims.push(conn.clone()))
        .await;
    for conn in victims {
        conn.disconnect();
    }

    // The agent redials after its reconnect delay and re-registers; a
    // request then succeeds again.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if hub.manager.client_count().await == 1 {
            let (status, body) = http_get(hub.http_addr, "test.localhost").await;
            if status == 200 && body == "hello-through-gunnel" {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "agent never recovered"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    shutdown.cancel();
}

//! Heartbeat behaviour over a real QUIC pair: liveness while both sides
//! run, watchdog disconnect when the emitter goes silent.

use gunnel_control::{Connection, ConnectionConfig, HeartbeatRole, LogOnlyHandler};
use gunnel_metrics::MetricsRegistry;
use gunnel_proto::Message;
use gunnel_transport::{ClientTls, ServerTls, TransportConfig, TunnelConnector, TunnelListener};
use std::sync::Arc;
use std::time::Duration;

fn init() {
    let _ = rustls::crypto::ring::default_provider().install_default();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

fn quic_pair() -> (TunnelListener, TunnelConnector) {
    let listener = TunnelListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        ServerTls::self_signed("localhost").unwrap(),
        TransportConfig::default(),
        MetricsRegistry::new(),
    )
    .unwrap();
    let connector = TunnelConnector::new(
        ClientTls::insecure(),
        TransportConfig::default(),
        MetricsRegistry::new(),
    )
    .unwrap();
    (listener, connector)
}

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(300),
        send_queue_capacity: 50,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeats_keep_both_sides_alive() {
    init();

    let (listener, connector) = quic_pair();
    let addr = listener.local_addr().unwrap();

    let hub = tokio::spawn(async move {
        let (session, _) = listener.accept().await.unwrap();
        let control = session.accept_stream().await.unwrap().unwrap();
        Connection::spawn(
            session,
            control,
            HeartbeatRole::Responder,
            Arc::new(LogOnlyHandler),
            fast_config(),
        )
    });

    let session = connector.connect(addr, "localhost").await.unwrap();
    let mut control = session.open_stream().await.unwrap();
    // First write makes the stream visible to the hub's accept.
    control
        .send_message(&Message::Heartbeat {
            message: String::new(),
        })
        .await
        .unwrap();

    let agent = Connection::spawn(
        session,
        control,
        HeartbeatRole::Emitter,
        Arc::new(LogOnlyHandler),
        fast_config(),
    );
    let hub = hub.await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(agent.connected());
    assert!(hub.connected());

    let agent_stats = agent.heartbeat_stats();
    let hub_stats = hub.heartbeat_stats();

    // The emitter sent heartbeats and got replies back; nobody missed.
    assert!(agent_stats.sent >= 2, "emitter sent {}", agent_stats.sent);
    assert!(
        agent_stats.received >= 1,
        "emitter received {}",
        agent_stats.received
    );
    assert!(hub_stats.received >= 2, "hub received {}", hub_stats.received);
    assert_eq!(agent_stats.missed, 0);
    assert_eq!(hub_stats.missed, 0);

    agent.disconnect();
    hub.disconnect();
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_peer_trips_the_watchdog() {
    init();

    let (listener, connector) = quic_pair();
    let addr = listener.local_addr().unwrap();

    let hub = tokio::spawn(async move {
        let (session, _) = listener.accept().await.unwrap();
        let control = session.accept_stream().await.unwrap().unwrap();
        Connection::spawn(
            session,
            control,
            HeartbeatRole::Responder,
            Arc::new(LogOnlyHandler),
            fast_config(),
        )
    });

    // A misbehaving agent: announces itself with one heartbeat, then
    // never emits again. The session stays open.
    let session = connector.connect(addr, "localhost").await.unwrap();
    let mut control = session.open_stream().await.unwrap();
    control
        .send_message(&Message::Heartbeat {
            message: String::new(),
        })
        .await
        .unwrap();

    let hub = hub.await.unwrap();

    // Within one watchdog tick past the timeout the hub must give up.
    tokio::time::sleep(Duration::from_millis(900)).await;

    assert!(!hub.connected(), "hub should have dropped the silent agent");
    assert!(hub.heartbeat_stats().missed >= 1);

    drop(control);
    drop(session);
}

//! The per-session control connection and its background tasks.

use crate::ControlError;
use async_trait::async_trait;
use gunnel_proto::Message;
use gunnel_transport::{Session, TunnelStream};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which side of the session emits heartbeats. Exactly one side emits: the
/// dialing side (the agent). The other side only replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatRole {
    Emitter,
    Responder,
}

/// Control-plane tunables. Defaults match the protocol's design values;
/// both hub and agent expose them through their configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub send_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(25),
            send_queue_capacity: 50,
        }
    }
}

/// Snapshot of heartbeat bookkeeping.
#[derive(Debug, Clone)]
pub struct HeartbeatStats {
    /// Time since the last heartbeat arrived.
    pub last_received: Duration,
    pub sent: u64,
    pub received: u64,
    pub missed: u64,
}

/// Receives control messages the connection itself does not consume.
///
/// On the hub this is the registration handler; on the agent the control
/// stream never carries application messages, so [`LogOnlyHandler`] is
/// enough.
#[async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    async fn handle(&self, conn: &Arc<Connection>, msg: Message) -> Result<(), ControlError>;
}

/// Handler that logs and drops everything it is given.
pub struct LogOnlyHandler;

#[async_trait]
impl ControlHandler for LogOnlyHandler {
    async fn handle(&self, conn: &Arc<Connection>, msg: Message) -> Result<(), ControlError> {
        warn!(addr = %conn.remote_address(), kind = %msg.kind(), "unexpected control message");
        Ok(())
    }
}

struct HeartbeatCounters {
    last_received: Mutex<Instant>,
    sent: AtomicU64,
    received: AtomicU64,
    missed: AtomicU64,
}

/// The control connection of one agent session.
///
/// Owns the session handle; data streams for proxied requests are opened
/// through [`Connection::acquire`].
pub struct Connection {
    session: Session,
    addr: SocketAddr,
    send_tx: mpsc::Sender<Message>,
    connected: AtomicBool,
    last_active: Mutex<Instant>,
    role: HeartbeatRole,
    config: ConnectionConfig,
    heartbeat: HeartbeatCounters,
    cancel: CancellationToken,
}

impl Connection {
    /// Wrap the control stream and start the background tasks: receive
    /// loop, queue drainer, heartbeat emitter/watchdog. All exit when the
    /// session's cancellation token fires.
    pub fn spawn(
        session: Session,
        control: TunnelStream,
        role: HeartbeatRole,
        handler: Arc<dyn ControlHandler>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_capacity);
        let cancel = session.cancellation();
        let addr = session.remote_address();

        let conn = Arc::new(Self {
            session,
            addr,
            send_tx,
            connected: AtomicBool::new(true),
            last_active: Mutex::new(Instant::now()),
            role,
            config,
            heartbeat: HeartbeatCounters {
                last_received: Mutex::new(Instant::now()),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                missed: AtomicU64::new(0),
            },
            cancel,
        });

        let (send_half, recv_half) = control.split();
        conn.clone().spawn_receive_loop(recv_half, handler);
        conn.clone().spawn_send_loop(send_half, send_rx);
        conn.clone().spawn_heartbeat();

        info!(addr = %conn.addr, role = ?role, "control connection started");
        conn
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.addr
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap()
    }

    pub fn heartbeat_stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            last_received: self.heartbeat.last_received.lock().unwrap().elapsed(),
            sent: self.heartbeat.sent.load(Ordering::Relaxed),
            received: self.heartbeat.received.load(Ordering::Relaxed),
            missed: self.heartbeat.missed.load(Ordering::Relaxed),
        }
    }

    /// Number of active data streams on this session, optionally filtered
    /// by subdomain.
    pub fn stream_count(&self, subdomain: Option<&str>) -> usize {
        self.session.active_streams(subdomain)
    }

    /// Queue a message for the control stream. Blocks when the bounded
    /// queue is full; fails non-fatally when disconnected.
    pub async fn send(&self, msg: Message) -> Result<(), ControlError> {
        if !self.connected() {
            warn!(addr = %self.addr, "not connected, dropping outbound message");
            return Err(ControlError::NotConnected);
        }
        self.send_tx
            .send(msg)
            .await
            .map_err(|_| ControlError::QueueClosed)
    }

    /// Open a fresh data stream on the session.
    pub async fn acquire(&self) -> Result<TunnelStream, ControlError> {
        self.mark_active();
        Ok(self.session.open_stream().await?)
    }

    /// Close a data stream acquired from this connection.
    pub fn release(&self, mut stream: TunnelStream) {
        stream.close();
        self.mark_active();
        debug!(addr = %self.addr, stream_id = stream.id(), "released stream");
    }

    /// Tear the session down. Safe to call more than once.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.mark_active();
            self.session.close(0, "disconnect");
            debug!(addr = %self.addr, "disconnected");
        }
    }

    fn mark_active(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    fn spawn_receive_loop(
        self: Arc<Self>,
        mut recv: gunnel_transport::RecvHalf,
        handler: Arc<dyn ControlHandler>,
    ) {
        tokio::spawn(async move {
            let cancel = self.cancel.clone();
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(addr = %self.addr, "control receive loop cancelled");
                        return;
                    }
                    msg = recv.recv_message() => msg,
                };

                match msg {
                    Ok(Some(msg)) => self.clone().handle_message(msg, &handler).await,
                    Ok(None) => {
                        info!(addr = %self.addr, "control stream closed by peer");
                        self.disconnect();
                        return;
                    }
                    Err(e) => {
                        error!(addr = %self.addr, error = %e, "failed to read control message");
                        self.disconnect();
                        return;
                    }
                }
            }
        });
    }

    fn spawn_send_loop(
        self: Arc<Self>,
        mut send: gunnel_transport::SendHalf,
        mut send_rx: mpsc::Receiver<Message>,
    ) {
        tokio::spawn(async move {
            let cancel = self.cancel.clone();
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(addr = %self.addr, "control send loop cancelled");
                        return;
                    }
                    msg = send_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => return,
                    },
                };

                if let Err(e) = send.send_message(&msg).await {
                    error!(addr = %self.addr, error = %e, "failed to send control message");
                    self.disconnect();
                    return;
                }
                self.mark_active();
            }
        });
    }

    fn spawn_heartbeat(self: Arc<Self>) {
        tokio::spawn(async move {
            let cancel = self.cancel.clone();

            let mut emit = tokio::time::interval(self.config.heartbeat_interval);
            emit.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut watchdog = tokio::time::interval(self.config.heartbeat_timeout);
            watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of an interval fires immediately.
            emit.tick().await;
            watchdog.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(addr = %self.addr, "heartbeat loop cancelled");
                        return;
                    }
                    _ = emit.tick() => {
                        if self.role == HeartbeatRole::Emitter {
                            self.send_heartbeat().await;
                        }
                    }
                    _ = watchdog.tick() => {
                        let silent_for = self.heartbeat.last_received.lock().unwrap().elapsed();
                        if silent_for > self.config.heartbeat_timeout {
                            self.heartbeat.missed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                addr = %self.addr,
                                silent_secs = silent_for.as_secs(),
                                "no heartbeat received, connection is stale"
                            );
                            self.disconnect();
                            return;
                        }
                    }
                }
            }
        });
    }

    async fn send_heartbeat(&self) {
        let heartbeat = Message::Heartbeat {
            message: String::new(),
        };
        if self.send(heartbeat).await.is_ok() {
            self.heartbeat.sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn handle_message(self: Arc<Self>, msg: Message, handler: &Arc<dyn ControlHandler>) {
        self.mark_active();

        match msg {
            Message::Heartbeat { .. } => {
                *self.heartbeat.last_received.lock().unwrap() = Instant::now();
                self.heartbeat.received.fetch_add(1, Ordering::Relaxed);

                // Replying from the emitter too would ping-pong forever.
                if self.role == HeartbeatRole::Responder {
                    self.send_heartbeat().await;
                }
            }
            Message::Disconnect { reason } => {
                info!(addr = %self.addr, reason, "peer disconnected");
                self.disconnect();
            }
            Message::Error { message } if !message.is_empty() => {
                error!(addr = %self.addr, message, "error from peer");
                self.disconnect();
            }
            Message::Error { .. } => {}
            other => {
                if let Err(e) = handler.handle(&self, other).await {
                    error!(addr = %self.addr, error = %e, "control handler failed");
                }
            }
        }
    }
}

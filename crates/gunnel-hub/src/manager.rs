//! The hub manager: registration, routing, and the per-request proxy flow.

use crate::http::{self, HttpError, HttpResponse, RequestHead};
use crate::registry::{ClientHandle, Registry};
use crate::RESERVED_SUBDOMAIN;
use async_trait::async_trait;
use gunnel_control::{
    Connection, ConnectionConfig, ControlError, ControlHandler, HeartbeatRole, HeartbeatStats,
};
use gunnel_metrics::{MetricsRegistry, StreamSnapshot, StreamStats};
use gunnel_proto::{Message, Register, RegisterResp};
use gunnel_transport::{Session, TunnelStream};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Auth hook: given the token an agent presented, allow or reject.
pub type TokenValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Dashboard hook for the reserved subdomain.
pub type DashboardHandler = Arc<dyn Fn(&RequestHead) -> HttpResponse + Send + Sync>;

/// ACME HTTP-01 hook; returns `None` when the request is not a challenge.
pub type AcmeChallengeHandler = Arc<dyn Fn(&RequestHead) -> Option<HttpResponse> + Send + Sync>;

impl ClientHandle for Arc<Connection> {
    fn connected(&self) -> bool {
        Connection::connected(self)
    }

    fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("no service found for subdomain {0}")]
    NotFound(String),

    #[error("service temporarily unavailable: {0}")]
    Unavailable(String),
}

/// Manager tunables.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long the proxy waits for an agent's ConnectionReady.
    pub readiness_timeout: Duration,
    pub control: ConnectionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(30),
            control: ConnectionConfig::default(),
        }
    }
}

/// Routes inbound user requests to registered agent sessions.
pub struct Manager {
    registry: RwLock<Registry<Arc<Connection>>>,
    token_validator: std::sync::RwLock<Option<TokenValidator>>,
    dashboard_handler: std::sync::RwLock<Option<DashboardHandler>>,
    acme_handler: std::sync::RwLock<Option<AcmeChallengeHandler>>,
    metrics: MetricsRegistry,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(metrics: MetricsRegistry, config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(Registry::new()),
            token_validator: std::sync::RwLock::new(None),
            dashboard_handler: std::sync::RwLock::new(None),
            acme_handler: std::sync::RwLock::new(None),
            metrics,
            config,
        })
    }

    pub fn set_token_validator(&self, validator: TokenValidator) {
        *self.token_validator.write().unwrap() = Some(validator);
    }

    pub fn set_dashboard_handler(&self, handler: DashboardHandler) {
        *self.dashboard_handler.write().unwrap() = Some(handler);
    }

    pub fn set_acme_handler(&self, handler: AcmeChallengeHandler) {
        *self.acme_handler.write().unwrap() = Some(handler);
    }

    // ---- control plane ----------------------------------------------------

    /// Take over a freshly accepted agent session: the agent's first stream
    /// is the control stream.
    pub async fn handle_session(self: Arc<Self>, session: Session) {
        let control = match session.accept_stream().await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                error!("connection closed before the control stream arrived");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to accept control stream");
                return;
            }
        };

        let conn = Connection::spawn(
            session.clone(),
            control,
            HeartbeatRole::Responder,
            Arc::new(RegistrationHandler {
                manager: Arc::downgrade(&self),
            }),
            self.config.control.clone(),
        );

        // Drop the session from the registry the moment it dies.
        {
            let manager = Arc::downgrade(&self);
            let conn = conn.clone();
            let gone = session.cancellation();
            tokio::spawn(async move {
                gone.cancelled().await;
                if let Some(manager) = manager.upgrade() {
                    manager.registry.write().await.remove_client(&conn);
                    debug!(addr = %conn.remote_address(), "session removed from registry");
                }
            });
        }

        // Data streams flow hub -> agent; anything the agent opens beyond
        // the control stream is a protocol violation.
        let gone = session.cancellation();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = gone.cancelled() => return,
                    accepted = session.accept_stream() => accepted,
                };
                match accepted {
                    Ok(Some(mut stream)) => {
                        warn!(stream_id = stream.id(), "unexpected agent-initiated stream");
                        stream.close();
                    }
                    Ok(None) | Err(_) => return,
                }
            }
        });
    }

    async fn handle_register(
        &self,
        conn: &Arc<Connection>,
        reg: Register,
    ) -> Result<(), ControlError> {
        let subdomain = if reg.subdomain.is_empty() {
            "default".to_string()
        } else {
            reg.subdomain
        };

        let authorized = {
            let validator = self.token_validator.read().unwrap().clone();
            validator.map_or(true, |validate| validate(&reg.token))
        };
        if !authorized {
            warn!(subdomain, addr = %conn.remote_address(), "registration unauthorized");
            conn.send(Message::RegisterResp(RegisterResp {
                success: false,
                subdomain,
                message: "unauthorized".to_string(),
            }))
            .await?;
            return Ok(());
        }

        let result = self
            .registry
            .write()
            .await
            .add_or_replace(subdomain.clone(), conn.clone());

        let resp = match result {
            Ok(()) => {
                info!(
                    subdomain,
                    addr = %conn.remote_address(),
                    protocol = %reg.protocol,
                    backend = format!("{}:{}", reg.host, reg.port),
                    "backend registered"
                );
                RegisterResp {
                    success: true,
                    subdomain,
                    message: "success".to_string(),
                }
            }
            Err(e) => {
                warn!(subdomain, error = %e, "registration rejected");
                RegisterResp {
                    success: false,
                    subdomain,
                    message: e.to_string(),
                }
            }
        };

        conn.send(Message::RegisterResp(resp)).await?;
        Ok(())
    }

    // ---- data plane -------------------------------------------------------

    /// Open a data stream toward the agent owning `subdomain`.
    pub async fn acquire(
        &self,
        subdomain: &str,
    ) -> Result<(TunnelStream, Arc<Connection>), AcquireError> {
        let conn = self
            .registry
            .read()
            .await
            .get(subdomain)
            .cloned()
            .ok_or_else(|| AcquireError::NotFound(subdomain.to_string()))?;

        match conn.acquire().await {
            Ok(stream) => {
                stream.set_subdomain(subdomain);
                Ok((stream, conn))
            }
            Err(e) => {
                error!(subdomain, error = %e, "failed to acquire stream");
                Err(AcquireError::Unavailable(e.to_string()))
            }
        }
    }

    pub fn release(&self, conn: &Arc<Connection>, stream: TunnelStream) {
        conn.release(stream);
    }

    /// Serve one user HTTP connection: parse, route, proxy.
    pub async fn handle_http_conn<S>(&self, mut conn: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (head, raw_request) = match http::read_request(&mut conn).await {
            Ok(parsed) => parsed,
            Err(HttpError::Io(_) | HttpError::Closed) => return,
            Err(e) => {
                http::send_json_error(&mut conn, 400, &format!("failed to read request: {e}"))
                    .await;
                return;
            }
        };

        // Host header routes the request; peers without one fall back to
        // their remote address (which yields no subdomain).
        let host = head
            .header("host")
            .map(str::to_string)
            .unwrap_or_else(|| peer.to_string());
        let subdomain = http::extract_subdomain(&host);

        debug!(subdomain, method = %head.method, path = %head.path, "processing request");

        if subdomain == RESERVED_SUBDOMAIN {
            self.handle_reserved(&mut conn, &head).await;
            return;
        }

        let (mut stream, client) = match self.acquire(&subdomain).await {
            Ok(acquired) => acquired,
            Err(e @ AcquireError::NotFound(_)) => {
                error!(subdomain, "no service found for subdomain");
                http::send_json_error(&mut conn, 404, &e.to_string()).await;
                return;
            }
            Err(e) => {
                error!(subdomain, error = %e, "failed to acquire transport");
                http::send_json_error(&mut conn, 503, &e.to_string()).await;
                return;
            }
        };

        let outcome = self
            .run_proxy(&mut stream, &subdomain, &raw_request, &mut conn)
            .await;
        self.release(&client, stream);

        if let Err(message) = outcome {
            error!(subdomain, message, "proxy failed");
            http::send_json_error(&mut conn, 500, &message).await;
        }
    }

    /// One stream, one request: BeginStream, wait for ready, forward the
    /// request with a half-close, stream the response back.
    async fn run_proxy<S>(
        &self,
        stream: &mut TunnelStream,
        subdomain: &str,
        raw_request: &[u8],
        user: &mut S,
    ) -> Result<(), String>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        stream
            .send_message(&Message::BeginStream {
                subdomain: subdomain.to_string(),
            })
            .await
            .map_err(|e| format!("failed to send begin stream message: {e}"))?;

        self.await_ready(stream).await?;

        stream
            .write_all(raw_request)
            .await
            .map_err(|e| format!("failed to send request data: {e}"))?;
        stream
            .close_write()
            .map_err(|e| format!("failed to half-close stream: {e}"))?;

        let mut buf = vec![0u8; 32 * 1024];
        let mut forwarded: u64 = 0;
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if forwarded == 0 => {
                    return Err(format!("failed to receive response: {e}"));
                }
                Err(e) => {
                    // Headers already went to the user; all we can do is cut
                    // the connection short.
                    warn!(subdomain, error = %e, forwarded, "response truncated");
                    break;
                }
            };
            if user.write_all(&buf[..n]).await.is_err() {
                debug!(subdomain, "user connection closed mid-response");
                break;
            }
            forwarded += n as u64;
        }
        let _ = user.flush().await;

        debug!(subdomain, forwarded, "response forwarded");
        Ok(())
    }

    /// Wait for the agent's first frame on a fresh data stream. Ready wins
    /// over error, error wins over the deadline.
    async fn await_ready(&self, stream: &mut TunnelStream) -> Result<(), String> {
        let wait = async {
            loop {
                match stream.recv_message().await {
                    Ok(Some(Message::ConnectionReady { .. })) => return Ok(()),
                    Ok(Some(Message::EndStream { .. })) => {
                        return Err("remote ended the stream before ready".to_string());
                    }
                    Ok(Some(Message::Error { message })) => {
                        return Err(format!("client error: {message}"));
                    }
                    Ok(Some(other)) => {
                        warn!(kind = %other.kind(), "unexpected message while waiting for ready");
                    }
                    Ok(None) => return Err("stream closed before ready".to_string()),
                    Err(e) => return Err(format!("failed to read message: {e}")),
                }
            }
        };

        match timeout(self.config.readiness_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err("client connection not ready in time".to_string()),
        }
    }

    async fn handle_reserved<S>(&self, conn: &mut S, head: &RequestHead)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // ACME challenges get first refusal on the reserved label.
        let acme = self.acme_handler.read().unwrap().clone();
        if let Some(acme) = acme {
            if let Some(resp) = acme(head) {
                if let Err(e) = http::write_response(conn, &resp).await {
                    warn!(error = %e, "failed to write ACME response");
                }
                return;
            }
        }

        let dashboard = self.dashboard_handler.read().unwrap().clone();
        match dashboard {
            Some(handler) => {
                let resp = handler(head);
                if let Err(e) = http::write_response(conn, &resp).await {
                    warn!(error = %e, "failed to write dashboard response");
                }
            }
            None => {
                http::send_json_error(conn, 500, "gunnel subdomain handler not set").await;
            }
        }
    }

    // ---- observability ----------------------------------------------------

    /// Visit every registered `(subdomain, connection)` pair.
    pub async fn for_each_client(&self, f: impl FnMut(&str, &Arc<Connection>)) {
        self.registry.read().await.for_each(f);
    }

    pub async fn client_count(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn stats_snapshot(&self) -> HubStats {
        let mut clients = Vec::new();
        self.registry.read().await.for_each(|subdomain, conn| {
            let heartbeat = conn.heartbeat_stats();
            clients.push(ClientSnapshot {
                subdomain: subdomain.to_string(),
                addr: conn.remote_address().to_string(),
                connected: conn.connected(),
                active_streams: conn.stream_count(Some(subdomain)),
                heartbeat: heartbeat.into(),
            });
        });

        HubStats {
            uptime_secs: self.metrics.uptime().as_secs(),
            total_clients: clients.len(),
            stats: self.metrics.stats(),
            clients,
            streams: self.metrics.snapshot(),
        }
    }
}

/// Control-stream handler on the hub side: only registration arrives here,
/// the connection itself consumes heartbeats and disconnects.
struct RegistrationHandler {
    manager: Weak<Manager>,
}

#[async_trait]
impl ControlHandler for RegistrationHandler {
    async fn handle(&self, conn: &Arc<Connection>, msg: Message) -> Result<(), ControlError> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(());
        };

        match msg {
            Message::Register(reg) => manager.handle_register(conn, reg).await,
            other => {
                warn!(kind = %other.kind(), "unhandled control message");
                Ok(())
            }
        }
    }
}

/// Serializable dashboard snapshot.
#[derive(Debug, Serialize)]
pub struct HubStats {
    pub uptime_secs: u64,
    pub total_clients: usize,
    #[serde(flatten)]
    pub stats: StreamStats,
    pub clients: Vec<ClientSnapshot>,
    pub streams: Vec<StreamSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct ClientSnapshot {
    pub subdomain: String,
    pub addr: String,
    pub connected: bool,
    pub active_streams: usize,
    pub heartbeat: HeartbeatSnapshot,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatSnapshot {
    pub last_received_secs: u64,
    pub sent: u64,
    pub received: u64,
    pub missed: u64,
}

impl From<HeartbeatStats> for HeartbeatSnapshot {
    fn from(stats: HeartbeatStats) -> Self {
        Self {
            last_received_secs: stats.last_received.as_secs(),
            sent: stats.sent,
            received: stats.received,
            missed: stats.missed,
        }
    }
}

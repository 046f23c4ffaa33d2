//! Agent lifecycle: dial, register, serve, reconnect.

use crate::config::{AgentConfig, BackendConfig};
use crate::{stream, AgentError, TOKEN_ENV};
use gunnel_control::{Connection, ConnectionConfig, HeartbeatRole, LogOnlyHandler};
use gunnel_metrics::MetricsRegistry;
use gunnel_proto::{Message, Register};
use gunnel_transport::{ClientTls, Session, TransportConfig, TunnelConnector, TunnelStream};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The agent client. Owns the configuration and drives the
/// connect/register/serve/reconnect cycle.
pub struct Agent {
    config: AgentConfig,
    token: String,
    metrics: MetricsRegistry,
    transport_config: TransportConfig,
    control_config: ConnectionConfig,
}

impl Agent {
    pub fn new(config: AgentConfig, metrics: MetricsRegistry) -> Self {
        Self {
            config,
            token: std::env::var(TOKEN_ENV).unwrap_or_default(),
            metrics,
            transport_config: TransportConfig::default(),
            control_config: ConnectionConfig::default(),
        }
    }

    /// Override the token from the environment (mainly for tests).
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    pub fn with_control_config(mut self, config: ConnectionConfig) -> Self {
        self.control_config = config;
        self
    }

    /// Run until `shutdown` fires. Each pass dials, registers every
    /// backend, and serves streams; on failure the loop sleeps the
    /// reconnect delay and starts over.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), AgentError> {
        self.config.validate()?;

        loop {
            if shutdown.is_cancelled() {
                info!("agent shutting down");
                return Ok(());
            }

            match self.connect_and_serve(&shutdown).await {
                Ok(()) => {
                    info!("session ended, reconnecting");
                }
                Err(e) => {
                    error!(error = %e, "session failed, reconnecting");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("agent shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
            }
        }
    }

    async fn connect_and_serve(&mut self, shutdown: &CancellationToken) -> Result<(), AgentError> {
        let addr = self.resolve_server_addr().await?;
        let server_name = self.config.server_name().to_string();

        let tls = if self.config.insecure {
            ClientTls::insecure()
        } else {
            ClientTls::default()
        };
        let connector =
            TunnelConnector::new(tls, self.transport_config.clone(), self.metrics.clone())?;
        let session = connector.connect(addr, &server_name).await?;

        // The client-opened first stream is the control stream.
        let mut control = session.open_stream().await?;

        if let Err(e) = self.register_backends(&mut control).await {
            session.close(0, "registration failed");
            return Err(e);
        }
        info!(server = %self.config.server_addr, "all backends registered");

        let conn = Connection::spawn(
            session.clone(),
            control,
            HeartbeatRole::Emitter,
            Arc::new(LogOnlyHandler),
            self.control_config.clone(),
        );

        let result = self.accept_loop(&session, shutdown).await;

        conn.disconnect();
        result
    }

    async fn resolve_server_addr(&self) -> Result<SocketAddr, AgentError> {
        let mut addrs = tokio::net::lookup_host(&self.config.server_addr)
            .await
            .map_err(|_| AgentError::Resolve(self.config.server_addr.clone()))?;
        addrs
            .next()
            .ok_or_else(|| AgentError::Resolve(self.config.server_addr.clone()))
    }

    /// Send one Register per backend and await its response. The hub may
    /// canonicalise the subdomain; adopt whatever it returns.
    async fn register_backends(&mut self, control: &mut TunnelStream) -> Result<(), AgentError> {
        for (name, backend) in self.config.backend.iter_mut() {
            debug!(backend = %name, subdomain = %backend.subdomain, "registering backend");

            control
                .send_message(&Message::Register(Register {
                    subdomain: backend.subdomain.clone(),
                    host: backend.host.clone(),
                    port: backend.port as u32,
                    protocol: backend.protocol,
                    token: self.token.clone(),
                }))
                .await?;

            let resp = match control.recv_message().await? {
                Some(Message::RegisterResp(resp)) => resp,
                Some(Message::Error { message }) => {
                    return Err(AgentError::Registration(message));
                }
                Some(other) => {
                    return Err(AgentError::Registration(format!(
                        "unexpected response kind {} during registration",
                        other.kind()
                    )));
                }
                None => {
                    return Err(AgentError::Registration(
                        "connection closed during registration".to_string(),
                    ));
                }
            };

            if !resp.success {
                return Err(AgentError::Registration(resp.message));
            }

            backend.subdomain = resp.subdomain;
            info!(backend = %name, subdomain = %backend.subdomain, "backend registered");
        }
        Ok(())
    }

    /// Accept data streams for the life of the session.
    async fn accept_loop(
        &self,
        session: &Session,
        shutdown: &CancellationToken,
    ) -> Result<(), AgentError> {
        let backends: Arc<HashMap<String, BackendConfig>> = Arc::new(
            self.config
                .backend
                .values()
                .map(|b| (b.subdomain.clone(), b.clone()))
                .collect(),
        );
        let session_gone = session.cancellation();
        let dial_timeout = self.config.dial_timeout();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    session.close(0, "agent shutdown");
                    return Ok(());
                }
                _ = session_gone.cancelled() => return Ok(()),
                accepted = session.accept_stream() => accepted,
            };

            match accepted {
                Ok(Some(data_stream)) => {
                    let backends = backends.clone();
                    tokio::spawn(async move {
                        stream::handle_stream(data_stream, backends, dial_timeout).await;
                    });
                }
                Ok(None) => {
                    info!("transport closed, leaving accept loop");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept stream");
                    return Err(e.into());
                }
            }
        }
    }
}

//! Hub assembly: the QUIC listener for agents and the HTTP(S) listener for
//! users, wired to one manager.

use crate::config::HubConfig;
use crate::manager::{Manager, ManagerConfig, TokenValidator};
use crate::HubError;
use gunnel_metrics::MetricsRegistry;
use gunnel_transport::{ServerTls, TransportConfig, TunnelListener};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Overall deadline for one user connection.
const HTTP_CONN_DEADLINE: Duration = Duration::from_secs(120);

/// Supplies the TLS material for the hub's listeners.
///
/// The ACME-backed implementation lives with the certificate collaborator;
/// [`SelfSignedProvider`] covers development.
pub trait CertProvider: Send + Sync {
    fn server_tls(&self) -> Result<ServerTls, HubError>;
}

/// Generates a fresh self-signed certificate per request.
pub struct SelfSignedProvider {
    domain: String,
}

impl SelfSignedProvider {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }
}

impl CertProvider for SelfSignedProvider {
    fn server_tls(&self) -> Result<ServerTls, HubError> {
        ServerTls::self_signed(&self.domain).map_err(|e| HubError::Cert(e.to_string()))
    }
}

/// The hub process: owns the manager, metrics, and both listeners.
pub struct Hub {
    config: HubConfig,
    manager: Arc<Manager>,
    metrics: MetricsRegistry,
    transport_config: TransportConfig,
    cert_provider: Arc<dyn CertProvider>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Result<Self, HubError> {
        config.validate()?;

        let metrics = MetricsRegistry::new();
        let manager = Manager::new(
            metrics.clone(),
            ManagerConfig {
                readiness_timeout: config.readiness_timeout(),
                ..ManagerConfig::default()
            },
        );

        // A configured shared token becomes the auth hook; without one,
        // every registration is allowed.
        if !config.token.is_empty() {
            let expected = config.token.clone();
            let validator: TokenValidator = Arc::new(move |token: &str| token == expected);
            manager.set_token_validator(validator);
        }

        let cert_provider = Arc::new(SelfSignedProvider::new(config.domain.clone()));

        Ok(Self {
            config,
            manager,
            metrics,
            transport_config: TransportConfig::default(),
            cert_provider,
        })
    }

    /// Swap in the production certificate provider.
    pub fn with_cert_provider(mut self, provider: Arc<dyn CertProvider>) -> Self {
        self.cert_provider = provider;
        self
    }

    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// The manager, for installing collaborator hooks (dashboard, ACME,
    /// token validation) and reading stats.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Run both listeners until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), HubError> {
        let quic_addr: SocketAddr = ([0, 0, 0, 0], self.config.quic_port).into();
        let http_addr: SocketAddr = ([0, 0, 0, 0], self.config.server_port).into();
        self.run_on(quic_addr, http_addr, shutdown).await
    }

    /// Like [`Hub::run`] with explicit bind addresses (tests bind port 0).
    pub async fn run_on(
        &self,
        quic_addr: SocketAddr,
        http_addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), HubError> {
        let quic_listener = TunnelListener::bind(
            quic_addr,
            self.cert_provider.server_tls()?,
            self.transport_config.clone(),
            self.metrics.clone(),
        )?;
        info!(addr = %quic_listener.local_addr()?, "QUIC server started");

        let http_listener = TcpListener::bind(http_addr).await?;
        info!(addr = %http_listener.local_addr()?, "HTTP server started");

        let quic_task = self.spawn_quic_loop(quic_listener, shutdown.clone());
        let http_task = self.spawn_http_loop(http_listener, shutdown.clone()).await?;

        shutdown.cancelled().await;
        info!("hub shutting down");

        quic_task.abort();
        http_task.abort();
        Ok(())
    }

    fn spawn_quic_loop(
        &self,
        listener: TunnelListener,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => {
                        listener.close();
                        return;
                    }
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((session, addr)) => {
                        info!(%addr, "agent connected");
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            manager.handle_session(session).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "QUIC accept failed");
                        return;
                    }
                }
            }
        })
    }

    async fn spawn_http_loop(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>, HubError> {
        let manager = self.manager.clone();

        // TLS on the user listener is opt-in; the certificate comes from
        // the same provider as the QUIC side.
        let tls_acceptor = if self.config.cert.enabled {
            let tls = self.cert_provider.server_tls()?;
            let server_config = tokio_rustls::rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(tls.cert_chain, tls.key)
                .map_err(|e| HubError::Cert(e.to_string()))?;
            Some(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)))
        } else {
            None
        };

        Ok(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };

                let (conn, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept user connection");
                        continue;
                    }
                };

                let manager = manager.clone();
                let tls_acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    let served = tokio::time::timeout(HTTP_CONN_DEADLINE, async {
                        match tls_acceptor {
                            Some(acceptor) => match acceptor.accept(conn).await {
                                Ok(tls_conn) => {
                                    manager.handle_http_conn(tls_conn, peer).await;
                                }
                                Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
                            },
                            None => manager.handle_http_conn(conn, peer).await,
                        }
                    })
                    .await;

                    if served.is_err() {
                        warn!(%peer, "user connection exceeded deadline");
                    }
                });
            }
        }))
    }
}

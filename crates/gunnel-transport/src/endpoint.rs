//! QUIC listener and connector.

use crate::config::{ClientTls, ServerTls};
use crate::session::Session;
use crate::{TransportConfig, TransportError, TransportResult};
use gunnel_metrics::MetricsRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Accepts incoming agent sessions on the hub's QUIC port.
pub struct TunnelListener {
    endpoint: quinn::Endpoint,
    config: Arc<TransportConfig>,
    metrics: MetricsRegistry,
}

impl TunnelListener {
    pub fn bind(
        addr: SocketAddr,
        tls: ServerTls,
        config: TransportConfig,
        metrics: MetricsRegistry,
    ) -> TransportResult<Self> {
        config.validate()?;
        let server_config = tls.build(&config)?;

        let endpoint = quinn::Endpoint::server(server_config, addr)?;
        info!(addr = %endpoint.local_addr()?, "QUIC listener bound");

        Ok(Self {
            endpoint,
            config: Arc::new(config),
            metrics,
        })
    }

    /// Accept the next session. Handshake failures are logged and skipped;
    /// the error return means the endpoint itself is gone.
    pub async fn accept(&self) -> TransportResult<(Session, SocketAddr)> {
        loop {
            let incoming = self
                .endpoint
                .accept()
                .await
                .ok_or(TransportError::ConnectionClosed)?;

            let remote = incoming.remote_address();
            debug!(addr = %remote, "incoming QUIC connection");

            let handshake = async move {
                match incoming.await {
                    Ok(conn) => Some(conn),
                    Err(e) => {
                        error!(addr = %remote, error = %e, "QUIC handshake failed");
                        None
                    }
                }
            };

            match timeout(self.config.handshake_timeout, handshake).await {
                Ok(Some(conn)) => {
                    info!(addr = %remote, "agent session established");
                    return Ok((
                        Session::new(conn, self.config.clone(), self.metrics.clone()),
                        remote,
                    ));
                }
                Ok(None) => continue,
                Err(_) => {
                    error!(addr = %remote, "QUIC handshake timed out");
                    continue;
                }
            }
        }
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"listener closed");
        info!("QUIC listener closed");
    }
}

/// Dials the hub from the agent side.
pub struct TunnelConnector {
    endpoint: quinn::Endpoint,
    config: Arc<TransportConfig>,
    metrics: MetricsRegistry,
}

impl TunnelConnector {
    pub fn new(
        tls: ClientTls,
        config: TransportConfig,
        metrics: MetricsRegistry,
    ) -> TransportResult<Self> {
        config.validate()?;
        let client_config = tls.build(&config)?;

        let bind: SocketAddr = "0.0.0.0:0"
            .parse()
            .map_err(|_| TransportError::Config("invalid bind address".to_string()))?;
        let mut endpoint = quinn::Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            config: Arc::new(config),
            metrics,
        })
    }

    /// Dial the hub. The whole dial + handshake is bounded by the
    /// configured handshake timeout.
    pub async fn connect(&self, addr: SocketAddr, server_name: &str) -> TransportResult<Session> {
        debug!(%addr, server_name, "dialing hub");

        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let conn = timeout(self.config.handshake_timeout, connecting)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        info!(%addr, server_name, "connected to hub");
        Ok(Session::new(conn, self.config.clone(), self.metrics.clone()))
    }
}

//! A session is one QUIC connection between an agent and the hub.

use crate::stream::TunnelStream;
use crate::{TransportConfig, TransportError, TransportResult};
use gunnel_metrics::{MetricsRegistry, StreamInfo};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct SweepEntry {
    info: Arc<StreamInfo>,
    cancel: CancellationToken,
}

/// One QUIC connection plus its stream bookkeeping.
///
/// Cloning is cheap; all clones share the underlying connection, the root
/// cancellation token, and the stream table swept by the janitor.
#[derive(Clone)]
pub struct Session {
    conn: quinn::Connection,
    config: Arc<TransportConfig>,
    metrics: MetricsRegistry,
    cancel: CancellationToken,
    streams: Arc<Mutex<Vec<SweepEntry>>>,
}

impl Session {
    pub(crate) fn new(
        conn: quinn::Connection,
        config: Arc<TransportConfig>,
        metrics: MetricsRegistry,
    ) -> Self {
        let session = Self {
            conn,
            config,
            metrics,
            cancel: CancellationToken::new(),
            streams: Arc::new(Mutex::new(Vec::new())),
        };
        session.spawn_close_watcher();
        session.spawn_janitor();
        session
    }

    /// Root cancellation token: fires when the connection closes from
    /// either side. Derived tokens gate every stream task of the session.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    /// Open a new bidirectional stream toward the peer.
    pub async fn open_stream(&self) -> TransportResult<TunnelStream> {
        let (send, recv) = self
            .conn
            .open_bi()
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        Ok(self.track(TunnelStream::new(
            send,
            recv,
            self.metrics.clone(),
            self.cancel.child_token(),
            self.config.io_deadline,
        )))
    }

    /// Accept the next stream the peer opens. `Ok(None)` means the
    /// connection closed in an orderly fashion.
    pub async fn accept_stream(&self) -> TransportResult<Option<TunnelStream>> {
        match self.conn.accept_bi().await {
            Ok((send, recv)) => Ok(Some(self.track(TunnelStream::new(
                send,
                recv,
                self.metrics.clone(),
                self.cancel.child_token(),
                self.config.io_deadline,
            )))),
            Err(
                quinn::ConnectionError::ApplicationClosed(_)
                | quinn::ConnectionError::ConnectionClosed(_)
                | quinn::ConnectionError::LocallyClosed
                | quinn::ConnectionError::TimedOut
                | quinn::ConnectionError::Reset,
            ) => {
                debug!(addr = %self.conn.remote_address(), "connection closed while accepting");
                Ok(None)
            }
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }

    /// Close the connection. All stream tasks observe the root token.
    pub fn close(&self, code: u32, reason: &str) {
        self.conn
            .close(quinn::VarInt::from_u32(code), reason.as_bytes());
        self.cancel.cancel();
        debug!(addr = %self.conn.remote_address(), code, reason, "session closed");
    }

    /// Number of active streams, optionally restricted to one subdomain.
    pub fn active_streams(&self, subdomain: Option<&str>) -> usize {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                e.info.is_active()
                    && subdomain.map_or(true, |sub| e.info.subdomain() == sub)
            })
            .count()
    }

    fn track(&self, stream: TunnelStream) -> TunnelStream {
        self.streams.lock().unwrap().push(SweepEntry {
            info: stream.info().clone(),
            cancel: stream.cancellation(),
        });
        stream
    }

    fn spawn_close_watcher(&self) {
        let conn = self.conn.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let reason = conn.closed().await;
            debug!(%reason, "connection closed");
            cancel.cancel();
        });
    }

    /// Sweep streams that finished but were never released, so a leaked
    /// stream cannot pin its bookkeeping forever.
    fn spawn_janitor(&self) {
        let streams = self.streams.clone();
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();
        let max_inactive = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_inactive);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let mut table = streams.lock().unwrap();
                table.retain(|entry| {
                    if !entry.info.is_active() && entry.info.idle_for() >= max_inactive {
                        info!(stream_id = entry.info.id(), "removing inactive stream");
                        entry.cancel.cancel();
                        return false;
                    }
                    true
                });
                drop(table);

                metrics.prune_inactive();
            }
        });
    }
}

//! QUIC transport for gunnel.
//!
//! One QUIC connection per agent session carries a long-lived control
//! stream plus short-lived per-request data streams. quinn provides the
//! multiplexing and mandatory TLS 1.3; this crate wraps it with the framed
//! message protocol, per-call I/O deadlines, stream metrics, and a janitor
//! that sweeps abandoned streams.

pub mod config;
pub mod endpoint;
pub mod session;
pub mod stream;

pub use config::{ClientTls, ServerTls, TransportConfig};
pub use endpoint::{TunnelConnector, TunnelListener};
pub use session::Session;
pub use stream::{RecvHalf, SendHalf, TunnelStream};

use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("stream closed")]
    StreamClosed,

    /// A read or write exceeded its deadline. Transient: callers that can
    /// retry should, everyone else tears the stream down.
    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Proto(#[from] gunnel_proto::ProtoError),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Transient errors may be retried by the caller; everything else is
    /// fatal to the stream or session it occurred on.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

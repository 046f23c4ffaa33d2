//! Control-plane connection management.
//!
//! Every agent session carries exactly one control stream. This crate runs
//! the tasks behind it: a framed receive loop with message dispatch, a
//! bounded send queue, and heartbeat emission plus a staleness watchdog.

mod connection;

pub use connection::{
    Connection, ConnectionConfig, ControlHandler, HeartbeatRole, HeartbeatStats, LogOnlyHandler,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// The connection is no longer connected; the message was not queued.
    /// Non-fatal: callers decide whether to retry after reconnect.
    #[error("connection is not connected")]
    NotConnected,

    #[error("send queue closed")]
    QueueClosed,

    #[error(transparent)]
    Transport(#[from] gunnel_transport::TransportError),
}

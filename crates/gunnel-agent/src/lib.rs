//! The gunnel agent: the process behind NAT that exposes local backends.
//!
//! On startup the agent dials the hub over QUIC, registers every configured
//! backend on the control stream, then serves data streams the hub opens
//! for inbound requests. Any fatal transport error tears the session down
//! and the reconnect loop dials again.

mod client;
mod config;
mod stream;

pub use client::Agent;
pub use config::{AgentConfig, BackendConfig};

use thiserror::Error;

/// Environment variable supplying the registration token.
pub const TOKEN_ENV: &str = "GUNNEL_TOKEN";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to resolve server address {0}")]
    Resolve(String),

    #[error("registration rejected: {0}")]
    Registration(String),

    #[error(transparent)]
    Transport(#[from] gunnel_transport::TransportError),
}

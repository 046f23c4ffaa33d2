//! The gunnel hub: the public process that accepts user traffic and routes
//! it to agents.
//!
//! The hub listens on two ports. The QUIC port accepts agent sessions and
//! runs the registration/control plane; the HTTP port accepts user
//! requests, routes them by the leftmost Host-header label, and proxies
//! each one over a fresh data stream to the owning agent.

pub mod config;
pub mod http;
pub mod manager;
pub mod registry;
pub mod server;

pub use config::{CertConfig, HubConfig};
pub use http::{HttpResponse, RequestHead};
pub use manager::{
    AcmeChallengeHandler, AcquireError, DashboardHandler, HubStats, Manager, ManagerConfig,
    TokenValidator,
};
pub use registry::{ClientHandle, Registry, RegistryError};
pub use server::{CertProvider, Hub, SelfSignedProvider};

use thiserror::Error;

/// Subdomain reserved for the hub's own dashboard.
pub const RESERVED_SUBDOMAIN: &str = "gunnel";

#[derive(Debug, Error)]
pub enum HubError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("certificate error: {0}")]
    Cert(String),

    #[error(transparent)]
    Transport(#[from] gunnel_transport::TransportError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

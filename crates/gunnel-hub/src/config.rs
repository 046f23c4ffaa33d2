//! Hub configuration.

use crate::HubError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_server_port() -> u16 {
    8080
}

fn default_quic_port() -> u16 {
    8081
}

fn default_readiness_timeout() -> u64 {
    30
}

/// TLS settings for the user-facing listener. The certificate itself comes
/// from the cert collaborator (ACME in production).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub email: String,
}

/// Top-level hub configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Base domain for HTTP routing (e.g. example.com).
    pub domain: String,

    /// Optional shared secret agents must present at registration.
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    #[serde(default = "default_quic_port")]
    pub quic_port: u16,

    #[serde(default)]
    pub cert: CertConfig,

    /// Seconds the proxy waits for an agent's ConnectionReady.
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            token: String::new(),
            server_port: default_server_port(),
            quic_port: default_quic_port(),
            cert: CertConfig::default(),
            readiness_timeout_secs: default_readiness_timeout(),
        }
    }
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self, HubError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HubError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_yaml::from_str(&contents)
            .map_err(|e| HubError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HubError> {
        if self.domain.is_empty() {
            return Err(HubError::Config("domain is required".to_string()));
        }
        Ok(())
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml() {
        let config: HubConfig = serde_yaml::from_str("domain: example.com\n").unwrap();
        assert_eq!(config.domain, "example.com");
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.quic_port, 8081);
        assert!(!config.cert.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_full_yaml() {
        let yaml = r#"
domain: example.com
token: sekret
server_port: 9090
quic_port: 9091
cert:
  enabled: true
  email: ops@example.com
"#;
        let config: HubConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.token, "sekret");
        assert_eq!(config.server_port, 9090);
        assert!(config.cert.enabled);
        assert_eq!(config.cert.email, "ops@example.com");
    }

    #[test]
    fn rejects_empty_domain() {
        assert!(HubConfig::default().validate().is_err());
    }
}

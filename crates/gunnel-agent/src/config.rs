//! Agent configuration.

use crate::AgentError;
use gunnel_proto::Protocol;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn default_server_addr() -> String {
    "localhost:8081".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_dial_timeout() -> u64 {
    10
}

/// One local service the agent forwards to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub subdomain: String,
    #[serde(default)]
    pub protocol: Protocol,
}

impl BackendConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port is required".to_string());
        }
        if self.subdomain.is_empty() {
            return Err("subdomain is required".to_string());
        }
        Ok(())
    }
}

/// Top-level agent configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    #[serde(default)]
    pub backend: HashMap<String, BackendConfig>,

    /// Accept any hub certificate. Required against self-signed dev hubs;
    /// keep off in production.
    #[serde(default)]
    pub insecure: bool,

    /// Seconds to wait between reconnection attempts.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Seconds allowed for the backend TCP dial.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            backend: HashMap::new(),
            insecure: false,
            reconnect_delay_secs: default_reconnect_delay(),
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_yaml::from_str(&contents)
            .map_err(|e| AgentError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.server_addr.is_empty() {
            return Err(AgentError::Config("server address is required".to_string()));
        }
        if self.backend.is_empty() {
            return Err(AgentError::Config(
                "at least one backend is required".to_string(),
            ));
        }
        for (name, backend) in &self.backend {
            backend
                .validate()
                .map_err(|e| AgentError::Config(format!("backend {name}: {e}")))?;
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Hostname part of `server_addr`, used as the TLS server name.
    pub fn server_name(&self) -> &str {
        self.server_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.server_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(port: u16, subdomain: &str) -> BackendConfig {
        BackendConfig {
            host: default_host(),
            port,
            subdomain: subdomain.to_string(),
            protocol: Protocol::Http,
        }
    }

    #[test]
    fn parses_yaml_with_defaults() {
        let yaml = r#"
backend:
  web:
    port: 3000
    subdomain: test
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server_addr, "localhost:8081");
        assert!(!config.insecure);
        assert_eq!(config.reconnect_delay_secs, 5);

        let web = &config.backend["web"];
        assert_eq!(web.host, "localhost");
        assert_eq!(web.protocol, Protocol::Http);
        assert_eq!(web.addr(), "localhost:3000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_missing_backends() {
        let config = AgentConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_port() {
        let mut config = AgentConfig::default();
        config.backend.insert("web".into(), backend(0, "test"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_subdomain() {
        let mut config = AgentConfig::default();
        config.backend.insert("web".into(), backend(3000, ""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn tcp_protocol_parses() {
        let yaml = r#"
backend:
  db:
    port: 5432
    subdomain: db
    protocol: tcp
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.backend["db"].protocol, Protocol::Tcp);
    }

    #[test]
    fn server_name_strips_port() {
        let config = AgentConfig {
            server_addr: "hub.example.com:8081".to_string(),
            ..AgentConfig::default()
        };
        assert_eq!(config.server_name(), "hub.example.com");
    }
}

//! QSTP configuration

use crate::address::Address;
use crate::crypto::KemAlgorithm;
use crate::reverse_proxy::{RouteTable, FALLBACK_KEY};
use crate::QstpError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QstpConfig {
    /// KEM used for every handshake; both peers must agree
    #[serde(default)]
    pub kem: KemAlgorithm,

    /// Debug logging
    #[serde(default)]
    pub debug: bool,

    /// Listening socket
    #[serde(default)]
    pub server: ServerConfig,

    /// Transparent proxy (proxy mode)
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    /// Reverse proxy (reverse-proxy mode)
    #[serde(default)]
    pub reverse_proxy: Option<ReverseProxyConfig>,
}

/// Listening socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: Address,

    /// Pending-connection queue length
    pub backlog: u32,

    /// How long shutdown waits for in-flight connections
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,

    /// Deadline for the handshake, and again for reading the request
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Address::new("0.0.0.0", 8080),
            backlog: 10,
            join_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Transparent proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Fixed upstream every relayed payload goes to
    pub upstream: Address,
}

/// Reverse proxy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReverseProxyConfig {
    /// Host name to upstream, plus an optional `FALLBACK` entry
    #[serde(default)]
    pub routes: RouteTable,
}

impl QstpConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), QstpError> {
        if self.server.backlog == 0 {
            return Err(QstpError::InvalidConfig("backlog must be at least 1".into()));
        }

        if self.server.handshake_timeout.is_zero() {
            return Err(QstpError::InvalidConfig(
                "handshake_timeout must be greater than zero".into(),
            ));
        }

        if let Some(reverse) = &self.reverse_proxy {
            if reverse.routes.is_empty() {
                return Err(QstpError::InvalidConfig(format!(
                    "reverse_proxy needs at least one route or a {} entry",
                    FALLBACK_KEY
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QstpConfig::default();
        assert_eq!(config.kem, KemAlgorithm::MlKem512);
        assert_eq!(config.server.backlog, 10);
        assert_eq!(config.server.listen.port, 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config: QstpConfig = toml::from_str(
            r#"
            kem = "ML-KEM-768"
            debug = true

            [server]
            listen = "127.0.0.1:9000"
            backlog = 32
            join_timeout = "2s"
            handshake_timeout = "500ms"

            [proxy]
            upstream = "localhost:8080"

            [reverse_proxy.routes."server1.com"]
            location = "localhost:8081"

            [reverse_proxy.routes.FALLBACK]
            location = "localhost:8082"
            "#,
        )
        .unwrap();

        assert_eq!(config.kem, KemAlgorithm::MlKem768);
        assert!(config.debug);
        assert_eq!(config.server.listen, Address::new("127.0.0.1", 9000));
        assert_eq!(config.server.backlog, 32);
        assert_eq!(config.server.join_timeout, Duration::from_secs(2));
        assert_eq!(config.server.handshake_timeout, Duration::from_millis(500));
        assert_eq!(config.proxy.unwrap().upstream, Address::new("localhost", 8080));

        let routes = config.reverse_proxy.unwrap().routes;
        assert_eq!(routes.len(), 2);
        let (upstream, fallback) = routes.resolve("server1.com").unwrap();
        assert_eq!(upstream, &Address::new("localhost", 8081));
        assert!(!fallback);
    }

    #[test]
    fn test_partial_server_section_uses_defaults() {
        let config: QstpConfig = toml::from_str("[server]\nbacklog = 4\n").unwrap();
        assert_eq!(config.server.backlog, 4);
        assert_eq!(config.server.join_timeout, Duration::from_secs(5));
        assert!(config.proxy.is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = QstpConfig::default();

        config.server.backlog = 0;
        assert!(config.validate().is_err());
        config.server.backlog = 10;

        config.reverse_proxy = Some(ReverseProxyConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_kem_rejected() {
        assert!(toml::from_str::<QstpConfig>("kem = \"RSA\"").is_err());
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = QstpConfig::default();
        config.proxy = Some(ProxyConfig {
            upstream: Address::new("10.0.0.2", 8081),
        });
        let text = toml::to_string_pretty(&config).unwrap();
        let back: QstpConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.proxy.unwrap().upstream, Address::new("10.0.0.2", 8081));
        assert_eq!(back.server.join_timeout, config.server.join_timeout);
    }
}

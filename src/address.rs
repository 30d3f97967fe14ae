//! Connection endpoint addresses

use crate::QstpError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// A `(host, port)` pair naming a connection endpoint.
///
/// Hosts are kept as strings so that names like `localhost` are resolved at
/// connect time rather than at configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = QstpError;

    /// Parse `host:port`, `[v6]:port` included.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| QstpError::InvalidAddress(format!("missing port in {:?}", s)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(QstpError::InvalidAddress(format!("missing host in {:?}", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| QstpError::InvalidAddress(format!("bad port in {:?}: {}", s, e)))?;

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Address {
    type Error = QstpError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let addr: Address = "localhost:8081".parse().unwrap();
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.port, 8081);
        assert_eq!(addr.to_string(), "localhost:8081");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr: Address = "[::1]:9000".parse().unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.to_string(), "[::1]:9000");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("localhost".parse::<Address>().is_err());
        assert!(":80".parse::<Address>().is_err());
        assert!("host:http".parse::<Address>().is_err());
        assert!("host:70000".parse::<Address>().is_err());
    }

    #[test]
    fn test_from_socket_addr() {
        let sock: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(Address::from(sock), Address::new("127.0.0.1", 4000));
    }
}

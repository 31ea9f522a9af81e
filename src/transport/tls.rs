//! Broker endpoint parsing and TLS materials.
//!
//! Accepted address forms:
//! - `host` or `host:port`
//! - `mqtt://host[:port]`, `tcp://host[:port]` (plain TCP)
//! - `mqtts://host[:port]`, `ssl://host[:port]` (TLS)
//! - `[ipv6]:port`, or a bare IPv6 literal
//!
//! A missing port falls back to the protocol default (1883, or 8883 with TLS).

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::net::IpAddr;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Broker endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

pub fn parse_broker_endpoint(addr: &str, tls_override: bool) -> Result<BrokerEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported broker scheme: {}", other)),
        }
        remainder = rest;
    }
    let remainder = remainder.trim_end_matches('/');
    if remainder.is_empty() {
        return Err(anyhow!("broker address is empty"));
    }

    let default_port = if use_tls {
        DEFAULT_TLS_PORT
    } else {
        DEFAULT_PORT
    };
    let (host, port) = split_host_port(remainder, default_port)?;
    if host.is_empty() {
        return Err(anyhow!("broker address {} has no host", addr));
    }
    Ok(BrokerEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid broker address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => parse_port(port, addr)?,
            None if rest.is_empty() => default_port,
            None => return Err(anyhow!("invalid broker address: {}", addr)),
        };
        return Ok((host.to_string(), port));
    }

    // A bare IPv6 literal has colons but no port.
    if addr.parse::<IpAddr>().is_ok() {
        return Ok((addr.to_string(), default_port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port, addr)?)),
        None => Ok((addr.to_string(), default_port)),
    }
}

fn parse_port(port: &str, addr: &str) -> Result<u16> {
    port.parse()
        .with_context(|| format!("invalid broker port in {}", addr))
}

/// PEM materials for TLS connections.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// CA certificate. When `None`, the platform roots are used.
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&PathBuf>,
        client_cert_path: Option<&PathBuf>,
        client_key_path: Option<&PathBuf>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read broker CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read client cert '{}'", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => return Err(anyhow!("client certificate provided without key")),
            (None, Some(_)) => return Err(anyhow!("client key provided without certificate")),
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    /// Build the rumqttc transport for an endpoint.
    pub fn build_transport(&self, endpoint: &BrokerEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                return Err(anyhow!(
                    "TLS materials provided but TLS is disabled (use --broker-tls or mqtts://)"
                ));
            }
            return Ok(Transport::tcp());
        }
        if !self.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = self.ca.clone().ok_or_else(|| {
            anyhow!("a CA certificate is required when providing client certificates")
        })?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_host_gets_default_port() {
        let ep = parse_broker_endpoint("localhost", false).unwrap();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 1883);
        assert!(!ep.use_tls);
    }

    #[test]
    fn host_and_port() {
        let ep = parse_broker_endpoint("10.0.0.5:11883", false).unwrap();
        assert_eq!(ep.host, "10.0.0.5");
        assert_eq!(ep.port, 11883);
    }

    #[test]
    fn tls_scheme_switches_default_port() {
        let ep = parse_broker_endpoint("mqtts://broker.example.com", false).unwrap();
        assert!(ep.use_tls);
        assert_eq!(ep.port, 8883);
        assert_eq!(ep.to_string(), "mqtts://broker.example.com:8883");
    }

    #[test]
    fn tls_override_applies_to_plain_scheme() {
        let ep = parse_broker_endpoint("127.0.0.1:8883", true).unwrap();
        assert!(ep.use_tls);
    }

    #[test]
    fn ipv6_forms() {
        let ep = parse_broker_endpoint("[::1]:1884", false).unwrap();
        assert_eq!((ep.host.as_str(), ep.port), ("::1", 1884));
        let ep = parse_broker_endpoint("::1", false).unwrap();
        assert_eq!((ep.host.as_str(), ep.port), ("::1", 1883));
        assert_eq!(ep.to_string(), "mqtt://[::1]:1883");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_broker_endpoint("amqp://localhost", false).is_err());
        assert!(parse_broker_endpoint("localhost:notaport", false).is_err());
        assert!(parse_broker_endpoint("", false).is_err());
        assert!(parse_broker_endpoint(":1883", false).is_err());
    }

    #[test]
    fn client_cert_requires_key() {
        let err = TlsMaterials::load(None, Some(&PathBuf::from("/nonexistent/cert.pem")), None)
            .unwrap_err();
        assert!(err.to_string().contains("without key"));
    }

    #[test]
    fn materials_without_tls_are_rejected() {
        let materials = TlsMaterials {
            ca: Some(b"pem".to_vec()),
            client_auth: None,
        };
        let ep = parse_broker_endpoint("localhost", false).unwrap();
        assert!(materials.build_transport(&ep).is_err());
        assert!(TlsMaterials::default().build_transport(&ep).is_ok());
    }
}

//! Agent configuration

use expose_proto::PROTOCOL_VERSION;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::Url;

use crate::error::AgentError;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay front door, e.g. `https://relay.example.com`
    pub relay_url: String,
    /// Handshake bearer token
    pub auth_token: String,
    /// Host the local service listens on
    pub local_host: String,
    /// Port the local service listens on
    pub local_port: u16,
    /// Lease secret to request; the relay generates one when unset
    pub secret: Option<String>,
    /// Alias to request; the relay generates one when unset or taken
    pub alias: Option<String>,
    /// IPs registered on the lease's allow-list once it is granted
    pub allow_ips: Vec<IpAddr>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:3000".to_string(),
            auth_token: String::new(),
            local_host: "localhost".to_string(),
            local_port: 4455,
            secret: None,
            alias: None,
            allow_ips: vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        }
    }
}

impl AgentConfig {
    fn base_url(&self) -> Result<Url, AgentError> {
        Url::parse(&self.relay_url)
            .map_err(|e| AgentError::InvalidUrl(format!("{}: {}", self.relay_url, e)))
    }

    /// WebSocket URL of the control channel, carrying the token and protocol version
    pub fn control_url(&self) -> Result<Url, AgentError> {
        let mut url = self.base_url()?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(AgentError::InvalidUrl(format!(
                    "unsupported relay scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| AgentError::InvalidUrl(self.relay_url.clone()))?;

        url.set_path("/tunnel");
        url.query_pairs_mut()
            .clear()
            .append_pair("token", &self.auth_token)
            .append_pair("version", &PROTOCOL_VERSION.to_string());

        Ok(url)
    }

    /// HTTP URL of the allow-list endpoint
    pub fn allow_list_url(&self) -> Result<Url, AgentError> {
        let mut url = self.base_url()?;

        let scheme = match url.scheme() {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            other => {
                return Err(AgentError::InvalidUrl(format!(
                    "unsupported relay scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| AgentError::InvalidUrl(self.relay_url.clone()))?;

        url.set_path("/allow-list");
        url.set_query(None);
        Ok(url)
    }
}

/// Public port from the URL the relay returned in `exposed`, e.g. `tcp://relay:4456`
pub fn public_port_from_url(url: &str) -> Result<u16, AgentError> {
    url.trim_end_matches('/')
        .rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| AgentError::InvalidUrl(format!("no port in {}", url)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(relay_url: &str) -> AgentConfig {
        AgentConfig {
            relay_url: relay_url.to_string(),
            auth_token: "abc.def.ghi".to_string(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_control_url_from_http() {
        let url = config("http://relay.test:3000").control_url().unwrap();
        assert_eq!(
            url.as_str(),
            "ws://relay.test:3000/tunnel?token=abc.def.ghi&version=1"
        );
    }

    #[test]
    fn test_control_url_from_https() {
        let url = config("https://relay.test/").control_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/tunnel");
    }

    #[test]
    fn test_allow_list_url() {
        let url = config("wss://relay.test").allow_list_url().unwrap();
        assert_eq!(url.as_str(), "https://relay.test/allow-list");
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            config("ftp://relay.test").control_url(),
            Err(AgentError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_public_port_from_url() {
        assert_eq!(public_port_from_url("tcp://localhost:4456").unwrap(), 4456);
        assert_eq!(public_port_from_url("https://relay.test:5000/").unwrap(), 5000);
        assert!(public_port_from_url("tcp://localhost").is_err());
    }
}

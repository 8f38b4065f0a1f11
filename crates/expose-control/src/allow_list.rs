//! Per-lease IP allow-lists
//!
//! Each leased port carries the lease secret and the set of IPs admitted to it.
//! An empty set admits nobody.

use expose_auth::{AllowListToken, AllowListTokenError};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::error::AllowListError;

struct AllowListEntry {
    alias: String,
    secret: String,
    ips: HashSet<IpAddr>,
}

/// Result of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub port: u16,
    pub ip: IpAddr,
}

#[derive(Default)]
pub struct AllowListStore {
    entries: RwLock<HashMap<u16, AllowListEntry>>,
}

impl AllowListStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty allow-list for a freshly leased port
    pub fn create(&self, port: u16, alias: &str, secret: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            port,
            AllowListEntry {
                alias: alias.to_string(),
                secret: secret.to_string(),
                ips: HashSet::new(),
            },
        );
        debug!("Created allow-list for port {} ({})", port, alias);
    }

    /// Add the IP carried by a signed token to its port's allow-list.
    ///
    /// Registering an IP that is already present succeeds without change.
    pub fn register(&self, token: &str) -> Result<Registration, AllowListError> {
        let port = AllowListToken::peek_port(token).map_err(|e| match e {
            AllowListTokenError::MissingPort => AllowListError::MissingPort,
            other => AllowListError::InvalidToken(other.to_string()),
        })?;

        let secret = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries
                .get(&port)
                .map(|entry| entry.secret.clone())
                .ok_or(AllowListError::PortNotFound(port))?
        };

        let claims = AllowListToken::verify(token, &secret).map_err(|e| match e {
            AllowListTokenError::SignatureRejected(_) => AllowListError::Forbidden,
            AllowListTokenError::MissingPort => AllowListError::MissingPort,
            other => AllowListError::InvalidToken(other.to_string()),
        })?;

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get_mut(&claims.port)
            .ok_or(AllowListError::PortNotFound(claims.port))?;

        // The port may have been released and leased again while verifying
        if entry.secret != secret {
            return Err(AllowListError::Forbidden);
        }

        if entry.ips.insert(claims.ip) {
            info!(
                "IP {} added to allow list for port {} ({})",
                claims.ip, claims.port, entry.alias
            );
        }

        Ok(Registration {
            port: claims.port,
            ip: claims.ip,
        })
    }

    /// Whether a peer may connect to a leased port.
    ///
    /// IPv4-mapped IPv6 peers match their IPv4 entry.
    pub fn is_allowed(&self, port: u16, ip: IpAddr) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&port)
            .map(|entry| entry.ips.contains(&ip.to_canonical()) || entry.ips.contains(&ip))
            .unwrap_or(false)
    }

    /// Forget a port's allow-list. Returns false if none existed.
    pub fn destroy(&self, port: u16) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let removed = entries.remove(&port).is_some();
        if removed {
            debug!("Destroyed allow-list for port {}", port);
        }
        removed
    }

    /// Find the port leased under an alias
    pub fn port_for_alias(&self, alias: &str) -> Option<u16> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .find(|(_, entry)| entry.alias == alias)
            .map(|(port, _)| *port)
    }

    /// Ports that currently have an allow-list, ascending
    pub fn ports(&self) -> Vec<u16> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut ports: Vec<u16> = entries.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const SECRET: &str = "lease-secret";

    fn store_with_port(port: u16) -> AllowListStore {
        let store = AllowListStore::new();
        store.create(port, "db", SECRET);
        store
    }

    #[test]
    fn test_register_admits_ip() {
        let store = store_with_port(4456);
        let token = AllowListToken::sign(SECRET, "127.0.0.1", 4456).unwrap();

        let registration = store.register(&token).unwrap();
        assert_eq!(registration.port, 4456);
        assert_eq!(registration.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));

        assert!(store.is_allowed(4456, IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(!store.is_allowed(4456, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(!store.is_allowed(4457, IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_register_is_idempotent() {
        let store = store_with_port(4456);
        let token = AllowListToken::sign(SECRET, "::1", 4456).unwrap();

        store.register(&token).unwrap();
        store.register(&token).unwrap();
        assert!(store.is_allowed(4456, IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_empty_allow_list_admits_nobody() {
        let store = store_with_port(4456);
        assert!(!store.is_allowed(4456, IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_mapped_ipv4_peer_matches() {
        let store = store_with_port(4456);
        let token = AllowListToken::sign(SECRET, "127.0.0.1", 4456).unwrap();
        store.register(&token).unwrap();

        let mapped = IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped());
        assert!(store.is_allowed(4456, mapped));
    }

    #[test]
    fn test_wrong_secret_is_forbidden() {
        let store = store_with_port(4456);
        let token = AllowListToken::sign("other-secret", "127.0.0.1", 4456).unwrap();

        assert!(matches!(
            store.register(&token),
            Err(AllowListError::Forbidden)
        ));
        assert!(!store.is_allowed(4456, IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_unknown_port_rejected() {
        let store = store_with_port(4456);
        let token = AllowListToken::sign(SECRET, "127.0.0.1", 5000).unwrap();

        assert!(matches!(
            store.register(&token),
            Err(AllowListError::PortNotFound(5000))
        ));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let store = store_with_port(4456);
        assert!(matches!(
            store.register("not-a-token"),
            Err(AllowListError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_destroy_forgets_port() {
        let store = store_with_port(4456);
        let token = AllowListToken::sign(SECRET, "127.0.0.1", 4456).unwrap();
        store.register(&token).unwrap();

        assert!(store.destroy(4456));
        assert!(!store.destroy(4456));
        assert!(!store.is_allowed(4456, IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(matches!(
            store.register(&token),
            Err(AllowListError::PortNotFound(4456))
        ));
    }

    #[test]
    fn test_port_for_alias() {
        let store = store_with_port(4456);
        store.create(4457, "web", SECRET);

        assert_eq!(store.port_for_alias("web"), Some(4457));
        assert_eq!(store.port_for_alias("db"), Some(4456));
        assert_eq!(store.port_for_alias("nope"), None);
        assert_eq!(store.ports(), vec![4456, 4457]);
    }
}

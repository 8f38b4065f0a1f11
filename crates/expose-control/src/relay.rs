//! Process-wide lease state
//!
//! A [`Relay`] is shared by every control session. Leasing reserves a public
//! port, an alias and a secret, creates the port's allow-list and binds the
//! public listener. Any failure part-way rolls back what was already reserved.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::alias::AliasAllocator;
use crate::allow_list::AllowListStore;
use crate::error::LeaseError;
use crate::port_allocator::{PortAllocator, ProbingPortAllocator};

/// Random bytes in a generated lease secret
const SECRET_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Lowest public port handed out
    pub min_port: u16,
    /// Highest public port handed out (inclusive)
    pub max_port: u16,
    /// Prefix for public URLs, e.g. `tcp://relay.example.com`
    pub public_url: String,
    /// Address public listeners bind to
    pub bind_host: IpAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            min_port: 4456,
            max_port: 5456,
            public_url: "tcp://localhost".to_string(),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// What an agent asked for in `expose`
#[derive(Debug, Clone, Default)]
pub struct LeaseRequest {
    pub local_port: u16,
    pub secret: Option<String>,
    pub alias: Option<String>,
}

/// A granted lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Agent-side port the lease was requested for
    pub local_port: u16,
    /// Public port on the relay
    pub port: u16,
    pub alias: String,
    pub secret: String,
    pub url: String,
}

pub struct Relay {
    config: RelayConfig,
    ports: Arc<dyn PortAllocator>,
    aliases: AliasAllocator,
    allow_lists: AllowListStore,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let ports = Arc::new(ProbingPortAllocator::with_probe_host(
            config.min_port,
            config.max_port,
            config.bind_host,
        ));

        Self {
            config,
            ports,
            aliases: AliasAllocator::new(),
            allow_lists: AllowListStore::new(),
        }
    }

    pub fn with_port_allocator(mut self, ports: Arc<dyn PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_alias_allocator(mut self, aliases: AliasAllocator) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn allow_lists(&self) -> &AllowListStore {
        &self.allow_lists
    }

    /// Public URL for a leased port
    pub fn public_url(&self, port: u16) -> String {
        format!("{}:{}", self.config.public_url.trim_end_matches('/'), port)
    }

    /// Reserve a port, alias and secret and open the public listener.
    ///
    /// Ports whose listener fails to bind stay reserved until the attempt ends
    /// so the allocator does not hand the same port back; they are all
    /// released before returning.
    pub async fn lease(&self, request: LeaseRequest) -> Result<(Lease, TcpListener), LeaseError> {
        let mut failed_ports = Vec::new();

        let result = loop {
            let port = match self.ports.allocate() {
                Ok(port) => port,
                Err(e) => break Err(LeaseError::from(e)),
            };

            let addr = SocketAddr::new(self.config.bind_host, port);
            match TcpListener::bind(addr).await {
                Ok(listener) => break Ok((port, listener)),
                Err(e) => {
                    warn!("Failed to bind public listener on {}: {}", addr, e);
                    failed_ports.push(port);
                }
            }
        };

        for port in failed_ports {
            self.ports.release(port);
        }

        let (port, listener) = result?;

        let alias = match self.aliases.allocate(request.alias.as_deref()) {
            Ok(alias) => alias,
            Err(e) => {
                drop(listener);
                self.ports.release(port);
                return Err(e.into());
            }
        };

        let secret = request
            .secret
            .filter(|secret| !secret.is_empty())
            .unwrap_or_else(generate_secret);

        self.allow_lists.create(port, &alias, &secret);

        let lease = Lease {
            local_port: request.local_port,
            port,
            url: self.public_url(port),
            alias,
            secret,
        };

        info!(
            "Leased port {} as {} for local port {}",
            lease.port, lease.alias, lease.local_port
        );

        Ok((lease, listener))
    }

    /// Return a lease's port, alias and allow-list to the pool.
    ///
    /// The caller must have dropped the lease's listener first.
    pub fn release(&self, lease: &Lease) {
        self.allow_lists.destroy(lease.port);
        self.aliases.release(&lease.alias);
        self.ports.release(lease.port);
        debug!("Released lease {} on port {}", lease.alias, lease.port);
    }

    /// Currently leased public ports, ascending
    pub fn leased_ports(&self) -> Vec<u16> {
        self.ports.allocated_ports()
    }

    pub fn lookup_alias(&self, alias: &str) -> Option<u16> {
        self.allow_lists.port_for_alias(alias)
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AllocationError;
    use std::sync::Mutex;

    /// Hands out a fixed sequence of ports and records releases
    struct ScriptedPorts {
        queue: Mutex<Vec<u16>>,
        allocated: Mutex<Vec<u16>>,
    }

    impl ScriptedPorts {
        fn new(ports: &[u16]) -> Self {
            let mut queue = ports.to_vec();
            queue.reverse();
            Self {
                queue: Mutex::new(queue),
                allocated: Mutex::new(Vec::new()),
            }
        }
    }

    impl PortAllocator for ScriptedPorts {
        fn allocate(&self) -> Result<u16, AllocationError> {
            let port = self
                .queue
                .lock()
                .unwrap()
                .pop()
                .ok_or(AllocationError::NoPortsAvailable { min: 0, max: 0 })?;
            self.allocated.lock().unwrap().push(port);
            Ok(port)
        }

        fn release(&self, port: u16) {
            self.allocated.lock().unwrap().retain(|p| *p != port);
        }

        fn allocated_ports(&self) -> Vec<u16> {
            let mut ports = self.allocated.lock().unwrap().clone();
            ports.sort_unstable();
            ports
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Distinct ports that were free a moment ago
    fn free_ports(n: usize) -> Vec<u16> {
        let holders: Vec<_> = (0..n)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        holders
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect()
    }

    fn loopback_config() -> RelayConfig {
        RelayConfig {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            public_url: "tcp://relay.test".to_string(),
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_lease_and_release() {
        let port = free_port();
        let relay = Relay::new(RelayConfig {
            min_port: port,
            max_port: port,
            ..loopback_config()
        });

        let (lease, listener) = relay
            .lease(LeaseRequest {
                local_port: 5432,
                secret: Some("s3cret".to_string()),
                alias: Some("db".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(lease.port, port);
        assert_eq!(lease.local_port, 5432);
        assert_eq!(lease.alias, "db");
        assert_eq!(lease.secret, "s3cret");
        assert_eq!(lease.url, format!("tcp://relay.test:{}", port));
        assert_eq!(listener.local_addr().unwrap().port(), port);
        assert_eq!(relay.leased_ports(), vec![port]);
        assert_eq!(relay.lookup_alias("db"), Some(port));

        drop(listener);
        relay.release(&lease);
        assert!(relay.leased_ports().is_empty());
        assert_eq!(relay.lookup_alias("db"), None);
    }

    #[tokio::test]
    async fn test_generated_secret_and_alias() {
        let relay = Relay::new(loopback_config())
            .with_port_allocator(Arc::new(ScriptedPorts::new(&[free_port()])));

        let (lease, _listener) = relay
            .lease(LeaseRequest {
                local_port: 80,
                secret: Some(String::new()),
                alias: None,
            })
            .await
            .unwrap();

        assert!(lease.alias.starts_with("exposed-"));
        let decoded = STANDARD.decode(&lease.secret).unwrap();
        assert_eq!(decoded.len(), SECRET_BYTES);
    }

    #[tokio::test]
    async fn test_bind_failure_retries_next_port() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = holder.local_addr().unwrap().port();
        let free = free_port();

        let ports = Arc::new(ScriptedPorts::new(&[busy, free]));
        let relay = Relay::new(loopback_config()).with_port_allocator(ports.clone());

        let (lease, _listener) = relay.lease(LeaseRequest::default()).await.unwrap();

        assert_eq!(lease.port, free);
        // The port that failed to bind was handed back
        assert_eq!(ports.allocated_ports(), vec![free]);
    }

    #[tokio::test]
    async fn test_exhausted_range_rejects() {
        let relay = Relay::new(loopback_config())
            .with_port_allocator(Arc::new(ScriptedPorts::new(&[])));

        let err = relay.lease(LeaseRequest::default()).await.unwrap_err();
        assert!(matches!(
            err,
            LeaseError::Allocation(AllocationError::NoPortsAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_alias_failure_rolls_back_port() {
        let ports = Arc::new(ScriptedPorts::new(&free_ports(2)));
        let relay = Relay::new(loopback_config())
            .with_port_allocator(ports.clone())
            .with_alias_allocator(AliasAllocator::with_generator(|| "fixed".to_string()));

        let (first, _listener) = relay.lease(LeaseRequest::default()).await.unwrap();
        assert_eq!(first.alias, "fixed");

        let err = relay.lease(LeaseRequest::default()).await.unwrap_err();
        assert!(matches!(
            err,
            LeaseError::Allocation(AllocationError::NoAliasAvailable { .. })
        ));
        assert_eq!(ports.allocated_ports(), vec![first.port]);
        assert_eq!(relay.allow_lists().ports(), vec![first.port]);
    }

    #[test]
    fn test_public_url_trims_trailing_slash() {
        let relay = Relay::new(RelayConfig {
            public_url: "tcp://relay.test/".to_string(),
            ..RelayConfig::default()
        });
        assert_eq!(relay.public_url(4456), "tcp://relay.test:4456");
    }
}

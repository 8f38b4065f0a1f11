//! Public port leasing

use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Mutex;
use tracing::debug;

use crate::error::AllocationError;

/// Trait for port allocation (TCP tunnels)
pub trait PortAllocator: Send + Sync {
    /// Reserve the next free port. The port is marked leased before it is returned.
    fn allocate(&self) -> Result<u16, AllocationError>;
    fn release(&self, port: u16);
    /// Currently leased ports, ascending
    fn allocated_ports(&self) -> Vec<u16>;
}

/// Scans `[min, max]` in ascending order and confirms each candidate with an
/// OS-level bind probe.
///
/// The probe only proves the port was free at that instant. Another process can
/// still take it before the listener binds; callers handle that by releasing the
/// reservation and allocating again.
pub struct ProbingPortAllocator {
    min_port: u16,
    max_port: u16,
    probe_host: IpAddr,
    leased: Mutex<BTreeSet<u16>>,
}

impl ProbingPortAllocator {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self::with_probe_host(min_port, max_port, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn with_probe_host(min_port: u16, max_port: u16, probe_host: IpAddr) -> Self {
        Self {
            min_port,
            max_port,
            probe_host,
            leased: Mutex::new(BTreeSet::new()),
        }
    }

    /// Check if a port is actually available at the OS level.
    ///
    /// Only `AddrInUse` counts as taken; any other bind error is treated as available.
    fn is_port_available(&self, port: u16) -> bool {
        match TcpListener::bind(SocketAddr::new(self.probe_host, port)) {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => false,
            Err(e) => {
                debug!("Probe of port {} failed with {}, treating as free", port, e);
                true
            }
        }
    }
}

impl PortAllocator for ProbingPortAllocator {
    fn allocate(&self) -> Result<u16, AllocationError> {
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());

        for port in self.min_port..=self.max_port {
            if leased.contains(&port) {
                continue;
            }
            if self.is_port_available(port) {
                leased.insert(port);
                debug!("Reserved port {}", port);
                return Ok(port);
            }
            debug!("Port {} is in use by another process", port);
        }

        Err(AllocationError::NoPortsAvailable {
            min: self.min_port,
            max: self.max_port,
        })
    }

    fn release(&self, port: u16) {
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        if leased.remove(&port) {
            debug!("Released port {}", port);
        }
    }

    fn allocated_ports(&self) -> Vec<u16> {
        let leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        leased.iter().copied().collect()
    }
}

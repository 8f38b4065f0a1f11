//! Control plane for the tunnel relay
//!
//! Owns the process-wide lease state (ports, aliases, allow-lists) through a
//! [`Relay`] and drives one [`TunnelSession`] per authenticated control channel.

pub mod alias;
pub mod allow_list;
pub mod error;
pub mod listener_tracker;
pub mod port_allocator;
pub mod relay;
pub mod session;

pub use alias::{generate_alias, AliasAllocator, MAX_ALIAS_ATTEMPTS};
pub use allow_list::{AllowListStore, Registration};
pub use error::{AllocationError, AllowListError, LeaseError};
pub use listener_tracker::ListenerTracker;
pub use port_allocator::{PortAllocator, ProbingPortAllocator};
pub use relay::{Lease, LeaseRequest, Relay, RelayConfig};
pub use session::TunnelSession;

//! Agent that exposes a local TCP service through an expose relay

pub mod agent;
pub mod allow_list;
pub mod config;
pub mod error;

pub use agent::{Agent, AgentEvent, ExposedTunnel};
pub use allow_list::AllowListRegistrar;
pub use config::{public_port_from_url, AgentConfig};
pub use error::AgentError;

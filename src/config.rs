//! Relay configuration file
//!
//! Optional YAML file whose values sit underneath CLI flags and environment
//! variables.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RelayFileConfig {
    pub listen: Option<SocketAddr>,
    pub public_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub port_min: Option<u16>,
    pub port_max: Option<u16>,
    pub bind_host: Option<IpAddr>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl RelayFileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

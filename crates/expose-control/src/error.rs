//! Control plane errors

use thiserror::Error;

/// Port or alias allocation failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("No available ports in range {min}-{max}")]
    NoPortsAvailable { min: u16, max: u16 },

    #[error("No available aliases after {attempts} attempts")]
    NoAliasAvailable { attempts: usize },
}

/// Allow-list registration failures
#[derive(Debug, Error)]
pub enum AllowListError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Port is required")]
    MissingPort,

    #[error("Port {0} no longer exists")]
    PortNotFound(u16),

    #[error("Token signature does not match the lease secret")]
    Forbidden,
}

/// Failures while establishing a lease for an `expose` request
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("Failed to open public listener: {0}")]
    Listener(#[from] std::io::Error),
}

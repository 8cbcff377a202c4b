//! Operator error types.

use fleet_registry::RegistryError;
use fleet_state::StateError;
use thiserror::Error;

/// Result type alias for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("lease error: {0}")]
    Lease(#[from] StateError),

    #[error("lease {key} lost")]
    LeaseLost { key: String },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("finalizer {finalizer} failed on {key}: {source:#}")]
    Finalize {
        key: String,
        finalizer: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cancelled before the lease was acquired")]
    Cancelled,
}

//! Registry error types.

use fleet_state::StateError;
use thiserror::Error;

use crate::catalog::ConversionError;
use crate::gvk::Gvk;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid namespace {namespace:?}: {reason}")]
    InvalidNamespace { namespace: String, reason: String },

    #[error("object is {found}, registry stores {expected}")]
    GvkMismatch { expected: Gvk, found: Gvk },

    #[error("{kind} {key} already exists")]
    ResourceExists { kind: String, key: String },

    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("{kind} {key} was modified concurrently")]
    Conflict { kind: String, key: String },

    #[error("revision {revision} of {kind} {key} not found")]
    RevisionNotFound {
        kind: String,
        key: String,
        revision: u64,
    },

    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("hook rejected {key}: {reason}")]
    Hook { key: String, reason: String },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl RegistryError {
    /// Shorthand for hooks rejecting an object.
    pub fn hook(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Hook {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

//! Name and namespace validation.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{RegistryError, RegistryResult};

/// Longest accepted name or namespace.
pub const MAX_NAME_LEN: usize = 63;

/// Lower-case alphanumerics and `-`, starting and ending alphanumeric.
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("name pattern is valid")
});

fn check(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("must not be empty".to_string());
    }
    if value.len() > MAX_NAME_LEN {
        return Err(format!("must be at most {MAX_NAME_LEN} characters"));
    }
    if !NAME_RE.is_match(value) {
        return Err(format!("must match {}", NAME_RE.as_str()));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> RegistryResult<()> {
    check(name).map_err(|reason| RegistryError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// Namespaced kinds need a valid namespace; cluster-scoped kinds must have none.
pub fn validate_namespace(namespace: &str, namespaced: bool) -> RegistryResult<()> {
    if !namespaced {
        if namespace.is_empty() {
            return Ok(());
        }
        return Err(RegistryError::InvalidNamespace {
            namespace: namespace.to_string(),
            reason: "kind is cluster-scoped".to_string(),
        });
    }
    check(namespace).map_err(|reason| RegistryError::InvalidNamespace {
        namespace: namespace.to_string(),
        reason,
    })
}

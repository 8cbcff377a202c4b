//! Schema identity: (group, api version, kind).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Version name of the unversioned hub every kind converts through.
pub const HUB_VERSION: &str = "__internal";

/// Group, api version and kind of a resource schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gvk {
    pub group: String,
    pub api_version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, api_version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Parse the `apiVersion` / `kind` pair found in a stored document.
    ///
    /// `apiVersion` is `group/version`, or a bare `version` for the core group.
    pub fn from_type_meta(api_version: &str, kind: &str) -> Self {
        match api_version.rsplit_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// The `apiVersion` string written into documents.
    pub fn api_version_string(&self) -> String {
        if self.group.is_empty() {
            self.api_version.clone()
        } else {
            format!("{}/{}", self.group, self.api_version)
        }
    }

    /// The hub schema of this kind.
    pub fn hub(&self) -> Self {
        Self::new(&self.group, HUB_VERSION, &self.kind)
    }

    pub fn is_hub(&self) -> bool {
        self.api_version == HUB_VERSION
    }

    /// Same group and kind, ignoring version.
    pub fn same_kind(&self, other: &Gvk) -> bool {
        self.group == other.group && self.kind == other.kind
    }

    /// Lower-cased kind used in key paths and lock names.
    pub fn resource(&self) -> String {
        self.kind.to_ascii_lowercase()
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version_string(), self.kind)
    }
}

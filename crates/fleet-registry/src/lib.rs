//! fleet-registry: typed resource storage for the Fleet control plane.
//!
//! Every resource kind is stored through a [`Registry`] bound to one
//! (group, version, kind). The registry layers object semantics on top of
//! the raw key-value store from `fleet-state`:
//!
//! - create/update/delete/get/list with hook points
//! - optimistic concurrency (compare-and-set on every write)
//! - spec fingerprinting, so only meaningful changes bump `resource_version`
//! - finalizer-deferred deletion (`Deleting` phase until finalizers drain)
//! - schema conversion through a per-kind hub representation ([`Catalog`])
//! - watches that decode and convert each change
//! - revision history for rollback ([`Revisioner`])
//!
//! # Key layout
//!
//! ```text
//! {prefix}/{kind}s/[{namespace}/]{name}                   object JSON
//! {prefix}/revisions/{kind}s/[{namespace}/]{name}/{rev}   revision snapshots
//! {prefix}/locks/{kind}                                   operator lease
//! ```

pub mod catalog;
pub mod error;
pub mod gvk;
pub mod hooks;
pub mod object;
pub mod options;
pub mod registry;
pub mod revision;
pub mod validate;
pub mod watch;

pub use catalog::{Catalog, ConversionError, ConvertFn, spec_conversion};
pub use error::{RegistryError, RegistryResult};
pub use gvk::{Gvk, HUB_VERSION};
pub use hooks::{NoHooks, RegistryHooks};
pub use object::{Condition, Metadata, Object, ObjectRef, Phase, Spec, Status, spec_hash};
pub use options::{DeleteOptions, UpdateOptions};
pub use registry::{LAST_APPLIED_ANNOTATION, Registry, RegistryConfig};
pub use revision::{Revision, Revisioner};
pub use watch::{ObjectWatch, WatchAction, WatchEvent};

//! fleet-state: embedded key-value store for the Fleet control plane.
//!
//! Backed by [redb](https://docs.rs/redb). Values are opaque bytes keyed by
//! `/`-separated paths, so related records share a prefix and can be listed
//! or watched together.
//!
//! # Architecture
//!
//! ```text
//! StateStore (Clone + Send + Sync, Arc<Database>)
//!   ├── kv table      get / set / delete / compare_and_set / list / range
//!   ├── watch hub     broadcast of committed writes, filtered per Watcher
//!   └── leases table  LeaderLock (try_acquire / renew / release)
//! ```
//!
//! Writes are serialized, so watchers observe events in commit order.

pub mod error;
pub mod lease;
pub mod store;
pub mod tables;
pub mod watch;

pub use error::{StateError, StateResult};
pub use lease::{Lease, LeaderLock};
pub use store::StateStore;
pub use watch::{KvAction, KvEvent, Watcher};

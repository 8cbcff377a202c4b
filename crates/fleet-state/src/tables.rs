//! redb table definitions for the Fleet state store.
//!
//! Both tables use `&str` keys and `&[u8]` values.

use redb::TableDefinition;

/// Object data keyed by `{prefix}/{kind}s/[{namespace}/]{name}` and friends.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Leader leases keyed by lock path, JSON-encoded `LeaseRecord` values.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

//! redb table definitions for the appdeck state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Child tables key records as `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Templates keyed by `{name}@{version}`.
pub const TEMPLATES: TableDefinition<&str, &[u8]> = TableDefinition::new("templates");

/// Instances keyed by instance ID.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Port mappings keyed by `{instance_id}:{port_configuration_id}`.
pub const PORT_MAPPINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("port_mappings");

/// Lifecycle logs keyed by `{instance_id}:{log_id:020}`.
pub const LIFECYCLE_LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("lifecycle_logs");

/// Node registry keyed by node ID.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Monotonic ID counters keyed by sequence name.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

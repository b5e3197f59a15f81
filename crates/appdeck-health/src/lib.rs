//! appdeck-health: health checking for deployed instances and nodes.
//!
//! Each port configuration of a template carries a health-check strategy.
//! Probing an instance checks every port mapping, derives the instance's
//! health from them, and records one `HealthCheck` lifecycle log. Probing a
//! node checks all of its running instances concurrently and derives the
//! node status.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── check_instance / check_node (on demand)
//!   ├── Per-node background task (scheduled sweep, due mappings only)
//!   └── Sweeper
//!         ├── HealthChecker::probe_with_retries() → ProbeResult
//!         ├── aggregate::instance_healthy / node_status
//!         └── StateStore::record_health_check, set_node_status
//! ```

pub mod aggregate;
pub mod checker;
pub mod error;
pub mod monitor;
pub mod sweep;

pub use aggregate::{instance_healthy, node_status};
pub use checker::{HealthChecker, ProbeResult};
pub use error::HealthError;
pub use monitor::HealthMonitor;
pub use sweep::{InstanceHealthReport, Sweeper};

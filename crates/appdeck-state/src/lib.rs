//! appdeck-state: embedded state store for appdeck.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for templates, instances, port mappings, lifecycle logs, and the
//! node registry.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Child records use composite keys (`{instance_id}:{port_id}`,
//! `{instance_id}:{log_id:020}`) so an instance's mappings and logs can be
//! collected by prefix and come back in insertion order.
//!
//! Multi-record invariants are enforced inside a single write transaction:
//! marking a template version as latest clears every other version of the
//! same name, and deleting an instance removes its mappings and logs.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

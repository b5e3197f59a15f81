//! appdeck-lifecycle: drives instances through their lifecycle.
//!
//! The orchestrator validates each requested transition against the
//! instance's current status, runs the template's install or uninstall
//! steps in sequence order through the step executor, and records the
//! final status.
//!
//! # State machine
//!
//! ```text
//!             provision
//!                 │
//!                 ▼
//!  deploy ──► INSTALLING ──ok──► RUNNING ◄──start── STOPPED
//!    ▲            │                 │ stop            ▲
//!    │          halt                └─────────────────┘
//!    │            ▼
//!    ├────── FAILED ◄──halt── UNINSTALLING ◄── uninstall (RUNNING, STOPPED, FAILED)
//!    │                             │
//!    └──────── UNINSTALLED ◄───ok──┘
//! ```
//!
//! At most one deploy or uninstall run is active per instance; the run
//! registry rejects overlapping requests and carries the cancel signal.

pub mod error;
pub mod orchestrator;
pub mod registry;

pub use error::{LifecycleError, LifecycleResult};
pub use orchestrator::{Orchestrator, ProvisionRequest, RunReport};
pub use registry::{RunGuard, RunRegistry};

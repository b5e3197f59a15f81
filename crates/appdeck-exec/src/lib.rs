//! appdeck-exec: runs template execution steps.
//!
//! # Architecture
//!
//! ```text
//! StepExecutor::execute_step(instance, step, params, action, cancel)
//!   ├── resolve parameters (declared defaults ← instance env ← caller)
//!   ├── PlaceholderPattern::substitute (compiled once per pattern)
//!   ├── CommandBackend::execute  ── retried up to retry_count times
//!   │     └── ShellBackend (local `sh -c` / `sh -s`, optional sudo / ssh)
//!   └── StateStore::append_log  ── exactly one LifecycleLog per call
//! ```
//!
//! Execution failures never escape the executor: spawn errors, timeouts,
//! non-zero exits and cancellations all end up as a `Failed` log carrying a
//! descriptive exit code (see [`executor`] constants).

pub mod backend;
pub mod cancel;
pub mod error;
pub mod executor;
pub mod placeholder;

pub use backend::{
    CommandBackend, CommandOutput, CommandRequest, ExecFuture, MAX_CAPTURE_BYTES, ShellBackend,
};
pub use cancel::{CancelHandle, Cancellation, cancellation};
pub use error::{ExecError, PatternError};
pub use executor::{
    EXIT_CANCELLED, EXIT_INTERNAL_ERROR, EXIT_TIMED_OUT, Params, StepExecutor,
    resolve_parameters,
};
pub use placeholder::PlaceholderPattern;

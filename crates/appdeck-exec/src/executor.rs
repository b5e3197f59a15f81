//! StepExecutor: runs one execution step against an instance and records
//! the result.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use appdeck_core::config::ExecutorConfig;
use appdeck_state::{
    ExecutionStep, Instance, LifecycleAction, LifecycleLog, LogStatus, StateStore,
};

use crate::backend::{CommandBackend, CommandOutput, CommandRequest, MAX_CAPTURE_BYTES};
use crate::cancel::Cancellation;
use crate::error::{ExecError, PatternError};
use crate::placeholder::PlaceholderPattern;

/// Parameter values keyed by name.
pub type Params = BTreeMap<String, Value>;

/// Exit code for failures that happen before or around the process.
pub const EXIT_INTERNAL_ERROR: i32 = -1;
/// Exit code recorded when an attempt exceeds the step timeout.
pub const EXIT_TIMED_OUT: i32 = 124;
/// Exit code recorded when the run was cancelled.
pub const EXIT_CANCELLED: i32 = 130;

/// Only the tail of the captured output is kept in the log.
const MAX_OUTPUT_BYTES: usize = MAX_CAPTURE_BYTES;

/// Merge parameter sources: declared defaults, then the instance
/// environment, then caller-supplied values. Later sources win.
pub fn resolve_parameters(
    step: &ExecutionStep,
    env: &BTreeMap<String, String>,
    params: &Params,
) -> Params {
    let mut resolved = Params::new();
    for param in &step.parameters {
        if let Some(default) = &param.default {
            resolved.insert(param.name.clone(), default.clone());
        }
    }
    for (key, value) in env {
        resolved.insert(key.clone(), Value::String(value.clone()));
    }
    for (key, value) in params {
        resolved.insert(key.clone(), value.clone());
    }
    resolved
}

/// Declared required parameters that have no usable value.
fn missing_required(step: &ExecutionStep, resolved: &Params) -> Vec<String> {
    step.parameters
        .iter()
        .filter(|p| p.required)
        .filter(|p| matches!(resolved.get(&p.name), None | Some(Value::Null)))
        .map(|p| p.name.clone())
        .collect()
}

/// Result of all attempts of one step, before it becomes a log.
#[derive(Debug)]
struct StepOutcome {
    status: LogStatus,
    message: String,
    output: Option<String>,
    exit_code: Option<i32>,
    attempts: u32,
}

impl StepOutcome {
    fn failed(message: String, exit_code: i32, attempts: u32) -> Self {
        Self {
            status: LogStatus::Failed,
            message,
            output: None,
            exit_code: Some(exit_code),
            attempts,
        }
    }

    fn from_output(step: &ExecutionStep, output: &CommandOutput, attempts: u32) -> Self {
        let (status, message) = if output.success() {
            (LogStatus::Success, format!("step '{}' completed", step.name))
        } else {
            (
                LogStatus::Failed,
                format!(
                    "step '{}' exited with code {} after {} attempt(s)",
                    step.name, output.exit_code, attempts
                ),
            )
        };
        Self {
            status,
            message,
            output: Some(truncate_tail(output.merged())),
            exit_code: Some(output.exit_code),
            attempts,
        }
    }

    fn from_error(step: &ExecutionStep, err: &ExecError, attempts: u32) -> Self {
        let exit_code = match err {
            ExecError::TimedOut(_) => EXIT_TIMED_OUT,
            ExecError::Spawn(_) | ExecError::Io(_) => EXIT_INTERNAL_ERROR,
        };
        Self::failed(
            format!("step '{}' {err} after {attempts} attempt(s)", step.name),
            exit_code,
            attempts,
        )
    }

    fn cancelled(step: &ExecutionStep, attempts: u32) -> Self {
        Self::failed(
            format!("step '{}' cancelled", step.name),
            EXIT_CANCELLED,
            attempts,
        )
    }

    fn is_success(&self) -> bool {
        self.status == LogStatus::Success
    }
}

/// Runs execution steps through a [`CommandBackend`] and appends exactly
/// one lifecycle log per invocation.
pub struct StepExecutor {
    backend: Arc<dyn CommandBackend>,
    store: StateStore,
    default_working_dir: PathBuf,
    default_pattern: String,
    patterns: Mutex<HashMap<String, Arc<PlaceholderPattern>>>,
}

impl StepExecutor {
    pub fn new(backend: Arc<dyn CommandBackend>, store: StateStore) -> Self {
        Self::with_config(backend, store, &ExecutorConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn CommandBackend>,
        store: StateStore,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            backend,
            store,
            default_working_dir: config.default_working_dir.clone(),
            default_pattern: config.placeholder_pattern.clone(),
            patterns: Mutex::new(HashMap::new()),
        }
    }

    /// The backend steps are executed with.
    pub fn backend(&self) -> Arc<dyn CommandBackend> {
        Arc::clone(&self.backend)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Compiled pattern for `source`, compiling and caching it on first use.
    pub fn pattern(&self, source: &str) -> Result<Arc<PlaceholderPattern>, PatternError> {
        // A poisoned cache only means another thread panicked mid-insert.
        let mut cache = self
            .patterns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pattern) = cache.get(source) {
            return Ok(Arc::clone(pattern));
        }
        let pattern = Arc::new(PlaceholderPattern::compile(source)?);
        cache.insert(source.to_string(), Arc::clone(&pattern));
        Ok(pattern)
    }

    /// Execute `step` for `instance` and persist the resulting log.
    ///
    /// Never fails: every problem ends up in a `Failed` log.
    pub async fn execute_step(
        &self,
        instance: &Instance,
        step: &ExecutionStep,
        params: &Params,
        action: LifecycleAction,
        cancel: &Cancellation,
    ) -> LifecycleLog {
        let started = Instant::now();
        debug!(
            instance_id = %instance.id,
            step_id = %step.id,
            sequence = step.sequence,
            action = action.as_str(),
            "executing step"
        );

        let outcome = self.run(instance, step, params, cancel.clone()).await;

        let mut log = LifecycleLog::new(&instance.id, action, outcome.status, outcome.message);
        log.execution_step_id = Some(step.id.clone());
        log.output = outcome.output;
        log.exit_code = outcome.exit_code;
        log.attempts = outcome.attempts;
        log.duration_secs = started.elapsed().as_secs_f64();

        if log.is_success() {
            info!(
                instance_id = %instance.id,
                step_id = %step.id,
                attempts = log.attempts,
                duration_secs = log.duration_secs,
                "step succeeded"
            );
        } else {
            warn!(
                instance_id = %instance.id,
                step_id = %step.id,
                exit_code = ?log.exit_code,
                attempts = log.attempts,
                "step failed"
            );
        }

        match self.store.append_log(log.clone()) {
            Ok(stored) => stored,
            Err(e) => {
                error!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    error = %e,
                    "failed to persist lifecycle log"
                );
                log
            }
        }
    }

    async fn run(
        &self,
        instance: &Instance,
        step: &ExecutionStep,
        params: &Params,
        mut cancel: Cancellation,
    ) -> StepOutcome {
        if cancel.is_cancelled() {
            return StepOutcome::cancelled(step, 0);
        }

        let resolved = resolve_parameters(step, &instance.env, params);
        let missing = missing_required(step, &resolved);
        if !missing.is_empty() {
            return StepOutcome::failed(
                format!(
                    "step '{}' is missing required parameter(s): {}",
                    step.name,
                    missing.join(", ")
                ),
                EXIT_INTERNAL_ERROR,
                0,
            );
        }

        let source = step
            .placeholder_pattern
            .as_deref()
            .unwrap_or(&self.default_pattern);
        let pattern = match self.pattern(source) {
            Ok(p) => p,
            Err(e) => {
                return StepOutcome::failed(
                    format!("step '{}': {e}", step.name),
                    EXIT_INTERNAL_ERROR,
                    0,
                );
            }
        };
        let content = pattern.substitute(&step.content, &resolved);
        let unresolved = pattern.unresolved(&step.content, &resolved);
        if !unresolved.is_empty() {
            debug!(step_id = %step.id, ?unresolved, "placeholders left verbatim");
        }

        let request = CommandRequest {
            content,
            kind: step.kind,
            working_directory: Some(
                step.working_directory
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.default_working_dir.clone()),
            ),
            use_sudo: step.use_sudo,
            timeout: Duration::from_secs(step.timeout_secs),
            env: instance.env.clone(),
            host: self.resolve_host(&instance.node_id),
        };

        let max_attempts = step.retry_count.saturating_add(1);
        let retry_interval = Duration::from_secs(step.retry_interval_secs);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StepOutcome::cancelled(step, attempt),
                result = self.backend.execute(&request) => result,
            };
            let outcome = match &result {
                Ok(output) => StepOutcome::from_output(step, output, attempt),
                Err(e) => StepOutcome::from_error(step, e, attempt),
            };
            if outcome.is_success() || attempt >= max_attempts {
                return outcome;
            }

            warn!(
                instance_id = %instance.id,
                step_id = %step.id,
                attempt,
                max_attempts,
                exit_code = ?outcome.exit_code,
                "step attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StepOutcome::cancelled(step, attempt),
                _ = tokio::time::sleep(retry_interval) => {}
            }
        }
    }

    fn resolve_host(&self, node_id: &str) -> Option<String> {
        match self.store.get_node(node_id) {
            Ok(node) => node.map(|n| n.host),
            Err(e) => {
                warn!(node_id, error = %e, "failed to resolve node host");
                None
            }
        }
    }
}

/// Keep at most the last `MAX_OUTPUT_BYTES` of `text`, on a char boundary.
fn truncate_tail(text: String) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text;
    }
    let mut start = text.len() - MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

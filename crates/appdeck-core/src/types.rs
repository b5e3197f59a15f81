//! Shared template building blocks used across appdeck crates.
//!
//! Execution steps and port configurations are defined here so that both
//! the TOML template manifests and the persisted store records use the same
//! shapes.

use serde::{Deserialize, Serialize};

/// Placeholder pattern used when a step does not declare its own.
pub const DEFAULT_PLACEHOLDER_PATTERN: &str = "{{PARAM_NAME}}";

/// Literal marker inside a placeholder pattern that stands for the parameter name.
pub const PLACEHOLDER_NAME_MARKER: &str = "PARAM_NAME";

// ── Execution steps ──────────────────────────────────────────────

/// How a step's content is handed to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A single command line, run with `<shell> -c`.
    Command,
    /// A script body, piped to `<shell> -s`.
    Script,
}

/// A declared parameter of an execution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepParameter {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
}

/// One ordered command/script unit of an install or uninstall sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Unique within the owning template.
    pub id: String,
    pub name: String,
    /// Execution order (ascending). Ties keep declaration order.
    #[serde(default)]
    pub sequence: i32,
    pub kind: StepKind,
    pub content: String,
    /// Placeholder pattern containing the `PARAM_NAME` marker.
    #[serde(default)]
    pub placeholder_pattern: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub use_sudo: bool,
    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub parameters: Vec<StepParameter>,
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_interval_secs: u64,
}

impl ExecutionStep {
    /// The placeholder pattern in effect for this step.
    pub fn placeholder_pattern(&self) -> &str {
        self.placeholder_pattern
            .as_deref()
            .unwrap_or(DEFAULT_PLACEHOLDER_PATTERN)
    }
}

/// Return the steps in execution order: ascending `sequence`, stable on ties.
pub fn ordered_steps(steps: &[ExecutionStep]) -> Vec<&ExecutionStep> {
    let mut ordered: Vec<&ExecutionStep> = steps.iter().collect();
    ordered.sort_by_key(|s| s.sequence);
    ordered
}

// ── Ports ─────────────────────────────────────────────────────────

/// Transport protocol of a declared port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Strategy used to probe a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckType {
    TcpConnect,
    UdpPortCheck,
    Command,
}

/// A port declared by a template, with its health-check policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfiguration {
    /// Unique within the owning template.
    pub id: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub description: Option<String>,
    pub health_check_type: HealthCheckType,
    /// Free-form strategy settings (`command`, `success_exit_code`,
    /// `success_output_regex`).
    #[serde(default = "empty_object")]
    pub health_check_config: serde_json::Value,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_secs: u64,
    #[serde(default)]
    pub health_check_retries: u32,
}

fn default_true() -> bool {
    true
}

fn default_step_timeout() -> u64 {
    300
}

fn default_health_interval() -> u64 {
    60
}

fn default_health_timeout() -> u64 {
    5
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

//! Domain types for the appdeck state store.
//!
//! These types represent the persisted state of templates, instances,
//! port mappings, lifecycle logs, and registered nodes. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use appdeck_core::TemplateManifest;
use appdeck_core::version::{VersionError, canonical_version};

pub use appdeck_core::types::{
    ExecutionStep, HealthCheckType, PortConfiguration, Protocol, StepKind, StepParameter,
    ordered_steps,
};

/// Template identifier, `{name}@{version}`.
pub type TemplateId = String;

/// Unique identifier for an instance.
pub type InstanceId = String;

/// Unique identifier for a node.
pub type NodeId = String;

// ── Template ──────────────────────────────────────────────────────

/// A versioned application blueprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    /// Canonical semantic version.
    pub version: String,
    pub description: Option<String>,
    pub enabled: bool,
    /// At most one template per name carries this flag.
    pub is_latest: bool,
    /// Default environment variables copied onto new instances.
    pub env: BTreeMap<String, String>,
    pub install_steps: Vec<ExecutionStep>,
    pub uninstall_steps: Vec<ExecutionStep>,
    pub ports: Vec<PortConfiguration>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Template {
    /// Build the table key for a name/version pair.
    pub fn key_for(name: &str, version: &str) -> TemplateId {
        format!("{name}@{version}")
    }

    /// Build a template record from a validated manifest.
    pub fn from_manifest(manifest: TemplateManifest, now: u64) -> Result<Self, VersionError> {
        let version = canonical_version(&manifest.template.version)?;
        Ok(Self {
            id: Self::key_for(&manifest.template.name, &version),
            name: manifest.template.name,
            version,
            description: manifest.template.description,
            enabled: manifest.template.enabled,
            is_latest: false,
            env: manifest.env,
            install_steps: manifest.install,
            uninstall_steps: manifest.uninstall,
            ports: manifest.ports,
            created_at: now,
            updated_at: now,
        })
    }

    /// Look up a port configuration by ID.
    pub fn port(&self, id: &str) -> Option<&PortConfiguration> {
        self.ports.iter().find(|p| p.id == id)
    }

    /// Whether two records differ in anything other than bookkeeping flags.
    pub fn same_content(&self, other: &Template) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.description == other.description
            && self.env == other.env
            && self.install_steps == other.install_steps
            && self.uninstall_steps == other.uninstall_steps
            && self.ports == other.ports
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// One deployed occurrence of a template on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub template_id: TemplateId,
    pub template_name: String,
    /// Version pinned at creation time.
    pub template_version: String,
    pub node_id: NodeId,
    pub status: InstanceStatus,
    pub env: BTreeMap<String, String>,
    /// `None` until the first health check after the instance started running.
    pub healthy: Option<bool>,
    pub last_health_check: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Installing,
    Running,
    Failed,
    Uninstalling,
    Stopped,
    Uninstalled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Installing => "installing",
            InstanceStatus::Running => "running",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Uninstalling => "uninstalling",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Uninstalled => "uninstalled",
        }
    }

    /// Whether an orchestration run is expected to be driving this status.
    pub fn is_transitional(&self) -> bool {
        matches!(self, InstanceStatus::Installing | InstanceStatus::Uninstalling)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Port mapping ──────────────────────────────────────────────────

/// The realized binding of a template port on an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    pub instance_id: InstanceId,
    pub port_configuration_id: String,
    /// Bound port; may differ from the configured one.
    pub actual_port: u16,
    pub healthy: Option<bool>,
    pub last_health_check: Option<u64>,
}

impl PortMapping {
    /// Build the composite key for the port mappings table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.instance_id, self.port_configuration_id)
    }
}

// ── Lifecycle log ─────────────────────────────────────────────────

/// What an audit record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Install,
    HealthCheck,
    Uninstall,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Install => "install",
            LifecycleAction::HealthCheck => "health_check",
            LifecycleAction::Uninstall => "uninstall",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Failed,
}

/// Immutable audit record of one step execution or health check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleLog {
    /// Assigned by the store on append.
    pub id: u64,
    pub instance_id: InstanceId,
    pub execution_step_id: Option<String>,
    pub action: LifecycleAction,
    pub status: LogStatus,
    pub message: String,
    pub output: Option<String>,
    pub exit_code: Option<i32>,
    /// Number of attempts made (retries + 1).
    pub attempts: u32,
    pub duration_secs: f64,
    pub created_at: u64,
}

impl LifecycleLog {
    /// Start a log record for an instance; `id` is assigned on append.
    pub fn new(
        instance_id: &str,
        action: LifecycleAction,
        status: LogStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            instance_id: instance_id.to_string(),
            execution_step_id: None,
            action,
            status,
            message: message.into(),
            output: None,
            exit_code: None,
            attempts: 1,
            duration_secs: 0.0,
            created_at: epoch_secs(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == LogStatus::Success
    }

    /// Build the composite key for the lifecycle logs table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.instance_id, self.id)
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Aggregate status of a node, derived from its instances' health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Maintain,
}

/// A host that instances are deployed onto.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Hostname or IP address used for health probes and remote execution.
    pub host: String,
    pub status: NodeStatus,
    pub updated_at: u64,
}

impl NodeRecord {
    pub fn new(id: &str, host: &str) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            status: NodeStatus::Maintain,
            updated_at: epoch_secs(),
        }
    }
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

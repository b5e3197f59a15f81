//! Template manifest (`template.toml`) parser.
//!
//! A manifest describes one template version: metadata, default
//! environment, install/uninstall steps, and port configurations.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    ExecutionStep, HealthCheckType, PLACEHOLDER_NAME_MARKER, PortConfiguration,
};
use crate::version::{VersionError, parse_version};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateManifest {
    pub template: TemplateSection,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub install: Vec<ExecutionStep>,
    #[serde(default)]
    pub uninstall: Vec<ExecutionStep>,
    #[serde(default)]
    pub ports: Vec<PortConfiguration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSection {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Problems found while validating a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("template name must not be empty")]
    EmptyName,

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("step {0} has an empty id or content")]
    EmptyStep(String),

    #[error("step {step}: placeholder pattern {pattern:?} lacks the PARAM_NAME marker")]
    BadPlaceholderPattern { step: String, pattern: String },

    #[error("step {0}: timeout must be at least one second")]
    ZeroTimeout(String),

    #[error("duplicate port id: {0}")]
    DuplicatePort(String),

    #[error("port {0}: port number must be non-zero")]
    ZeroPort(String),

    #[error("port {0}: command health check requires a `command` entry")]
    MissingHealthCommand(String),
}

impl TemplateManifest {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest = Self::from_toml_str(&content)?;
        Ok(manifest)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let manifest: TemplateManifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check structural invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.template.name.trim().is_empty() {
            return Err(ManifestError::EmptyName);
        }
        parse_version(&self.template.version)?;

        let mut step_ids = HashSet::new();
        for step in self.install.iter().chain(self.uninstall.iter()) {
            if step.id.trim().is_empty() || step.content.trim().is_empty() {
                return Err(ManifestError::EmptyStep(step.name.clone()));
            }
            if !step_ids.insert(step.id.as_str()) {
                return Err(ManifestError::DuplicateStep(step.id.clone()));
            }
            if !step.placeholder_pattern().contains(PLACEHOLDER_NAME_MARKER) {
                return Err(ManifestError::BadPlaceholderPattern {
                    step: step.id.clone(),
                    pattern: step.placeholder_pattern().to_string(),
                });
            }
            if step.timeout_secs == 0 {
                return Err(ManifestError::ZeroTimeout(step.id.clone()));
            }
        }

        let mut port_ids = HashSet::new();
        for port in &self.ports {
            if !port_ids.insert(port.id.as_str()) {
                return Err(ManifestError::DuplicatePort(port.id.clone()));
            }
            if port.port == 0 {
                return Err(ManifestError::ZeroPort(port.id.clone()));
            }
            if port.health_check_type == HealthCheckType::Command
                && port
                    .health_check_config
                    .get("command")
                    .and_then(|c| c.as_str())
                    .is_none()
            {
                return Err(ManifestError::MissingHealthCommand(port.id.clone()));
            }
        }

        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

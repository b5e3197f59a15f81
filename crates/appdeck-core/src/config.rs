//! appdeckd.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working single-host configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_PLACEHOLDER_PATTERN;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub executor: ExecutorConfig,
    pub health: HealthSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the admin API listens on.
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Shell used for commands (`-c`) and scripts (`-s`).
    pub shell: String,
    /// Working directory for steps that do not set one.
    pub default_working_dir: PathBuf,
    /// Elevation program and its arguments, e.g. `["sudo", "-n"]`.
    pub sudo: Vec<String>,
    /// Placeholder pattern for steps that do not declare one.
    pub placeholder_pattern: String,
    /// Run steps on the target node over SSH instead of locally.
    pub ssh: Option<SshConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub program: String,
    pub user: Option<String>,
    pub port: u16,
    /// Extra arguments passed before the destination.
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Interval between scheduled per-node health sweeps.
    pub sweep_interval_secs: u64,
    /// Start a sweep loop for every registered node on boot.
    pub monitor_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8480".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/appdeck"),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            default_working_dir: PathBuf::from("/"),
            sudo: vec!["sudo".to_string(), "-n".to_string()],
            placeholder_pattern: DEFAULT_PLACEHOLDER_PATTERN.to_string(),
            ssh: None,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            user: None,
            port: 22,
            options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            monitor_on_start: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,appdeckd=debug,appdeck=debug".to_string(),
            json: false,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Path of the redb database inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.storage.data_dir.join("appdeck.redb")
    }
}

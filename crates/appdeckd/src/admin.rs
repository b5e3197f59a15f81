//! Offline administration of the state database.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::info;

use appdeck_core::{DaemonConfig, TemplateManifest};
use appdeck_state::{StateError, StateStore, Template, epoch_secs};

/// Open (or create) the store under the configured data directory.
pub fn open_store(config: &DaemonConfig) -> Result<StateStore> {
    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            config.storage.data_dir.display()
        )
    })?;
    let path = config.db_path();
    StateStore::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

/// Parse and validate a manifest file, then store it as a template version.
pub fn import_template(
    state: &StateStore,
    path: &Path,
    latest: bool,
    replace: bool,
) -> Result<Template> {
    let manifest = TemplateManifest::from_file(path)
        .with_context(|| format!("invalid manifest {}", path.display()))?;
    let template = Template::from_manifest(manifest, epoch_secs())?;

    let mut stored = match state.create_template(&template) {
        Ok(t) => t,
        Err(StateError::AlreadyExists(id)) if replace => {
            info!(template_id = %id, "replacing template version");
            state.update_template(&template)?
        }
        Err(StateError::AlreadyExists(id)) => {
            bail!("template {id} already exists (use --replace to overwrite it)")
        }
        Err(e) => return Err(e.into()),
    };
    if latest && !stored.is_latest {
        stored = state.set_latest_version(&stored.id)?;
    }
    info!(template_id = %stored.id, latest = stored.is_latest, "template imported");
    Ok(stored)
}

pub fn list_templates(state: &StateStore, name: Option<&str>) -> Result<Vec<Template>> {
    let templates = match name {
        Some(name) => state.list_template_versions(name)?,
        None => state.list_templates()?,
    };
    Ok(templates)
}

/// One line per template: id, flags, step and port counts.
pub fn format_templates(templates: &[Template]) -> String {
    let mut out = String::new();
    for t in templates {
        let mut flags = Vec::new();
        if t.is_latest {
            flags.push("latest");
        }
        if !t.enabled {
            flags.push("disabled");
        }
        let _ = writeln!(
            out,
            "{}\t[{}]\tinstall={} uninstall={} ports={}",
            t.id,
            flags.join(","),
            t.install_steps.len(),
            t.uninstall_steps.len(),
            t.ports.len(),
        );
    }
    out
}

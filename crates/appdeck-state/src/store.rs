//! StateStore: redb-backed state persistence for appdeck.
//!
//! Provides typed CRUD operations over templates, instances, port mappings,
//! lifecycle logs, and nodes. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

const INSTANCE_COUNTER: &str = "instance";
const LOG_COUNTER: &str = "lifecycle_log";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(PORT_MAPPINGS).map_err(map_err!(Table))?;
        txn.open_table(LIFECYCLE_LOGS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Templates ──────────────────────────────────────────────────

    /// Store a new template version.
    ///
    /// The first version stored under a name becomes the latest one;
    /// later versions must be promoted with [`Self::set_latest_version`].
    pub fn create_template(&self, template: &Template) -> StateResult<Template> {
        check_template_key(template)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
            if table.get(template.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(template.id.clone()));
            }
            let has_latest = scan::<Template, _>(&table, "")?
                .iter()
                .any(|(_, t)| t.name == template.name && t.is_latest);

            let mut record = template.clone();
            record.is_latest = !has_latest;
            table
                .insert(record.id.as_str(), encode(&record)?.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(template = %record.id, is_latest = record.is_latest, "template created");
        Ok(record)
    }

    /// Replace a template's content.
    ///
    /// Rejected once any instance references the template. The enabled and
    /// latest flags are not changed here.
    pub fn update_template(&self, template: &Template) -> StateResult<Template> {
        check_template_key(template)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let referenced = {
                let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
                scan::<Instance, _>(&instances, "")?
                    .iter()
                    .any(|(_, i)| i.template_id == template.id)
            };
            let mut table = txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
            let existing: Template = get_in(&table, &template.id)?
                .ok_or_else(|| StateError::NotFound(template.id.clone()))?;
            if referenced && !existing.same_content(template) {
                return Err(StateError::Immutable(template.id.clone()));
            }

            let mut record = template.clone();
            record.enabled = existing.enabled;
            record.is_latest = existing.is_latest;
            record.created_at = existing.created_at;
            record.updated_at = epoch_secs();
            table
                .insert(record.id.as_str(), encode(&record)?.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(template = %record.id, "template updated");
        Ok(record)
    }

    /// Get a template by `{name}@{version}` key.
    pub fn get_template(&self, id: &str) -> StateResult<Option<Template>> {
        self.get_record(TEMPLATES, id)
    }

    /// List all templates.
    pub fn list_templates(&self) -> StateResult<Vec<Template>> {
        self.list_records(TEMPLATES, "")
    }

    /// List every stored version of a template name.
    pub fn list_template_versions(&self, name: &str) -> StateResult<Vec<Template>> {
        Ok(self
            .list_templates()?
            .into_iter()
            .filter(|t| t.name == name)
            .collect())
    }

    /// The version of `name` currently marked latest, if any.
    pub fn latest_template(&self, name: &str) -> StateResult<Option<Template>> {
        Ok(self
            .list_template_versions(name)?
            .into_iter()
            .find(|t| t.is_latest))
    }

    /// Mark a template as the latest version of its name.
    ///
    /// Clearing the flag on every other version and setting it on the target
    /// happen in one write transaction, so readers never observe two latest
    /// versions of the same name.
    pub fn set_latest_version(&self, id: &str) -> StateResult<Template> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let target = {
            let mut table = txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
            let target: Template =
                get_in(&table, id)?.ok_or_else(|| StateError::NotFound(id.to_string()))?;

            let siblings: Vec<(String, Template)> = scan::<Template, _>(&table, "")?
                .into_iter()
                .filter(|(_, t)| t.name == target.name)
                .collect();

            let mut updated = target;
            for (key, mut template) in siblings {
                let latest = key == id;
                if template.is_latest != latest {
                    template.is_latest = latest;
                    template.updated_at = now;
                    table
                        .insert(key.as_str(), encode(&template)?.as_slice())
                        .map_err(map_err!(Write))?;
                }
                if latest {
                    updated = template;
                }
            }
            updated
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(template = %id, name = %target.name, "template marked as latest version");
        Ok(target)
    }

    /// Enable or disable a template.
    pub fn set_template_enabled(&self, id: &str, enabled: bool) -> StateResult<Template> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let template = {
            let mut table = txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
            let mut template: Template =
                get_in(&table, id)?.ok_or_else(|| StateError::NotFound(id.to_string()))?;
            template.enabled = enabled;
            template.updated_at = epoch_secs();
            table
                .insert(id, encode(&template)?.as_slice())
                .map_err(map_err!(Write))?;
            template
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(template = %id, enabled, "template enabled flag changed");
        Ok(template)
    }

    /// Delete a template. Returns true if it existed.
    pub fn delete_template(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = {
            let referenced = {
                let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
                scan::<Instance, _>(&instances, "")?
                    .iter()
                    .any(|(_, i)| i.template_id == id)
            };
            if referenced {
                return Err(StateError::Immutable(id.to_string()));
            }
            let mut table = txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
            table.remove(id).map_err(map_err!(Write))?.is_some()
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(template = %id, existed, "template deleted");
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Create an instance of `template` on `node_id` in `Installing` state.
    ///
    /// The template version is pinned, template env defaults are overlaid
    /// with `env_overrides`, and one port mapping is created per port
    /// configuration (`port_overrides` maps configuration IDs to the
    /// actually bound port).
    pub fn create_instance(
        &self,
        template: &Template,
        node_id: &str,
        env_overrides: &BTreeMap<String, String>,
        port_overrides: &HashMap<String, u16>,
    ) -> StateResult<(Instance, Vec<PortMapping>)> {
        if let Some(unknown) = port_overrides.keys().find(|id| template.port(id).is_none()) {
            return Err(StateError::Invalid(format!(
                "template {} has no port configuration {unknown}",
                template.id
            )));
        }

        let mut env = template.env.clone();
        env.extend(env_overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(bad) = env.keys().find(|k| !is_env_key(k)) {
            return Err(StateError::Invalid(format!(
                "environment variable name {bad:?} is not a valid shell identifier"
            )));
        }

        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            if nodes.get(node_id).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(node_id.to_string()));
            }
        }
        let seq = next_id(&txn, INSTANCE_COUNTER)?;

        let instance = Instance {
            id: format!("inst-{seq}"),
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            template_version: template.version.clone(),
            node_id: node_id.to_string(),
            status: InstanceStatus::Installing,
            env,
            healthy: None,
            last_health_check: None,
            created_at: now,
            updated_at: now,
        };
        let mappings: Vec<PortMapping> = template
            .ports
            .iter()
            .map(|port| PortMapping {
                instance_id: instance.id.clone(),
                port_configuration_id: port.id.clone(),
                actual_port: port_overrides.get(&port.id).copied().unwrap_or(port.port),
                healthy: None,
                last_health_check: None,
            })
            .collect();

        {
            let templates = txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
            if templates
                .get(template.id.as_str())
                .map_err(map_err!(Read))?
                .is_none()
            {
                return Err(StateError::NotFound(template.id.clone()));
            }
        }
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(instance.id.as_str(), encode(&instance)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        {
            let mut table = txn.open_table(PORT_MAPPINGS).map_err(map_err!(Table))?;
            for mapping in &mappings {
                table
                    .insert(mapping.table_key().as_str(), encode(mapping)?.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(instance = %instance.id, template = %template.id, node = %node_id, "instance created");
        Ok((instance, mappings))
    }

    /// Insert or update an instance.
    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put_record(INSTANCES, &instance.id, instance)
    }

    /// Get an instance by ID.
    pub fn get_instance(&self, id: &str) -> StateResult<Option<Instance>> {
        self.get_record(INSTANCES, id)
    }

    /// List all instances.
    pub fn list_instances(&self) -> StateResult<Vec<Instance>> {
        self.list_records(INSTANCES, "")
    }

    /// List the instances deployed on a node.
    pub fn list_instances_for_node(&self, node_id: &str) -> StateResult<Vec<Instance>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.node_id == node_id)
            .collect())
    }

    /// Move an instance to `to` if its current status is one of `allowed`.
    ///
    /// The check and the write share one transaction. Leaving `Running`
    /// clears the instance's health state.
    pub fn transition_instance(
        &self,
        id: &str,
        allowed: &[InstanceStatus],
        to: InstanceStatus,
    ) -> StateResult<Instance> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let instance = {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut instance: Instance =
                get_in(&table, id)?.ok_or_else(|| StateError::NotFound(id.to_string()))?;
            if !allowed.contains(&instance.status) {
                return Err(StateError::UnexpectedStatus {
                    id: id.to_string(),
                    actual: instance.status,
                });
            }
            let from = instance.status;
            instance.status = to;
            if to != InstanceStatus::Running {
                instance.healthy = None;
            }
            instance.updated_at = epoch_secs();
            table
                .insert(id, encode(&instance)?.as_slice())
                .map_err(map_err!(Write))?;
            debug!(instance = %id, %from, %to, "instance status changed");
            instance
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(instance)
    }

    /// Persist the outcome of a health check in one transaction.
    ///
    /// Writes the probed port mappings, appends the health-check log, and
    /// sets the instance's health fields. The instance health is only
    /// recorded while it is still `Running`.
    pub fn record_health_check(
        &self,
        instance_id: &str,
        healthy: bool,
        mappings: &[PortMapping],
        log: LifecycleLog,
    ) -> StateResult<(Instance, LifecycleLog)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let log = insert_log(&txn, log)?;
        let instance = {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut instance: Instance = get_in(&table, instance_id)?
                .ok_or_else(|| StateError::NotFound(instance_id.to_string()))?;
            if instance.status == InstanceStatus::Running {
                instance.healthy = Some(healthy);
                instance.last_health_check = Some(log.created_at);
                table
                    .insert(instance_id, encode(&instance)?.as_slice())
                    .map_err(map_err!(Write))?;
            }
            instance
        };
        {
            let mut table = txn.open_table(PORT_MAPPINGS).map_err(map_err!(Table))?;
            for mapping in mappings {
                table
                    .insert(mapping.table_key().as_str(), encode(mapping)?.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok((instance, log))
    }

    /// Delete an instance together with its port mappings and logs.
    /// Returns true if the instance existed.
    pub fn delete_instance(&self, id: &str) -> StateResult<bool> {
        let prefix = format!("{id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table.remove(id).map_err(map_err!(Write))?.is_some()
        };
        let mappings = remove_prefixed(&txn, PORT_MAPPINGS, &prefix)?;
        let logs = remove_prefixed(&txn, LIFECYCLE_LOGS, &prefix)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance = %id, existed, mappings, logs, "instance deleted");
        Ok(existed)
    }

    // ── Port mappings ──────────────────────────────────────────────

    /// Insert or update a port mapping.
    pub fn put_port_mapping(&self, mapping: &PortMapping) -> StateResult<()> {
        self.put_record(PORT_MAPPINGS, &mapping.table_key(), mapping)
    }

    /// List the port mappings of an instance.
    pub fn list_port_mappings(&self, instance_id: &str) -> StateResult<Vec<PortMapping>> {
        self.list_records(PORT_MAPPINGS, &format!("{instance_id}:"))
    }

    // ── Lifecycle logs ─────────────────────────────────────────────

    /// Append a log record, assigning its ID. Logs are never updated.
    pub fn append_log(&self, log: LifecycleLog) -> StateResult<LifecycleLog> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let log = insert_log(&txn, log)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(log)
    }

    /// List an instance's logs, oldest first.
    pub fn list_logs_for_instance(&self, instance_id: &str) -> StateResult<Vec<LifecycleLog>> {
        self.list_records(LIFECYCLE_LOGS, &format!("{instance_id}:"))
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Register a node or update its host, keeping its current status.
    pub fn register_node(&self, id: &str, host: &str) -> StateResult<NodeRecord> {
        let node = match self.get_node(id)? {
            Some(mut existing) => {
                existing.host = host.to_string();
                existing.updated_at = epoch_secs();
                existing
            }
            None => NodeRecord::new(id, host),
        };
        self.put_node(&node)?;
        info!(node = %id, %host, "node registered");
        Ok(node)
    }

    /// Insert or update a node.
    pub fn put_node(&self, node: &NodeRecord) -> StateResult<()> {
        self.put_record(NODES, &node.id, node)
    }

    /// Get a node by ID.
    pub fn get_node(&self, id: &str) -> StateResult<Option<NodeRecord>> {
        self.get_record(NODES, id)
    }

    /// List all nodes.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        self.list_records(NODES, "")
    }

    /// Set a node's aggregate status.
    pub fn set_node_status(&self, id: &str, status: NodeStatus) -> StateResult<NodeRecord> {
        let mut node = self
            .get_node(id)?
            .ok_or_else(|| StateError::NotFound(id.to_string()))?;
        node.status = status;
        node.updated_at = epoch_secs();
        self.put_node(&node)?;
        Ok(node)
    }

    /// Delete a node by ID. Returns true if it existed.
    ///
    /// Refused while any instance is placed on the node.
    pub fn delete_node(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let instances = {
            let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            scan::<Instance, _>(&table, "")?
                .iter()
                .filter(|(_, i)| i.node_id == id)
                .count()
        };
        if instances > 0 {
            return Err(StateError::NodeInUse {
                id: id.to_string(),
                instances,
            });
        }
        let existed = {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table.remove(id).map_err(map_err!(Write))?.is_some()
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Record helpers ─────────────────────────────────────────────

    fn put_record<T: Serialize>(&self, table: RecordTable, key: &str, value: &T) -> StateResult<()> {
        let value = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, table: RecordTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        get_in(&table, key)
    }

    fn list_records<T: DeserializeOwned>(&self, table: RecordTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        Ok(scan(&table, prefix)?.into_iter().map(|(_, v)| v).collect())
    }
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn get_in<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Collect `(key, record)` pairs whose key starts with `prefix`, in key order.
fn scan<T, R>(table: &R, prefix: &str) -> StateResult<Vec<(String, T)>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push((key.value().to_string(), decode(value.value())?));
        }
    }
    Ok(results)
}

fn remove_prefixed(txn: &WriteTransaction, table: RecordTable, prefix: &str) -> StateResult<u32> {
    let mut table = txn.open_table(table).map_err(map_err!(Table))?;
    let keys: Vec<String> = table
        .iter()
        .map_err(map_err!(Read))?
        .filter_map(|entry| {
            let (key, _) = entry.ok()?;
            let k = key.value().to_string();
            k.starts_with(prefix).then_some(k)
        })
        .collect();
    for key in &keys {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(keys.len() as u32)
}

fn next_id(txn: &WriteTransaction, counter: &str) -> StateResult<u64> {
    let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
    let current = table
        .get(counter)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(counter, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn insert_log(txn: &WriteTransaction, mut log: LifecycleLog) -> StateResult<LifecycleLog> {
    log.id = next_id(txn, LOG_COUNTER)?;
    let mut table = txn.open_table(LIFECYCLE_LOGS).map_err(map_err!(Table))?;
    table
        .insert(log.table_key().as_str(), encode(&log)?.as_slice())
        .map_err(map_err!(Write))?;
    Ok(log)
}

fn check_template_key(template: &Template) -> StateResult<()> {
    let expected = Template::key_for(&template.name, &template.version);
    if template.id != expected {
        return Err(StateError::Invalid(format!(
            "template id {} does not match {expected}",
            template.id
        )));
    }
    Ok(())
}

/// POSIX shell variable name: `[A-Za-z_][A-Za-z0-9_]*`.
fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_node() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store.register_node("node-1", "10.0.0.1").unwrap();
        store
    }

    fn test_template(name: &str, version: &str) -> Template {
        Template {
            id: Template::key_for(name, version),
            name: name.to_string(),
            version: version.to_string(),
            description: None,
            enabled: true,
            is_latest: false,
            env: BTreeMap::from([("MODE".to_string(), "production".to_string())]),
            install_steps: Vec::new(),
            uninstall_steps: Vec::new(),
            ports: vec![PortConfiguration {
                id: "http".to_string(),
                port: 8080,
                protocol: Protocol::Tcp,
                description: None,
                health_check_type: HealthCheckType::TcpConnect,
                health_check_config: serde_json::json!({}),
                health_check_interval_secs: 30,
                health_check_timeout_secs: 2,
                health_check_retries: 0,
            }],
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn latest_count(store: &StateStore, name: &str) -> usize {
        store
            .list_template_versions(name)
            .unwrap()
            .iter()
            .filter(|t| t.is_latest)
            .count()
    }

    // ── Templates ──────────────────────────────────────────────────

    #[test]
    fn first_version_of_a_name_becomes_latest() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        let second = store.create_template(&test_template("nginx", "1.1.0")).unwrap();
        let other = store.create_template(&test_template("redis", "7.0.0")).unwrap();

        assert!(first.is_latest);
        assert!(!second.is_latest);
        assert!(other.is_latest);
    }

    #[test]
    fn create_rejects_duplicates_and_bad_keys() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        assert!(matches!(
            store.create_template(&test_template("nginx", "1.0.0")),
            Err(StateError::AlreadyExists(_))
        ));

        let mut bad = test_template("nginx", "2.0.0");
        bad.id = "nginx".to_string();
        assert!(matches!(store.create_template(&bad), Err(StateError::Invalid(_))));
    }

    #[test]
    fn set_latest_keeps_exactly_one_latest_per_name() {
        let store = StateStore::open_in_memory().unwrap();
        for v in ["1.0.0", "1.1.0", "2.0.0"] {
            store.create_template(&test_template("nginx", v)).unwrap();
        }
        store.create_template(&test_template("redis", "7.0.0")).unwrap();
        assert_eq!(latest_count(&store, "nginx"), 1);

        for v in ["2.0.0", "1.1.0", "1.1.0", "1.0.0"] {
            let updated = store
                .set_latest_version(&Template::key_for("nginx", v))
                .unwrap();
            assert!(updated.is_latest);
            assert_eq!(latest_count(&store, "nginx"), 1);
            assert_eq!(
                store.latest_template("nginx").unwrap().unwrap().version,
                v
            );
        }
        // Other names are untouched.
        assert!(store.latest_template("redis").unwrap().unwrap().is_latest);
    }

    #[test]
    fn set_latest_unknown_template_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            store.set_latest_version("ghost@1.0.0"),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn referenced_template_is_immutable() {
        let store = store_with_node();
        let template = store.create_template(&test_template("nginx", "1.0.0")).unwrap();

        // Unreferenced templates can be edited.
        let mut edited = template.clone();
        edited.description = Some("edited".to_string());
        store.update_template(&edited).unwrap();

        store
            .create_instance(&edited, "node-1", &BTreeMap::new(), &HashMap::new())
            .unwrap();

        let mut again = edited.clone();
        again.env.insert("MODE".to_string(), "debug".to_string());
        assert!(matches!(
            store.update_template(&again),
            Err(StateError::Immutable(_))
        ));
        assert!(matches!(
            store.delete_template(&template.id),
            Err(StateError::Immutable(_))
        ));

        // Flags stay mutable.
        let disabled = store.set_template_enabled(&template.id, false).unwrap();
        assert!(!disabled.enabled);
    }

    // ── Instances ──────────────────────────────────────────────────

    #[test]
    fn create_instance_pins_version_and_creates_mappings() {
        let store = store_with_node();
        let template = store.create_template(&test_template("nginx", "1.0.0")).unwrap();

        let env = BTreeMap::from([("WORKERS".to_string(), "4".to_string())]);
        let ports = HashMap::from([("http".to_string(), 18080u16)]);
        let (instance, mappings) = store
            .create_instance(&template, "node-1", &env, &ports)
            .unwrap();

        assert_eq!(instance.status, InstanceStatus::Installing);
        assert_eq!(instance.template_version, "1.0.0");
        assert_eq!(instance.env.get("MODE").map(String::as_str), Some("production"));
        assert_eq!(instance.env.get("WORKERS").map(String::as_str), Some("4"));
        assert_eq!(instance.healthy, None);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].actual_port, 18080);

        assert_eq!(store.get_instance(&instance.id).unwrap(), Some(instance.clone()));
        assert_eq!(store.list_port_mappings(&instance.id).unwrap(), mappings);
    }

    #[test]
    fn instance_ids_are_unique() {
        let store = store_with_node();
        let template = store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        let (a, _) = store
            .create_instance(&template, "node-1", &BTreeMap::new(), &HashMap::new())
            .unwrap();
        let (b, _) = store
            .create_instance(&template, "node-1", &BTreeMap::new(), &HashMap::new())
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.list_instances_for_node("node-1").unwrap().len(), 2);
    }

    #[test]
    fn create_instance_rejects_unknown_port_override() {
        let store = store_with_node();
        let template = store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        let ports = HashMap::from([("grpc".to_string(), 9000u16)]);
        assert!(matches!(
            store.create_instance(&template, "node-1", &BTreeMap::new(), &ports),
            Err(StateError::Invalid(_))
        ));
    }

    #[test]
    fn transition_checks_current_status() {
        let store = store_with_node();
        let template = store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        let (instance, _) = store
            .create_instance(&template, "node-1", &BTreeMap::new(), &HashMap::new())
            .unwrap();

        let running = store
            .transition_instance(&instance.id, &[InstanceStatus::Installing], InstanceStatus::Running)
            .unwrap();
        assert_eq!(running.status, InstanceStatus::Running);

        let err = store
            .transition_instance(&instance.id, &[InstanceStatus::Stopped], InstanceStatus::Running)
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::UnexpectedStatus { actual: InstanceStatus::Running, .. }
        ));
    }

    #[test]
    fn leaving_running_clears_health() {
        let store = store_with_node();
        let template = store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        let (instance, mappings) = store
            .create_instance(&template, "node-1", &BTreeMap::new(), &HashMap::new())
            .unwrap();
        store
            .transition_instance(&instance.id, &[InstanceStatus::Installing], InstanceStatus::Running)
            .unwrap();

        let log = LifecycleLog::new(&instance.id, LifecycleAction::HealthCheck, LogStatus::Success, "ok");
        let (checked, _) = store
            .record_health_check(&instance.id, true, &mappings, log)
            .unwrap();
        assert_eq!(checked.healthy, Some(true));
        assert!(checked.last_health_check.is_some());

        let stopped = store
            .transition_instance(&instance.id, &[InstanceStatus::Running], InstanceStatus::Stopped)
            .unwrap();
        assert_eq!(stopped.healthy, None);
    }

    #[test]
    fn health_is_not_recorded_for_non_running_instances() {
        let store = store_with_node();
        let template = store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        let (instance, _) = store
            .create_instance(&template, "node-1", &BTreeMap::new(), &HashMap::new())
            .unwrap();

        let log = LifecycleLog::new(&instance.id, LifecycleAction::HealthCheck, LogStatus::Failed, "down");
        let (after, log) = store
            .record_health_check(&instance.id, false, &[], log)
            .unwrap();
        assert_eq!(after.healthy, None);
        // The audit record is still written.
        assert_eq!(store.list_logs_for_instance(&instance.id).unwrap(), vec![log]);
    }

    #[test]
    fn delete_instance_cascades() {
        let store = store_with_node();
        let template = store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        let (keep, _) = store
            .create_instance(&template, "node-1", &BTreeMap::new(), &HashMap::new())
            .unwrap();
        let (gone, _) = store
            .create_instance(&template, "node-1", &BTreeMap::new(), &HashMap::new())
            .unwrap();
        for inst in [&keep, &gone] {
            store
                .append_log(LifecycleLog::new(&inst.id, LifecycleAction::Install, LogStatus::Success, "done"))
                .unwrap();
        }

        assert!(store.delete_instance(&gone.id).unwrap());
        assert!(!store.delete_instance(&gone.id).unwrap());
        assert!(store.get_instance(&gone.id).unwrap().is_none());
        assert!(store.list_port_mappings(&gone.id).unwrap().is_empty());
        assert!(store.list_logs_for_instance(&gone.id).unwrap().is_empty());

        assert_eq!(store.list_port_mappings(&keep.id).unwrap().len(), 1);
        assert_eq!(store.list_logs_for_instance(&keep.id).unwrap().len(), 1);
    }

    #[test]
    fn create_instance_rejects_bad_env_names() {
        let store = store_with_node();
        let template = store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        for bad in ["1ST", "A-B", "X;rm -rf /", ""] {
            let env = BTreeMap::from([(bad.to_string(), "v".to_string())]);
            assert!(
                matches!(
                    store.create_instance(&template, "node-1", &env, &HashMap::new()),
                    Err(StateError::Invalid(_))
                ),
                "{bad:?}"
            );
        }
        let env = BTreeMap::from([("_PORT_2".to_string(), "v".to_string())]);
        assert!(store.create_instance(&template, "node-1", &env, &HashMap::new()).is_ok());
        assert_eq!(store.list_instances().unwrap().len(), 1);
    }

    #[test]
    fn create_instance_requires_registered_node() {
        let store = store_with_node();
        let template = store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        assert!(matches!(
            store.create_instance(&template, "ghost", &BTreeMap::new(), &HashMap::new()),
            Err(StateError::NotFound(id)) if id == "ghost"
        ));
        assert!(store.list_instances().unwrap().is_empty());
    }

    #[test]
    fn node_with_instances_cannot_be_deleted() {
        let store = store_with_node();
        let template = store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        let (instance, _) = store
            .create_instance(&template, "node-1", &BTreeMap::new(), &HashMap::new())
            .unwrap();

        assert!(matches!(
            store.delete_node("node-1"),
            Err(StateError::NodeInUse { instances: 1, .. })
        ));
        assert!(store.get_node("node-1").unwrap().is_some());

        store.delete_instance(&instance.id).unwrap();
        assert!(store.delete_node("node-1").unwrap());
        assert!(matches!(
            store.create_instance(&template, "node-1", &BTreeMap::new(), &HashMap::new()),
            Err(StateError::NotFound(_))
        ));
    }

    // ── Logs ───────────────────────────────────────────────────────

    #[test]
    fn logs_are_listed_in_append_order() {
        let store = StateStore::open_in_memory().unwrap();
        // Enough records to cross a digit boundary in the log IDs.
        for i in 0..12 {
            let log = LifecycleLog::new("inst-1", LifecycleAction::Install, LogStatus::Success, format!("step {i}"));
            store.append_log(log).unwrap();
        }
        store
            .append_log(LifecycleLog::new("inst-10", LifecycleAction::Install, LogStatus::Success, "other"))
            .unwrap();

        let logs = store.list_logs_for_instance("inst-1").unwrap();
        assert_eq!(logs.len(), 12);
        let messages: Vec<_> = logs.iter().map(|l| l.message.clone()).collect();
        let expected: Vec<_> = (0..12).map(|i| format!("step {i}")).collect();
        assert_eq!(messages, expected);
        assert!(logs.windows(2).all(|w| w[0].id < w[1].id));
    }

    // ── Nodes ──────────────────────────────────────────────────────

    #[test]
    fn register_node_keeps_status() {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.register_node("node-1", "10.0.0.1").unwrap();
        assert_eq!(node.status, NodeStatus::Maintain);

        store.set_node_status("node-1", NodeStatus::Online).unwrap();
        let node = store.register_node("node-1", "10.0.0.2").unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.host, "10.0.0.2");
        assert_eq!(store.list_nodes().unwrap().len(), 1);

        assert!(store.delete_node("node-1").unwrap());
        assert!(store.get_node("node-1").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.create_template(&test_template("nginx", "1.0.0")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let template = store.get_template("nginx@1.0.0").unwrap();
        assert!(template.is_some());
        assert!(template.unwrap().is_latest);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_templates().unwrap().is_empty());
        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_logs_for_instance("any").unwrap().is_empty());
        assert!(store.latest_template("any").unwrap().is_none());
        assert!(!store.delete_instance("nope").unwrap());
        assert!(!store.delete_template("nope").unwrap());
        assert!(!store.delete_node("nope").unwrap());
    }
}

//! Health monitor: background tasks that sweep nodes on a schedule.
//!
//! The `HealthMonitor` spawns one background task per node. Each tick it
//! probes the node's running instances whose port checks are due and
//! updates the node status in the state store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use appdeck_exec::CommandBackend;
use appdeck_state::{NodeStatus, StateStore};

use crate::error::HealthError;
use crate::sweep::{InstanceHealthReport, Sweeper};

/// Per-node monitor state.
struct MonitorSlot {
    /// Handle to the background sweep task.
    handle: JoinHandle<()>,
    /// Shutdown signal for this monitor.
    shutdown_tx: watch::Sender<bool>,
}

/// Runs on-demand checks and manages the per-node sweep loops.
pub struct HealthMonitor {
    sweeper: Sweeper,
    sweep_interval: Duration,
    /// Active monitors: node_id → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
}

impl HealthMonitor {
    pub fn new(state: StateStore, backend: Arc<dyn CommandBackend>) -> Self {
        Self {
            sweeper: Sweeper::new(state, backend),
            sweep_interval: Duration::from_secs(60),
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Set the pause between scheduled sweeps of a node.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Probe one instance now, regardless of check intervals.
    pub async fn check_instance(&self, instance_id: &str) -> Result<InstanceHealthReport, HealthError> {
        self.sweeper.check_instance(instance_id).await
    }

    /// Probe all running instances of a node now and update its status.
    pub async fn check_node(&self, node_id: &str) -> Result<NodeStatus, HealthError> {
        self.sweeper.check_node(node_id, false).await
    }

    /// Start the scheduled sweep loop for a node, replacing any existing one.
    pub async fn start_monitor(&self, node_id: &str) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let node_id_owned = node_id.to_string();
        let sweeper = self.sweeper.clone();
        let interval = self.sweep_interval;

        let handle = tokio::spawn(async move {
            run_sweep_loop(&node_id_owned, sweeper, interval, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            node_id.to_string(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%node_id, interval_secs = interval.as_secs(), "health monitor started");
    }

    /// Stop the sweep loop of a node.
    pub async fn stop_monitor(&self, node_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(node_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%node_id, "health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(node_id = %id, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    /// List node IDs with active monitors.
    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        let mut ids: Vec<String> = monitors.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Check if a node has an active monitor.
    pub async fn is_monitoring(&self, node_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(node_id)
    }
}

/// The sweep loop for a single node.
async fn run_sweep_loop(
    node_id: &str,
    sweeper: Sweeper,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%node_id, "sweep loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = sweeper.check_node(node_id, true).await {
                    warn!(%node_id, error = %e, "scheduled health sweep failed");
                }
            }
            _ = shutdown.changed() => {
                debug!(%node_id, "sweep loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use appdeck_exec::ShellBackend;
    use appdeck_state::{InstanceStatus, Template};

    use super::*;

    fn monitor(state: StateStore) -> HealthMonitor {
        HealthMonitor::new(state, Arc::new(ShellBackend::new("/bin/sh")))
            .with_sweep_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn monitor_starts_and_stops() {
        let monitor = monitor(StateStore::open_in_memory().unwrap());

        assert!(monitor.active_monitors().await.is_empty());

        monitor.start_monitor("node-1").await;
        assert!(monitor.is_monitoring("node-1").await);

        monitor.stop_monitor("node-1").await;
        assert!(!monitor.is_monitoring("node-1").await);
    }

    #[tokio::test]
    async fn monitor_stop_all() {
        let monitor = monitor(StateStore::open_in_memory().unwrap());

        monitor.start_monitor("node-1").await;
        monitor.start_monitor("node-2").await;
        assert_eq!(monitor.active_monitors().await, vec!["node-1", "node-2"]);

        monitor.stop_all().await;
        assert!(monitor.active_monitors().await.is_empty());
    }

    #[tokio::test]
    async fn monitor_replaces_existing_monitor() {
        let monitor = monitor(StateStore::open_in_memory().unwrap());

        monitor.start_monitor("node-1").await;
        monitor.start_monitor("node-1").await;

        assert_eq!(monitor.active_monitors().await.len(), 1);
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn scheduled_sweep_updates_node_status() {
        let state = StateStore::open_in_memory().unwrap();
        state.register_node("node-1", "127.0.0.1").unwrap();
        let template = Template {
            id: "cron@1.0.0".to_string(),
            name: "cron".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            enabled: true,
            is_latest: false,
            env: BTreeMap::new(),
            install_steps: Vec::new(),
            uninstall_steps: Vec::new(),
            ports: Vec::new(),
            created_at: 0,
            updated_at: 0,
        };
        state.create_template(&template).unwrap();
        let (instance, _) = state
            .create_instance(&template, "node-1", &BTreeMap::new(), &HashMap::new())
            .unwrap();
        state
            .transition_instance(&instance.id, &[InstanceStatus::Installing], InstanceStatus::Running)
            .unwrap();

        let monitor = monitor(state.clone());
        monitor.start_monitor("node-1").await;

        let mut status = NodeStatus::Maintain;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = state.get_node("node-1").unwrap().unwrap().status;
            if status == NodeStatus::Online {
                break;
            }
        }
        monitor.stop_all().await;
        assert_eq!(status, NodeStatus::Online);
    }
}

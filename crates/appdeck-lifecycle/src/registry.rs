//! In-process registry of active orchestration runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use appdeck_exec::{CancelHandle, Cancellation, cancellation};

type Runs = Arc<Mutex<HashMap<String, CancelHandle>>>;

/// Tracks which instances have a deploy or uninstall run in flight.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Runs,
}

/// Releases the instance's registry slot on drop.
#[derive(Debug)]
pub struct RunGuard {
    runs: Runs,
    instance_id: String,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run slot of an instance. Returns `None` if a run is
    /// already active.
    pub fn acquire(&self, instance_id: &str) -> Option<(RunGuard, Cancellation)> {
        let mut runs = lock(&self.runs);
        if runs.contains_key(instance_id) {
            return None;
        }
        let (handle, signal) = cancellation();
        runs.insert(instance_id.to_string(), handle);
        let guard = RunGuard {
            runs: Arc::clone(&self.runs),
            instance_id: instance_id.to_string(),
        };
        Some((guard, signal))
    }

    /// Signal cancellation to the active run. Returns false if none is active.
    pub fn cancel(&self, instance_id: &str) -> bool {
        match lock(&self.runs).get(instance_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, instance_id: &str) -> bool {
        lock(&self.runs).contains_key(instance_id)
    }

    /// IDs of instances with an active run, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.runs).keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock(&self.runs).remove(&self.instance_id);
    }
}

fn lock(runs: &Mutex<HashMap<String, CancelHandle>>) -> MutexGuard<'_, HashMap<String, CancelHandle>> {
    runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

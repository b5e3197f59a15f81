//! Instance and node health sweeps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use appdeck_exec::CommandBackend;
use appdeck_state::{
    Instance, InstanceStatus, LifecycleAction, LifecycleLog, LogStatus, NodeStatus,
    PortConfiguration, PortMapping, StateStore, Template, epoch_secs,
};

use crate::aggregate::{instance_healthy, node_status};
use crate::checker::{HealthChecker, ProbeResult};
use crate::error::HealthError;

/// Outcome of checking one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealthReport {
    pub instance: Instance,
    pub mappings: Vec<PortMapping>,
    pub log: LifecycleLog,
}

impl InstanceHealthReport {
    pub fn healthy(&self) -> bool {
        self.log.is_success()
    }
}

/// Probes instances and nodes and persists the results.
#[derive(Clone)]
pub struct Sweeper {
    state: StateStore,
    backend: Arc<dyn CommandBackend>,
}

impl Sweeper {
    pub fn new(state: StateStore, backend: Arc<dyn CommandBackend>) -> Self {
        Self { state, backend }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Probe every port mapping of an instance and record the result.
    pub async fn check_instance(&self, instance_id: &str) -> Result<InstanceHealthReport, HealthError> {
        let instance = self
            .state
            .get_instance(instance_id)?
            .ok_or_else(|| HealthError::InstanceNotFound(instance_id.to_string()))?;
        let template = self.template_of(&instance)?;
        let mappings = self.state.list_port_mappings(&instance.id)?;
        self.probe(&instance, &template, mappings, false).await
    }

    /// Probe all running instances of a node concurrently, then derive and
    /// persist the node status.
    ///
    /// With `only_due`, mappings whose check interval has not elapsed keep
    /// their previous result, and instances with nothing due are skipped.
    pub async fn check_node(&self, node_id: &str, only_due: bool) -> Result<NodeStatus, HealthError> {
        if self.state.get_node(node_id)?.is_none() {
            return Err(HealthError::NodeNotFound(node_id.to_string()));
        }

        let mut tasks = JoinSet::new();
        for instance in self.state.list_instances_for_node(node_id)? {
            if instance.status != InstanceStatus::Running {
                continue;
            }
            let sweeper = self.clone();
            tasks.spawn(async move {
                let result = sweeper.sweep_instance(&instance, only_due).await;
                (instance.id, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((instance_id, Ok(Some(report)))) => {
                    debug!(%instance_id, healthy = report.healthy(), "instance checked");
                }
                Ok((instance_id, Ok(None))) => {
                    debug!(%instance_id, "no port due for a check");
                }
                Ok((instance_id, Err(e))) => {
                    warn!(%instance_id, error = %e, "instance health check failed");
                }
                Err(e) => error!(error = %e, "health check task panicked"),
            }
        }

        let status = node_status(&self.state.list_instances_for_node(node_id)?);
        self.state.set_node_status(node_id, status)?;
        info!(%node_id, ?status, "node health aggregated");
        Ok(status)
    }

    async fn sweep_instance(
        &self,
        instance: &Instance,
        only_due: bool,
    ) -> Result<Option<InstanceHealthReport>, HealthError> {
        let template = self.template_of(instance)?;
        let mappings = self.state.list_port_mappings(&instance.id)?;
        if only_due && !mappings.is_empty() {
            let now = epoch_secs();
            let any_due = mappings
                .iter()
                .any(|m| is_due(m, template.port(&m.port_configuration_id), now));
            if !any_due {
                return Ok(None);
            }
        }
        self.probe(instance, &template, mappings, only_due)
            .await
            .map(Some)
    }

    async fn probe(
        &self,
        instance: &Instance,
        template: &Template,
        mut mappings: Vec<PortMapping>,
        only_due: bool,
    ) -> Result<InstanceHealthReport, HealthError> {
        let started = Instant::now();
        let host = self
            .state
            .get_node(&instance.node_id)?
            .ok_or_else(|| HealthError::NodeNotFound(instance.node_id.clone()))?
            .host;

        let now = epoch_secs();
        let mut lines = Vec::with_capacity(mappings.len());
        let mut attempts = 1;
        for mapping in mappings.iter_mut() {
            let config = template.port(&mapping.port_configuration_id);
            if only_due && !is_due(mapping, config, now) {
                continue;
            }
            let (result, tries) = match config {
                Some(config) => self.probe_port(&host, mapping.actual_port, config).await,
                None => {
                    warn!(
                        instance_id = %instance.id,
                        port_id = %mapping.port_configuration_id,
                        "port mapping has no configuration in template"
                    );
                    (ProbeResult::Failed, 0)
                }
            };
            attempts = attempts.max(tries);
            mapping.healthy = Some(result.is_healthy());
            mapping.last_health_check = Some(now);
            lines.push(format!(
                "{} {}:{} {:?} ({} attempt(s))",
                mapping.port_configuration_id, host, mapping.actual_port, result, tries
            ));
        }

        let healthy = instance_healthy(&mappings);
        let total = mappings.len();
        let passing = mappings.iter().filter(|m| m.healthy == Some(true)).count();
        let status = if healthy {
            LogStatus::Success
        } else {
            LogStatus::Failed
        };
        let mut log = LifecycleLog::new(
            &instance.id,
            LifecycleAction::HealthCheck,
            status,
            format!("{passing}/{total} ports healthy"),
        );
        log.output = (!lines.is_empty()).then(|| lines.join("\n"));
        log.attempts = attempts;
        log.duration_secs = started.elapsed().as_secs_f64();

        let (instance, log) =
            self.state
                .record_health_check(&instance.id, healthy, &mappings, log)?;
        Ok(InstanceHealthReport {
            instance,
            mappings,
            log,
        })
    }

    async fn probe_port(&self, host: &str, port: u16, config: &PortConfiguration) -> (ProbeResult, u32) {
        let checker = match HealthChecker::from_config(config) {
            Ok(checker) => checker,
            Err(e) => {
                warn!(port_id = %config.id, error = %e, "unusable health check config");
                return (ProbeResult::Failed, 0);
            }
        };
        let timeout = Duration::from_secs(config.health_check_timeout_secs.max(1));
        checker
            .probe_with_retries(
                self.backend.as_ref(),
                host,
                port,
                timeout,
                config.health_check_retries,
            )
            .await
    }

    fn template_of(&self, instance: &Instance) -> Result<Template, HealthError> {
        self.state
            .get_template(&instance.template_id)?
            .ok_or_else(|| HealthError::TemplateNotFound(instance.template_id.clone()))
    }
}

/// Whether a mapping's check interval has elapsed. Mappings without a
/// configuration are always due.
fn is_due(mapping: &PortMapping, config: Option<&PortConfiguration>, now: u64) -> bool {
    match (mapping.last_health_check, config) {
        (Some(last), Some(config)) => now.saturating_sub(last) >= config.health_check_interval_secs,
        _ => true,
    }
}

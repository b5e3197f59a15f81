//! Orchestrator: validates lifecycle transitions and runs step sequences.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use appdeck_exec::{Cancellation, EXIT_CANCELLED, Params, StepExecutor};
use appdeck_health::{HealthMonitor, InstanceHealthReport};
use appdeck_state::{
    ExecutionStep, Instance, InstanceStatus, LifecycleAction, LifecycleLog, NodeStatus,
    StateError, StateStore, Template, ordered_steps,
};

use crate::error::{LifecycleError, LifecycleResult};
use crate::registry::RunRegistry;

const DEPLOYABLE: &[InstanceStatus] = &[
    InstanceStatus::Failed,
    InstanceStatus::Stopped,
    InstanceStatus::Uninstalled,
];
const UNINSTALLABLE: &[InstanceStatus] = &[
    InstanceStatus::Running,
    InstanceStatus::Stopped,
    InstanceStatus::Failed,
];

/// Parameters for creating and installing a new instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionRequest {
    pub template_id: String,
    pub node_id: String,
    /// Overrides on top of the template's default environment.
    pub env: BTreeMap<String, String>,
    /// Actually bound port per port configuration ID.
    pub ports: HashMap<String, u16>,
    /// Caller-supplied step parameters.
    pub params: Params,
}

/// Outcome of a deploy or uninstall run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// The instance after its final transition.
    pub instance: Instance,
    /// One log per executed step, in execution order.
    pub logs: Vec<LifecycleLog>,
    /// The step that halted the run, if any.
    pub halted_at: Option<String>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.halted_at.is_none()
    }
}

/// Result of running one step sequence.
struct SequenceOutcome {
    logs: Vec<LifecycleLog>,
    halted_at: Option<String>,
    cancelled: bool,
}

/// Drives instances through their lifecycle.
pub struct Orchestrator {
    state: StateStore,
    executor: Arc<StepExecutor>,
    health: Arc<HealthMonitor>,
    runs: RunRegistry,
}

impl Orchestrator {
    pub fn new(state: StateStore, executor: Arc<StepExecutor>, health: Arc<HealthMonitor>) -> Self {
        Self {
            state,
            executor,
            health,
            runs: RunRegistry::new(),
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Whether a deploy or uninstall run is active for the instance.
    pub fn is_running(&self, instance_id: &str) -> bool {
        self.runs.is_active(instance_id)
    }

    /// IDs of instances with an active run.
    pub fn active_runs(&self) -> Vec<String> {
        self.runs.active()
    }

    /// Create an instance of an enabled template on a registered node and
    /// run its install steps.
    pub async fn provision(self: &Arc<Self>, request: ProvisionRequest) -> LifecycleResult<RunReport> {
        let template = self.template(&request.template_id)?;
        if !template.enabled {
            return Err(LifecycleError::TemplateDisabled(template.id));
        }
        if self.state.get_node(&request.node_id)?.is_none() {
            return Err(LifecycleError::NodeNotFound(request.node_id));
        }

        let (instance, mappings) = self
            .state
            .create_instance(&template, &request.node_id, &request.env, &request.ports)
            .map_err(|e| match e {
                StateError::Invalid(reason) => LifecycleError::Invalid(reason),
                StateError::NotFound(id) if id == request.node_id => LifecycleError::NodeNotFound(id),
                StateError::NotFound(id) => LifecycleError::TemplateNotFound(id),
                other => LifecycleError::State(other),
            })?;
        info!(
            instance_id = %instance.id,
            template_id = %template.id,
            node_id = %instance.node_id,
            ports = mappings.len(),
            "instance provisioned"
        );

        let (guard, cancel) = self
            .runs
            .acquire(&instance.id)
            .ok_or_else(|| LifecycleError::Busy(instance.id.clone()))?;
        let orch = Arc::clone(self);
        let id = instance.id.clone();
        self.detach(&id, async move {
            let _guard = guard;
            orch.run_install(instance, &template, &request.params, &cancel)
                .await
        })
        .await
    }

    /// Re-run the install steps of an instance that is failed, stopped or
    /// uninstalled.
    pub async fn deploy(self: &Arc<Self>, instance_id: &str, params: &Params) -> LifecycleResult<RunReport> {
        let (guard, cancel) = self
            .runs
            .acquire(instance_id)
            .ok_or_else(|| LifecycleError::Busy(instance_id.to_string()))?;
        let instance = self.instance(instance_id)?;
        let template = self.template(&instance.template_id)?;
        let instance = self.transition(instance_id, "deploy", DEPLOYABLE, InstanceStatus::Installing)?;
        let orch = Arc::clone(self);
        let params = params.clone();
        self.detach(instance_id, async move {
            let _guard = guard;
            orch.run_install(instance, &template, &params, &cancel).await
        })
        .await
    }

    /// Mark a stopped instance as running again. No steps are executed.
    pub fn start(&self, instance_id: &str) -> LifecycleResult<Instance> {
        self.ensure_idle(instance_id)?;
        let instance = self.transition(
            instance_id,
            "start",
            &[InstanceStatus::Stopped],
            InstanceStatus::Running,
        )?;
        info!(%instance_id, "instance started");
        Ok(instance)
    }

    /// Mark a running instance as stopped. No steps are executed.
    pub fn stop(&self, instance_id: &str) -> LifecycleResult<Instance> {
        self.ensure_idle(instance_id)?;
        let instance = self.transition(
            instance_id,
            "stop",
            &[InstanceStatus::Running],
            InstanceStatus::Stopped,
        )?;
        info!(%instance_id, "instance stopped");
        Ok(instance)
    }

    /// Run the uninstall steps of an instance.
    pub async fn uninstall(self: &Arc<Self>, instance_id: &str, params: &Params) -> LifecycleResult<RunReport> {
        let (guard, cancel) = self
            .runs
            .acquire(instance_id)
            .ok_or_else(|| LifecycleError::Busy(instance_id.to_string()))?;
        let instance = self.instance(instance_id)?;
        let template = self.template(&instance.template_id)?;
        let instance = self.transition(
            instance_id,
            "uninstall",
            UNINSTALLABLE,
            InstanceStatus::Uninstalling,
        )?;
        let orch = Arc::clone(self);
        let params = params.clone();
        self.detach(instance_id, async move {
            let _guard = guard;
            orch.run_uninstall(instance, &template, &params, &cancel).await
        })
        .await
    }

    /// Probe a running instance now.
    pub async fn check_health(&self, instance_id: &str) -> LifecycleResult<InstanceHealthReport> {
        let instance = self.instance(instance_id)?;
        if instance.status != InstanceStatus::Running {
            return Err(LifecycleError::InvalidTransition {
                id: instance.id,
                action: "check health of",
                status: instance.status,
            });
        }
        Ok(self.health.check_instance(instance_id).await?)
    }

    /// Probe all running instances of a node now and update its status.
    pub async fn check_node(&self, node_id: &str) -> LifecycleResult<NodeStatus> {
        if self.state.get_node(node_id)?.is_none() {
            return Err(LifecycleError::NodeNotFound(node_id.to_string()));
        }
        Ok(self.health.check_node(node_id).await?)
    }

    /// Signal the active run of an instance to stop.
    pub fn cancel(&self, instance_id: &str) -> LifecycleResult<()> {
        if self.runs.cancel(instance_id) {
            info!(%instance_id, "run cancellation requested");
            return Ok(());
        }
        self.instance(instance_id)?;
        Err(LifecycleError::NoActiveRun(instance_id.to_string()))
    }

    /// Delete an instance with its port mappings and logs.
    pub fn remove(&self, instance_id: &str) -> LifecycleResult<()> {
        self.ensure_idle(instance_id)?;
        let instance = self.instance(instance_id)?;
        if instance.status.is_transitional() {
            return Err(LifecycleError::InvalidTransition {
                id: instance.id,
                action: "remove",
                status: instance.status,
            });
        }
        self.state.delete_instance(instance_id)?;
        info!(%instance_id, "instance removed");
        Ok(())
    }

    /// Mark instances left mid-run by a previous process as FAILED.
    ///
    /// Call once at startup, before any run is accepted. Returns the IDs
    /// that were recovered.
    pub fn recover_interrupted(&self) -> LifecycleResult<Vec<String>> {
        let mut recovered = Vec::new();
        for instance in self.state.list_instances()? {
            if !instance.status.is_transitional() || self.runs.is_active(&instance.id) {
                continue;
            }
            let from = instance.status;
            self.state
                .transition_instance(&instance.id, &[from], InstanceStatus::Failed)?;
            warn!(instance_id = %instance.id, %from, "interrupted run marked failed");
            recovered.push(instance.id);
        }
        Ok(recovered)
    }

    /// Run a step sequence on its own task so it completes even if the
    /// caller stops waiting. The task owns the run guard.
    async fn detach<F>(&self, instance_id: &str, run: F) -> LifecycleResult<RunReport>
    where
        F: Future<Output = LifecycleResult<RunReport>> + Send + 'static,
    {
        match tokio::spawn(run).await {
            Ok(result) => result,
            Err(e) => {
                error!(%instance_id, error = %e, "run task ended abnormally");
                if let Err(e) = self.state.transition_instance(
                    instance_id,
                    &[InstanceStatus::Installing, InstanceStatus::Uninstalling],
                    InstanceStatus::Failed,
                ) {
                    warn!(%instance_id, error = %e, "could not mark aborted run failed");
                }
                Err(LifecycleError::RunAborted {
                    id: instance_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn run_uninstall(
        &self,
        instance: Instance,
        template: &Template,
        params: &Params,
        cancel: &Cancellation,
    ) -> LifecycleResult<RunReport> {
        info!(
            instance_id = %instance.id,
            steps = template.uninstall_steps.len(),
            "uninstall started"
        );
        let outcome = self
            .run_sequence(
                &instance,
                &template.uninstall_steps,
                LifecycleAction::Uninstall,
                params,
                cancel,
            )
            .await;
        let to = if outcome.halted_at.is_some() {
            InstanceStatus::Failed
        } else {
            InstanceStatus::Uninstalled
        };
        self.finish(&instance.id, InstanceStatus::Uninstalling, to, outcome)
    }

    async fn run_install(
        &self,
        instance: Instance,
        template: &Template,
        params: &Params,
        cancel: &Cancellation,
    ) -> LifecycleResult<RunReport> {
        info!(
            instance_id = %instance.id,
            steps = template.install_steps.len(),
            "install started"
        );
        let outcome = self
            .run_sequence(
                &instance,
                &template.install_steps,
                LifecycleAction::Install,
                params,
                cancel,
            )
            .await;
        let to = if outcome.halted_at.is_some() {
            InstanceStatus::Failed
        } else {
            InstanceStatus::Running
        };
        self.finish(&instance.id, InstanceStatus::Installing, to, outcome)
    }

    /// Execute steps in ascending sequence order until one halts the run.
    async fn run_sequence(
        &self,
        instance: &Instance,
        steps: &[ExecutionStep],
        action: LifecycleAction,
        params: &Params,
        cancel: &Cancellation,
    ) -> SequenceOutcome {
        let mut outcome = SequenceOutcome {
            logs: Vec::with_capacity(steps.len()),
            halted_at: None,
            cancelled: false,
        };
        for step in ordered_steps(steps) {
            let log = self
                .executor
                .execute_step(instance, step, params, action, cancel)
                .await;
            let failed = !log.is_success();
            let cancelled = failed && log.exit_code == Some(EXIT_CANCELLED);
            outcome.logs.push(log);

            if cancelled || (failed && step.stop_on_error) {
                warn!(
                    instance_id = %instance.id,
                    step_id = %step.id,
                    cancelled,
                    "run halted"
                );
                outcome.halted_at = Some(step.id.clone());
                outcome.cancelled = cancelled;
                break;
            }
            if failed {
                debug!(instance_id = %instance.id, step_id = %step.id, "step failed, continuing");
            }
        }
        outcome
    }

    fn finish(
        &self,
        instance_id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
        outcome: SequenceOutcome,
    ) -> LifecycleResult<RunReport> {
        let instance = self.state.transition_instance(instance_id, &[from], to)?;
        info!(
            %instance_id,
            status = %instance.status,
            steps_run = outcome.logs.len(),
            halted_at = ?outcome.halted_at,
            "run finished"
        );
        Ok(RunReport {
            instance,
            logs: outcome.logs,
            halted_at: outcome.halted_at,
            cancelled: outcome.cancelled,
        })
    }

    fn transition(
        &self,
        instance_id: &str,
        action: &'static str,
        allowed: &[InstanceStatus],
        to: InstanceStatus,
    ) -> LifecycleResult<Instance> {
        self.state
            .transition_instance(instance_id, allowed, to)
            .map_err(|e| match e {
                StateError::NotFound(id) => LifecycleError::InstanceNotFound(id),
                StateError::UnexpectedStatus { id, actual } => LifecycleError::InvalidTransition {
                    id,
                    action,
                    status: actual,
                },
                other => LifecycleError::State(other),
            })
    }

    fn ensure_idle(&self, instance_id: &str) -> LifecycleResult<()> {
        if self.runs.is_active(instance_id) {
            return Err(LifecycleError::Busy(instance_id.to_string()));
        }
        Ok(())
    }

    fn instance(&self, instance_id: &str) -> LifecycleResult<Instance> {
        self.state
            .get_instance(instance_id)?
            .ok_or_else(|| LifecycleError::InstanceNotFound(instance_id.to_string()))
    }

    fn template(&self, template_id: &str) -> LifecycleResult<Template> {
        self.state
            .get_template(template_id)?
            .ok_or_else(|| LifecycleError::TemplateNotFound(template_id.to_string()))
    }
}

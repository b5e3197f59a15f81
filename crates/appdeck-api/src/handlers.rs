//! REST API handlers for templates and nodes, plus the shared response
//! format and error mapping.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use appdeck_core::TemplateManifest;
use appdeck_health::HealthError;
use appdeck_lifecycle::LifecycleError;
use appdeck_state::{StateError, Template, epoch_secs};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

/// A response with the given status, outcome flag and payload.
pub(crate) fn respond<T: Serialize>(
    status: StatusCode,
    success: bool,
    message: impl Into<String>,
    data: T,
) -> Response {
    (
        status,
        Json(ApiResponse {
            success,
            message: message.into(),
            data: Some(data),
        }),
    )
        .into_response()
}

pub(crate) fn ok<T: Serialize>(message: impl Into<String>, data: T) -> Response {
    respond(StatusCode::OK, true, message, data)
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            message: msg.to_string(),
            data: None,
        }),
    )
        .into_response()
}

fn state_status(e: &StateError) -> StatusCode {
    match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::AlreadyExists(_)
        | StateError::Immutable(_)
        | StateError::NodeInUse { .. }
        | StateError::UnexpectedStatus { .. } => StatusCode::CONFLICT,
        StateError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn health_status(e: &HealthError) -> StatusCode {
    match e {
        HealthError::InstanceNotFound(_)
        | HealthError::NodeNotFound(_)
        | HealthError::TemplateNotFound(_) => StatusCode::NOT_FOUND,
        HealthError::InvalidConfig { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        HealthError::State(e) => state_status(e),
    }
}

fn lifecycle_status(e: &LifecycleError) -> StatusCode {
    match e {
        LifecycleError::InstanceNotFound(_)
        | LifecycleError::TemplateNotFound(_)
        | LifecycleError::NodeNotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::InvalidTransition { .. }
        | LifecycleError::Busy(_)
        | LifecycleError::NoActiveRun(_)
        | LifecycleError::TemplateDisabled(_) => StatusCode::CONFLICT,
        LifecycleError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LifecycleError::RunAborted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        LifecycleError::State(e) => state_status(e),
        LifecycleError::Health(e) => health_status(e),
    }
}

pub(crate) fn state_error(e: &StateError) -> Response {
    let status = state_status(e);
    if status.is_server_error() {
        warn!(error = %e, "state store request failed");
    }
    error_response(&e.to_string(), status)
}

pub(crate) fn lifecycle_error(e: &LifecycleError) -> Response {
    let status = lifecycle_status(e);
    if status.is_server_error() {
        warn!(error = %e, "lifecycle request failed");
    }
    error_response(&e.to_string(), status)
}

// ── Templates ──────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TemplateQuery {
    pub name: Option<String>,
}

/// GET /api/v1/templates
pub async fn list_templates(
    State(state): State<ApiState>,
    Query(query): Query<TemplateQuery>,
) -> impl IntoResponse {
    let result = match &query.name {
        Some(name) => state.store.list_template_versions(name),
        None => state.store.list_templates(),
    };
    match result {
        Ok(templates) => ok(format!("{} template(s)", templates.len()), templates),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/templates/{id}
pub async fn get_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_template(&id) {
        Ok(Some(template)) => ok("template found", template),
        Ok(None) => error_response("template not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/templates
///
/// The body is a template manifest in JSON form.
pub async fn create_template(
    State(state): State<ApiState>,
    Json(manifest): Json<TemplateManifest>,
) -> impl IntoResponse {
    if let Err(e) = manifest.validate() {
        return error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY);
    }
    let template = match Template::from_manifest(manifest, epoch_secs()) {
        Ok(t) => t,
        Err(e) => return error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY),
    };
    match state.store.create_template(&template) {
        Ok(created) => {
            info!(template_id = %created.id, "template imported");
            respond(StatusCode::CREATED, true, "template created", created)
        }
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/templates/{id}/latest
pub async fn set_latest_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.set_latest_version(&id) {
        Ok(template) => ok(
            format!("{} is now the latest version of {}", template.version, template.name),
            template,
        ),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/templates/{id}/enable
pub async fn enable_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.set_template_enabled(&id, true) {
        Ok(template) => ok("template enabled", template),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/templates/{id}/disable
pub async fn disable_template(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.set_template_enabled(&id, false) {
        Ok(template) => ok("template disabled", template),
        Err(e) => state_error(&e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// Node registration body.
#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub host: String,
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_nodes() {
        Ok(nodes) => ok(format!("{} node(s)", nodes.len()), nodes),
        Err(e) => state_error(&e),
    }
}

/// PUT /api/v1/nodes/{id}
pub async fn register_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<RegisterNodeRequest>,
) -> impl IntoResponse {
    if req.host.trim().is_empty() {
        return error_response("host must not be empty", StatusCode::UNPROCESSABLE_ENTITY);
    }
    match state.store.register_node(&id, req.host.trim()) {
        Ok(node) => {
            let health = state.orchestrator.health();
            if state.monitor_new_nodes && !health.is_monitoring(&id).await {
                health.start_monitor(&id).await;
            }
            ok("node registered", node)
        }
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/nodes/{id}
///
/// Only nodes without instances can be removed.
pub async fn delete_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_node(&id) {
        Ok(true) => {
            state.orchestrator.health().stop_monitor(&id).await;
            ok("node deleted", id)
        }
        Ok(false) => error_response("node not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/nodes/{id}/check
pub async fn check_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.check_node(&id).await {
        Ok(status) => ok(format!("node {id} checked"), status),
        Err(e) => lifecycle_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use appdeck_exec::{ShellBackend, StepExecutor};
    use appdeck_health::HealthMonitor;
    use appdeck_lifecycle::Orchestrator;
    use appdeck_state::{NodeStatus, StateStore};

    use super::*;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let backend = Arc::new(ShellBackend::new("/bin/sh"));
        let executor = Arc::new(StepExecutor::new(backend.clone(), store.clone()));
        let health = Arc::new(HealthMonitor::new(store.clone(), backend));
        ApiState::new(Arc::new(Orchestrator::new(store, executor, health)))
    }

    fn manifest(version: &str) -> TemplateManifest {
        TemplateManifest::from_toml_str(&format!(
            r#"
[template]
name = "nginx"
version = "{version}"

[[install]]
id = "install"
name = "Install"
sequence = 1
kind = "command"
content = "true"
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn list_templates_empty() {
        let state = test_state();
        let resp = list_templates(State(state), Query(TemplateQuery::default()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_get_template() {
        let state = test_state();
        let resp = create_template(State(state.clone()), Json(manifest("1.0.0")))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = get_template(State(state), Path("nginx@1.0.0".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_template_conflicts() {
        let state = test_state();
        create_template(State(state.clone()), Json(manifest("1.0.0"))).await;
        let resp = create_template(State(state), Json(manifest("1.0.0")))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn invalid_version_is_unprocessable() {
        let state = test_state();
        let mut m = manifest("1.0.0");
        m.template.version = "one".to_string();
        let resp = create_template(State(state), Json(m)).await.into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn latest_moves_between_versions() {
        let state = test_state();
        create_template(State(state.clone()), Json(manifest("1.0.0"))).await;
        create_template(State(state.clone()), Json(manifest("1.1.0"))).await;

        let resp = set_latest_template(State(state.clone()), Path("nginx@1.1.0".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let latest = state.store.latest_template("nginx").unwrap().unwrap();
        assert_eq!(latest.version, "1.1.0");

        let resp = set_latest_template(State(state), Path("nginx@9.9.9".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn enable_and_disable_template() {
        let state = test_state();
        create_template(State(state.clone()), Json(manifest("1.0.0"))).await;

        disable_template(State(state.clone()), Path("nginx@1.0.0".to_string())).await;
        assert!(!state.store.get_template("nginx@1.0.0").unwrap().unwrap().enabled);

        enable_template(State(state.clone()), Path("nginx@1.0.0".to_string())).await;
        assert!(state.store.get_template("nginx@1.0.0").unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn register_and_check_node() {
        let state = test_state();
        let resp = register_node(
            State(state.clone()),
            Path("node-1".to_string()),
            Json(RegisterNodeRequest {
                host: "127.0.0.1".to_string(),
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!state.orchestrator.health().is_monitoring("node-1").await);

        let resp = check_node(State(state.clone()), Path("node-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            state.store.get_node("node-1").unwrap().unwrap().status,
            NodeStatus::Maintain
        );

        let resp = check_node(State(state), Path("ghost".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn registering_starts_monitor_when_enabled() {
        let state = test_state().with_node_monitoring(true);
        register_node(
            State(state.clone()),
            Path("node-1".to_string()),
            Json(RegisterNodeRequest {
                host: "10.0.0.1".to_string(),
            }),
        )
        .await;
        assert!(state.orchestrator.health().is_monitoring("node-1").await);

        let resp = delete_node(State(state.clone()), Path("node-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!state.orchestrator.health().is_monitoring("node-1").await);
    }

    #[tokio::test]
    async fn empty_host_is_rejected() {
        let state = test_state();
        let resp = register_node(
            State(state),
            Path("node-1".to_string()),
            Json(RegisterNodeRequest {
                host: "  ".to_string(),
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn lifecycle_errors_map_to_statuses() {
        assert_eq!(
            lifecycle_status(&LifecycleError::Busy("i".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            lifecycle_status(&LifecycleError::InstanceNotFound("i".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            lifecycle_status(&LifecycleError::Invalid("bad".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            lifecycle_status(&LifecycleError::State(StateError::Write("disk".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            lifecycle_status(&LifecycleError::State(StateError::Immutable("t".into()))),
            StatusCode::CONFLICT
        );
    }
}

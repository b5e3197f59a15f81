//! REST API handlers for instances.
//!
//! Deploy and uninstall block until the run finishes. The HTTP status
//! reports whether the request was accepted; `success` in the body reports
//! whether every step went through.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use appdeck_exec::Params;
use appdeck_lifecycle::{ProvisionRequest, RunReport};

use crate::ApiState;
use crate::handlers::{error_response, lifecycle_error, ok, respond, state_error};

#[derive(Debug, Default, Deserialize)]
pub struct InstanceQuery {
    pub node: Option<String>,
}

/// Optional body of deploy and uninstall requests.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub params: Params,
}

/// Parse an optional JSON body; an empty body means defaults.
fn parse_run_request(body: &Bytes) -> Result<RunRequest, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RunRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        error_response(
            &format!("invalid request body: {e}"),
            StatusCode::UNPROCESSABLE_ENTITY,
        )
    })
}

fn report_response(status: StatusCode, verb: &str, report: RunReport) -> Response {
    let message = match (&report.halted_at, report.cancelled) {
        (None, _) => format!("{verb} of {} completed", report.instance.id),
        (Some(step), true) => format!("{verb} of {} cancelled at step {step}", report.instance.id),
        (Some(step), false) => format!("{verb} of {} failed at step {step}", report.instance.id),
    };
    respond(status, report.succeeded(), message, report)
}

/// GET /api/v1/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Query(query): Query<InstanceQuery>,
) -> impl IntoResponse {
    let result = match &query.node {
        Some(node) => state.store.list_instances_for_node(node),
        None => state.store.list_instances(),
    };
    match result {
        Ok(instances) => ok(format!("{} instance(s)", instances.len()), instances),
        Err(e) => state_error(&e),
    }
}

/// POST /api/v1/instances
pub async fn provision_instance(
    State(state): State<ApiState>,
    Json(req): Json<ProvisionRequest>,
) -> impl IntoResponse {
    match state.orchestrator.provision(req).await {
        Ok(report) => report_response(StatusCode::CREATED, "install", report),
        Err(e) => lifecycle_error(&e),
    }
}

/// GET /api/v1/instances/{id}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_instance(&id) {
        Ok(Some(instance)) => ok("instance found", instance),
        Ok(None) => error_response("instance not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

/// DELETE /api/v1/instances/{id}
pub async fn remove_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.remove(&id) {
        Ok(()) => ok("instance removed", id),
        Err(e) => lifecycle_error(&e),
    }
}

/// POST /api/v1/instances/{id}/deploy
pub async fn deploy_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let req = match parse_run_request(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    match state.orchestrator.deploy(&id, &req.params).await {
        Ok(report) => report_response(StatusCode::OK, "install", report),
        Err(e) => lifecycle_error(&e),
    }
}

/// POST /api/v1/instances/{id}/uninstall
pub async fn uninstall_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let req = match parse_run_request(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    match state.orchestrator.uninstall(&id, &req.params).await {
        Ok(report) => report_response(StatusCode::OK, "uninstall", report),
        Err(e) => lifecycle_error(&e),
    }
}

/// POST /api/v1/instances/{id}/start
pub async fn start_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.start(&id) {
        Ok(instance) => ok("instance started", instance),
        Err(e) => lifecycle_error(&e),
    }
}

/// POST /api/v1/instances/{id}/stop
pub async fn stop_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.stop(&id) {
        Ok(instance) => ok("instance stopped", instance),
        Err(e) => lifecycle_error(&e),
    }
}

/// POST /api/v1/instances/{id}/check-health
pub async fn check_instance_health(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.check_health(&id).await {
        Ok(report) => {
            let message = report.log.message.clone();
            respond(StatusCode::OK, report.healthy(), message, report)
        }
        Err(e) => lifecycle_error(&e),
    }
}

/// POST /api/v1/instances/{id}/cancel
pub async fn cancel_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.cancel(&id) {
        Ok(()) => ok("cancellation requested", id),
        Err(e) => lifecycle_error(&e),
    }
}

/// GET /api/v1/runs
pub async fn list_runs(State(state): State<ApiState>) -> impl IntoResponse {
    let runs = state.orchestrator.active_runs();
    ok(format!("{} active run(s)", runs.len()), runs)
}

/// GET /api/v1/instances/{id}/logs
pub async fn list_logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_instance(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("instance not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error(&e),
    }
    match state.store.list_logs_for_instance(&id) {
        Ok(logs) => ok(format!("{} log(s)", logs.len()), logs),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/instances/{id}/ports
pub async fn list_ports(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_instance(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("instance not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error(&e),
    }
    match state.store.list_port_mappings(&id) {
        Ok(mappings) => ok(format!("{} port mapping(s)", mappings.len()), mappings),
        Err(e) => state_error(&e),
    }
}

//! appdeck-api: REST API for appdeck.
//!
//! Provides axum route handlers for managing templates, instances and
//! nodes. Every response body has the shape
//! `{"success": bool, "message": string, "data": ...}`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/templates` | List templates (`?name=` filters one name) |
//! | POST | `/api/v1/templates` | Import a template manifest |
//! | GET | `/api/v1/templates/{id}` | Get a template |
//! | POST | `/api/v1/templates/{id}/latest` | Mark a version as latest |
//! | POST | `/api/v1/templates/{id}/enable` | Enable a template |
//! | POST | `/api/v1/templates/{id}/disable` | Disable a template |
//! | GET | `/api/v1/instances` | List instances (`?node=` filters one node) |
//! | POST | `/api/v1/instances` | Provision and install an instance |
//! | GET | `/api/v1/instances/{id}` | Get an instance |
//! | DELETE | `/api/v1/instances/{id}` | Remove an instance with its logs |
//! | POST | `/api/v1/instances/{id}/deploy` | Re-run install steps |
//! | POST | `/api/v1/instances/{id}/start` | Mark a stopped instance running |
//! | POST | `/api/v1/instances/{id}/stop` | Mark a running instance stopped |
//! | POST | `/api/v1/instances/{id}/uninstall` | Run uninstall steps |
//! | POST | `/api/v1/instances/{id}/check-health` | Probe an instance now |
//! | POST | `/api/v1/instances/{id}/cancel` | Cancel the active run |
//! | GET | `/api/v1/instances/{id}/logs` | Lifecycle logs, oldest first |
//! | GET | `/api/v1/instances/{id}/ports` | Port mappings |
//! | GET | `/api/v1/runs` | Instances with a deploy or uninstall in flight |
//! | GET | `/api/v1/nodes` | List nodes |
//! | PUT | `/api/v1/nodes/{id}` | Register or update a node |
//! | DELETE | `/api/v1/nodes/{id}` | Unregister an empty node |
//! | POST | `/api/v1/nodes/{id}/check` | Probe a node now |

pub mod handlers;
pub mod instance_handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};

use appdeck_lifecycle::Orchestrator;
use appdeck_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub orchestrator: Arc<Orchestrator>,
    /// Start a health monitor for nodes registered through the API.
    pub monitor_new_nodes: bool,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store: orchestrator.state().clone(),
            orchestrator,
            monitor_new_nodes: false,
        }
    }

    pub fn with_node_monitoring(mut self, enabled: bool) -> Self {
        self.monitor_new_nodes = enabled;
        self
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/templates",
            get(handlers::list_templates).post(handlers::create_template),
        )
        .route("/templates/{id}", get(handlers::get_template))
        .route("/templates/{id}/latest", post(handlers::set_latest_template))
        .route("/templates/{id}/enable", post(handlers::enable_template))
        .route("/templates/{id}/disable", post(handlers::disable_template))
        .route(
            "/instances",
            get(instance_handlers::list_instances).post(instance_handlers::provision_instance),
        )
        .route(
            "/instances/{id}",
            get(instance_handlers::get_instance).delete(instance_handlers::remove_instance),
        )
        .route("/instances/{id}/deploy", post(instance_handlers::deploy_instance))
        .route("/instances/{id}/start", post(instance_handlers::start_instance))
        .route("/instances/{id}/stop", post(instance_handlers::stop_instance))
        .route(
            "/instances/{id}/uninstall",
            post(instance_handlers::uninstall_instance),
        )
        .route(
            "/instances/{id}/check-health",
            post(instance_handlers::check_instance_health),
        )
        .route("/instances/{id}/cancel", post(instance_handlers::cancel_instance))
        .route("/instances/{id}/logs", get(instance_handlers::list_logs))
        .route("/instances/{id}/ports", get(instance_handlers::list_ports))
        .route("/runs", get(instance_handlers::list_runs))
        .route("/nodes", get(handlers::list_nodes))
        .route(
            "/nodes/{id}",
            put(handlers::register_node).delete(handlers::delete_node),
        )
        .route("/nodes/{id}/check", post(handlers::check_node))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

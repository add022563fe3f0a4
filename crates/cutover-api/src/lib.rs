//! cutover-api: REST API for the cutover deployer.
//!
//! Provides axum route handlers for deployment admission, formation reads
//! and writes, scheduler job-event ingestion and the live deployment event
//! stream (server-sent events).
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/deployments` | Admit a deployment |
//! | GET | `/api/v1/deployments/{id}` | Get deployment details |
//! | GET | `/api/v1/deployments/{id}/events` | Stream deployment events (SSE) |
//! | GET | `/api/v1/apps/{app}/releases/{release}/formation` | Get a formation |
//! | PUT | `/api/v1/apps/{app}/releases/{release}/formation` | Overwrite a formation |
//! | POST | `/api/v1/apps/{app}/job-events` | Report a scheduler job event |

pub mod handlers;
pub mod stream;

use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};

use cutover_rollout::JobEventBus;
use cutover_state::{DeploymentRepo, EventLog, StateStore};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub repo: DeploymentRepo,
    pub log: EventLog,
    pub bus: JobEventBus,
    /// Keep-alive interval for event streams.
    pub keepalive: Duration,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/deployments", post(handlers::create_deployment))
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route("/deployments/{id}/events", get(stream::stream_deployment_events))
        .route(
            "/apps/{app}/releases/{release}/formation",
            get(handlers::get_formation).put(handlers::put_formation),
        )
        .route("/apps/{app}/job-events", post(handlers::report_job_event))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

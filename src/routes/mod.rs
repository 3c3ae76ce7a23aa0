use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod health;
pub mod jobs;
pub mod metrics;

/// Job and health routes. Middleware and `/metrics` are added by the binary.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs/reprocess", post(jobs::trigger_reprocess))
        .route("/api/v1/jobs/stop", post(jobs::stop_job))
        .route("/api/v1/tenants/{db_name}/job", get(jobs::get_job_status))
        .route("/api/v1/tenants/{db_name}/job/logs", get(jobs::get_job_logs))
        .with_state(state)
}

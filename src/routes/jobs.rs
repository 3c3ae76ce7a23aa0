use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::error::AppError;
use crate::models::job::LogEntry;
use crate::models::reprocess::{
    JobStatusResponse, ReprocessRequest, ReprocessResponse, StopRequest, StopResponse,
};
use crate::services::cancellation::StopOutcome;

/// POST /api/v1/jobs/reprocess — start reprocessing a tenant's catalog.
///
/// Answers as soon as the job is recorded as `running`; the outcome is only
/// observable by polling status or logs.
pub async fn trigger_reprocess(
    State(state): State<AppState>,
    payload: Result<Json<ReprocessRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ReprocessResponse>), AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let response = state.dispatcher.trigger(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// POST /api/v1/jobs/stop — ask a tenant's running worker to exit.
pub async fn stop_job(
    State(state): State<AppState>,
    payload: Result<Json<StopRequest>, JsonRejection>,
) -> Result<Json<StopResponse>, AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let db_name = request
        .into_tenant()
        .map_err(|report| AppError::Validation(report.to_string()))?;

    let outcome = state.tokens.stop(&db_name).await?;
    tracing::info!(db_name = %db_name, outcome = ?outcome, "Stop requested");

    Ok(Json(StopResponse {
        stopped: outcome == StopOutcome::Acknowledged,
        message: outcome.message().to_string(),
    }))
}

/// GET /api/v1/tenants/{db_name}/job/logs — every log entry recorded for the tenant.
pub async fn get_job_logs(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
) -> Result<Json<Vec<LogEntry>>, AppError> {
    Ok(Json(state.jobs.get_logs(&db_name).await?))
}

/// GET /api/v1/tenants/{db_name}/job — lifecycle state and progress fields.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let status = match state.jobs.get_status(&db_name).await? {
        Some(record) => JobStatusResponse::from(record),
        None => JobStatusResponse::idle(&db_name),
    };
    Ok(Json(status))
}

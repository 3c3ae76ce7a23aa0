use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::models::job::{JobState, ProgressData};
use crate::models::reprocess::{JobScope, ReprocessRequest, ReprocessResponse};
use crate::services::cancellation::{CancellationTokens, TokenError};
use crate::services::job_store::{JobStore, StoreError};
use crate::services::tenants::{TenantDirectory, TenantError};
use crate::services::worker::{JobPayload, Worker, WorkerContext, WorkerError, WorkerOutcome};

const STALE_JOB_MESSAGE: &str = "orchestrator restarted before the job finished";

type ActiveRuns = Arc<Mutex<HashMap<Uuid, String>>>;

/// Starts reprocessing jobs and supervises them to completion.
///
/// Each trigger writes `running`, then hands the worker to a task owned by
/// this dispatcher's tracker, so the job outlives the request that started
/// it. The supervising task writes the final outcome exactly once.
pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    tenants: Arc<dyn TenantDirectory>,
    tokens: Arc<CancellationTokens>,
    worker: Arc<dyn Worker>,
    tracker: TaskTracker,
    active: ActiveRuns,
    allow_overlapping: bool,
}

impl JobDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        tenants: Arc<dyn TenantDirectory>,
        tokens: Arc<CancellationTokens>,
        worker: Arc<dyn Worker>,
    ) -> Self {
        Self {
            store,
            tenants,
            tokens,
            worker,
            tracker: TaskTracker::new(),
            active: Arc::default(),
            allow_overlapping: false,
        }
    }

    /// Permit a second job for a tenant while one is still supervised. Their
    /// state and log writes then interleave, and whichever finishes first
    /// removes the shared cancellation token.
    pub fn allow_overlapping(mut self, allow: bool) -> Self {
        self.allow_overlapping = allow;
        self
    }

    /// Validate, record `running`, dispatch, and return without waiting.
    pub async fn trigger(
        &self,
        request: ReprocessRequest,
    ) -> Result<ReprocessResponse, TriggerError> {
        let (db_name, scope) = request
            .into_job()
            .map_err(|report| TriggerError::Validation(report.to_string()))?;

        if !self.tenants.exists(&db_name).await? {
            return Err(TriggerError::TenantNotFound(db_name));
        }

        let run_id = Uuid::new_v4();
        let slot = self.reserve(&db_name, run_id)?;

        let log_start = self.store.log_count(&db_name).await?;

        // The token exists before the acknowledgement is returned.
        let token_path = self.tokens.arm(&db_name).await?;
        if let Err(e) = self
            .store
            .set_state(&db_name, JobState::Running, run_started(run_id, log_start, &scope))
            .await
        {
            if let Err(token_err) = self.tokens.stop(&db_name).await {
                tracing::warn!(db_name = %db_name, error = %token_err, "Failed to remove cancellation token");
            }
            return Err(e.into());
        }

        metrics::counter!("reprocess_jobs_triggered_total").increment(1);
        tracing::info!(
            db_name = %db_name,
            run_id = %run_id,
            categories = scope.categories.len(),
            "Reprocess job dispatched"
        );

        let debug = scope.debug_summary();
        self.spawn_supervisor(
            JobPayload {
                db_name,
                run_id,
                scope,
            },
            token_path,
            slot,
        );

        Ok(ReprocessResponse {
            state: JobState::Running,
            run_id,
            debug,
        })
    }

    /// Tenants with a job currently supervised by this process.
    pub fn active_jobs(&self) -> Vec<String> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tenants: Vec<String> = active.values().cloned().collect();
        tenants.sort();
        tenants.dedup();
        tenants
    }

    pub fn is_active(&self, db_name: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.values().any(|tenant| tenant == db_name)
    }

    /// Mark records left `running` by a previous process as failed.
    ///
    /// No supervisor survives a restart, so those jobs would otherwise stay
    /// `running` forever. Jobs that ended at a stop checkpoint keep their
    /// state. Leftover tokens are removed as well.
    pub async fn recover_stale_jobs(&self) -> Result<Vec<String>, StoreError> {
        let mut recovered = Vec::new();
        for db_name in self.store.list_by_state(JobState::Running).await? {
            if self.is_active(&db_name) {
                continue;
            }
            let record = self.store.get_status(&db_name).await?;
            let stopped = record
                .as_ref()
                .and_then(|r| r.progress_data.get("stopped"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if stopped {
                continue;
            }
            self.store
                .set_state(&db_name, JobState::Error, run_failed(STALE_JOB_MESSAGE))
                .await?;
            if let Err(e) = self.tokens.stop(&db_name).await {
                tracing::warn!(db_name = %db_name, error = %e, "Failed to clear stale token");
            }
            tracing::warn!(db_name = %db_name, "Recovered stale running job");
            recovered.push(db_name);
        }
        Ok(recovered)
    }

    /// Wait for supervised jobs to finish. Triggers are not rejected here;
    /// callers stop serving requests first.
    ///
    /// Returns `false` if jobs were still running when `grace` elapsed.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    active = ?self.active_jobs(),
                    grace_secs = grace.as_secs(),
                    "Jobs still running at shutdown"
                );
                false
            }
        }
    }

    fn reserve(&self, db_name: &str, run_id: Uuid) -> Result<ActiveSlot, TriggerError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.allow_overlapping && active.values().any(|tenant| tenant == db_name) {
            metrics::counter!("reprocess_jobs_rejected_total").increment(1);
            return Err(TriggerError::AlreadyRunning(db_name.to_string()));
        }
        active.insert(run_id, db_name.to_string());
        metrics::gauge!("reprocess_jobs_active").set(active.len() as f64);

        Ok(ActiveSlot {
            active: self.active.clone(),
            run_id,
        })
    }

    fn spawn_supervisor(&self, job: JobPayload, token_path: PathBuf, slot: ActiveSlot) {
        let span = tracing::info_span!(
            "reprocess_job",
            db_name = %job.db_name,
            run_id = %job.run_id
        );
        let store = self.store.clone();
        let tokens = self.tokens.clone();
        let worker = self.worker.clone();

        self.tracker.spawn(
            async move {
                let started = Instant::now();
                let db_name = job.db_name.clone();

                let result = run_worker(store.clone(), worker, job, token_path).await;

                // The token goes first so that a client seeing the final state
                // and asking to stop is told the job already finished.
                if let Err(e) = tokens.stop(&db_name).await {
                    tracing::warn!(error = %e, "Failed to remove cancellation token");
                }
                record_outcome(store.as_ref(), &db_name, result, started.elapsed()).await;
                drop(slot);
            }
            .instrument(span),
        );
    }
}

/// Registry entry for a supervised run, released on drop.
struct ActiveSlot {
    active: ActiveRuns,
    run_id: Uuid,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.remove(&self.run_id);
        metrics::gauge!("reprocess_jobs_active").set(active.len() as f64);
    }
}

async fn run_worker(
    store: Arc<dyn JobStore>,
    worker: Arc<dyn Worker>,
    job: JobPayload,
    token_path: PathBuf,
) -> Result<WorkerOutcome, WorkerError> {
    let ctx = WorkerContext::new(job.db_name.clone(), job.run_id, store, token_path);

    // A separate task so a panicking worker surfaces as a JoinError here.
    let handle = tokio::spawn(async move { worker.run(job, ctx).await }.in_current_span());
    match handle.await {
        Ok(Err(WorkerError::Cancelled)) => Ok(WorkerOutcome::Stopped),
        Ok(result) => result,
        Err(e) => Err(WorkerError::Panicked(e.to_string())),
    }
}

async fn record_outcome(
    store: &dyn JobStore,
    db_name: &str,
    result: Result<WorkerOutcome, WorkerError>,
    elapsed: Duration,
) {
    metrics::histogram!("reprocess_job_duration_seconds").record(elapsed.as_secs_f64());

    let write = match result {
        Ok(WorkerOutcome::Completed) => {
            metrics::counter!("reprocess_jobs_completed_total").increment(1);
            tracing::info!(duration_ms = elapsed.as_millis() as u64, "Reprocess job completed");
            store
                .set_state(db_name, JobState::Done, progress(json!({ "finishedAt": Utc::now() })))
                .await
        }
        Ok(WorkerOutcome::Stopped) => {
            metrics::counter!("reprocess_jobs_stopped_total").increment(1);
            tracing::info!(duration_ms = elapsed.as_millis() as u64, "Reprocess job stopped early");
            store
                .merge_progress(
                    db_name,
                    progress(json!({ "stopped": true, "stoppedAt": Utc::now() })),
                )
                .await
        }
        Err(e) => {
            metrics::counter!("reprocess_jobs_failed_total").increment(1);
            tracing::error!(error = %e, duration_ms = elapsed.as_millis() as u64, "Reprocess job failed");
            store
                .set_state(db_name, JobState::Error, run_failed(&e.to_string()))
                .await
        }
    };

    if let Err(e) = write {
        tracing::error!(error = %e, "Failed to record job outcome");
    }
}

/// Progress merged on the `running` transition. Clears the previous run's
/// outcome fields; logs of earlier runs are kept and start at `logStart`.
fn run_started(run_id: Uuid, log_start: usize, scope: &JobScope) -> ProgressData {
    progress(json!({
        "runId": run_id,
        "startedAt": Utc::now(),
        "logStart": log_start,
        "scope": scope,
        "finishedAt": Value::Null,
        "error": Value::Null,
        "stopped": false,
        "stoppedAt": Value::Null,
    }))
}

fn run_failed(message: &str) -> ProgressData {
    progress(json!({ "error": message, "finishedAt": Utc::now() }))
}

fn progress(value: Value) -> ProgressData {
    match value {
        Value::Object(map) => map,
        _ => ProgressData::new(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("missing required data: {0}")]
    Validation(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("a job is already running for {0}")]
    AlreadyRunning(String),

    #[error(transparent)]
    Tenant(#[from] TenantError),

    #[error("Failed to create cancellation token: {0}")]
    Token(#[from] TokenError),

    #[error("Failed to record job start: {0}")]
    Storage(#[from] StoreError),
}

//! Shared harness for orchestration and HTTP tests

#![allow(dead_code)]

use async_trait::async_trait;
use catalog_reprocess::{
    app_state::AppState,
    models::job::{JobRecord, ProgressData},
    models::reprocess::ReprocessRequest,
    services::{
        cancellation::CancellationTokens,
        dispatcher::JobDispatcher,
        job_store::{JobStore, MemoryJobStore},
        tenants::StaticTenantDirectory,
        worker::{JobPayload, Worker, WorkerContext, WorkerError, WorkerOutcome},
    },
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::time::sleep;

pub const TENANTS: [&str; 3] = ["shop-a", "shop-b", "shop-c"];

/// How a [`GatedWorker`] ends once released.
#[derive(Clone, Copy)]
pub enum Finish {
    Succeed,
    Fail,
    Panic,
}

/// Releases gated workers one at a time.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn release(&self) {
        self.0.add_permits(1);
    }
}

/// Logs one entry, then waits for the test to release it.
pub struct GatedWorker {
    gate: Gate,
    finish: Finish,
}

impl GatedWorker {
    pub fn new(finish: Finish) -> (Self, Gate) {
        let gate = Gate(Arc::new(Semaphore::new(0)));
        (
            Self {
                gate: gate.clone(),
                finish,
            },
            gate,
        )
    }
}

#[async_trait]
impl Worker for GatedWorker {
    async fn run(&self, job: JobPayload, ctx: WorkerContext) -> Result<WorkerOutcome, WorkerError> {
        ctx.log(json!({ "message": "started", "runId": job.run_id }))
            .await?;
        self.gate
            .0
            .acquire()
            .await
            .map_err(|_| WorkerError::Failed("gate closed".into()))?
            .forget();
        match self.finish {
            Finish::Succeed => Ok(WorkerOutcome::Completed),
            Finish::Fail => Err(WorkerError::Failed("enrichment service unavailable".into())),
            Finish::Panic => panic!("worker crashed"),
        }
    }
}

/// Processes batches until its token disappears.
pub struct CooperativeWorker {
    pub batch_delay: Duration,
}

#[async_trait]
impl Worker for CooperativeWorker {
    async fn run(&self, _job: JobPayload, ctx: WorkerContext) -> Result<WorkerOutcome, WorkerError> {
        for batch in 0..10_000u32 {
            ctx.checkpoint().await?;
            ctx.log(json!({ "batch": batch })).await?;
            let mut progress = ProgressData::new();
            progress.insert("processed".into(), (batch + 1).into());
            ctx.report_progress(progress).await?;
            sleep(self.batch_delay).await;
        }
        Ok(WorkerOutcome::Completed)
    }
}

pub struct Harness {
    _dir: TempDir,
    pub store: Arc<MemoryJobStore>,
    pub state: AppState,
}

impl Harness {
    pub fn new(worker: impl Worker) -> Self {
        Self::with_overlap(worker, false)
    }

    pub fn with_overlap(worker: impl Worker, allow_overlapping: bool) -> Self {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let store = Arc::new(MemoryJobStore::new());
        let tokens = Arc::new(CancellationTokens::new(dir.path()));
        let dispatcher = JobDispatcher::new(
            store.clone(),
            Arc::new(StaticTenantDirectory::new(TENANTS)),
            tokens.clone(),
            Arc::new(worker),
        )
        .allow_overlapping(allow_overlapping);

        let state = AppState::new(None, store.clone(), tokens, dispatcher);
        Self {
            _dir: dir,
            store,
            state,
        }
    }

    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.state.dispatcher
    }

    pub fn tokens(&self) -> &CancellationTokens {
        &self.state.tokens
    }

    pub async fn record(&self, db_name: &str) -> JobRecord {
        self.store
            .get_status(db_name)
            .await
            .expect("store read should succeed")
            .expect("record should exist")
    }

    /// Block until no job for `db_name` is supervised any more.
    pub async fn wait_idle(&self, db_name: &str) {
        let dispatcher = self.dispatcher();
        wait_until(move || async move { !dispatcher.is_active(db_name) }).await;
    }
}

pub fn request(db_name: &str, categories: &[&str]) -> ReprocessRequest {
    serde_json::from_value(json!({ "dbName": db_name, "categories": categories }))
        .expect("request should deserialize")
}

/// Poll `condition` every 10ms for up to 5 seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5 seconds");
}

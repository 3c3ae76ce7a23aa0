use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{
    cancellation::CancellationTokens, dispatcher::JobDispatcher, job_store::JobStore,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Present when job state is kept in PostgreSQL.
    pub db: Option<PgPool>,
    pub jobs: Arc<dyn JobStore>,
    pub tokens: Arc<CancellationTokens>,
    pub dispatcher: Arc<JobDispatcher>,
}

impl AppState {
    pub fn new(
        db: Option<PgPool>,
        jobs: Arc<dyn JobStore>,
        tokens: Arc<CancellationTokens>,
        dispatcher: JobDispatcher,
    ) -> Self {
        Self {
            db,
            jobs,
            tokens,
            dispatcher: Arc::new(dispatcher),
        }
    }
}

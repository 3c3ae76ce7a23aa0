use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use crate::models::job::{JobState, LogEntry, ProgressData};
use crate::models::reprocess::JobScope;
use crate::services::cancellation::{marker_present, TokenError};
use crate::services::job_store::{JobStore, StoreError};

pub const ENV_TENANT: &str = "CATALOG_JOB_TENANT";
pub const ENV_RUN_ID: &str = "CATALOG_JOB_RUN_ID";
pub const ENV_CANCEL_TOKEN: &str = "CATALOG_JOB_CANCEL_TOKEN";

/// What a worker is asked to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub db_name: String,
    pub run_id: Uuid,
    pub scope: JobScope,
}

/// How a worker run ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    /// Exited early after seeing its cancellation token gone.
    Stopped,
}

/// The opaque catalog transformation.
///
/// Implementations report through `ctx` and are expected to call
/// [`WorkerContext::checkpoint`] between batches.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn run(&self, job: JobPayload, ctx: WorkerContext) -> Result<WorkerOutcome, WorkerError>;
}

/// A worker's callbacks into the job store and its cancellation token.
#[derive(Clone)]
pub struct WorkerContext {
    db_name: String,
    run_id: Uuid,
    store: Arc<dyn JobStore>,
    token_path: PathBuf,
}

impl WorkerContext {
    pub fn new(
        db_name: impl Into<String>,
        run_id: Uuid,
        store: Arc<dyn JobStore>,
        token_path: PathBuf,
    ) -> Self {
        Self {
            db_name: db_name.into(),
            run_id,
            store,
            token_path,
        }
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    pub async fn log(&self, entry: impl Into<LogEntry> + Send) -> Result<(), StoreError> {
        self.store.append_logs(&self.db_name, vec![entry.into()]).await
    }

    pub async fn append_logs(&self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        self.store.append_logs(&self.db_name, entries).await
    }

    /// Merge progress fields while keeping the job `running`.
    pub async fn report_progress(&self, progress: ProgressData) -> Result<(), StoreError> {
        self.store
            .set_state(&self.db_name, JobState::Running, progress)
            .await
    }

    pub async fn is_cancelled(&self) -> bool {
        !marker_present(&self.token_path).await
    }

    /// `Err(WorkerError::Cancelled)` once a stop was requested.
    pub async fn checkpoint(&self) -> Result<(), WorkerError> {
        if self.is_cancelled().await {
            return Err(WorkerError::Cancelled);
        }
        Ok(())
    }
}

/// Runs the transformation as a child process.
///
/// The payload is written to stdin as JSON. Every stdout line becomes one log
/// entry: JSON objects as they are, anything else as `{"message": line}`.
/// The child learns its token path from `CATALOG_JOB_CANCEL_TOKEN` and must
/// exit 0 when it stops early. It is killed if its supervisor is dropped.
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
}

impl CommandWorker {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn run(&self, job: JobPayload, ctx: WorkerContext) -> Result<WorkerOutcome, WorkerError> {
        let payload = serde_json::to_vec(&job)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(ENV_TENANT, &job.db_name)
            .env(ENV_RUN_ID, job.run_id.to_string())
            .env(ENV_CANCEL_TOKEN, ctx.token_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        tracing::debug!(pid = child.id(), program = %self.program, "Worker process started");

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                // Child exited or closed stdin without reading the payload.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    tracing::debug!("Worker closed stdin before reading payload");
                }
                Err(e) => return Err(WorkerError::Io(e)),
            }
        }

        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf).await? == 0 {
                    break;
                }
                // Worker output is opaque; bytes that are not UTF-8 are kept lossily.
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = ctx.log(parse_log_line(line)).await {
                    tracing::warn!(error = %e, "Failed to record worker log line");
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(WorkerError::Exit(status));
        }

        if ctx.is_cancelled().await {
            Ok(WorkerOutcome::Stopped)
        } else {
            Ok(WorkerOutcome::Completed)
        }
    }
}

fn parse_log_line(line: &str) -> LogEntry {
    match serde_json::from_str::<Value>(line) {
        Ok(value @ Value::Object(_)) => LogEntry(value),
        _ => LogEntry::message(line),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Stopped at checkpoint")]
    Cancelled,

    #[error("Failed to launch worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Worker I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker exited with {0}")]
    Exit(ExitStatus),

    #[error("Worker failed: {0}")]
    Failed(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("Payload serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Token(#[from] TokenError),
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::services::cancellation::CancellationTokens;
    use crate::services::job_store::MemoryJobStore;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        tokens: CancellationTokens,
        store: Arc<MemoryJobStore>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let tokens = CancellationTokens::new(dir.path());
            Self {
                _dir: dir,
                tokens,
                store: Arc::new(MemoryJobStore::new()),
            }
        }

        async fn run(&self, script: &str) -> Result<WorkerOutcome, WorkerError> {
            let token_path = self.tokens.arm("shop-a").await.unwrap();
            let ctx = WorkerContext::new("shop-a", Uuid::new_v4(), self.store.clone(), token_path);
            let job = JobPayload {
                db_name: "shop-a".into(),
                run_id: ctx.run_id(),
                scope: JobScope {
                    categories: vec!["x".into()],
                    ..Default::default()
                },
            };
            CommandWorker::new("sh", vec!["-c".into(), script.into()])
                .run(job, ctx)
                .await
        }

        async fn logs(&self) -> Vec<LogEntry> {
            self.store.get_logs("shop-a").await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_stdout_lines_become_logs() {
        let harness = Harness::new();
        let outcome = harness
            .run(r#"echo '{"message":"batch 1","count":10}'; echo; echo plain text"#)
            .await
            .unwrap();

        assert_eq!(outcome, WorkerOutcome::Completed);
        let logs = harness.logs().await;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].0["count"], 10);
        assert_eq!(logs[1], LogEntry::message("plain text"));
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_logged_lossily() {
        let harness = Harness::new();
        let outcome = harness
            .run(r#"printf 'caf\351\n'; echo after"#)
            .await
            .unwrap();

        assert_eq!(outcome, WorkerOutcome::Completed);
        let logs = harness.logs().await;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0], LogEntry::message("caf\u{FFFD}"));
        assert_eq!(logs[1], LogEntry::message("after"));
    }

    #[tokio::test]
    async fn test_payload_and_env_reach_child() {
        let harness = Harness::new();
        harness
            .run(r#"cat; echo; echo "$CATALOG_JOB_TENANT""#)
            .await
            .unwrap();

        let logs = harness.logs().await;
        assert_eq!(logs[0].0["dbName"], "shop-a");
        assert_eq!(logs[0].0["scope"]["categories"][0], "x");
        assert_eq!(logs[1], LogEntry::message("shop-a"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let harness = Harness::new();
        let err = harness.run("exit 3").await.unwrap_err();
        assert!(matches!(err, WorkerError::Exit(status) if status.code() == Some(3)));
    }

    #[tokio::test]
    async fn test_clean_exit_after_stop_is_reported_as_stopped() {
        let harness = Harness::new();
        let outcome = harness
            .run(r#"rm "$CATALOG_JOB_CANCEL_TOKEN"; echo stopping"#)
            .await
            .unwrap();
        assert_eq!(outcome, WorkerOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let harness = Harness::new();
        let token_path = harness.tokens.arm("shop-a").await.unwrap();
        let ctx = WorkerContext::new("shop-a", Uuid::new_v4(), harness.store.clone(), token_path);
        let job = JobPayload {
            db_name: "shop-a".into(),
            run_id: ctx.run_id(),
            scope: JobScope::default(),
        };

        let err = CommandWorker::new("/nonexistent/catalog-worker", Vec::new())
            .run(job, ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_checkpoint_reports_cancellation() {
        let harness = Harness::new();
        let token_path = harness.tokens.arm("shop-a").await.unwrap();
        let ctx = WorkerContext::new("shop-a", Uuid::new_v4(), harness.store.clone(), token_path);

        assert!(ctx.checkpoint().await.is_ok());
        harness.tokens.stop("shop-a").await.unwrap();
        assert!(matches!(ctx.checkpoint().await, Err(WorkerError::Cancelled)));
    }

    #[test]
    fn test_non_object_json_is_wrapped() {
        assert_eq!(parse_log_line("42"), LogEntry::message("42"));
        assert_eq!(parse_log_line("[1,2]"), LogEntry::message("[1,2]"));
    }
}

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Without it job state lives in memory only.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Comma-separated tenant keys accepted when running without a database
    #[serde(default)]
    pub known_tenants: Vec<String>,

    /// Directory holding per-tenant cancellation tokens
    #[serde(default = "default_cancel_dir")]
    pub cancel_dir: PathBuf,

    /// Executable launched for each reprocessing job
    pub worker_program: String,

    /// Comma-separated arguments passed to the worker executable
    #[serde(default)]
    pub worker_args: Vec<String>,

    /// Accept a trigger while the same tenant already has a job running
    #[serde(default)]
    pub allow_overlapping_jobs: bool,

    /// Mark jobs left `running` by a previous process as failed at startup
    #[serde(default = "default_true")]
    pub recover_stale_jobs: bool,

    /// Seconds to wait for running jobs on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_cancel_dir() -> PathBuf {
    std::env::temp_dir().join("catalog-reprocess")
}

fn default_true() -> bool {
    true
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}

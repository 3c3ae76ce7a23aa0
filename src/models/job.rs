use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form progress fields merged into a job record.
pub type ProgressData = Map<String, Value>;

/// Lifecycle phase of a tenant's reprocessing job.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

/// Opaque log value produced by a worker. The store imposes no shape and
/// no timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogEntry(pub Value);

impl LogEntry {
    /// Entry of the form `{"message": ...}`.
    pub fn message(text: impl Into<String>) -> Self {
        Self(serde_json::json!({ "message": text.into() }))
    }
}

impl From<Value> for LogEntry {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Persisted state and log document for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub db_name: String,
    pub state: JobState,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub progress_data: ProgressData,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl JobRecord {
    /// Empty record used when a tenant is first written by a non-state update.
    pub fn idle(db_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            db_name: db_name.to_string(),
            state: JobState::Idle,
            updated_at: now,
            progress_data: ProgressData::new(),
            logs: Vec::new(),
        }
    }
}

/// Folds `incoming` into `target`, last write wins per top-level field.
pub fn merge_progress(target: &mut ProgressData, incoming: ProgressData) {
    target.extend(incoming);
}

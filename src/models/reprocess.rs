use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::job::{JobRecord, JobState, ProgressData};

/// Request to reprocess a tenant's catalog.
///
/// Scope fields are not interpreted here; they travel to the worker as-is,
/// together with any unrecognised fields.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessRequest {
    #[garde(required, length(min = 1, max = 128), custom(non_blank))]
    pub db_name: Option<String>,

    #[garde(required)]
    pub categories: Option<Vec<String>>,

    #[garde(skip)]
    pub types: Option<Vec<String>>,

    #[garde(skip)]
    pub soft_categories: Option<Vec<String>>,

    #[garde(length(min = 1, max = 200))]
    pub target_category: Option<String>,

    #[garde(skip)]
    pub only_missing: Option<bool>,

    #[serde(flatten)]
    #[garde(skip)]
    pub extra: Map<String, Value>,
}

/// Request to stop a tenant's running job.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    #[garde(required, length(min = 1, max = 128), custom(non_blank))]
    pub db_name: Option<String>,
}

fn non_blank(value: &Option<String>, _ctx: &()) -> garde::Result {
    match value {
        Some(v) if v.trim().is_empty() => Err(garde::Error::new("must not be blank")),
        _ => Ok(()),
    }
}

/// Transformation scope handed to the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobScope {
    pub categories: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub soft_categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_category: Option<String>,
    #[serde(default)]
    pub only_missing: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Counts of the optional scope lists a client supplied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDebug {
    pub categories: usize,
    pub types: usize,
    pub soft_categories: usize,
    pub has_target_category: bool,
    pub only_missing: bool,
}

impl ReprocessRequest {
    /// Splits a validated request into tenant key and scope.
    pub fn into_job(self) -> Result<(String, JobScope), garde::Report> {
        self.validate()?;
        // Both fields are checked by `required` above.
        let db_name = self.db_name.unwrap_or_default();
        let scope = JobScope {
            categories: self.categories.unwrap_or_default(),
            types: self.types.unwrap_or_default(),
            soft_categories: self.soft_categories.unwrap_or_default(),
            target_category: self.target_category,
            only_missing: self.only_missing.unwrap_or(false),
            extra: self.extra,
        };
        Ok((db_name, scope))
    }
}

impl StopRequest {
    pub fn into_tenant(self) -> Result<String, garde::Report> {
        self.validate()?;
        Ok(self.db_name.unwrap_or_default())
    }
}

impl JobScope {
    pub fn debug_summary(&self) -> ValidationDebug {
        ValidationDebug {
            categories: self.categories.len(),
            types: self.types.len(),
            soft_categories: self.soft_categories.len(),
            has_target_category: self.target_category.is_some(),
            only_missing: self.only_missing,
        }
    }
}

/// Acknowledgement returned as soon as a job has been dispatched.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessResponse {
    pub state: JobState,
    pub run_id: Uuid,
    pub debug: ValidationDebug,
}

/// Acknowledgement of a stop request.
#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
    pub message: String,
}

/// Status projection of a job record, without the log body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub db_name: String,
    pub state: JobState,
    pub updated_at: Option<DateTime<Utc>>,
    pub progress_data: ProgressData,
    pub log_count: usize,
}

impl JobStatusResponse {
    /// Projection for a tenant without a record: idle, nothing logged.
    pub fn idle(db_name: &str) -> Self {
        Self {
            db_name: db_name.to_string(),
            state: JobState::Idle,
            updated_at: None,
            progress_data: ProgressData::new(),
            log_count: 0,
        }
    }
}

impl From<JobRecord> for JobStatusResponse {
    fn from(record: JobRecord) -> Self {
        Self {
            log_count: record.logs.len(),
            db_name: record.db_name,
            state: record.state,
            updated_at: Some(record.updated_at),
            progress_data: record.progress_data,
        }
    }
}

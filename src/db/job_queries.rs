use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::models::job::{JobRecord, JobState, LogEntry, ProgressData};

/// Upsert the tenant's record with a new state, merging progress fields.
pub async fn upsert_state(
    pool: &PgPool,
    db_name: &str,
    state: JobState,
    progress: &ProgressData,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO job_records (db_name, state, updated_at, progress)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (db_name) DO UPDATE
        SET state = EXCLUDED.state,
            updated_at = EXCLUDED.updated_at,
            progress = job_records.progress || EXCLUDED.progress
        "#,
    )
    .bind(db_name)
    .bind(state.to_string())
    .bind(now)
    .bind(Json(progress))
    .execute(pool)
    .await?;

    Ok(())
}

/// Merge progress fields without touching state or updated_at
pub async fn merge_progress(
    pool: &PgPool,
    db_name: &str,
    progress: &ProgressData,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO job_records (db_name, updated_at, progress)
        VALUES ($1, $2, $3)
        ON CONFLICT (db_name) DO UPDATE
        SET progress = job_records.progress || EXCLUDED.progress
        "#,
    )
    .bind(db_name)
    .bind(now)
    .bind(Json(progress))
    .execute(pool)
    .await?;

    Ok(())
}

/// Append log entries in order. A single statement, so the batch lands atomically.
pub async fn append_logs(
    pool: &PgPool,
    db_name: &str,
    entries: &[LogEntry],
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO job_records (db_name, updated_at, logs)
        VALUES ($1, $2, $3)
        ON CONFLICT (db_name) DO UPDATE
        SET logs = job_records.logs || EXCLUDED.logs
        "#,
    )
    .bind(db_name)
    .bind(now)
    .bind(Json(entries))
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a tenant's record
pub async fn get_record(pool: &PgPool, db_name: &str) -> Result<Option<JobRecord>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT db_name, state, updated_at, progress, logs
        FROM job_records
        WHERE db_name = $1
        "#,
    )
    .bind(db_name)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(r) => {
            let state_str: String = r.try_get("state")?;
            let state =
                JobState::from_str(&state_str).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
            let Json(progress_data): Json<ProgressData> = r.try_get("progress")?;
            let Json(logs): Json<Vec<LogEntry>> = r.try_get("logs")?;

            Some(JobRecord {
                db_name: r.try_get("db_name")?,
                state,
                updated_at: r.try_get("updated_at")?,
                progress_data,
                logs,
            })
        }
        None => None,
    })
}

/// Number of log entries without loading them
pub async fn log_count(pool: &PgPool, db_name: &str) -> Result<usize, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT jsonb_array_length(logs) AS log_count
        FROM job_records
        WHERE db_name = $1
        "#,
    )
    .bind(db_name)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(r) => {
            let count: i32 = r.try_get("log_count")?;
            usize::try_from(count).unwrap_or_default()
        }
        None => 0,
    })
}

/// Tenants whose record is currently in `state`
pub async fn list_by_state(pool: &PgPool, state: JobState) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT db_name
        FROM job_records
        WHERE state = $1
        ORDER BY db_name ASC
        "#,
    )
    .bind(state.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(|r| r.try_get("db_name")).collect()
}

//! Materialization job records - the per-video single-writer claim

use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres};

use crate::models::{JobStatus, MaterializationJob};

#[derive(sqlx::FromRow)]
struct JobRow {
    video_id: String,
    requested_by: String,
    status: String,
    attempts: i32,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for MaterializationJob {
    type Error = sqlx::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;

        Ok(Self {
            video_id: row.video_id,
            requested_by: row.requested_by,
            status,
            attempts: row.attempts,
            error: row.error,
            updated_at: row.updated_at,
        })
    }
}

pub async fn get_job<'e, E>(
    executor: E,
    video_id: &str,
) -> Result<Option<MaterializationJob>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<JobRow> = sqlx::query_as(
        r#"
        SELECT video_id, requested_by, status, attempts, error, updated_at
        FROM materialization_jobs
        WHERE video_id = $1
        "#,
    )
    .bind(video_id)
    .fetch_optional(executor)
    .await?;

    row.map(MaterializationJob::try_from).transpose()
}

/// Create (or recycle) a pending job for `video_id`.
///
/// An existing job is only taken over when it has finished or its lease has
/// gone stale; recycling bumps `attempts` so the previous holder's fence no
/// longer matches. Returns the fence value if this call owns the pending job.
pub async fn enqueue_job<'e, E>(
    executor: E,
    video_id: &str,
    requested_by: &str,
    lease_seconds: i64,
) -> Result<Option<i32>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        INSERT INTO materialization_jobs (video_id, requested_by, status, attempts, error, updated_at)
        VALUES ($1, $2, 'pending', 0, NULL, NOW())
        ON CONFLICT (video_id)
        DO UPDATE SET
            requested_by = EXCLUDED.requested_by,
            status = 'pending',
            attempts = materialization_jobs.attempts + 1,
            error = NULL,
            updated_at = NOW()
        WHERE materialization_jobs.status IN ('done', 'failed')
           OR materialization_jobs.updated_at < NOW() - ($3::text || ' seconds')::interval
        RETURNING attempts
        "#,
    )
    .bind(video_id)
    .bind(requested_by)
    .bind(lease_seconds)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|(attempts,)| attempts))
}

/// Move a pending (or stale running) job to running. Returns the claim's
/// fence value if claimed.
pub async fn claim_job<'e, E>(
    executor: E,
    video_id: &str,
    lease_seconds: i64,
) -> Result<Option<i32>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        UPDATE materialization_jobs
        SET status = 'running',
            attempts = attempts + 1,
            updated_at = NOW()
        WHERE video_id = $1
          AND (
              status = 'pending'
              OR (
                  status = 'running'
                  AND updated_at < NOW() - ($2::text || ' seconds')::interval
              )
          )
        RETURNING attempts
        "#,
    )
    .bind(video_id)
    .bind(lease_seconds)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|(attempts,)| attempts))
}

/// Renew a running lease. False once another run has taken the job over.
pub async fn touch_job<'e, E>(
    executor: E,
    video_id: &str,
    attempt: i32,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE materialization_jobs
        SET updated_at = NOW()
        WHERE video_id = $1 AND status = 'running' AND attempts = $2
        "#,
    )
    .bind(video_id)
    .bind(attempt)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Close out an active job. Only the holder of `attempt` can finish it.
pub async fn finish_job<'e, E>(
    executor: E,
    video_id: &str,
    attempt: i32,
    status: JobStatus,
    error: Option<&str>,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE materialization_jobs
        SET status = $2, error = $3, updated_at = NOW()
        WHERE video_id = $1
          AND attempts = $4
          AND status IN ('pending', 'running')
        "#,
    )
    .bind(video_id)
    .bind(status.as_str())
    .bind(error)
    .bind(attempt)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

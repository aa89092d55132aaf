//! Video cache domain - materialized export metadata

use sqlx::types::Json;
use sqlx::{Executor, Postgres};
use std::collections::BTreeMap;

use crate::models::{ExportFormat, VideoCacheEntry};

#[derive(sqlx::FromRow)]
struct VideoCacheRow {
    video_id: String,
    download_links: Json<BTreeMap<ExportFormat, String>>,
    artifact_keys: Json<BTreeMap<ExportFormat, String>>,
    total_comments: i64,
    expiry_time: i64,
}

impl From<VideoCacheRow> for VideoCacheEntry {
    fn from(row: VideoCacheRow) -> Self {
        Self {
            video_id: row.video_id,
            download_links: row.download_links.0,
            artifact_keys: row.artifact_keys.0,
            total_comments: row.total_comments,
            expiry_time: row.expiry_time,
        }
    }
}

pub async fn get_video<'e, E>(
    executor: E,
    video_id: &str,
) -> Result<Option<VideoCacheEntry>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<VideoCacheRow> = sqlx::query_as(
        r#"
        SELECT video_id, download_links, artifact_keys, total_comments, expiry_time
        FROM video_cache
        WHERE video_id = $1
        "#,
    )
    .bind(video_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(VideoCacheEntry::from))
}

/// Upsert `entry`, fenced on the running job claim: the write only lands if
/// `attempt` still holds the video's job. Re-materializing an expired video
/// replaces its entry.
pub async fn put_video<'e, E>(
    executor: E,
    entry: &VideoCacheEntry,
    attempt: i32,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        INSERT INTO video_cache (video_id, download_links, artifact_keys, total_comments, expiry_time)
        SELECT $1, $2, $3, $4, $5
        WHERE EXISTS (
            SELECT 1 FROM materialization_jobs
            WHERE video_id = $1 AND status = 'running' AND attempts = $6
        )
        ON CONFLICT (video_id)
        DO UPDATE SET
            download_links = EXCLUDED.download_links,
            artifact_keys = EXCLUDED.artifact_keys,
            total_comments = EXCLUDED.total_comments,
            expiry_time = EXCLUDED.expiry_time,
            created_at = NOW()
        RETURNING video_id
        "#,
    )
    .bind(&entry.video_id)
    .bind(Json(&entry.download_links))
    .bind(Json(&entry.artifact_keys))
    .bind(entry.total_comments)
    .bind(entry.expiry_time)
    .bind(attempt)
    .fetch_optional(executor)
    .await?;

    Ok(row.is_some())
}

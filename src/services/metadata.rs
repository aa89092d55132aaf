//! Metadata store: video cache entries, user credits and job claims.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::domain::{jobs, users, videos};
use crate::models::{JobStatus, MaterializationJob, UserAccount, VideoCacheEntry};
use crate::services::error::AppError;

/// Record-level operations the pipeline needs. Every mutation is atomic
/// per record; none of them are read-modify-write from the caller's side.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_video(&self, video_id: &str) -> Result<Option<VideoCacheEntry>, AppError>;

    /// Write `entry` if `attempt` still holds the video's running job.
    /// Returns false when the claim has been taken over.
    async fn put_video(&self, entry: &VideoCacheEntry, attempt: i32) -> Result<bool, AppError>;

    async fn get_user(&self, email: &str) -> Result<Option<UserAccount>, AppError>;

    /// Store `user` unless its email is taken. Returns the stored account and
    /// whether it was created by this call.
    async fn register_user(&self, user: UserAccount) -> Result<(UserAccount, bool), AppError>;

    /// Take one credit, floored at zero. None if the user does not exist.
    async fn decrement_credits(&self, email: &str) -> Result<Option<i64>, AppError>;

    async fn get_job(&self, video_id: &str) -> Result<Option<MaterializationJob>, AppError>;

    /// Some(attempt) if the caller now owns a fresh pending job for `video_id`.
    async fn enqueue_job(
        &self,
        video_id: &str,
        requested_by: &str,
        lease_seconds: i64,
    ) -> Result<Option<i32>, AppError>;

    /// Some(attempt) if the caller won the running lease for `video_id`.
    /// The attempt fences every later write made under this claim.
    async fn claim_job(
        &self,
        video_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<i32>, AppError>;

    /// Renew the running lease. False once the claim has been taken over.
    async fn touch_job(&self, video_id: &str, attempt: i32) -> Result<bool, AppError>;

    /// Mark an active job finished. False if `attempt` no longer holds it.
    async fn finish_job(
        &self,
        video_id: &str,
        attempt: i32,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError>;
}

#[derive(Clone)]
pub struct PgMetadataStore {
    db: PgPool,
}

impl PgMetadataStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn get_video(&self, video_id: &str) -> Result<Option<VideoCacheEntry>, AppError> {
        Ok(videos::get_video(&self.db, video_id).await?)
    }

    async fn put_video(&self, entry: &VideoCacheEntry, attempt: i32) -> Result<bool, AppError> {
        Ok(videos::put_video(&self.db, entry, attempt).await?)
    }

    async fn get_user(&self, email: &str) -> Result<Option<UserAccount>, AppError> {
        Ok(users::get_user_by_email(&self.db, email).await?)
    }

    async fn register_user(&self, user: UserAccount) -> Result<(UserAccount, bool), AppError> {
        if let Some(created) = users::insert_user_if_absent(&self.db, &user).await? {
            return Ok((created, true));
        }

        let existing = users::get_user_by_email(&self.db, &user.email)
            .await?
            .ok_or_else(|| AppError::Storage(format!("user {} vanished after insert", user.email)))?;
        Ok((existing, false))
    }

    async fn decrement_credits(&self, email: &str) -> Result<Option<i64>, AppError> {
        Ok(users::decrement_credits(&self.db, email).await?)
    }

    async fn get_job(&self, video_id: &str) -> Result<Option<MaterializationJob>, AppError> {
        Ok(jobs::get_job(&self.db, video_id).await?)
    }

    async fn enqueue_job(
        &self,
        video_id: &str,
        requested_by: &str,
        lease_seconds: i64,
    ) -> Result<Option<i32>, AppError> {
        Ok(jobs::enqueue_job(&self.db, video_id, requested_by, lease_seconds).await?)
    }

    async fn claim_job(
        &self,
        video_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<i32>, AppError> {
        Ok(jobs::claim_job(&self.db, video_id, lease_seconds).await?)
    }

    async fn touch_job(&self, video_id: &str, attempt: i32) -> Result<bool, AppError> {
        Ok(jobs::touch_job(&self.db, video_id, attempt).await?)
    }

    async fn finish_job(
        &self,
        video_id: &str,
        attempt: i32,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        Ok(jobs::finish_job(&self.db, video_id, attempt, status, error).await?)
    }
}

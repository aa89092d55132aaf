//! Materialization pipeline: fetch → encode → upload → persist → debit.
//!
//! One run per dispatched job. A run only does work after winning the
//! per-video claim, so concurrent cache misses for the same video fetch and
//! bill once. The claim's lease is renewed on every fetched page and between
//! stages, and the cache entry write is fenced on the claim: a run whose
//! lease was taken over cannot persist, bill or finish the job. The cache
//! entry is written before the debit: a retry after a crash between the two
//! sees a cache hit and does not bill again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::comments;
use crate::constants::{CACHED_LINK_TTL_SECS, EXPORT_PREFIX, FRESH_LINK_TTL_SECS};
use crate::export;
use crate::models::{ExportFormat, JobStatus, VideoCacheEntry};
use crate::services::error::AppError;
use crate::services::metadata::MetadataStore;
use crate::services::youtube::{CommentPage, CommentSource};
use crate::storage::{ArtifactHandle, ArtifactStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CheckingCache,
    Fetching,
    Encoding,
    Uploading,
    PersistingMetadata,
    DebitingCredit,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::CheckingCache => "checking_cache",
            Stage::Fetching => "fetching",
            Stage::Encoding => "encoding",
            Stage::Uploading => "uploading",
            Stage::PersistingMetadata => "persisting_metadata",
            Stage::DebitingCredit => "debiting_credit",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// An unexpired entry already existed; nothing fetched, nothing billed
    Cached(VideoCacheEntry),
    /// Freshly materialized. `credits` is None when no account was billed.
    Materialized {
        entry: VideoCacheEntry,
        credits: Option<i64>,
    },
    /// Another run holds the claim for this video
    Busy,
}

fn lease_lost(video_id: &str) -> AppError {
    AppError::Storage(format!("job lease for {} taken over by another run", video_id))
}

async fn renew_lease(
    metadata: &dyn MetadataStore,
    video_id: &str,
    attempt: i32,
) -> Result<(), AppError> {
    if metadata.touch_job(video_id, attempt).await? {
        Ok(())
    } else {
        Err(lease_lost(video_id))
    }
}

/// Comment source that renews the job lease before every page request.
struct LeasedSource<'a> {
    inner: &'a dyn CommentSource,
    metadata: &'a dyn MetadataStore,
    attempt: i32,
}

#[async_trait]
impl<'a> CommentSource for LeasedSource<'a> {
    async fn comment_page(
        &self,
        video_id: &str,
        page_token: Option<&str>,
    ) -> Result<CommentPage, AppError> {
        renew_lease(self.metadata, video_id, self.attempt).await?;
        self.inner.comment_page(video_id, page_token).await
    }

    async fn comment_count(&self, video_id: &str) -> Result<u64, AppError> {
        self.inner.comment_count(video_id).await
    }
}

/// Object namespace for a video's exports
pub fn namespace(video_id: &str) -> String {
    format!("{}/{}", EXPORT_PREFIX, video_id)
}

pub struct Materializer {
    metadata: Arc<dyn MetadataStore>,
    artifacts: Arc<dyn ArtifactStore>,
    comments: Arc<dyn CommentSource>,
    retention: chrono::Duration,
    lease_seconds: i64,
}

impl Materializer {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        artifacts: Arc<dyn ArtifactStore>,
        comments: Arc<dyn CommentSource>,
        retention: chrono::Duration,
        lease_seconds: i64,
    ) -> Self {
        Self {
            metadata,
            artifacts,
            comments,
            retention,
            lease_seconds,
        }
    }

    /// Materialize `video_id` on behalf of `email`.
    pub async fn run(&self, video_id: &str, email: &str) -> Result<Outcome, AppError> {
        tracing::info!(video_id, email, stage = %Stage::CheckingCache, "materialization started");
        let cached = self.live_entry(video_id).await?;

        let Some(attempt) = self.metadata.claim_job(video_id, self.lease_seconds).await? else {
            return Ok(match cached {
                Some(entry) => Outcome::Cached(entry),
                None => {
                    tracing::info!(video_id, "claim held by another run, skipping");
                    Outcome::Busy
                }
            });
        };

        // A run holding the claim may have finished between our check and claim
        let cached = match cached {
            Some(entry) => Some(entry),
            None => self.live_entry(video_id).await?,
        };
        if let Some(entry) = cached {
            self.metadata
                .finish_job(video_id, attempt, JobStatus::Done, None)
                .await?;
            return Ok(Outcome::Cached(entry));
        }

        match self.materialize(video_id, email, attempt, Utc::now()).await {
            Ok(outcome) => {
                if !self
                    .metadata
                    .finish_job(video_id, attempt, JobStatus::Done, None)
                    .await?
                {
                    tracing::warn!(video_id, attempt, "job taken over before it could be closed");
                }
                tracing::info!(video_id, stage = %Stage::Done, "materialization finished");
                Ok(outcome)
            }
            Err((stage, err)) => {
                tracing::error!(
                    video_id,
                    stage = %Stage::Failed,
                    failed_at = %stage,
                    error = %err,
                    "materialization failed"
                );
                let message = format!("{}: {}", stage, err);
                if let Err(e) = self
                    .metadata
                    .finish_job(video_id, attempt, JobStatus::Failed, Some(&message))
                    .await
                {
                    tracing::error!(video_id, error = %e, "failed to record job failure");
                }
                Err(err)
            }
        }
    }

    async fn live_entry(&self, video_id: &str) -> Result<Option<VideoCacheEntry>, AppError> {
        Ok(self
            .metadata
            .get_video(video_id)
            .await?
            .filter(|entry| !entry.is_expired(Utc::now())))
    }

    async fn materialize(
        &self,
        video_id: &str,
        email: &str,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<Outcome, (Stage, AppError)> {
        let source = LeasedSource {
            inner: self.comments.as_ref(),
            metadata: self.metadata.as_ref(),
            attempt,
        };
        let records = comments::fetch_all_comments(&source, video_id)
            .await
            .map_err(|e| (Stage::Fetching, e))?;
        tracing::info!(video_id, comments = records.len(), stage = %Stage::Encoding, "comments fetched");

        let artifacts = export::encode_all(&records).map_err(|e| (Stage::Encoding, e))?;

        renew_lease(self.metadata.as_ref(), video_id, attempt)
            .await
            .map_err(|e| (Stage::Uploading, e))?;

        let prefix = namespace(video_id);
        let mut uploaded: Vec<(ExportFormat, ArtifactHandle)> = Vec::with_capacity(artifacts.len());
        for artifact in &artifacts {
            let name = artifact.file_name(video_id);
            match self
                .artifacts
                .upload(&prefix, &name, artifact.bytes.clone())
                .await
            {
                Ok(handle) => uploaded.push((artifact.format, handle)),
                Err(e) => {
                    self.discard(&uploaded).await;
                    return Err((Stage::Uploading, e));
                }
            }
        }

        let mut download_links = BTreeMap::new();
        let mut artifact_keys = BTreeMap::new();
        for (format, handle) in &uploaded {
            match self.artifacts.presign(handle, FRESH_LINK_TTL_SECS).await {
                Ok(url) => {
                    download_links.insert(*format, url);
                    artifact_keys.insert(*format, handle.key.clone());
                }
                Err(e) => {
                    self.discard(&uploaded).await;
                    return Err((Stage::Uploading, e));
                }
            }
        }

        let entry = VideoCacheEntry {
            video_id: video_id.to_string(),
            download_links,
            artifact_keys,
            total_comments: records.len() as i64,
            expiry_time: (now + self.retention).timestamp(),
        };
        match self.metadata.put_video(&entry, attempt).await {
            Ok(true) => {}
            // Object keys are shared with the run now holding the claim; leave them.
            Ok(false) => return Err((Stage::PersistingMetadata, lease_lost(video_id))),
            Err(e) => {
                self.discard(&uploaded).await;
                return Err((Stage::PersistingMetadata, e));
            }
        }

        // The entry is durable from here on; billing problems never undo it.
        let credits = match self.metadata.decrement_credits(email).await {
            Ok(Some(remaining)) => Some(remaining),
            Ok(None) => {
                tracing::warn!(
                    video_id,
                    email,
                    stage = %Stage::DebitingCredit,
                    "requesting user missing at debit time, materialization not billed"
                );
                None
            }
            Err(e) => {
                tracing::error!(
                    video_id,
                    email,
                    stage = %Stage::DebitingCredit,
                    error = %e,
                    "credit debit failed, materialization not billed"
                );
                None
            }
        };

        Ok(Outcome::Materialized { entry, credits })
    }

    /// Best-effort removal of objects uploaded by a failed attempt.
    async fn discard(&self, uploaded: &[(ExportFormat, ArtifactHandle)]) {
        for (_, handle) in uploaded {
            match self.artifacts.delete(handle).await {
                Ok(()) => tracing::info!(key = %handle.key, "cleaned up orphaned export"),
                Err(e) => tracing::error!(
                    key = %handle.key,
                    error = %e,
                    "failed to clean up orphaned export"
                ),
            }
        }
    }
}

/// Re-sign a cached entry's artifacts with the long cache-hit TTL.
pub async fn refresh_links(
    artifacts: &dyn ArtifactStore,
    entry: &VideoCacheEntry,
) -> Result<BTreeMap<ExportFormat, String>, AppError> {
    let mut links = BTreeMap::new();
    for (format, key) in &entry.artifact_keys {
        let handle = ArtifactHandle { key: key.clone() };
        links.insert(*format, artifacts.presign(&handle, CACHED_LINK_TTL_SECS).await?);
    }
    Ok(links)
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryArtifactStore;
    use super::*;
    use crate::comments::testing::FakeSource;
    use crate::services::metadata::memory::MemoryMetadataStore;

    const LEASE: i64 = 900;

    struct Harness {
        metadata: Arc<MemoryMetadataStore>,
        artifacts: Arc<MemoryArtifactStore>,
        source: Arc<FakeSource>,
    }

    impl Harness {
        fn new(credits: i64, source: FakeSource, artifacts: MemoryArtifactStore) -> Self {
            Self {
                metadata: Arc::new(MemoryMetadataStore::with_user("a@x.com", credits)),
                artifacts: Arc::new(artifacts),
                source: Arc::new(source),
            }
        }

        fn materializer(&self) -> Materializer {
            Materializer::new(
                self.metadata.clone(),
                self.artifacts.clone(),
                self.source.clone(),
                chrono::Duration::days(7),
                LEASE,
            )
        }

        async fn enqueue_and_run(&self, video_id: &str) -> Result<Outcome, AppError> {
            self.metadata
                .enqueue_job(video_id, "a@x.com", LEASE)
                .await
                .unwrap();
            self.materializer().run(video_id, "a@x.com").await
        }
    }

    #[tokio::test]
    async fn test_cache_miss_materializes_and_debits_once() {
        let h = Harness::new(3, FakeSource::with_comments(250, 100), Default::default());

        let outcome = h.enqueue_and_run("V1").await.unwrap();
        let Outcome::Materialized { entry, credits } = outcome else {
            panic!("expected a fresh materialization");
        };

        assert_eq!(credits, Some(2));
        assert_eq!(h.metadata.credits("a@x.com"), Some(2));
        assert_eq!(entry.total_comments, 250);
        assert_eq!(entry.download_links.len(), 4);
        assert_eq!(
            entry.download_links[&ExportFormat::Csv],
            "https://storage.test/youtube_comments/V1/V1.csv?ttl=3600"
        );
        assert!(entry.expiry_time > Utc::now().timestamp());

        // Every link points at an object that exists
        let objects = h.artifacts.objects.lock().unwrap();
        for key in entry.artifact_keys.values() {
            assert!(objects.contains_key(key), "missing object {}", key);
        }
        drop(objects);

        assert_eq!(h.metadata.get_video("V1").await.unwrap(), Some(entry));
        assert_eq!(h.metadata.job_status("V1"), Some(JobStatus::Done));
    }

    #[tokio::test]
    async fn test_cache_hit_touches_neither_upstream_nor_credits() {
        let h = Harness::new(3, FakeSource::with_comments(10, 100), Default::default());
        h.enqueue_and_run("V1").await.unwrap();
        let requests = h.source.requests();

        let outcome = h.materializer().run("V1", "a@x.com").await.unwrap();
        assert!(matches!(outcome, Outcome::Cached(ref e) if e.total_comments == 10));
        assert_eq!(h.source.requests(), requests);
        assert_eq!(h.metadata.credits("a@x.com"), Some(2));
    }

    #[tokio::test]
    async fn test_credits_never_go_negative() {
        let h = Harness::new(1, FakeSource::with_comments(3, 100), Default::default());
        for video in ["V1", "V2", "V3"] {
            h.enqueue_and_run(video).await.unwrap();
        }
        assert_eq!(h.metadata.credits("a@x.com"), Some(0));
    }

    #[tokio::test]
    async fn test_upstream_failure_leaves_no_trace() {
        let mut source = FakeSource::with_comments(300, 100);
        source.fail_on_page = Some(1);
        let h = Harness::new(3, source, Default::default());

        let result = h.enqueue_and_run("V1").await;
        assert!(matches!(result, Err(AppError::Upstream(_))));
        assert_eq!(h.metadata.credits("a@x.com"), Some(3));
        assert!(h.metadata.get_video("V1").await.unwrap().is_none());
        assert!(h.artifacts.objects.lock().unwrap().is_empty());

        let job = h.metadata.get_job("V1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().starts_with("fetching:"));
    }

    #[tokio::test]
    async fn test_partial_upload_is_cleaned_up() {
        let artifacts = MemoryArtifactStore {
            fail_upload_at: Some(2),
            ..Default::default()
        };
        let h = Harness::new(3, FakeSource::with_comments(5, 100), artifacts);

        let result = h.enqueue_and_run("V1").await;
        assert!(matches!(result, Err(AppError::Storage(_))));
        assert!(h.artifacts.objects.lock().unwrap().is_empty());
        assert!(h.metadata.get_video("V1").await.unwrap().is_none());
        assert_eq!(h.metadata.credits("a@x.com"), Some(3));
        assert_eq!(h.metadata.job_status("V1"), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_metadata_failure_discards_uploads_and_skips_debit() {
        let h = Harness::new(3, FakeSource::with_comments(5, 100), Default::default());
        h.metadata.set_fail_video_writes(true);

        let result = h.enqueue_and_run("V1").await;
        assert!(matches!(result, Err(AppError::Storage(_))));
        assert!(h.artifacts.objects.lock().unwrap().is_empty());
        assert_eq!(h.metadata.credits("a@x.com"), Some(3));
    }

    #[tokio::test]
    async fn test_missing_user_still_persists_entry() {
        let h = Harness::new(3, FakeSource::with_comments(5, 100), Default::default());
        h.metadata.users.lock().unwrap().clear();

        let outcome = h.enqueue_and_run("V1").await.unwrap();
        assert!(matches!(outcome, Outcome::Materialized { credits: None, .. }));
        assert!(h.metadata.get_video("V1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_run_without_claim_is_busy() {
        let h = Harness::new(3, FakeSource::with_comments(5, 100), Default::default());
        h.metadata.enqueue_job("V1", "a@x.com", LEASE).await.unwrap();
        assert!(h.metadata.claim_job("V1", LEASE).await.unwrap().is_some());

        let outcome = h.materializer().run("V1", "a@x.com").await.unwrap();
        assert_eq!(outcome, Outcome::Busy);
        assert_eq!(h.source.requests(), 0);
        assert_eq!(h.metadata.credits("a@x.com"), Some(3));
    }

    #[tokio::test]
    async fn test_expired_entry_is_rematerialized() {
        let h = Harness::new(3, FakeSource::with_comments(5, 100), Default::default());
        h.enqueue_and_run("V1").await.unwrap();
        h.metadata
            .videos
            .lock()
            .unwrap()
            .get_mut("V1")
            .unwrap()
            .expiry_time = Utc::now().timestamp() - 1;

        let outcome = h.enqueue_and_run("V1").await.unwrap();
        assert!(matches!(outcome, Outcome::Materialized { credits: Some(1), .. }));
        assert_eq!(*h.metadata.video_writes.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_refresh_links_uses_cache_ttl() {
        let h = Harness::new(3, FakeSource::with_comments(5, 100), Default::default());
        let Outcome::Materialized { entry, .. } = h.enqueue_and_run("V1").await.unwrap() else {
            panic!("expected materialization");
        };

        let links = refresh_links(h.artifacts.as_ref(), &entry).await.unwrap();
        assert_eq!(links.len(), 4);
        assert!(links[&ExportFormat::Json].ends_with("V1.json?ttl=604800"));
    }

    #[tokio::test]
    async fn test_recycled_job_for_cached_video_is_closed() {
        let h = Harness::new(3, FakeSource::with_comments(5, 100), Default::default());
        h.enqueue_and_run("V1").await.unwrap();
        let requests = h.source.requests();

        // Entry path raced the first run's finish and recycled its DONE job
        let outcome = h.enqueue_and_run("V1").await.unwrap();
        assert!(matches!(outcome, Outcome::Cached(_)));
        assert_eq!(h.metadata.job_status("V1"), Some(JobStatus::Done));
        assert_eq!(h.source.requests(), requests);
        assert_eq!(h.metadata.credits("a@x.com"), Some(2));
    }

    #[tokio::test]
    async fn test_lease_is_renewed_while_fetching() {
        let h = Harness::new(3, FakeSource::with_comments(350, 100), Default::default());
        h.metadata.enqueue_job("V1", "a@x.com", LEASE).await.unwrap();
        let attempt = h.metadata.claim_job("V1", LEASE).await.unwrap().unwrap();
        h.metadata.age_job("V1", LEASE + 1);

        h.materializer()
            .materialize("V1", "a@x.com", attempt, Utc::now())
            .await
            .unwrap();

        // Renewed, so a new request cannot take the job over
        assert!(h.metadata.enqueue_job("V1", "b@x.com", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_taken_over_run_cannot_persist_bill_or_finish() {
        let h = Harness::new(3, FakeSource::with_comments(5, 100), Default::default());
        h.metadata.enqueue_job("V1", "a@x.com", LEASE).await.unwrap();
        let stale = h.metadata.claim_job("V1", LEASE).await.unwrap().unwrap();

        // First worker stalls past its lease; a new request takes the job over
        h.metadata.age_job("V1", LEASE + 1);
        assert!(h.metadata.enqueue_job("V1", "a@x.com", LEASE).await.unwrap().is_some());
        let outcome = h.materializer().run("V1", "a@x.com").await.unwrap();
        assert!(matches!(outcome, Outcome::Materialized { credits: Some(2), .. }));

        // The stalled worker resumes with its old claim
        let result = h
            .materializer()
            .materialize("V1", "a@x.com", stale, Utc::now())
            .await;
        let Err((stage, AppError::Storage(_))) = result else {
            panic!("superseded run should be fenced out");
        };
        assert_eq!(stage, Stage::Fetching);
        assert_eq!(*h.metadata.video_writes.lock().unwrap(), 1);
        assert_eq!(h.metadata.credits("a@x.com"), Some(2));

        assert!(
            !h.metadata
                .finish_job("V1", stale, JobStatus::Failed, Some("late"))
                .await
                .unwrap()
        );
        let job = h.metadata.get_job("V1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.error.is_none());
    }
}

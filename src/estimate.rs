//! Wait-time estimate shown to callers while a video is being materialized.

use crate::constants::COMMENTS_PER_SECOND;
use crate::services::error::AppError;
use crate::services::youtube::CommentSource;

/// Estimated processing time in seconds for `video_id`.
///
/// Advisory only: derived from the public comment count, which includes
/// replies the fetcher never downloads.
pub async fn estimate_wait_secs(
    source: &dyn CommentSource,
    video_id: &str,
) -> Result<f64, AppError> {
    let count = source.comment_count(video_id).await?;
    Ok(count as f64 / COMMENTS_PER_SECOND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comments::testing::FakeSource;

    #[tokio::test]
    async fn test_estimate_divides_by_throughput() {
        let source = FakeSource::with_comments(250, 100);
        assert_eq!(estimate_wait_secs(&source, "V1").await.unwrap(), 2.5);
    }

    #[tokio::test]
    async fn test_estimate_propagates_upstream_errors() {
        let mut source = FakeSource::with_comments(0, 100);
        source.comment_count = Err("video statistics missing".to_string());
        assert!(matches!(
            estimate_wait_secs(&source, "V1").await,
            Err(AppError::Upstream(_))
        ));
    }
}

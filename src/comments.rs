//! Paginated comment fetching.
//!
//! Walks the commentThreads pages for one video until the upstream stops
//! returning a continuation token. Any failed page aborts the whole fetch;
//! partially accumulated records are dropped with it.

use crate::models::CommentRecord;
use crate::services::error::AppError;
use crate::services::youtube::{CommentSnippet, CommentSource};

/// Fetch every top-level comment for `video_id`, in upstream order.
pub async fn fetch_all_comments(
    source: &dyn CommentSource,
    video_id: &str,
) -> Result<Vec<CommentRecord>, AppError> {
    let mut records = Vec::new();
    let mut page_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = source.comment_page(video_id, page_token.as_deref()).await?;
        pages += 1;

        records.extend(
            page.items
                .into_iter()
                .map(|thread| normalize(thread.snippet.top_level_comment.snippet)),
        );

        match page.next_page_token.filter(|t| !t.is_empty()) {
            Some(next) if page_token.as_deref() == Some(next.as_str()) => {
                return Err(AppError::Upstream(format!(
                    "pagination stalled on token {} for video {}",
                    next, video_id
                )));
            }
            Some(next) => page_token = Some(next),
            None => break,
        }
    }

    tracing::debug!(video_id, pages, comments = records.len(), "fetched comments");
    Ok(records)
}

fn normalize(snippet: CommentSnippet) -> CommentRecord {
    CommentRecord {
        author: snippet.author_display_name.unwrap_or_default(),
        text: snippet.text_display.unwrap_or_default(),
        published_at: snippet.published_at,
        like_count: snippet.like_count.unwrap_or(0),
    }
}

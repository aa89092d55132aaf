use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::constants::COMMENT_PAGE_SIZE;
use crate::services::error::{AppError, ResultExt};

/// Read access to a video's comments and statistics.
#[async_trait]
pub trait CommentSource: Send + Sync {
    /// Fetch one page of top-level comment threads.
    async fn comment_page(
        &self,
        video_id: &str,
        page_token: Option<&str>,
    ) -> Result<CommentPage, AppError>;

    /// Public comment count from the video statistics.
    async fn comment_count(&self, video_id: &str) -> Result<u64, AppError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentPage {
    #[serde(default)]
    pub items: Vec<CommentThread>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentThread {
    pub snippet: ThreadSnippet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSnippet {
    pub top_level_comment: TopLevelComment,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopLevelComment {
    pub snippet: CommentSnippet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentSnippet {
    pub author_display_name: Option<String>,
    pub text_display: Option<String>,
    pub published_at: DateTime<Utc>,
    pub like_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    statistics: Option<VideoStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    /// Decimal string; absent when comments are disabled
    comment_count: Option<String>,
}

#[derive(Clone)]
pub struct YouTubeClient {
    api_key: String,
    base_url: String,
    http: Client,
}

impl YouTubeClient {
    pub fn new(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .upstream("Build HTTP client")?;

        Ok(Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, AppError> {
        let url = format!("{}/{}", self.base_url, path);

        let resp = self
            .http
            .get(&url)
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .upstream(path)?;

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Upstream(text));
        }

        resp.json().await.upstream(path)
    }
}

#[async_trait]
impl CommentSource for YouTubeClient {
    async fn comment_page(
        &self,
        video_id: &str,
        page_token: Option<&str>,
    ) -> Result<CommentPage, AppError> {
        let max_results = COMMENT_PAGE_SIZE.to_string();
        let mut query = vec![
            ("part", "snippet"),
            ("videoId", video_id),
            ("maxResults", max_results.as_str()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        self.get_json("commentThreads", &query).await
    }

    async fn comment_count(&self, video_id: &str) -> Result<u64, AppError> {
        let resp: VideoListResponse = self
            .get_json("videos", &[("part", "statistics"), ("id", video_id)])
            .await?;
        parse_comment_count(resp)
    }
}

fn parse_comment_count(resp: VideoListResponse) -> Result<u64, AppError> {
    let statistics = resp
        .items
        .into_iter()
        .next()
        .and_then(|item| item.statistics)
        .ok_or_else(|| AppError::Upstream("video statistics missing".to_string()))?;

    match statistics.comment_count {
        Some(count) => count
            .parse()
            .map_err(|_| AppError::Upstream(format!("invalid commentCount: {}", count))),
        None => Ok(0),
    }
}

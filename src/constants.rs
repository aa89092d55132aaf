//! Application constants

/// Default GCS bucket for exported comment files
pub const DEFAULT_BUCKET_NAME: &str = "youtube_comments_exports";

/// Object prefix under which every video's exports live
pub const EXPORT_PREFIX: &str = "youtube_comments";

/// Signed URL expiry for links minted right after upload (1 hour)
pub const FRESH_LINK_TTL_SECS: u32 = 60 * 60;

/// Signed URL expiry for links re-derived on a cache hit (7 days)
pub const CACHED_LINK_TTL_SECS: u32 = 7 * 24 * 60 * 60;

/// Comments the pipeline processes per second, used for wait estimates
pub const COMMENTS_PER_SECOND: f64 = 100.0;

/// Page size requested from the commentThreads endpoint (API maximum)
pub const COMMENT_PAGE_SIZE: u32 = 100;

/// Maximum request body accepted by the JSON endpoints
pub const MAX_REQUEST_BODY_SIZE: usize = 64 * 1024;

//! Feed query boundary
//!
//! Always answers with a well-formed `{cursor, feed, error?}` body; failures
//! become an `error` string with an empty feed and an `eof` cursor.

use super::composer::{FeedComposer, FeedError};
use super::cursor::EOF;
use crate::store::PostRepository;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MALFORMED_CURSOR: &str = "Malformed cursor.";
pub const INVALID_LIMIT: &str = "Limit must be a positive integer.";
pub const UNEXPECTED_ERROR: &str = "An unexpected error occurred.";

/// Requests above this size without a cursor are recorded in the request log
const LOGGED_REQUEST_LIMIT: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonItem {
    pub post: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSkeletonResponse {
    pub cursor: String,
    pub feed: Vec<SkeletonItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FeedSkeletonResponse {
    fn failure(message: &str) -> Self {
        Self {
            cursor: EOF.to_string(),
            feed: Vec::new(),
            error: Some(message.to_string()),
        }
    }
}

pub struct FeedService {
    composer: FeedComposer,
    store: Arc<dyn PostRepository>,
}

impl FeedService {
    pub fn new(composer: FeedComposer, store: Arc<dyn PostRepository>) -> Self {
        Self { composer, store }
    }

    /// Serve one skeleton page. `requester` is the caller's DID when known.
    pub async fn skeleton(
        &self,
        cursor: Option<&str>,
        limit: i64,
        requester: Option<&str>,
    ) -> FeedSkeletonResponse {
        if limit > LOGGED_REQUEST_LIMIT && cursor.is_none() {
            if let Err(e) = self.store.log_request(requester, Utc::now()).await {
                log::warn!("⚠️  Failed to record feed request: {}", e);
            }
        }

        match self.composer.compose(cursor, limit).await {
            Ok(page) => FeedSkeletonResponse {
                cursor: page.cursor.to_string(),
                feed: page
                    .feed
                    .into_iter()
                    .map(|post| SkeletonItem { post })
                    .collect(),
                error: None,
            },
            Err(FeedError::Cursor(e)) => {
                log::error!("❌ {}", e);
                FeedSkeletonResponse::failure(MALFORMED_CURSOR)
            }
            Err(FeedError::InvalidLimit(limit)) => {
                log::error!("❌ Invalid limit value: {}", limit);
                FeedSkeletonResponse::failure(INVALID_LIMIT)
            }
            Err(e @ FeedError::Store(_)) => {
                log::error!("❌ Feed composition failed: {}", e);
                FeedSkeletonResponse::failure(UNEXPECTED_ERROR)
            }
        }
    }
}

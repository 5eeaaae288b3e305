//! Persistence gateway for posts, subscription checkpoints and the request log
//!
//! Every mutation goes through a single transaction in the backing store, so
//! callers never need in-process locking around these operations. The
//! ingestion loop, the hydrator and the feed composer all talk to the store
//! through [`PostRepository`] and never see connection objects.

pub mod housekeeping;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use sqlite::SqlitePostStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database connection lock poisoned")]
    Poisoned,

    #[error("migration failed for {file}: {source}")]
    Migration {
        file: &'static str,
        source: rusqlite::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One persisted post row
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub uri: String,
    pub cid: String,
    pub author: String,
    pub reply_parent: Option<String>,
    pub reply_root: Option<String>,
    pub indexed_at: DateTime<Utc>,
    pub interactions: i64,
    pub text: Option<String>,
}

impl Post {
    /// Resume position of this post in the chronological ordering
    pub fn position(&self) -> ChronoPosition {
        ChronoPosition {
            indexed_at_ms: self.indexed_at.timestamp_millis(),
            uri: self.uri.clone(),
        }
    }
}

/// A post accepted by the ingestion filter, ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct NewPost {
    pub uri: String,
    pub cid: String,
    pub author: String,
    pub reply_parent: Option<String>,
    pub reply_root: Option<String>,
    pub indexed_at: DateTime<Utc>,
    pub text: Option<String>,
}

/// Persisted position of a named upstream subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub service: String,
    pub cursor: i64,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

/// Resume position in the chronological ordering: `(indexed_at, uri)`
///
/// Serialized as `"<epoch millis>::<uri>"`. The millisecond part never
/// contains `::`, so the first separator splits the pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChronoPosition {
    pub indexed_at_ms: i64,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid chronological position: {0}")]
pub struct InvalidPosition(String);

impl TryFrom<String> for ChronoPosition {
    type Error = InvalidPosition;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (millis, uri) = value
            .split_once("::")
            .ok_or_else(|| InvalidPosition(value.clone()))?;
        let indexed_at_ms = millis
            .parse::<i64>()
            .map_err(|_| InvalidPosition(value.clone()))?;
        if uri.is_empty() {
            return Err(InvalidPosition(value));
        }
        Ok(Self {
            indexed_at_ms,
            uri: uri.to_string(),
        })
    }
}

impl From<ChronoPosition> for String {
    fn from(position: ChronoPosition) -> Self {
        position.to_string()
    }
}

impl fmt::Display for ChronoPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.indexed_at_ms, self.uri)
    }
}

/// A recently indexed post that the hydrator should refresh
#[derive(Debug, Clone, PartialEq)]
pub struct HydrationCandidate {
    pub uri: String,
    pub interactions: i64,
    pub has_text: bool,
}

/// New score (and optional text backfill) for one post
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionUpdate {
    pub uri: String,
    pub interactions: i64,
    pub text: Option<String>,
}

/// Repository interface behind which any transactional store can sit
#[async_trait]
pub trait PostRepository: Send + Sync {
    /// Read the checkpoint for `service`, if one was ever written
    async fn get_checkpoint(&self, service: &str) -> StoreResult<Option<Checkpoint>>;

    /// Read the checkpoint for `service`, creating one at position 0 if absent
    async fn load_or_init_checkpoint(&self, service: &str) -> StoreResult<Checkpoint>;

    /// Persist `cursor` for `service`. The stored cursor never decreases;
    /// returns the value actually stored.
    async fn save_checkpoint(
        &self,
        service: &str,
        cursor: i64,
        last_indexed_at: DateTime<Utc>,
    ) -> StoreResult<i64>;

    /// Insert or overwrite posts by uri in one transaction
    async fn batch_upsert_posts(&self, posts: &[NewPost]) -> StoreResult<usize>;

    /// Delete posts by uri in one transaction; returns rows removed
    async fn batch_delete_posts(&self, uris: &[String]) -> StoreResult<usize>;

    /// Posts ordered by `indexed_at DESC, uri DESC`, strictly after `after`
    /// when given, skipping any uri in `exclude`
    async fn query_chronological(
        &self,
        after: Option<&ChronoPosition>,
        exclude: &[String],
        limit: usize,
    ) -> StoreResult<Vec<Post>>;

    /// Posts indexed after `since` with `interactions >= min_interactions`,
    /// ordered by `interactions DESC, indexed_at DESC, uri DESC`
    async fn query_ranked(
        &self,
        since: DateTime<Utc>,
        min_interactions: i64,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<Post>>;

    /// Posts indexed at or after `since`, newest first
    async fn posts_indexed_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<HydrationCandidate>>;

    /// Apply score updates in one transaction. Rows whose score is unchanged
    /// and whose text is already present are left untouched.
    async fn bulk_update_interactions(&self, updates: &[InteractionUpdate]) -> StoreResult<usize>;

    /// Record a feed request for external auditing
    async fn log_request(&self, requester: Option<&str>, at: DateTime<Utc>) -> StoreResult<()>;
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

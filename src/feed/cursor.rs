//! Opaque pagination cursor
//!
//! Wire form is a JSON object:
//! `{"main_posts": "<epoch_ms>::<uri>", "trending_posts_offset": 12}`.
//! `main_posts` is absent until a chronological item has been served. The
//! literal `eof` marks the end of the feed.

use crate::store::ChronoPosition;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const EOF: &str = "eof";

/// Deepest trending offset a cursor may carry. The composer stops drawing
/// ranked posts here, so cursors it issues never exceed it.
pub const MAX_RANKED_OFFSET: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("malformed cursor {raw:?}: {source}")]
    Decode {
        raw: String,
        source: serde_json::Error,
    },

    #[error("trending offset {0} is out of range")]
    OffsetOutOfRange(u64),
}

/// Per-source resume positions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationCursor {
    #[serde(rename = "main_posts", default, skip_serializing_if = "Option::is_none")]
    pub chronological: Option<ChronoPosition>,
    #[serde(rename = "trending_posts_offset", default)]
    pub ranked_offset: u64,
}

impl PaginationCursor {
    pub fn decode(raw: &str) -> Result<Self, CursorError> {
        let cursor: Self = serde_json::from_str(raw).map_err(|source| CursorError::Decode {
            raw: raw.to_string(),
            source,
        })?;
        if cursor.ranked_offset > MAX_RANKED_OFFSET {
            return Err(CursorError::OffsetOutOfRange(cursor.ranked_offset));
        }
        Ok(cursor)
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PaginationCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}

/// Cursor handed back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCursor {
    Next(PaginationCursor),
    Eof,
}

impl FeedCursor {
    pub fn parse(raw: &str) -> Result<Self, CursorError> {
        if raw == EOF {
            return Ok(FeedCursor::Eof);
        }
        PaginationCursor::decode(raw).map(FeedCursor::Next)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, FeedCursor::Eof)
    }
}

impl fmt::Display for FeedCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedCursor::Next(cursor) => cursor.fmt(f),
            FeedCursor::Eof => f.write_str(EOF),
        }
    }
}

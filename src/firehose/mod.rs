//! Commit stream ingestion: subscription, extraction, filtering, checkpointing

pub mod backoff;
pub mod extractor;
pub mod filter;
pub mod ingestion;
pub mod source;
pub mod types;
pub mod websocket;

pub use extractor::{CommitError, OperationExtractor, PostRecord, POST_COLLECTION};
pub use filter::{FilterDecision, FilterRuleSet, IdentityLists, PatternFilter, PostFilter};
pub use ingestion::{IngestionError, IngestionLoop, IngestionSettings, IngestionStats};
pub use source::{CommitSource, CommitStream, StreamError};
pub use types::{BlockSet, Commit, OpAction, RepoOp, StreamEvent};
pub use websocket::{decode_frame, WebSocketCommitSource};

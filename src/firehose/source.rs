//! Commit stream subscription interface
//!
//! The ingestion loop only sees [`CommitSource`] / [`CommitStream`]; the wire
//! transport behind them is swappable (WebSocket in production, scripted
//! sources in tests).

use super::types::StreamEvent;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Connection-level failure; the subscription can be reopened
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream sent something the subscription cannot continue past
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StreamError {
    pub fn is_transport(&self) -> bool {
        matches!(self, StreamError::Transport(_))
    }
}

/// One open subscription. `None` means the upstream closed the stream.
#[async_trait]
pub trait CommitStream: Send {
    async fn next_event(&mut self) -> Option<Result<StreamEvent, StreamError>>;

    async fn close(&mut self) {}
}

/// Opens subscriptions, optionally resuming after a sequence number
#[async_trait]
pub trait CommitSource: Send + Sync {
    async fn subscribe(&self, cursor: Option<i64>) -> Result<Box<dyn CommitStream>, StreamError>;
}

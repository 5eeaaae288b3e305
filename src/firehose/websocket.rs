//! WebSocket commit subscription
//!
//! Frames are JSON objects. Commit frames look like
//! `{"t": "#commit", "seq": 42, "repo": "did:plc:...", "time": "...",
//!   "ops": [{"action": "create", "path": "app.bsky.feed.post/3k...", "cid": "bafy..."}],
//!   "blocks": {"bafy...": "<base64 record bytes>"}}`.
//! `blocks` holds record bytes only, so a delete-only commit has no `blocks`
//! field at all. Any other `t` is surfaced as [`StreamEvent::Other`].

use super::source::{CommitSource, CommitStream, StreamError};
use super::types::{BlockSet, Commit, RepoOp, StreamEvent};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

const COMMIT_KIND: &str = "#commit";

#[derive(Deserialize)]
struct FrameHeader {
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    seq: Option<i64>,
}

#[derive(Deserialize)]
struct CommitFrame {
    seq: i64,
    repo: String,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    ops: Vec<RepoOp>,
    #[serde(default)]
    blocks: HashMap<String, String>,
}

/// Decode one frame. Never fails: undecodable commit envelopes come back as
/// [`StreamEvent::Malformed`] so the caller decides what to do with them.
pub fn decode_frame(bytes: &[u8]) -> StreamEvent {
    let header: FrameHeader = match serde_json::from_slice(bytes) {
        Ok(header) => header,
        Err(e) => {
            return StreamEvent::Malformed {
                seq: None,
                reason: format!("unreadable frame: {}", e),
            }
        }
    };

    match header.t.as_deref() {
        Some(COMMIT_KIND) => {}
        Some(kind) => {
            return StreamEvent::Other {
                kind: kind.to_string(),
            }
        }
        None => {
            return StreamEvent::Malformed {
                seq: header.seq,
                reason: "frame without type".to_string(),
            }
        }
    }

    let frame: CommitFrame = match serde_json::from_slice(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            return StreamEvent::Malformed {
                seq: header.seq,
                reason: format!("bad commit envelope: {}", e),
            }
        }
    };

    let mut blocks = BlockSet::new();
    for (cid, encoded) in frame.blocks {
        match STANDARD.decode(encoded.as_bytes()) {
            Ok(data) => blocks.insert(cid, data),
            Err(e) => {
                return StreamEvent::Malformed {
                    seq: Some(frame.seq),
                    reason: format!("block {} is not base64: {}", cid, e),
                }
            }
        }
    }

    StreamEvent::Commit(Commit {
        repo: frame.repo,
        seq: frame.seq,
        ops: frame.ops,
        blocks,
        time: frame.time,
    })
}

pub struct WebSocketCommitSource {
    endpoint: String,
}

impl WebSocketCommitSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn subscription_url(&self, cursor: Option<i64>) -> String {
        match cursor {
            Some(cursor) => {
                let separator = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{}cursor={}", self.endpoint, separator, cursor)
            }
            None => self.endpoint.clone(),
        }
    }
}

#[async_trait]
impl CommitSource for WebSocketCommitSource {
    async fn subscribe(&self, cursor: Option<i64>) -> Result<Box<dyn CommitStream>, StreamError> {
        let url = self.subscription_url(cursor);
        log::info!("🔌 Subscribing to {}", url);

        let (inner, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        log::info!("✅ Subscription open");
        Ok(Box::new(WebSocketCommitStream { inner }))
    }
}

struct WebSocketCommitStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl CommitStream for WebSocketCommitStream {
    async fn next_event(&mut self) -> Option<Result<StreamEvent, StreamError>> {
        loop {
            match self.inner.next().await {
                None => return None,
                Some(Err(e)) => return Some(Err(StreamError::Transport(e.to_string()))),
                Some(Ok(Message::Text(text))) => {
                    return Some(Ok(decode_frame(text.as_str().as_bytes())))
                }
                Some(Ok(Message::Binary(data))) => return Some(Ok(decode_frame(&data))),
                Some(Ok(Message::Close(frame))) => {
                    log::info!("🔌 Upstream closed subscription: {:?}", frame);
                    return None;
                }
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close(None).await {
            log::debug!("Subscription close: {}", e);
        }
    }
}

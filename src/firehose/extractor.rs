//! Turns one commit into typed create/delete operations for posts

use super::types::{Commit, OpAction};
use serde::Deserialize;

pub const POST_COLLECTION: &str = "app.bsky.feed.post";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    #[error("commit {seq}: repo {repo:?} is not a DID")]
    InvalidRepo { seq: i64, repo: String },

    #[error("commit {seq}: malformed op path {path:?}")]
    InvalidPath { seq: i64, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplyRef {
    pub parent: StrongRef,
    pub root: StrongRef,
}

/// Decoded post record
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PostRecord {
    #[serde(rename = "$type")]
    pub record_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateOp {
    pub uri: String,
    pub cid: String,
    pub author: String,
    pub record: PostRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOp {
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedOps {
    pub creates: Vec<CreateOp>,
    pub deletes: Vec<DeleteOp>,
}

#[derive(Debug, Clone)]
pub struct OperationExtractor {
    collection: String,
}

impl Default for OperationExtractor {
    fn default() -> Self {
        Self::new(POST_COLLECTION)
    }
}

impl OperationExtractor {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
        }
    }

    /// Validate the envelope, then pull out creates and deletes for the
    /// configured collection. Individual unusable records are skipped.
    pub fn extract(&self, commit: &Commit) -> Result<ExtractedOps, CommitError> {
        if !commit.repo.starts_with("did:") {
            return Err(CommitError::InvalidRepo {
                seq: commit.seq,
                repo: commit.repo.clone(),
            });
        }

        let mut paths = Vec::with_capacity(commit.ops.len());
        for op in &commit.ops {
            match op.path.split_once('/') {
                Some((collection, rkey)) if !collection.is_empty() && !rkey.is_empty() => {
                    paths.push(collection)
                }
                _ => {
                    return Err(CommitError::InvalidPath {
                        seq: commit.seq,
                        path: op.path.clone(),
                    })
                }
            }
        }

        let mut extracted = ExtractedOps::default();

        for (op, collection) in commit.ops.iter().zip(paths) {
            if collection != self.collection {
                continue;
            }
            let uri = format!("at://{}/{}", commit.repo, op.path);

            match op.action {
                OpAction::Create => {
                    let Some(cid) = op.cid.as_deref() else {
                        log::debug!("Create without cid at {}", uri);
                        continue;
                    };
                    let Some(block) = commit.blocks.get(cid) else {
                        log::debug!("Block {} missing for {}", cid, uri);
                        continue;
                    };
                    let record: PostRecord = match serde_json::from_slice(block) {
                        Ok(record) => record,
                        Err(e) => {
                            log::warn!("⚠️  Skipping undecodable record {}: {}", uri, e);
                            continue;
                        }
                    };
                    if record.record_type != self.collection {
                        log::debug!(
                            "Record type {} does not match collection at {}",
                            record.record_type,
                            uri
                        );
                        continue;
                    }

                    extracted.creates.push(CreateOp {
                        uri,
                        cid: cid.to_string(),
                        author: commit.repo.clone(),
                        record,
                    });
                }
                OpAction::Delete => extracted.deletes.push(DeleteOp { uri }),
                OpAction::Update | OpAction::Unknown => {}
            }
        }

        Ok(extracted)
    }
}

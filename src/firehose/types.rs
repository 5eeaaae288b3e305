//! Commit stream data model
//!
//! A commit is one sequenced batch of repository operations together with the
//! content-addressed blocks that the create/update operations reference.

use serde::Deserialize;
use std::collections::HashMap;

/// One sequenced change set against a single repository
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    /// Repository identity (a DID)
    pub repo: String,
    /// Upstream sequence number, monotonic per stream
    pub seq: i64,
    pub ops: Vec<RepoOp>,
    pub blocks: BlockSet,
    /// Upstream commit timestamp, informational only
    pub time: Option<String>,
}

impl Commit {
    /// Commits with neither operations nor block data carry nothing to
    /// extract. Delete-only commits have no blocks but still have ops.
    pub fn is_heartbeat(&self) -> bool {
        self.ops.is_empty() && self.blocks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RepoOp {
    pub action: OpAction,
    /// `collection/rkey`
    pub path: String,
    /// Content id of the new record revision; absent on delete
    #[serde(default)]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// Content-addressed blocks of one commit, keyed by content id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockSet(HashMap<String, Vec<u8>>);

impl BlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cid: impl Into<String>, data: Vec<u8>) {
        self.0.insert(cid.into(), data);
    }

    pub fn get(&self, cid: &str) -> Option<&[u8]> {
        self.0.get(cid).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Vec<u8>)> for BlockSet {
    fn from_iter<T: IntoIterator<Item = (String, Vec<u8>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One delivery from the subscription
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Commit(Commit),
    /// A frame that claimed to be a commit but whose envelope could not be
    /// decoded. Carries the sequence number when it was readable.
    Malformed { seq: Option<i64>, reason: String },
    /// Any other frame kind (identity, account, info...), ignored
    Other { kind: String },
}

//! Commit stream ingestion loop
//!
//! One sequential worker: commits are handled strictly in delivery order,
//! deletes before creates within a commit, each batch in its own store
//! transaction. The subscription cursor is checkpointed every
//! `checkpoint_interval` sequence numbers and once more on orderly stop.
//!
//! State machine:
//! `Connecting -> Streaming -> (Reconnecting | Stopping) -> Stopped`.
//! Transport failures and upstream closes reconnect forever with backoff.
//! Anything else (store failures, protocol errors) ends the loop with an
//! error and is left to the process supervisor.

use super::backoff::ExponentialBackoff;
use super::extractor::{ExtractedOps, OperationExtractor};
use super::filter::{FilterDecision, KeepReason, PostFilter, RejectReason};
use super::source::{CommitSource, CommitStream, StreamError};
use super::types::{Commit, StreamEvent};
use crate::store::{NewPost, PostRepository, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHECKPOINT_INTERVAL: i64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("unrecoverable stream failure: {0}")]
    Stream(StreamError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionState {
    Connecting,
    Streaming,
    Reconnecting,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct IngestionSettings {
    /// Checkpoint row name for this subscription
    pub service: String,
    pub checkpoint_interval: i64,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            service: "firehose".to_string(),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Counters reported when the loop stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionStats {
    pub commits: u64,
    pub heartbeats: u64,
    pub malformed: u64,
    pub other_frames: u64,
    pub created: u64,
    pub deleted: u64,
    pub denied: u64,
    pub unmatched: u64,
    pub checkpoints: u64,
    pub reconnects: u64,
}

#[derive(Debug)]
struct Progress {
    last_checkpointed: i64,
    last_processed: Option<i64>,
}

impl Progress {
    fn pending(&self) -> Option<i64> {
        self.last_processed
            .filter(|&seq| seq > self.last_checkpointed)
    }
}

pub struct IngestionLoop {
    source: Arc<dyn CommitSource>,
    store: Arc<dyn PostRepository>,
    filter: PostFilter,
    extractor: OperationExtractor,
    settings: IngestionSettings,
    stats: IngestionStats,
}

impl IngestionLoop {
    pub fn new(
        source: Arc<dyn CommitSource>,
        store: Arc<dyn PostRepository>,
        filter: PostFilter,
        settings: IngestionSettings,
    ) -> Self {
        Self {
            source,
            store,
            filter,
            extractor: OperationExtractor::default(),
            settings,
            stats: IngestionStats::default(),
        }
    }

    /// Run until `cancel` fires or an unrecoverable error occurs
    pub async fn run(mut self, cancel: CancellationToken) -> Result<IngestionStats, IngestionError> {
        log::info!("🚀 Starting ingestion for {}", self.settings.service);
        log::info!("   ├─ Checkpoint interval: {}", self.settings.checkpoint_interval);
        log::info!(
            "   └─ Reconnect backoff: {:?}..{:?}",
            self.settings.backoff_initial,
            self.settings.backoff_max
        );

        let checkpoint = self
            .store
            .load_or_init_checkpoint(&self.settings.service)
            .await?;
        let mut progress = Progress {
            last_checkpointed: checkpoint.cursor,
            last_processed: None,
        };

        let mut backoff =
            ExponentialBackoff::new(self.settings.backoff_initial, self.settings.backoff_max);
        let mut stream: Option<Box<dyn CommitStream>> = None;
        let mut state = IngestionState::Connecting;

        loop {
            let next = match state {
                IngestionState::Connecting | IngestionState::Reconnecting => {
                    self.connect(&mut stream, &mut backoff, &cancel).await?
                }
                IngestionState::Streaming => {
                    self.stream_next(&mut stream, &mut progress, &mut backoff, &cancel)
                        .await?
                }
                IngestionState::Stopping => {
                    if let Some(mut active) = stream.take() {
                        active.close().await;
                    }
                    self.flush_checkpoint(&mut progress).await?;
                    IngestionState::Stopped
                }
                IngestionState::Stopped => {
                    log::info!("🛑 Ingestion stopped: {:?}", self.stats);
                    return Ok(self.stats);
                }
            };

            if next != state {
                log::debug!("Ingestion {:?} -> {:?}", state, next);
                state = next;
            }
        }
    }

    async fn connect(
        &mut self,
        stream: &mut Option<Box<dyn CommitStream>>,
        backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> Result<IngestionState, IngestionError> {
        if cancel.is_cancelled() {
            return Ok(IngestionState::Stopping);
        }

        // Always resume from what is durably stored
        let cursor = self
            .store
            .load_or_init_checkpoint(&self.settings.service)
            .await?
            .cursor;
        let resume = (cursor > 0).then_some(cursor);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(IngestionState::Stopping),
            opened = self.source.subscribe(resume) => opened,
        };

        match opened {
            Ok(active) => {
                log::info!("✅ Streaming from cursor {:?}", resume);
                *stream = Some(active);
                backoff.reset();
                Ok(IngestionState::Streaming)
            }
            Err(e) if e.is_transport() => {
                log::warn!("⚠️  Subscribe failed: {}", e);
                Ok(self.wait_to_reconnect(backoff, cancel).await)
            }
            Err(e) => Err(IngestionError::Stream(e)),
        }
    }

    async fn stream_next(
        &mut self,
        stream: &mut Option<Box<dyn CommitStream>>,
        progress: &mut Progress,
        backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> Result<IngestionState, IngestionError> {
        let Some(active) = stream.as_mut() else {
            return Ok(IngestionState::Connecting);
        };

        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(IngestionState::Stopping),
            delivered = active.next_event() => delivered,
        };

        match delivered {
            Some(Ok(event)) => {
                self.handle_event(event, progress).await?;
                Ok(IngestionState::Streaming)
            }
            Some(Err(e)) if e.is_transport() => {
                log::warn!("⚠️  Stream transport error: {}", e);
                self.drop_stream(stream, progress).await?;
                Ok(self.wait_to_reconnect(backoff, cancel).await)
            }
            Some(Err(e)) => {
                log::error!("❌ Unrecoverable stream error: {}", e);
                self.drop_stream(stream, progress).await?;
                Err(IngestionError::Stream(e))
            }
            None => {
                log::warn!("⚠️  Upstream closed the subscription");
                self.drop_stream(stream, progress).await?;
                Ok(self.wait_to_reconnect(backoff, cancel).await)
            }
        }
    }

    /// Close the current subscription and persist fully processed progress
    async fn drop_stream(
        &mut self,
        stream: &mut Option<Box<dyn CommitStream>>,
        progress: &mut Progress,
    ) -> Result<(), IngestionError> {
        if let Some(mut active) = stream.take() {
            active.close().await;
        }
        self.flush_checkpoint(progress).await
    }

    async fn wait_to_reconnect(
        &mut self,
        backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> IngestionState {
        let delay = backoff.next_delay();
        self.stats.reconnects += 1;
        log::warn!("⏳ Reconnect attempt {} in {:?}", backoff.attempt(), delay);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => IngestionState::Stopping,
            _ = tokio::time::sleep(delay) => IngestionState::Reconnecting,
        }
    }

    async fn handle_event(
        &mut self,
        event: StreamEvent,
        progress: &mut Progress,
    ) -> Result<(), IngestionError> {
        match event {
            StreamEvent::Commit(commit) => self.handle_commit(commit, progress).await,
            StreamEvent::Malformed { seq, reason } => {
                self.stats.malformed += 1;
                log::warn!("⚠️  Malformed commit envelope (seq {:?}): {}", seq, reason);
                Ok(())
            }
            StreamEvent::Other { kind } => {
                self.stats.other_frames += 1;
                log::debug!("Ignoring {} frame", kind);
                Ok(())
            }
        }
    }

    async fn handle_commit(
        &mut self,
        commit: Commit,
        progress: &mut Progress,
    ) -> Result<(), IngestionError> {
        if commit.is_heartbeat() {
            self.stats.heartbeats += 1;
        } else {
            let ops = match self.extractor.extract(&commit) {
                Ok(ops) => ops,
                Err(e) => {
                    self.stats.malformed += 1;
                    log::warn!("⚠️  Rejected commit: {}", e);
                    return Ok(());
                }
            };
            log::debug!(
                "Commit {} from {} at {}: {} creates, {} deletes",
                commit.seq,
                commit.repo,
                commit.time.as_deref().unwrap_or("?"),
                ops.creates.len(),
                ops.deletes.len()
            );
            self.apply(ops).await?;
            self.stats.commits += 1;
        }

        progress.last_processed = Some(commit.seq);
        if commit.seq.saturating_sub(progress.last_checkpointed) >= self.settings.checkpoint_interval {
            self.flush_checkpoint(progress).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, ops: ExtractedOps) -> Result<(), IngestionError> {
        let deletes: Vec<String> = ops.deletes.into_iter().map(|op| op.uri).collect();
        let mut creates = Vec::with_capacity(ops.creates.len());

        for create in ops.creates {
            match self.filter.decide(&create.author, &create.record.text) {
                FilterDecision::Kept(reason) => {
                    if reason == KeepReason::Allowed {
                        log::info!("⭐ Keeping post from allow-listed DID {}", create.author);
                    }
                    let reply = create.record.reply.as_ref();
                    creates.push(NewPost {
                        reply_parent: reply.map(|r| r.parent.uri.clone()),
                        reply_root: reply.map(|r| r.root.uri.clone()),
                        uri: create.uri,
                        cid: create.cid,
                        author: create.author,
                        indexed_at: Utc::now(),
                        text: Some(create.record.text),
                    });
                }
                FilterDecision::Rejected(RejectReason::Denied) => {
                    self.stats.denied += 1;
                    log::info!("🚫 Skipping post from denied DID {}", create.author);
                }
                FilterDecision::Rejected(RejectReason::NoMatch) => {
                    self.stats.unmatched += 1;
                }
            }
        }

        if !deletes.is_empty() {
            let removed = self.store.batch_delete_posts(&deletes).await?;
            self.stats.deleted += removed as u64;
            if removed > 0 {
                log::info!("🗑️  Deleted {} posts", removed);
            }
        }

        if !creates.is_empty() {
            self.store.batch_upsert_posts(&creates).await?;
            self.stats.created += creates.len() as u64;
            for post in &creates {
                log::info!("✅ Stored post {}", post.uri);
            }
        }

        Ok(())
    }

    async fn flush_checkpoint(&mut self, progress: &mut Progress) -> Result<(), IngestionError> {
        let Some(seq) = progress.pending() else {
            return Ok(());
        };

        let stored = self
            .store
            .save_checkpoint(&self.settings.service, seq, Utc::now())
            .await?;
        progress.last_checkpointed = stored;
        self.stats.checkpoints += 1;
        log::info!("📍 Checkpoint {} saved for {}", stored, self.settings.service);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firehose::filter::FilterRuleSet;
    use crate::firehose::types::{BlockSet, OpAction, RepoOp};
    use crate::store::sqlite::tests::{create_test_store, make_post};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Session = Vec<Result<StreamEvent, StreamError>>;

    /// Replays one scripted session per subscribe; cancels once out of sessions
    struct ScriptedSource {
        sessions: Mutex<VecDeque<Session>>,
        cursors: Mutex<Vec<Option<i64>>>,
        cancel: CancellationToken,
    }

    struct ScriptedStream(VecDeque<Result<StreamEvent, StreamError>>);

    #[async_trait]
    impl CommitStream for ScriptedStream {
        async fn next_event(&mut self) -> Option<Result<StreamEvent, StreamError>> {
            self.0.pop_front()
        }
    }

    #[async_trait]
    impl CommitSource for ScriptedSource {
        async fn subscribe(&self, cursor: Option<i64>) -> Result<Box<dyn CommitStream>, StreamError> {
            self.cursors.lock().unwrap().push(cursor);
            match self.sessions.lock().unwrap().pop_front() {
                Some(session) => Ok(Box::new(ScriptedStream(session.into()))),
                None => {
                    self.cancel.cancel();
                    Err(StreamError::Transport("script exhausted".to_string()))
                }
            }
        }
    }

    fn heartbeat(seq: i64) -> Result<StreamEvent, StreamError> {
        Ok(StreamEvent::Commit(Commit {
            repo: "did:plc:a".to_string(),
            seq,
            ops: vec![],
            blocks: BlockSet::new(),
            time: None,
        }))
    }

    fn settings(interval: i64) -> IngestionSettings {
        IngestionSettings {
            service: "test".to_string(),
            checkpoint_interval: interval,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
        }
    }

    fn ingestion_loop(
        sessions: Vec<Session>,
        store: Arc<dyn PostRepository>,
        interval: i64,
    ) -> (IngestionLoop, Arc<ScriptedSource>, CancellationToken) {
        let cancel = CancellationToken::new();
        let source = Arc::new(ScriptedSource {
            sessions: Mutex::new(sessions.into()),
            cursors: Mutex::new(Vec::new()),
            cancel: cancel.clone(),
        });
        let filter = PostFilter::from_rules(&FilterRuleSet::builtin().unwrap()).unwrap();
        let ingestion = IngestionLoop::new(source.clone(), store, filter, settings(interval));
        (ingestion, source, cancel)
    }

    #[tokio::test]
    async fn test_heartbeats_drive_checkpoint_cadence() {
        let (_temp, store) = create_test_store();
        let store = Arc::new(store);
        let session = (1..=7).map(heartbeat).collect();
        let (ingestion, _source, cancel) = ingestion_loop(vec![session], store.clone(), 3);

        let stats = ingestion.run(cancel).await.unwrap();

        assert_eq!(stats.heartbeats, 7);
        // 3 and 6 on cadence, 7 when the stream ends
        assert_eq!(stats.checkpoints, 3);
        assert_eq!(store.get_checkpoint("test").await.unwrap().unwrap().cursor, 7);
    }

    #[tokio::test]
    async fn test_reconnect_resumes_from_checkpoint() {
        let (_temp, store) = create_test_store();
        let store = Arc::new(store);
        let sessions = vec![
            vec![
                heartbeat(10),
                heartbeat(11),
                Err(StreamError::Transport("reset by peer".to_string())),
            ],
            vec![heartbeat(12)],
        ];
        let (ingestion, source, cancel) = ingestion_loop(sessions, store.clone(), 1_000);

        let stats = ingestion.run(cancel).await.unwrap();

        assert_eq!(
            *source.cursors.lock().unwrap(),
            vec![None, Some(11), Some(12)]
        );
        assert_eq!(stats.reconnects, 3);
        assert_eq!(store.get_checkpoint("test").await.unwrap().unwrap().cursor, 12);
    }

    #[tokio::test]
    async fn test_protocol_error_is_not_retried() {
        let (_temp, store) = create_test_store();
        let sessions = vec![vec![
            heartbeat(1),
            Err(StreamError::Protocol("unsupported frame version".to_string())),
        ]];
        let (ingestion, source, cancel) = ingestion_loop(sessions, Arc::new(store), 1_000);

        let result = ingestion.run(cancel).await;

        assert!(matches!(result, Err(IngestionError::Stream(StreamError::Protocol(_)))));
        assert_eq!(source.cursors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start_stops_cleanly() {
        let (_temp, store) = create_test_store();
        let (ingestion, source, cancel) = ingestion_loop(vec![], Arc::new(store), 1_000);
        cancel.cancel();

        let stats = ingestion.run(cancel).await.unwrap();

        assert_eq!(stats, IngestionStats::default());
        assert!(source.cursors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_only_commit_is_applied() {
        let (_temp, store) = create_test_store();
        store
            .batch_upsert_posts(&[make_post("at://did:plc:a/app.bsky.feed.post/gone", Utc::now())])
            .await
            .unwrap();
        let store = Arc::new(store);
        let delete = Ok(StreamEvent::Commit(Commit {
            repo: "did:plc:a".to_string(),
            seq: 4,
            ops: vec![RepoOp {
                action: OpAction::Delete,
                path: "app.bsky.feed.post/gone".to_string(),
                cid: None,
            }],
            blocks: BlockSet::new(),
            time: Some("2024-11-01T12:00:00Z".to_string()),
        }));
        let (ingestion, _source, cancel) = ingestion_loop(vec![vec![delete]], store.clone(), 1_000);

        let stats = ingestion.run(cancel).await.unwrap();

        assert_eq!(stats.heartbeats, 0);
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.deleted, 1);
        assert!(store.query_chronological(None, &[], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sequence_far_below_checkpoint_does_not_overflow() {
        let (_temp, store) = create_test_store();
        let store = Arc::new(store);
        store.save_checkpoint("test", i64::MAX, Utc::now()).await.unwrap();
        let sessions = vec![vec![heartbeat(i64::MIN)]];
        let (ingestion, _source, cancel) = ingestion_loop(sessions, store.clone(), 1);

        let stats = ingestion.run(cancel).await.unwrap();

        assert_eq!(stats.heartbeats, 1);
        assert_eq!(stats.checkpoints, 0);
        assert_eq!(store.get_checkpoint("test").await.unwrap().unwrap().cursor, i64::MAX);
    }

    #[tokio::test]
    async fn test_malformed_envelope_does_not_checkpoint() {
        let (_temp, store) = create_test_store();
        let store = Arc::new(store);
        let sessions = vec![vec![Ok(StreamEvent::Malformed {
            seq: Some(50),
            reason: "truncated".to_string(),
        })]];
        let (ingestion, _source, cancel) = ingestion_loop(sessions, store.clone(), 1);

        let stats = ingestion.run(cancel).await.unwrap();

        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.checkpoints, 0);
        assert_eq!(store.get_checkpoint("test").await.unwrap().unwrap().cursor, 0);
    }
}

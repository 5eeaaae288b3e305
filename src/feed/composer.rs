//! Two-source feed composition
//!
//! Interleaves a chronological source with a score-ranked source into one
//! deduplicated page. Each call is stateless: everything needed to resume
//! lives in the returned [`FeedCursor`].

use super::cursor::{CursorError, FeedCursor, PaginationCursor, MAX_RANKED_OFFSET};
use crate::store::{ChronoPosition, Post, PostRepository, StoreError};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

pub const DEFAULT_RANKED_WINDOW_HOURS: i64 = 24;
pub const DEFAULT_MIN_INTERACTIONS: i64 = 30;

/// Largest page served; bigger requests are clamped
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("limit must be a positive integer, got {0}")]
    InvalidLimit(i64),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Chronological,
    Ranked,
}

#[derive(Debug, Clone)]
pub struct ComposerSettings {
    /// Repeating slot pattern, e.g. two chronological then one ranked
    pub pattern: Vec<(Source, usize)>,
    pub ranked_window: Duration,
    pub min_interactions: i64,
}

impl Default for ComposerSettings {
    fn default() -> Self {
        Self {
            pattern: vec![(Source::Chronological, 2), (Source::Ranked, 1)],
            ranked_window: Duration::hours(DEFAULT_RANKED_WINDOW_HOURS),
            min_interactions: DEFAULT_MIN_INTERACTIONS,
        }
    }
}

impl ComposerSettings {
    fn period(&self) -> usize {
        self.pattern.iter().map(|(_, n)| n).sum::<usize>().max(1)
    }

    /// Requested limit clamped to [`MAX_PAGE_SIZE`], then rounded up to a
    /// whole number of pattern periods without exceeding the clamp
    fn page_size(&self, limit: u64) -> usize {
        let period = self.period();
        let requested = limit.min(MAX_PAGE_SIZE as u64) as usize;
        let ceiling = (MAX_PAGE_SIZE / period).max(1) * period;
        (requested.div_ceil(period) * period).min(ceiling)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    pub feed: Vec<String>,
    pub cursor: FeedCursor,
}

impl FeedPage {
    fn eof(feed: Vec<String>) -> Self {
        Self {
            feed,
            cursor: FeedCursor::Eof,
        }
    }
}

pub struct FeedComposer {
    store: Arc<dyn PostRepository>,
    settings: ComposerSettings,
}

impl FeedComposer {
    pub fn new(store: Arc<dyn PostRepository>, settings: ComposerSettings) -> Self {
        Self { store, settings }
    }

    pub async fn compose(&self, cursor: Option<&str>, limit: i64) -> Result<FeedPage, FeedError> {
        self.compose_at(cursor, limit, Utc::now()).await
    }

    /// Compose one page with `now` anchoring the ranked window
    pub async fn compose_at(
        &self,
        cursor: Option<&str>,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<FeedPage, FeedError> {
        if limit <= 0 {
            return Err(FeedError::InvalidLimit(limit));
        }

        // Preview request: newest post only, cursor ignored
        if limit == 1 {
            let newest = self.store.query_chronological(None, &[], 1).await?;
            return Ok(FeedPage::eof(newest.into_iter().map(|p| p.uri).collect()));
        }

        let incoming = match cursor.map(FeedCursor::parse).transpose()? {
            None => PaginationCursor::default(),
            Some(FeedCursor::Eof) => return Ok(FeedPage::eof(Vec::new())),
            Some(FeedCursor::Next(cursor)) => cursor,
        };

        let period = self.settings.period();
        let limit = self.settings.page_size(limit as u64);

        // Ranked posts served on earlier pages are fetched too, so the
        // chronological source can skip them as well as this page's picks.
        // No ranked post is drawn past MAX_RANKED_OFFSET.
        let offset = incoming.ranked_offset.min(MAX_RANKED_OFFSET) as usize;
        let ranked_budget = limit.min(MAX_RANKED_OFFSET as usize - offset);
        let mut ranked = self
            .store
            .query_ranked(
                now - self.settings.ranked_window,
                self.settings.min_interactions,
                0,
                offset + ranked_budget,
            )
            .await?;
        let mut excluded: Vec<String> = ranked.iter().map(|p| p.uri.clone()).collect();
        let ranked = ranked.split_off(offset.min(ranked.len()));
        let ranked_fetched = ranked.len();

        let chronological = self
            .store
            .query_chronological(incoming.chronological.as_ref(), &excluded, limit)
            .await?;

        log::debug!(
            "Composing {} from {} ranked (offset {}) and {} chronological",
            limit,
            ranked_fetched,
            incoming.ranked_offset,
            chronological.len()
        );

        let mut page = Interleaver::new(chronological, ranked, limit);
        for _ in 0..limit / period {
            for &(source, count) in &self.settings.pattern {
                for _ in 0..count {
                    if !page.fill_slot(source) {
                        break;
                    }
                }
            }
        }
        page.top_up();

        let emitted = page.finish();
        let ranked_left = page.ranked.len();

        let next = PaginationCursor {
            chronological: page.last_chronological.or(incoming.chronological),
            ranked_offset: (offset + page.ranked_emitted) as u64,
        };

        let more_ranked = (ranked_budget > 0 && ranked_fetched == ranked_budget) || ranked_left > 0;
        excluded.extend(emitted.iter().cloned());
        let more_chronological = !self
            .store
            .query_chronological(next.chronological.as_ref(), &excluded, 1)
            .await?
            .is_empty();

        let cursor = if more_ranked || more_chronological {
            FeedCursor::Next(next)
        } else {
            FeedCursor::Eof
        };

        log::info!(
            "📰 Served {} posts ({} ranked), next cursor {}",
            emitted.len(),
            page.ranked_emitted,
            cursor
        );

        Ok(FeedPage {
            feed: emitted,
            cursor,
        })
    }
}

/// Page under construction
struct Interleaver {
    chronological: std::vec::IntoIter<Post>,
    ranked: std::vec::IntoIter<Post>,
    limit: usize,
    page: Vec<Post>,
    seen: HashSet<String>,
    last_chronological: Option<ChronoPosition>,
    ranked_emitted: usize,
}

impl Interleaver {
    fn new(chronological: Vec<Post>, ranked: Vec<Post>, limit: usize) -> Self {
        Self {
            chronological: chronological.into_iter(),
            ranked: ranked.into_iter(),
            limit,
            page: Vec::with_capacity(limit),
            seen: HashSet::with_capacity(limit),
            last_chronological: None,
            ranked_emitted: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.page.len() >= self.limit
    }

    fn take(&mut self, source: Source) -> Option<Post> {
        match source {
            Source::Chronological => self.chronological.next(),
            Source::Ranked => self.ranked.next(),
        }
    }

    /// Fill one pattern slot, falling back to the other source when the
    /// preferred one is exhausted. False once the page is full or both
    /// sources are drained.
    fn fill_slot(&mut self, preferred: Source) -> bool {
        if self.is_full() {
            return false;
        }

        let other = match preferred {
            Source::Chronological => Source::Ranked,
            Source::Ranked => Source::Chronological,
        };
        let (post, source) = match self.take(preferred) {
            Some(post) => (post, preferred),
            None => match self.take(other) {
                Some(post) => (post, other),
                None => return false,
            },
        };

        self.push(post, source);
        true
    }

    fn push(&mut self, post: Post, source: Source) {
        if !self.seen.insert(post.uri.clone()) {
            return;
        }
        match source {
            Source::Chronological => self.last_chronological = Some(post.position()),
            Source::Ranked => self.ranked_emitted += 1,
        }
        self.page.push(post);
    }

    fn top_up(&mut self) {
        while !self.is_full() {
            match self.chronological.next() {
                Some(post) => self.push(post, Source::Chronological),
                None => break,
            }
        }
    }

    /// Truncate, drop any repeated uri, return the uris in page order
    fn finish(&mut self) -> Vec<String> {
        self.page.truncate(self.limit);
        let mut unique = HashSet::with_capacity(self.page.len());
        self.page
            .iter()
            .filter(|post| unique.insert(post.uri.as_str()))
            .map(|post| post.uri.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::tests::{create_test_store, make_post};
    use crate::store::{InteractionUpdate, SqlitePostStore};

    async fn seed(store: &SqlitePostStore, now: DateTime<Utc>, chrono: usize, ranked: &[i64]) {
        let mut posts = Vec::new();
        for i in 0..chrono {
            posts.push(make_post(
                &format!("at://did:plc:a/app.bsky.feed.post/c{:02}", i),
                now - Duration::minutes(i as i64 + 1),
            ));
        }
        for (i, _) in ranked.iter().enumerate() {
            posts.push(make_post(
                &format!("at://did:plc:a/app.bsky.feed.post/r{:02}", i),
                now - Duration::hours(2) - Duration::minutes(i as i64),
            ));
        }
        store.batch_upsert_posts(&posts).await.unwrap();

        let updates: Vec<_> = ranked
            .iter()
            .enumerate()
            .map(|(i, &score)| InteractionUpdate {
                uri: format!("at://did:plc:a/app.bsky.feed.post/r{:02}", i),
                interactions: score,
                text: None,
            })
            .collect();
        store.bulk_update_interactions(&updates).await.unwrap();
    }

    fn composer(store: SqlitePostStore) -> FeedComposer {
        FeedComposer::new(Arc::new(store), ComposerSettings::default())
    }

    #[tokio::test]
    async fn test_pattern_with_exhausted_ranked_source() {
        let (_temp, store) = create_test_store();
        let now = Utc::now();
        seed(&store, now, 12, &[500, 100]).await;

        let page = composer(store).compose_at(None, 9, now).await.unwrap();

        let short: Vec<_> = page.feed.iter().map(|u| u.rsplit('/').next().unwrap()).collect();
        assert_eq!(short, vec!["c00", "c01", "r00", "c02", "c03", "r01", "c04", "c05", "c06"]);

        let FeedCursor::Next(cursor) = page.cursor else {
            panic!("expected more pages");
        };
        assert_eq!(cursor.ranked_offset, 2);
        assert!(cursor.chronological.unwrap().uri.ends_with("/c06"));
    }

    #[tokio::test]
    async fn test_limit_rounds_up_to_pattern_period() {
        let (_temp, store) = create_test_store();
        let now = Utc::now();
        seed(&store, now, 20, &[]).await;

        let page = composer(store).compose_at(None, 4, now).await.unwrap();
        assert_eq!(page.feed.len(), 6);
    }

    #[tokio::test]
    async fn test_pages_walk_to_eof_without_repeats() {
        let (_temp, store) = create_test_store();
        let now = Utc::now();
        seed(&store, now, 10, &[90, 80, 70]).await;
        let composer = composer(store);

        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        for _ in 0..10 {
            let page = composer.compose_at(cursor.as_deref(), 6, now).await.unwrap();
            for uri in &page.feed {
                assert!(seen.insert(uri.clone()), "{} served twice", uri);
            }
            match page.cursor {
                FeedCursor::Eof => break,
                next => cursor = Some(next.to_string()),
            }
        }

        assert_eq!(seen.len(), 13);
        let again = composer.compose_at(Some("eof"), 6, now).await.unwrap();
        assert!(again.feed.is_empty());
        assert!(again.cursor.is_eof());
    }

    #[tokio::test]
    async fn test_ranked_source_respects_window_and_threshold() {
        let (_temp, store) = create_test_store();
        let now = Utc::now();
        seed(&store, now, 3, &[29]).await;
        store
            .batch_upsert_posts(&[make_post("at://did:plc:a/app.bsky.feed.post/stale", now - Duration::hours(30))])
            .await
            .unwrap();
        store
            .bulk_update_interactions(&[InteractionUpdate {
                uri: "at://did:plc:a/app.bsky.feed.post/stale".to_string(),
                interactions: 1000,
                text: None,
            }])
            .await
            .unwrap();

        let page = composer(store).compose_at(None, 3, now).await.unwrap();
        // nothing qualifies as ranked: pure chronological order
        let short: Vec<_> = page.feed.iter().map(|u| u.rsplit('/').next().unwrap()).collect();
        assert_eq!(short, vec!["c00", "c01", "c02"]);
    }

    #[tokio::test]
    async fn test_limit_one_returns_newest_and_eof() {
        let (_temp, store) = create_test_store();
        let now = Utc::now();
        seed(&store, now, 3, &[100]).await;

        let page = composer(store).compose_at(None, 1, now).await.unwrap();
        assert_eq!(page.feed, vec!["at://did:plc:a/app.bsky.feed.post/c00".to_string()]);
        assert!(page.cursor.is_eof());
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let (_temp, store) = create_test_store();
        let composer = composer(store);

        assert!(matches!(
            composer.compose(None, 0).await,
            Err(FeedError::InvalidLimit(0))
        ));
        assert!(matches!(
            composer.compose(Some("{broken"), 5).await,
            Err(FeedError::Cursor(_))
        ));
    }

    #[test]
    fn test_page_size_is_clamped() {
        let settings = ComposerSettings::default();
        assert_eq!(settings.page_size(4), 6);
        assert_eq!(settings.page_size(99), 99);
        assert_eq!(settings.page_size(100), 99);
        assert_eq!(settings.page_size(i64::MAX as u64), 99);
    }

    #[tokio::test]
    async fn test_huge_limit_serves_one_bounded_page() {
        let (_temp, store) = create_test_store();
        let now = Utc::now();
        seed(&store, now, 120, &[]).await;

        let page = composer(store).compose_at(None, i64::MAX, now).await.unwrap();

        assert_eq!(page.feed.len(), 99);
        assert!(!page.cursor.is_eof());
    }

    #[tokio::test]
    async fn test_crafted_offset_is_a_cursor_error() {
        let (_temp, store) = create_test_store();
        let composer = composer(store);

        let result = composer
            .compose(Some(r#"{"trending_posts_offset":18446744073709551615}"#), 6)
            .await;

        assert!(matches!(
            result,
            Err(FeedError::Cursor(CursorError::OffsetOutOfRange(_)))
        ));
    }

    #[tokio::test]
    async fn test_ranked_source_stops_at_offset_bound() {
        let (_temp, store) = create_test_store();
        let now = Utc::now();
        let ranked_count = MAX_RANKED_OFFSET as usize;

        let mut posts: Vec<_> = (0..5)
            .map(|i| {
                make_post(
                    &format!("at://did:plc:a/app.bsky.feed.post/c{:02}", i),
                    now - Duration::minutes(i as i64 + 1),
                )
            })
            .collect();
        let ranked_uris: Vec<String> = (0..ranked_count)
            .map(|i| format!("at://did:plc:a/app.bsky.feed.post/r{:05}", i))
            .collect();
        for (i, uri) in ranked_uris.iter().enumerate() {
            posts.push(make_post(uri, now - Duration::hours(2) - Duration::seconds(i as i64)));
        }
        store.batch_upsert_posts(&posts).await.unwrap();
        let updates: Vec<_> = ranked_uris
            .iter()
            .map(|uri| InteractionUpdate {
                uri: uri.clone(),
                interactions: 100,
                text: None,
            })
            .collect();
        store.bulk_update_interactions(&updates).await.unwrap();
        let composer = composer(store);

        // Three ranked posts left before the bound; every served one is excluded
        // from the chronological side through one bind list
        let near = format!(r#"{{"trending_posts_offset":{}}}"#, MAX_RANKED_OFFSET - 3);
        let page = composer.compose_at(Some(near.as_str()), 6, now).await.unwrap();
        let short: Vec<_> = page.feed.iter().map(|u| u.rsplit('/').next().unwrap()).collect();
        assert_eq!(short, vec!["c00", "c01", "r09997", "c02", "c03", "r09998"]);
        let FeedCursor::Next(cursor) = page.cursor else {
            panic!("expected more pages");
        };
        assert_eq!(cursor.ranked_offset, MAX_RANKED_OFFSET - 1);

        // At the bound only chronological posts remain
        let at_bound = format!(r#"{{"trending_posts_offset":{}}}"#, MAX_RANKED_OFFSET);
        let page = composer.compose_at(Some(at_bound.as_str()), 6, now).await.unwrap();
        let short: Vec<_> = page.feed.iter().map(|u| u.rsplit('/').next().unwrap()).collect();
        assert_eq!(short, vec!["c00", "c01", "c02", "c03", "c04"]);
        assert!(page.cursor.is_eof());
    }

    #[tokio::test]
    async fn test_empty_store_is_eof() {
        let (_temp, store) = create_test_store();
        let page = composer(store).compose(None, 30).await.unwrap();
        assert!(page.feed.is_empty());
        assert!(page.cursor.is_eof());
    }
}

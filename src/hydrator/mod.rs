//! Interaction hydration
//!
//! Periodically re-fetches engagement counters for recently indexed posts and
//! stores a time-decayed score in `interactions`. A rate-limited batch aborts
//! the rest of the run; what happens next is decided by the schedule (see
//! [`schedule::RateLimitPolicy`]).

pub mod client;
pub mod schedule;
pub mod score;

use crate::store::{InteractionUpdate, PostRepository, StoreError};
use chrono::{DateTime, Duration, Utc};
use client::{EngagementError, EngagementSource};
use std::collections::HashMap;
use std::sync::Arc;

pub use client::{CredentialStore, PostEngagement, XrpcEngagementClient};
pub use schedule::{HydrationSchedule, RateLimitPolicy};
pub use score::{hot_score, Engagement};

pub const DEFAULT_BATCH_SIZE: usize = 25;
pub const DEFAULT_RECENCY_DAYS: i64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum HydrationError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrationReport {
    pub candidates: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub fetched: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydrationOutcome {
    Completed(HydrationReport),
    /// Remaining batches were skipped; upstream asks to wait until `reset_at`
    RateLimited {
        reset_at: DateTime<Utc>,
        report: HydrationReport,
    },
}

pub struct InteractionHydrator {
    store: Arc<dyn PostRepository>,
    source: Arc<dyn EngagementSource>,
    recency_window: Duration,
}

impl InteractionHydrator {
    pub fn new(
        store: Arc<dyn PostRepository>,
        source: Arc<dyn EngagementSource>,
        recency_days: i64,
    ) -> Self {
        Self {
            store,
            source,
            recency_window: Duration::days(recency_days),
        }
    }

    pub async fn hydrate(&self, batch_size: usize) -> Result<HydrationOutcome, HydrationError> {
        self.hydrate_at(batch_size, Utc::now()).await
    }

    /// One hydration pass with `now` as the scoring clock
    pub async fn hydrate_at(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<HydrationOutcome, HydrationError> {
        let candidates = self
            .store
            .posts_indexed_since(now - self.recency_window)
            .await?;

        let mut report = HydrationReport {
            candidates: candidates.len(),
            ..HydrationReport::default()
        };

        if candidates.is_empty() {
            log::info!("💧 No posts found to hydrate");
            return Ok(HydrationOutcome::Completed(report));
        }

        let known: HashMap<&str, _> = candidates.iter().map(|c| (c.uri.as_str(), c)).collect();

        for chunk in candidates.chunks(batch_size.max(1)) {
            let uris: Vec<String> = chunk.iter().map(|c| c.uri.clone()).collect();
            report.batches += 1;

            let fetched = match self.source.fetch_engagement(&uris).await {
                Ok(fetched) => fetched,
                Err(EngagementError::RateLimited { reset_at }) => {
                    log::warn!(
                        "⏳ Rate limited during hydration after {} batches, next attempt at {}",
                        report.batches - 1,
                        reset_at
                    );
                    return Ok(HydrationOutcome::RateLimited { reset_at, report });
                }
                Err(e) => {
                    log::error!("❌ Hydration batch of {} failed: {}", uris.len(), e);
                    report.failed_batches += 1;
                    continue;
                }
            };
            report.fetched += fetched.len();

            let updates: Vec<InteractionUpdate> = fetched
                .into_iter()
                .filter_map(|post| {
                    let current = known.get(post.uri.as_str())?;
                    let interactions = score::stored_score(&post.engagement, post.indexed_at, now);
                    let text = if current.has_text { None } else { post.text };

                    if interactions == current.interactions && text.is_none() {
                        return None;
                    }
                    Some(InteractionUpdate {
                        uri: post.uri,
                        interactions,
                        text,
                    })
                })
                .collect();

            if !updates.is_empty() {
                report.updated += self.store.bulk_update_interactions(&updates).await?;
            }
        }

        if report.updated > 0 {
            log::info!("💧 Hydrated {} posts with updated scores", report.updated);
        } else {
            log::info!("💧 No posts needed updating based on the latest interactions");
        }

        Ok(HydrationOutcome::Completed(report))
    }
}

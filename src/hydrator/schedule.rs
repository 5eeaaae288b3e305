//! Coupling between hydration runs and the scheduler
//!
//! The periodic hydration job and its rate-limit handling are explicit state
//! transitions:
//!
//! ```text
//! periodic run -> Completed                 : nothing to do
//! periodic run -> RateLimited (Defer)       : pause periodic, register one-shot at reset
//! one-shot run -> Completed                 : resume periodic
//! one-shot run -> RateLimited (Defer)       : register another one-shot at the new reset
//! any run      -> RateLimited (Fail)        : job fails; the next trigger retries
//! ```

use super::{HydrationError, HydrationOutcome, InteractionHydrator};
use crate::scheduler::{Job, JobId, Scheduler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub const PERIODIC_JOB_NAME: &str = "hydrate_posts_interval";
pub const DEFERRED_JOB_NAME: &str = "hydrate_posts_once";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// Pause the periodic trigger and retry once at the reset time
    #[default]
    Defer,
    /// Fail the run and leave retrying to whatever triggers the job
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rate limit policy {0:?} (expected \"defer\" or \"fail\")")]
pub struct UnknownPolicy(String);

impl FromStr for RateLimitPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "defer" => Ok(RateLimitPolicy::Defer),
            "fail" => Ok(RateLimitPolicy::Fail),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

struct Shared {
    hydrator: Arc<InteractionHydrator>,
    batch_size: usize,
    policy: RateLimitPolicy,
    scheduler: Scheduler,
    periodic: OnceLock<JobId>,
}

/// Owns the periodic hydration job registration
pub struct HydrationSchedule {
    shared: Arc<Shared>,
}

impl HydrationSchedule {
    pub fn new(
        hydrator: Arc<InteractionHydrator>,
        batch_size: usize,
        policy: RateLimitPolicy,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                hydrator,
                batch_size,
                policy,
                scheduler,
                periodic: OnceLock::new(),
            }),
        }
    }

    /// Register the periodic job. Registering twice keeps the first id.
    pub fn register(&self, every: Duration) -> JobId {
        if let Some(id) = self.shared.periodic.get() {
            return *id;
        }

        let id = self
            .shared
            .scheduler
            .register_periodic(every, self.periodic_job());
        let _ = self.shared.periodic.set(id);
        log::info!(
            "💧 Hydration every {:?}, batch size {}, rate limit policy {:?}",
            every,
            self.shared.batch_size,
            self.shared.policy
        );
        id
    }

    pub fn periodic_id(&self) -> Option<JobId> {
        self.shared.periodic.get().copied()
    }

    pub fn periodic_job(&self) -> Arc<HydrationJob> {
        Arc::new(HydrationJob {
            shared: self.shared.clone(),
            deferred: false,
        })
    }
}

pub struct HydrationJob {
    shared: Arc<Shared>,
    deferred: bool,
}

impl HydrationJob {
    fn defer_until(&self, reset_at: DateTime<Utc>) -> anyhow::Result<()> {
        let shared = &self.shared;

        if let Some(id) = shared.periodic.get() {
            shared.scheduler.pause(*id)?;
        }
        shared.scheduler.register_once(
            reset_at,
            Arc::new(HydrationJob {
                shared: shared.clone(),
                deferred: true,
            }),
        );

        log::warn!("⏸️  Hydration deferred until {}", reset_at);
        Ok(())
    }
}

#[async_trait]
impl Job for HydrationJob {
    fn name(&self) -> &str {
        if self.deferred {
            DEFERRED_JOB_NAME
        } else {
            PERIODIC_JOB_NAME
        }
    }

    async fn run(&self) -> anyhow::Result<()> {
        let shared = &self.shared;

        match shared.hydrator.hydrate(shared.batch_size).await? {
            HydrationOutcome::Completed(report) => {
                log::debug!("Hydration report: {:?}", report);
                if self.deferred {
                    if let Some(id) = shared.periodic.get() {
                        shared.scheduler.resume(*id)?;
                    }
                }
                Ok(())
            }
            HydrationOutcome::RateLimited { reset_at, .. } => match shared.policy {
                RateLimitPolicy::Defer => self.defer_until(reset_at),
                RateLimitPolicy::Fail => Err(HydrationError::RateLimited { reset_at }.into()),
            },
        }
    }
}

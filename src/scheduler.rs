//! In-process job scheduler
//!
//! Periodic and one-shot jobs on the Tokio runtime. Each periodic job runs
//! inside its own task, so a job never overlaps with itself; different jobs
//! run concurrently. Pausing a periodic job skips its ticks until resumed.
//! Registering a one-shot job replaces any pending one-shot job with the same
//! name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown job {0}")]
    UnknownJob(JobId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Periodic,
    Once,
}

struct JobEntry {
    name: String,
    trigger: Trigger,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    job: Arc<dyn Job>,
}

struct Inner {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    shutdown: CancellationToken,
}

/// Cheap to clone; all clones drive the same job table
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_job(job: &dyn Job) {
    let started = std::time::Instant::now();
    log::info!("▶️  Running job {}", job.name());

    match job.run().await {
        Ok(()) => log::info!("✅ Job {} finished in {:?}", job.name(), started.elapsed()),
        Err(e) => log::error!("❌ Job {} failed: {:#}", job.name(), e),
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                jobs: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self, trigger: Trigger, job: &Arc<dyn Job>) -> (JobId, Arc<AtomicBool>, CancellationToken) {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let paused = Arc::new(AtomicBool::new(false));
        let cancel = self.inner.shutdown.child_token();

        self.jobs().insert(
            id,
            JobEntry {
                name: job.name().to_string(),
                trigger,
                paused: paused.clone(),
                cancel: cancel.clone(),
                job: job.clone(),
            },
        );
        (id, paused, cancel)
    }

    /// Run `job` every `every`, first run one interval from now.
    /// Must be called from within a Tokio runtime.
    pub fn register_periodic(&self, every: Duration, job: Arc<dyn Job>) -> JobId {
        let every = every.max(Duration::from_millis(1));
        let (id, paused, cancel) = self.allocate(Trigger::Periodic, &job);

        log::info!("🗓️  Registered periodic job {} {} every {:?}", job.name(), id, every);

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if paused.load(Ordering::SeqCst) {
                    log::debug!("⏸️  {} paused, skipping tick", job.name());
                    continue;
                }
                run_job(job.as_ref()).await;
            }
        });

        id
    }

    /// Run `job` once at `at` (immediately if `at` has passed). A pending
    /// one-shot job with the same name is cancelled and replaced.
    pub fn register_once(&self, at: DateTime<Utc>, job: Arc<dyn Job>) -> JobId {
        let replaced: Vec<JobId> = self
            .jobs()
            .iter()
            .filter(|(_, entry)| entry.trigger == Trigger::Once && entry.name == job.name())
            .map(|(id, _)| *id)
            .collect();
        for id in replaced {
            self.remove(id);
        }

        let (id, paused, cancel) = self.allocate(Trigger::Once, &job);
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        log::info!("🗓️  Registered one-shot job {} {} at {}", job.name(), id, at);

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if paused.load(Ordering::SeqCst) {
                log::info!("⏸️  One-shot job {} was paused, dropping it", job.name());
            } else {
                run_job(job.as_ref()).await;
            }
            scheduler.jobs().remove(&id);
        });

        id
    }

    pub fn pause(&self, id: JobId) -> Result<(), SchedulerError> {
        let jobs = self.jobs();
        let entry = jobs.get(&id).ok_or(SchedulerError::UnknownJob(id))?;
        if !entry.paused.swap(true, Ordering::SeqCst) {
            log::info!("⏸️  Paused job {} {}", entry.name, id);
        }
        Ok(())
    }

    pub fn resume(&self, id: JobId) -> Result<(), SchedulerError> {
        let jobs = self.jobs();
        let entry = jobs.get(&id).ok_or(SchedulerError::UnknownJob(id))?;
        if entry.paused.swap(false, Ordering::SeqCst) {
            log::info!("▶️  Resumed job {} {}", entry.name, id);
        }
        Ok(())
    }

    pub fn is_paused(&self, id: JobId) -> Result<bool, SchedulerError> {
        self.jobs()
            .get(&id)
            .map(|entry| entry.paused.load(Ordering::SeqCst))
            .ok_or(SchedulerError::UnknownJob(id))
    }

    /// Id of a registered (or still pending) job by name
    pub fn find(&self, name: &str) -> Option<JobId> {
        self.jobs()
            .iter()
            .find(|(_, entry)| entry.name == name)
            .map(|(id, _)| *id)
    }

    /// Run a registered job once right away, outside its trigger
    pub fn run_now(&self, id: JobId) -> Result<(), SchedulerError> {
        let job = self
            .jobs()
            .get(&id)
            .map(|entry| entry.job.clone())
            .ok_or(SchedulerError::UnknownJob(id))?;

        tokio::spawn(async move {
            run_job(job.as_ref()).await;
        });
        Ok(())
    }

    /// Cancel and forget a job; returns whether it existed
    pub fn remove(&self, id: JobId) -> bool {
        match self.jobs().remove(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                log::debug!("Removed job {} {}", entry.name, id);
                true
            }
            None => false,
        }
    }

    /// Stop every job. Runs already in progress finish on their own.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.jobs().clear();
        log::info!("🛑 Scheduler shut down");
    }
}

//! Feed generator runtime
//!
//! Runs the commit-stream ingestion loop in the foreground and the
//! hydration and housekeeping jobs on the internal scheduler. CTRL+C stops
//! ingestion after a final checkpoint.
//!
//! Usage:
//!   cargo run --release --bin feedgen
//!
//! See `FeedgenConfig::from_env` for the environment variables.

use anyhow::Context;
use log::{error, info, warn};
use skyfeed::config::FeedgenConfig;
use skyfeed::firehose::{
    FilterRuleSet, IngestionLoop, IngestionSettings, PostFilter, WebSocketCommitSource,
};
use skyfeed::hydrator::{CredentialStore, HydrationSchedule, InteractionHydrator, XrpcEngagementClient};
use skyfeed::scheduler::Scheduler;
use skyfeed::store::housekeeping::HousekeepingJob;
use skyfeed::store::SqlitePostStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = FeedgenConfig::from_env().context("invalid configuration")?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("⚠️  Crypto provider already installed");
    }

    info!("🚀 Starting feed generator");
    info!("   ├─ Log filter: {}", config.rust_log.as_deref().unwrap_or("info"));
    info!("   ├─ Database: {}", config.db_path.display());
    info!("   ├─ Firehose: {}", config.firehose_url);
    info!("   ├─ Checkpoint interval: {}", config.checkpoint_interval);
    info!(
        "   └─ Filter rules: {}",
        config
            .filter_rules
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "bundled".to_string())
    );

    let store = Arc::new(SqlitePostStore::open(&config.db_path)?);

    let rules = match &config.filter_rules {
        Some(path) => FilterRuleSet::from_path(path)?,
        None => FilterRuleSet::builtin()?,
    }
    .with_identities(&config.allow_dids, &config.deny_dids);
    let filter = PostFilter::from_rules(&rules)?;

    let scheduler = Scheduler::new();
    let mut jobs = Vec::new();

    match &config.credentials {
        Some(credentials) => {
            let session_store: Arc<dyn CredentialStore> = store.clone();
            let client = XrpcEngagementClient::new(
                config.api_url.as_str(),
                credentials.handle.as_str(),
                credentials.password.as_str(),
                session_store,
            )?;
            let hydrator = Arc::new(InteractionHydrator::new(
                store.clone(),
                Arc::new(client),
                config.hydration_window_days,
            ));
            let schedule = HydrationSchedule::new(
                hydrator,
                config.hydration_batch_size,
                config.rate_limit_policy,
                scheduler.clone(),
            );
            jobs.push(schedule.register(Duration::from_secs(config.hydration_interval_mins * 60)));
        }
        None => warn!("⚠️  HANDLE/PASSWORD not set, interaction hydration disabled"),
    }

    let housekeeping = HousekeepingJob::new(store.as_ref().clone(), config.cleanup_days);
    jobs.push(scheduler.register_periodic(
        Duration::from_secs(config.cleanup_interval_hours * 3600),
        Arc::new(housekeeping),
    ));
    info!(
        "🧹 Cleanup every {}h, keeping {} days",
        config.cleanup_interval_hours, config.cleanup_days
    );

    if config.run_jobs_on_start {
        info!("⚡ Running {} scheduled jobs now", jobs.len());
        for id in jobs {
            if let Err(e) = scheduler.run_now(id) {
                warn!("⚠️  Could not start job {}: {}", id, e);
            }
        }
    }

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
            Err(e) => {
                error!("❌ Failed to listen for CTRL+C: {}", e);
                return;
            }
        }
        signal.cancel();
    });

    info!("🔄 Press CTRL+C to shutdown gracefully");

    let settings = IngestionSettings {
        service: config.subscription_service.clone(),
        checkpoint_interval: config.checkpoint_interval,
        ..IngestionSettings::default()
    };
    let source = Arc::new(WebSocketCommitSource::new(config.firehose_url.as_str()));
    let result = IngestionLoop::new(source, store.clone(), filter, settings)
        .run(cancel)
        .await;

    scheduler.shutdown();

    match result {
        Ok(stats) => {
            info!("✅ Feed generator stopped");
            info!("   ├─ Commits: {}", stats.commits);
            info!("   ├─ Posts created: {}", stats.created);
            info!("   ├─ Posts deleted: {}", stats.deleted);
            info!("   └─ Reconnects: {}", stats.reconnects);
            Ok(())
        }
        Err(e) => {
            error!("❌ Ingestion stopped: {}", e);
            Err(e.into())
        }
    }
}

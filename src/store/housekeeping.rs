//! Database housekeeping: backup, retention pruning and vacuum

use super::{SqlitePostStore, StoreResult};
use crate::scheduler::Job;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use std::path::PathBuf;

impl SqlitePostStore {
    /// Sibling file the backup is written to: `feed.db` -> `feed_backup.db`
    pub fn backup_path(&self) -> PathBuf {
        let path = self.path();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "feed".to_string());
        let name = match path.extension() {
            Some(ext) => format!("{}_backup.{}", stem, ext.to_string_lossy()),
            None => format!("{}_backup", stem),
        };
        path.with_file_name(name)
    }

    /// Write a consistent snapshot of the database next to the live file.
    /// An existing backup is replaced.
    pub fn backup(&self) -> StoreResult<PathBuf> {
        let target = self.backup_path();
        if target.exists() {
            std::fs::remove_file(&target)?;
        }

        let conn = self.conn()?;
        conn.execute("VACUUM INTO ?1", params![target.to_string_lossy().into_owned()])?;

        log::info!("💾 Database backup created at {}", target.display());
        Ok(target)
    }

    /// Delete every post indexed before `cutoff`
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM post WHERE indexed_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        tx.commit()?;

        log::info!("🧹 Deleted {} posts older than {}", deleted, cutoff);
        Ok(deleted)
    }

    pub fn vacuum(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch("VACUUM;")?;
        log::info!("🧹 Database vacuumed to reclaim space");
        Ok(())
    }
}

/// Periodic cleanup: backup, prune posts past retention, vacuum
pub struct HousekeepingJob {
    store: SqlitePostStore,
    retention: Duration,
}

impl HousekeepingJob {
    pub fn new(store: SqlitePostStore, retention_days: i64) -> Self {
        Self {
            store,
            retention: Duration::days(retention_days),
        }
    }

    pub fn run_at(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        // A failed backup must not block pruning
        if let Err(e) = self.store.backup() {
            log::error!("❌ Failed to back up database: {}", e);
        }

        let deleted = self.store.prune_older_than(now - self.retention)?;
        self.store.vacuum()?;
        Ok(deleted)
    }
}

#[async_trait]
impl Job for HousekeepingJob {
    fn name(&self) -> &str {
        "cleanup_db"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.run_at(Utc::now())?;
        Ok(())
    }
}

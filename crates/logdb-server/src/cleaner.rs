//! Retention cleaner worker
//!
//! Wakes every [`CLEANER_TICK`], ticks liveness, and once per cleanup period
//! deletes rows whose device time is older than the retention window.

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::config::{CleanerConfig, Config};
use crate::error::{StoreError, WorkerResult};
use crate::liveness::Liveness;
use crate::store::PgLogStore;

/// Sleep between cleaner iterations
pub const CLEANER_TICK: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Purge: Send + Sync {
    /// Delete rows older than `cutoff` (Unix seconds), returning how many.
    async fn purge_older_than(&self, cutoff: i64) -> Result<u64, StoreError>;
}

#[async_trait]
impl Purge for PgLogStore {
    async fn purge_older_than(&self, cutoff: i64) -> Result<u64, StoreError> {
        self.delete_older_than(cutoff).await
    }
}

pub struct RetentionCleaner<P, L> {
    purge: P,
    config: CleanerConfig,
    liveness: L,
    last_cleanup: i64,
}

impl<P: Purge, L: Liveness> RetentionCleaner<P, L> {
    /// The first cleanup runs one full period after `started_at`.
    pub fn new(purge: P, config: CleanerConfig, liveness: L, started_at: i64) -> Self {
        Self {
            purge,
            config,
            liveness,
            last_cleanup: started_at,
        }
    }

    /// One iteration at wall-clock `now`. Returns the number of deleted rows
    /// when a cleanup ran.
    pub async fn run_once(&mut self, now: i64) -> WorkerResult<Option<u64>> {
        let period = i64::try_from(self.config.period_secs).unwrap_or(i64::MAX);
        let mut deleted = None;

        if now.saturating_sub(self.last_cleanup) > period {
            let retention = i64::try_from(self.config.retention_secs).unwrap_or(i64::MAX);
            let cutoff = now.saturating_sub(retention);

            info!(cutoff, "Performing database cleanup");
            let rows = self.purge.purge_older_than(cutoff).await?;
            info!(deleted = rows, "Database cleanup finished");

            self.last_cleanup = now;
            deleted = Some(rows);
        }

        self.liveness.tick();
        Ok(deleted)
    }

    pub async fn run(&mut self) -> WorkerResult<()> {
        loop {
            self.run_once(chrono::Utc::now().timestamp()).await?;
            tokio::time::sleep(CLEANER_TICK).await;
        }
    }
}

pub async fn run_cleaner<L: Liveness>(config: &Config, liveness: L) -> WorkerResult<()> {
    let store = PgLogStore::connect(&config.database).await?;
    store.migrate().await?;

    info!(
        period_secs = config.cleaner.period_secs,
        retention_secs = config.cleaner.retention_secs,
        "Cleaner started"
    );

    RetentionCleaner::new(store, config.cleaner.clone(), liveness, chrono::Utc::now().timestamp())
        .run()
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::worker::testing::CountingLiveness;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingPurge(Arc<Mutex<Vec<i64>>>);

    #[async_trait]
    impl Purge for RecordingPurge {
        async fn purge_older_than(&self, cutoff: i64) -> Result<u64, StoreError> {
            self.0.lock().unwrap().push(cutoff);
            Ok(3)
        }
    }

    fn config() -> CleanerConfig {
        CleanerConfig {
            enabled: true,
            period_secs: 3600,
            retention_secs: 7 * 24 * 3600,
        }
    }

    #[tokio::test]
    async fn test_waits_a_full_period_before_first_cleanup() {
        let purge = RecordingPurge::default();
        let liveness = CountingLiveness::default();
        let mut cleaner = RetentionCleaner::new(purge.clone(), config(), liveness.clone(), 1_000_000);

        assert_eq!(cleaner.run_once(1_000_010).await.unwrap(), None);
        assert_eq!(cleaner.run_once(1_003_600).await.unwrap(), None);
        assert_eq!(cleaner.run_once(1_003_601).await.unwrap(), Some(3));

        assert_eq!(*purge.0.lock().unwrap(), vec![1_003_601 - 7 * 24 * 3600]);
        assert_eq!(liveness.count(), 3);
    }

    #[tokio::test]
    async fn test_period_restarts_after_cleanup() {
        let purge = RecordingPurge::default();
        let mut cleaner = RetentionCleaner::new(purge.clone(), config(), CountingLiveness::default(), 0);

        cleaner.run_once(4000).await.unwrap();
        assert_eq!(cleaner.run_once(5000).await.unwrap(), None);
        assert_eq!(cleaner.run_once(7601).await.unwrap(), Some(3));
        assert_eq!(purge.0.lock().unwrap().len(), 2);
    }
}

//! Retention sweep and weekly storage maintenance

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Weekday};
use common::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RetentionConfig;
use crate::error::{Result, TrendSrvError};
use crate::repository::{Repository, RetentionReport};

/// Settle time before the first sweep
pub const INITIAL_DELAY: Duration = Duration::from_secs(5 * 60);

/// Delay after a failed sweep
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Sunday 02:00-02:59 in the given zone
pub fn is_maintenance_window<Tz: TimeZone>(at: &DateTime<Tz>) -> bool {
    at.weekday() == Weekday::Sun && at.hour() == 2
}

/// Result of one sweep
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveOutcome {
    pub report: RetentionReport,
    pub compacted: bool,
}

pub struct ArchivingScheduler {
    repository: Arc<Repository>,
    clock: Arc<dyn Clock>,
    retention: RetentionConfig,
    initial_delay: Duration,
    failure_backoff: Duration,
}

impl ArchivingScheduler {
    pub fn new(
        repository: Arc<Repository>,
        clock: Arc<dyn Clock>,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            repository,
            clock,
            retention,
            initial_delay: INITIAL_DELAY,
            failure_backoff: FAILURE_BACKOFF,
        }
    }

    /// Override the settle delay and failure backoff
    pub fn with_delays(mut self, initial: Duration, failure_backoff: Duration) -> Self {
        self.initial_delay = initial;
        self.failure_backoff = failure_backoff;
        self
    }

    /// One sweep: delete past the raw horizon, compact inside the window
    ///
    /// Fails when any kind failed; every kind is still attempted first.
    pub async fn run_cycle(&self) -> Result<ArchiveOutcome> {
        let now = self.clock.now();
        let cutoff = now - self.retention.raw_retention();

        let report = self.repository.delete_older_than(cutoff).await;
        for (kind, rows) in &report.deleted {
            if *rows > 0 {
                info!("Deleted {} {} readings older than {}", rows, kind, cutoff);
            }
        }
        if !report.is_complete() {
            let kinds: Vec<String> = report
                .failures
                .iter()
                .map(|(kind, e)| format!("{}: {}", kind, e))
                .collect();
            return Err(TrendSrvError::retention(kinds.join("; ")));
        }
        info!(
            "Retention sweep removed {} readings (cutoff {})",
            report.total_deleted(),
            cutoff
        );

        // A failed compaction does not fail the sweep
        let compacted = if is_maintenance_window(&now.with_timezone(&Local)) {
            info!("Weekly maintenance: compacting database");
            match self.repository.compact().await {
                Ok(()) => {
                    info!("Weekly maintenance completed");
                    true
                },
                Err(e) => {
                    warn!("Weekly maintenance failed: {}", e);
                    false
                },
            }
        } else {
            false
        };

        Ok(ArchiveOutcome { report, compacted })
    }

    /// Run until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) {
        let interval = self.retention.cleanup_interval();
        info!(
            "Archiving started (raw retention {} days, every {:?})",
            self.retention.raw_data_retention_days, interval
        );

        let mut delay = self.initial_delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                () = token.cancelled() => break,
            }

            delay = tokio::select! {
                outcome = self.run_cycle() => match outcome {
                    Ok(_) => interval,
                    Err(e) => {
                        error!("Retention sweep failed: {}", e);
                        self.failure_backoff
                    },
                },
                () = token.cancelled() => break,
            };
        }

        info!("Archiving stopped");
    }

    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::model::{Address, PointConfig, PointKind, Quality, Reading, ReadingValue};
    use crate::store::{ReadingStore, SqliteReadingStore};
    use async_trait::async_trait;
    use chrono::{FixedOffset, NaiveDate, Utc};
    use common::{FixedClock, SqliteClient};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<FixedOffset> {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
            .and_local_timezone(FixedOffset::east_opt(3600).unwrap())
            .unwrap()
    }

    #[test]
    fn test_maintenance_window() {
        // 2026-01-11 is a Sunday
        assert!(is_maintenance_window(&at(2026, 1, 11, 2, 0)));
        assert!(is_maintenance_window(&at(2026, 1, 11, 2, 59)));
        assert!(!is_maintenance_window(&at(2026, 1, 11, 1, 59)));
        assert!(!is_maintenance_window(&at(2026, 1, 11, 3, 0)));
        assert!(!is_maintenance_window(&at(2026, 1, 12, 2, 30)));
    }

    fn analog(tag: &str, at: DateTime<Utc>) -> Reading {
        Reading {
            tag_name: tag.to_string(),
            address: Address::new(1, 0),
            quality: Quality::Good,
            timestamp: at,
            value: ReadingValue::Analog {
                value: 1.0,
                unit: None,
            },
        }
    }

    async fn scheduler(now: DateTime<Utc>) -> (ArchivingScheduler, Arc<SqliteReadingStore>) {
        let clock = Arc::new(FixedClock::new(now));
        let client = Arc::new(SqliteClient::in_memory().await.unwrap());
        let store = Arc::new(SqliteReadingStore::new(client, clock.clone(), 50));
        store.initialize().await.unwrap();
        let repository = Arc::new(Repository::new(store.clone()));
        (
            ArchivingScheduler::new(repository, clock, RetentionConfig::default()),
            store,
        )
    }

    #[tokio::test]
    async fn test_sweep_removes_past_horizon() {
        // Wednesday: outside the maintenance window in every zone
        let now = Utc.with_ymd_and_hms(2026, 1, 14, 12, 0, 0).unwrap();
        let (archiver, store) = scheduler(now).await;
        store
            .append_batch(&[
                analog("Old", now - chrono::Duration::days(8)),
                analog("New", now - chrono::Duration::days(1)),
            ])
            .await
            .unwrap();

        let outcome = archiver.run_cycle().await.unwrap();
        assert_eq!(outcome.report.deleted_for(PointKind::Analog), Some(1));
        assert!(!outcome.compacted);

        let from = now - chrono::Duration::days(30);
        assert!(store
            .history("Old", PointKind::Analog, from, now)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .history("New", PointKind::Analog, from, now)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_sweep_fails_when_storage_unavailable() {
        let now = Utc.with_ymd_and_hms(2026, 1, 14, 12, 0, 0).unwrap();
        let (archiver, store) = scheduler(now).await;
        store.client().close().await;

        let err = archiver.run_cycle().await.unwrap_err();
        assert!(matches!(err, TrendSrvError::RetentionError(ref m) if m.contains("Analog")));
    }

    #[tokio::test]
    async fn test_sweep_compacts_inside_window() {
        let local = Local
            .with_ymd_and_hms(2026, 1, 11, 2, 30, 0)
            .single()
            .unwrap();
        let (archiver, _store) = scheduler(local.with_timezone(&Utc)).await;

        let outcome = archiver.run_cycle().await.unwrap();
        assert!(outcome.compacted);
    }

    /// Store whose deletes and compaction can be made to fail
    #[derive(Default)]
    struct ScriptedStore {
        fail_delete: bool,
        fail_compact: bool,
        delete_calls: AtomicU32,
        compact_calls: AtomicU32,
    }

    impl ScriptedStore {
        /// Sweeps seen so far; one sweep deletes every kind once
        fn sweeps(&self) -> u32 {
            self.delete_calls.load(Ordering::SeqCst) / PointKind::ALL.len() as u32
        }
    }

    #[async_trait]
    impl ReadingStore for ScriptedStore {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn append_batch(&self, _batch: &[Reading]) -> Result<()> {
            Ok(())
        }
        async fn history(
            &self,
            _tag_name: &str,
            _kind: PointKind,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<Reading>> {
            Ok(Vec::new())
        }
        async fn delete_older_than(&self, _kind: PointKind, _cutoff: DateTime<Utc>) -> Result<u64> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete {
                return Err(TrendSrvError::persistence("database is locked"));
            }
            Ok(0)
        }
        async fn latest_per_tag(&self, _kind: PointKind) -> Result<Vec<Reading>> {
            Ok(Vec::new())
        }
        async fn point_configs(&self, _enabled_only: bool) -> Result<Vec<PointConfig>> {
            Ok(Vec::new())
        }
        async fn point_config(&self, _tag_name: &str) -> Result<Option<PointConfig>> {
            Ok(None)
        }
        async fn save_point_config(&self, _config: &PointConfig) -> Result<()> {
            Ok(())
        }
        async fn compact(&self) -> Result<()> {
            self.compact_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_compact {
                return Err(TrendSrvError::persistence("database is locked"));
            }
            Ok(())
        }
    }

    fn scripted(store: &Arc<ScriptedStore>, now: DateTime<Utc>) -> ArchivingScheduler {
        let repository = Arc::new(Repository::new(store.clone()));
        ArchivingScheduler::new(
            repository,
            Arc::new(FixedClock::new(now)),
            RetentionConfig::default(),
        )
        .with_delays(Duration::from_secs(1), Duration::from_secs(10))
    }

    fn wednesday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 14, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_failed_compaction_keeps_sweep_successful() {
        let store = Arc::new(ScriptedStore {
            fail_compact: true,
            ..Default::default()
        });
        let local = Local
            .with_ymd_and_hms(2026, 1, 11, 2, 30, 0)
            .single()
            .unwrap();
        let archiver = scripted(&store, local.with_timezone(&Utc));

        let outcome = archiver.run_cycle().await.unwrap();
        assert!(!outcome.compacted);
        assert!(outcome.report.is_complete());
        assert_eq!(store.compact_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sweep_retries_after_backoff() {
        let store = Arc::new(ScriptedStore {
            fail_delete: true,
            ..Default::default()
        });
        let token = CancellationToken::new();
        let handle = Arc::new(scripted(&store, wednesday_noon())).spawn(token.clone());

        // Sweeps at 1 s and 11 s; the hourly interval would allow only one
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(store.sweeps(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.sweeps(), 3);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_sweep_waits_cleanup_interval() {
        let store = Arc::new(ScriptedStore::default());
        let token = CancellationToken::new();
        let handle = Arc::new(scripted(&store, wednesday_noon())).spawn(token.clone());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(store.sweeps(), 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(store.sweeps(), 2);

        token.cancel();
        handle.await.unwrap();
    }
}

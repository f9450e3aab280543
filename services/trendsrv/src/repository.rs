//! Reading repository with latest-value cache
//!
//! The cache lock is a synchronous mutex and is never held across an
//! `.await`; storage I/O always happens outside it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{PointConfig, PointKind, Reading};
use crate::store::ReadingStore;

/// Kinds considered when rebuilding the cache from storage
const REBUILD_KINDS: [PointKind; 2] = [PointKind::Analog, PointKind::Digital];

/// Outcome of one retention pass over every reading kind
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionReport {
    pub cutoff: DateTime<Utc>,
    /// Rows removed per kind that succeeded
    pub deleted: Vec<(PointKind, u64)>,
    /// Error text per kind that failed
    pub failures: Vec<(PointKind, String)>,
}

impl RetentionReport {
    pub fn total_deleted(&self) -> u64 {
        self.deleted.iter().map(|(_, n)| n).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn deleted_for(&self, kind: PointKind) -> Option<u64> {
        self.deleted
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, n)| *n)
    }
}

#[derive(Debug, Default)]
struct LatestValueCache {
    entries: HashMap<String, Reading>,
    rebuilt: bool,
}

/// Persists batches, serves history and keeps the newest reading per tag
pub struct Repository {
    store: Arc<dyn ReadingStore>,
    cache: Mutex<LatestValueCache>,
}

impl Repository {
    pub fn new(store: Arc<dyn ReadingStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(LatestValueCache::default()),
        }
    }

    /// Write a batch atomically, then refresh the cache
    ///
    /// On a storage error the cache is left untouched.
    pub async fn persist(&self, batch: &[Reading]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.store.append_batch(batch).await?;

        // Last write wins, also within one batch
        let mut cache = self.cache.lock();
        for reading in batch {
            cache
                .entries
                .insert(reading.tag_name.clone(), reading.clone());
        }
        debug!("Cache holds {} tags", cache.entries.len());
        Ok(())
    }

    /// Snapshot of the newest reading per tag
    ///
    /// A cold cache is rebuilt once from stored Analog and Digital history.
    pub async fn latest_values(&self) -> Result<HashMap<String, Reading>> {
        {
            let cache = self.cache.lock();
            if !cache.entries.is_empty() || cache.rebuilt {
                return Ok(cache.entries.clone());
            }
        }

        let mut loaded = Vec::new();
        for kind in REBUILD_KINDS {
            loaded.extend(self.store.latest_per_tag(kind).await?);
        }

        let mut cache = self.cache.lock();
        let count = loaded.len();
        for reading in loaded {
            // A concurrent persist may already have filled the tag
            cache
                .entries
                .entry(reading.tag_name.clone())
                .or_insert(reading);
        }
        cache.rebuilt = true;
        info!("Latest-value cache rebuilt from storage ({} tags)", count);
        Ok(cache.entries.clone())
    }

    pub async fn history(
        &self,
        tag_name: &str,
        kind: PointKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        self.store.history(tag_name, kind, from, to).await
    }

    /// Delete readings older than `cutoff` for every kind
    ///
    /// Each kind is attempted even when an earlier one fails.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> RetentionReport {
        let mut report = RetentionReport {
            cutoff,
            deleted: Vec::with_capacity(PointKind::ALL.len()),
            failures: Vec::new(),
        };

        for kind in PointKind::ALL {
            match self.store.delete_older_than(kind, cutoff).await {
                Ok(rows) => report.deleted.push((kind, rows)),
                Err(e) => {
                    warn!("Retention delete for {} readings failed: {}", kind, e);
                    report.failures.push((kind, e.to_string()));
                },
            }
        }
        report
    }

    pub async fn enabled_points(&self) -> Result<Vec<PointConfig>> {
        self.store.point_configs(true).await
    }

    pub async fn all_points(&self) -> Result<Vec<PointConfig>> {
        self.store.point_configs(false).await
    }

    pub async fn point(&self, tag_name: &str) -> Result<Option<PointConfig>> {
        self.store.point_config(tag_name).await
    }

    /// Insert or update a point; takes effect from the next polling cycle
    pub async fn save_point(&self, config: &PointConfig) -> Result<()> {
        self.store.save_point_config(config).await?;
        info!("Saved point {} ({})", config.tag_name, config.kind);
        Ok(())
    }

    /// Storage compaction (`VACUUM`)
    pub async fn compact(&self) -> Result<()> {
        self.store.compact().await
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::error::TrendSrvError;
    use crate::model::{Address, Quality, ReadingValue};
    use crate::store::SqliteReadingStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use common::{FixedClock, SqliteClient};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_768_329_366_000).unwrap()
    }

    fn analog(tag: &str, value: f32, at: DateTime<Utc>) -> Reading {
        Reading {
            tag_name: tag.to_string(),
            address: Address::new(1, 0),
            quality: Quality::Good,
            timestamp: at,
            value: ReadingValue::Analog { value, unit: None },
        }
    }

    fn string(tag: &str, at: DateTime<Utc>) -> Reading {
        Reading {
            tag_name: tag.to_string(),
            address: Address::new(3, 0),
            quality: Quality::Good,
            timestamp: at,
            value: ReadingValue::String {
                value: "RUN".to_string(),
                max_length: 254,
            },
        }
    }

    async fn sqlite_store() -> Arc<SqliteReadingStore> {
        let client = Arc::new(SqliteClient::in_memory().await.unwrap());
        let store = SqliteReadingStore::new(client, Arc::new(FixedClock::new(t0())), 50);
        store.initialize().await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_persist_updates_cache() {
        let repo = Repository::new(sqlite_store().await);
        repo.persist(&[analog("T1", 42.5, t0())]).await.unwrap();

        let latest = repo.latest_values().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(
            latest["T1"].value,
            ReadingValue::Analog {
                value: 42.5,
                unit: None
            }
        );
    }

    #[tokio::test]
    async fn test_persist_overwrites_newer_cached_reading() {
        let repo = Repository::new(sqlite_store().await);
        repo.persist(&[analog("T1", 1.0, t0() + Duration::seconds(10))])
            .await
            .unwrap();
        // Wall clock stepped back
        repo.persist(&[analog("T1", 2.0, t0())]).await.unwrap();

        let latest = repo.latest_values().await.unwrap();
        assert_eq!(
            latest["T1"].value,
            ReadingValue::Analog {
                value: 2.0,
                unit: None
            }
        );
        assert_eq!(latest["T1"].timestamp, t0());
    }

    #[tokio::test]
    async fn test_persist_later_reading_in_batch_wins() {
        let repo = Repository::new(sqlite_store().await);
        repo.persist(&[
            analog("T1", 1.0, t0() + Duration::seconds(5)),
            analog("T1", 3.0, t0()),
        ])
        .await
        .unwrap();

        let latest = repo.latest_values().await.unwrap();
        assert_eq!(
            latest["T1"].value,
            ReadingValue::Analog {
                value: 3.0,
                unit: None
            }
        );
    }

    #[tokio::test]
    async fn test_cold_start_rebuild_skips_strings() {
        let store = sqlite_store().await;
        store
            .append_batch(&[
                analog("A", 1.0, t0()),
                analog("A", 2.0, t0() + Duration::seconds(5)),
                string("S", t0()),
            ])
            .await
            .unwrap();

        let repo = Repository::new(store);
        let latest = repo.latest_values().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest["A"].timestamp, t0() + Duration::seconds(5));

        // Later batches merge into the rebuilt cache
        repo.persist(&[string("S", t0() + Duration::seconds(10))])
            .await
            .unwrap();
        assert_eq!(repo.latest_values().await.unwrap().len(), 2);
    }

    /// Store whose writes and deletes can be made to fail
    #[derive(Default)]
    struct FlakyStore {
        fail_writes: AtomicBool,
        fail_digital_delete: AtomicBool,
        delete_calls: AtomicU32,
        latest_calls: AtomicU32,
    }

    #[async_trait]
    impl ReadingStore for FlakyStore {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn append_batch(&self, _batch: &[Reading]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(TrendSrvError::persistence("disk full"));
            }
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
        async fn delete_older_than(&self, kind: PointKind, _cutoff: DateTime<Utc>) -> Result<u64> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            if kind == PointKind::Digital && self.fail_digital_delete.load(Ordering::SeqCst) {
                return Err(TrendSrvError::persistence("database is locked"));
            }
            Ok(2)
        }
        async fn latest_per_tag(&self, _kind: PointKind) -> Result<Vec<Reading>> {
            self.latest_calls.fetch_add(1, Ordering::SeqCst);
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
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_cache() {
        let store = Arc::new(FlakyStore::default());
        let repo = Repository::new(store.clone());
        repo.persist(&[analog("T1", 1.0, t0())]).await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        let err = repo
            .persist(&[analog("T1", 9.0, t0() + Duration::seconds(5))])
            .await
            .unwrap_err();
        assert!(matches!(err, TrendSrvError::PersistenceError(_)));

        let latest = repo.latest_values().await.unwrap();
        assert_eq!(latest["T1"].timestamp, t0());
    }

    #[tokio::test]
    async fn test_empty_storage_rebuilds_once() {
        let store = Arc::new(FlakyStore::default());
        let repo = Repository::new(store.clone());

        assert!(repo.latest_values().await.unwrap().is_empty());
        assert!(repo.latest_values().await.unwrap().is_empty());
        assert_eq!(store.latest_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_delete_attempts_every_kind() {
        let store = Arc::new(FlakyStore::default());
        store.fail_digital_delete.store(true, Ordering::SeqCst);
        let repo = Repository::new(store.clone());

        let report = repo.delete_older_than(t0()).await;
        assert_eq!(store.delete_calls.load(Ordering::SeqCst), 4);
        assert!(!report.is_complete());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, PointKind::Digital);
        assert_eq!(report.total_deleted(), 6);
        assert_eq!(report.deleted_for(PointKind::Digital), None);
        assert_eq!(report.deleted_for(PointKind::String), Some(2));
    }
}

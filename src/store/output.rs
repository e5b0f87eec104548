//! In-memory output records keyed by original index.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::store::traits::{NullStore, PersistentStore};

/// One output row. Fields fill in as stages complete; partial rows are valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Keyword used for the TURL search (the translation in AI mode).
    pub keyword: String,
    /// Keyword used for the catalog searches.
    pub native_keyword: String,
    pub turl: Option<String>,
    pub mercari_url: Option<String>,
    pub yahoo_url: Option<String>,
    /// Listing the keyword came from.
    pub listing_link: String,
}

/// Concurrent index → record map, persisted after every change.
///
/// Writers to different indices never block each other. Records are never
/// removed during a run.
pub struct OutputStore {
    records: DashMap<usize, OutputRecord>,
    persist: Arc<dyn PersistentStore>,
    flush_lock: Mutex<()>,
}

impl OutputStore {
    pub fn new(persist: Arc<dyn PersistentStore>) -> Self {
        Self {
            records: DashMap::new(),
            persist,
            flush_lock: Mutex::new(()),
        }
    }

    /// A store that keeps records in memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(NullStore))
    }

    /// Replace the record at `index` (last write wins).
    #[cfg(test)]
    fn set(&self, index: usize, record: OutputRecord) {
        self.records.insert(index, record);
    }

    /// Modify the record at `index`, creating an empty one first if needed.
    pub fn update(&self, index: usize, apply: impl FnOnce(&mut OutputRecord)) {
        let mut entry = self.records.entry(index).or_default();
        apply(entry.value_mut());
    }

    pub fn get(&self, index: usize) -> Option<OutputRecord> {
        self.records.get(&index).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records ordered by index.
    pub fn snapshot(&self) -> Vec<(usize, OutputRecord)> {
        let mut rows: Vec<(usize, OutputRecord)> = self
            .records
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        rows.sort_by_key(|(index, _)| *index);
        rows
    }

    /// Persist the current snapshot. Failures are logged, never returned.
    ///
    /// Flushes are serialized and each one snapshots under the lock, so a
    /// later flush always writes a superset of an earlier one.
    pub async fn flush(&self) {
        let _guard = self.flush_lock.lock().await;
        let snapshot = self.snapshot();
        match self.persist.flush(&snapshot).await {
            Ok(()) => debug!(records = snapshot.len(), "Snapshot flushed"),
            Err(e) => error!(error = %e, "Failed to persist snapshot"),
        }
    }

    /// Update one record and flush.
    pub async fn upsert(&self, index: usize, apply: impl FnOnce(&mut OutputRecord)) {
        self.update(index, apply);
        self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::StoreError;

    #[derive(Default)]
    struct Recording {
        flushes: StdMutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl PersistentStore for Recording {
        async fn flush(&self, snapshot: &[(usize, OutputRecord)]) -> Result<(), StoreError> {
            self.flushes.lock().unwrap().push(snapshot.len());
            if self.fail {
                return Err(StoreError::Database("disk full".into()));
            }
            Ok(())
        }
    }

    fn record(keyword: &str) -> OutputRecord {
        OutputRecord {
            keyword: keyword.into(),
            ..Default::default()
        }
    }

    #[test]
    fn upserting_same_index_keeps_latest() {
        let store = OutputStore::in_memory();
        store.set(4, record("first"));
        store.set(4, record("second"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(4).unwrap().keyword, "second");
    }

    #[test]
    fn updates_accumulate_fields() {
        let store = OutputStore::in_memory();
        store.update(1, |r| r.turl = Some("t".into()));
        store.update(1, |r| r.mercari_url = Some("m".into()));
        let rec = store.get(1).unwrap();
        assert_eq!(rec.turl.as_deref(), Some("t"));
        assert_eq!(rec.mercari_url.as_deref(), Some("m"));
    }

    #[test]
    fn snapshot_is_ordered_by_index() {
        let store = OutputStore::in_memory();
        store.set(9, record("c"));
        store.set(0, record("a"));
        store.set(3, record("b"));
        let indices: Vec<_> = store.snapshot().into_iter().map(|(i, _)| i).collect();
        assert_eq!(indices, [0, 3, 9]);
    }

    #[tokio::test]
    async fn each_upsert_flushes_growing_snapshot() {
        let persist = Arc::new(Recording::default());
        let store = OutputStore::new(persist.clone());
        store.upsert(0, |r| r.keyword = "a".into()).await;
        store.upsert(1, |r| r.keyword = "b".into()).await;
        store.upsert(1, |r| r.turl = Some("t".into())).await;
        assert_eq!(*persist.flushes.lock().unwrap(), [1, 2, 2]);
    }

    #[tokio::test]
    async fn persist_failure_is_not_fatal() {
        let persist = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let store = OutputStore::new(persist);
        store.upsert(0, |r| r.keyword = "a".into()).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_writers_to_distinct_indices() {
        let store = Arc::new(OutputStore::in_memory());
        let mut handles = Vec::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.upsert(i, |r| r.keyword = format!("k{i}")).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len(), 50);
    }
}

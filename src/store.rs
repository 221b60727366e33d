use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::types::{BulkReport, MergeReport, TickerPostPair};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Durable record holding the whole map.
pub const STORAGE_KEY: &str = "tickerPairs";

pub const AUTO_EXPORT_THRESHOLD: usize = 20;

#[derive(Debug, Default)]
struct Pairs {
    by_key: HashMap<String, TickerPostPair>,
    /// Keys in insertion order, oldest first.
    order: Vec<String>,
    /// New pairs merged since the last export.
    emitted: usize,
    /// Bumped on every mutation; persisted snapshots carry it.
    generation: u64,
}

impl Pairs {
    /// First-seen wins: an existing key keeps its original pair.
    // NOTE: a later sighting may carry a more accurate timestamp and is still
    // dropped. Kept for compatibility with existing exports.
    fn insert(&mut self, pair: TickerPostPair) -> bool {
        let key = pair.key();
        if self.by_key.contains_key(&key) {
            return false;
        }
        self.order.push(key.clone());
        self.by_key.insert(key, pair);
        true
    }

    fn ordered(&self) -> Vec<TickerPostPair> {
        self.order.iter().filter_map(|k| self.by_key.get(k)).cloned().collect()
    }

    fn to_json(&self) -> Result<String> {
        let mut map = Map::with_capacity(self.order.len());
        for key in &self.order {
            if let Some(pair) = self.by_key.get(key) {
                map.insert(key.clone(), serde_json::to_value(pair)?);
            }
        }
        Ok(serde_json::to_string(&map)?)
    }

    fn from_json(text: &str) -> Result<Self> {
        let map: Map<String, Value> = serde_json::from_str(text)?;
        let mut pairs = Pairs::default();
        for (key, value) in map {
            match serde_json::from_value::<TickerPostPair>(value) {
                Ok(pair) if !pair.ticker.is_empty() && !pair.url.is_empty() => {
                    pairs.insert(pair);
                }
                Ok(_) => warn!("[Store] Skipping stored entry {} with empty ticker or url", key),
                Err(e) => warn!("[Store] Skipping unreadable stored entry {}: {}", key, e),
            }
        }
        Ok(pairs)
    }
}

/// Authoritative ticker/post map, persisted to a key-value store.
///
/// Every mutation goes through the merge/clear/reload API. Persistence is
/// fire-and-forget: the in-memory map is updated first and a failed write is
/// only logged. Readers get cloned snapshots, never a live view.
pub struct AggregateStore {
    pairs: RwLock<Pairs>,
    kv: Arc<dyn KeyValueStore>,
    auto_export_threshold: usize,
    /// Generation of the newest snapshot known to be on disk.
    persisted: Arc<Mutex<u64>>,
}

impl AggregateStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_threshold(kv, AUTO_EXPORT_THRESHOLD)
    }

    pub fn with_threshold(kv: Arc<dyn KeyValueStore>, auto_export_threshold: usize) -> Self {
        Self {
            pairs: RwLock::new(Pairs::default()),
            kv,
            auto_export_threshold: auto_export_threshold.max(1),
            persisted: Arc::new(Mutex::new(0)),
        }
    }

    /// Create a store hydrated from durable storage.
    pub async fn load(kv: Arc<dyn KeyValueStore>, auto_export_threshold: usize) -> Self {
        let store = Self::with_threshold(kv, auto_export_threshold);
        store.reload().await;
        store
    }

    /// Merge a batch from an extraction session. First-seen wins.
    pub async fn merge_incremental(&self, batch: Vec<TickerPostPair>) -> MergeReport {
        let mut pairs = self.pairs.write().await;
        let mut report = MergeReport::default();
        for pair in batch {
            if pairs.insert(pair) {
                pairs.emitted += 1;
                report.added += 1;
            }
        }
        if report.added > 0 {
            pairs.generation += 1;
            self.schedule_persist(&pairs);
        }
        // Checked once per batch, not per pair.
        if pairs.emitted >= self.auto_export_threshold {
            info!("[Store] {} new pairs since last export, export due", pairs.emitted);
            pairs.emitted = 0;
            report.export_due = true;
        }
        if report.added > 0 {
            info!("[Store] Added {} pair(s) (total: {})", report.added, pairs.order.len());
        }
        report
    }

    /// Merge an imported data set. Resets the emission counter since this is
    /// a resynchronisation rather than new discovery.
    pub async fn merge_bulk(&self, incoming: Vec<TickerPostPair>) -> BulkReport {
        let mut pairs = self.pairs.write().await;
        let mut report = BulkReport::default();
        for pair in incoming {
            if pairs.insert(pair) {
                report.added += 1;
            } else {
                report.duplicates += 1;
            }
        }
        pairs.emitted = 0;
        if report.added > 0 {
            pairs.generation += 1;
            self.schedule_persist(&pairs);
        }
        info!(
            "[Store] Bulk merge: {} added, {} duplicates (total: {})",
            report.added,
            report.duplicates,
            pairs.order.len()
        );
        report
    }

    /// Pairs in insertion order, oldest first.
    pub async fn snapshot(&self) -> Vec<TickerPostPair> {
        self.pairs.read().await.ordered()
    }

    pub async fn snapshot_newest_first(&self) -> Vec<TickerPostPair> {
        let mut pairs = self.snapshot().await;
        pairs.reverse();
        pairs
    }

    pub async fn size(&self) -> usize {
        self.pairs.read().await.order.len()
    }

    pub async fn pending_emissions(&self) -> usize {
        self.pairs.read().await.emitted
    }

    pub async fn reset_emissions(&self) {
        self.pairs.write().await.emitted = 0;
    }

    pub async fn clear(&self) {
        let mut pairs = self.pairs.write().await;
        let generation = pairs.generation + 1;
        *pairs = Pairs { generation, ..Pairs::default() };
        self.schedule_persist(&pairs);
        info!("[Store] Cleared all pairs");
    }

    /// Replace the in-memory map with the durable record. A missing or
    /// unreadable record leaves the store empty. Returns the loaded size.
    ///
    /// Unsaved changes are written first and the read happens under the same
    /// lock as writes, so the record read is never older than memory. If that
    /// write fails the reload is skipped and memory is kept.
    pub async fn reload(&self) -> usize {
        let mut pairs = self.pairs.write().await;
        let pending = match pairs.to_json() {
            Ok(json) => Some((pairs.generation, json)),
            Err(e) => {
                error!("[Store] Failed to serialize pairs before reload: {}", e);
                None
            }
        };
        let Some((current, json)) = pending else {
            return pairs.order.len();
        };

        let kv = Arc::clone(&self.kv);
        let persisted = Arc::clone(&self.persisted);
        let read = tokio::task::spawn_blocking(move || read_after_write(kv.as_ref(), &persisted, current, &json)).await;

        let loaded = match read {
            Ok(ReloadRead::Record(Some(text))) => Pairs::from_json(&text).unwrap_or_else(|e| {
                error!("[Store] Stored pairs are unreadable: {}", e);
                Pairs::default()
            }),
            Ok(ReloadRead::Record(None)) => {
                info!("[Store] No stored data found");
                Pairs::default()
            }
            Ok(ReloadRead::ReadFailed(e)) => {
                error!("[Store] Error loading from storage: {}", e);
                Pairs::default()
            }
            Ok(ReloadRead::Unsaved(e)) => {
                error!("[Store] Reload skipped, unsaved pairs could not be written: {}", e);
                return pairs.order.len();
            }
            Err(e) => {
                error!("[Store] Storage read task failed: {}", e);
                return pairs.order.len();
            }
        };

        let generation = pairs.generation + 1;
        *pairs = Pairs { generation, ..loaded };
        // What was just read needs no write-back; this also keeps a failed
        // read from clobbering the record with an empty map.
        if let Ok(mut persisted) = self.persisted.lock() {
            *persisted = (*persisted).max(generation);
        }
        info!("[Store] Loaded {} ticker pairs from storage", pairs.order.len());
        pairs.order.len()
    }

    /// Write the current map if it is newer than what is on disk.
    /// Returns whether a write happened.
    pub async fn flush(&self) -> Result<bool> {
        let (generation, json) = {
            let pairs = self.pairs.read().await;
            (pairs.generation, pairs.to_json()?)
        };
        let kv = Arc::clone(&self.kv);
        let persisted = Arc::clone(&self.persisted);
        tokio::task::spawn_blocking(move || write_if_newer(kv.as_ref(), &persisted, generation, &json))
            .await
            .map_err(|e| Error::Storage(e.to_string()))?
    }

    fn schedule_persist(&self, pairs: &Pairs) {
        let json = match pairs.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("[Store] Failed to serialize pairs: {}", e);
                return;
            }
        };
        let generation = pairs.generation;
        let count = pairs.order.len();
        let kv = Arc::clone(&self.kv);
        let persisted = Arc::clone(&self.persisted);
        tokio::task::spawn_blocking(move || {
            match write_if_newer(kv.as_ref(), &persisted, generation, &json) {
                Ok(true) => info!("[Store] Saved {} pairs to storage", count),
                Ok(false) => {}
                Err(e) => error!("[Store] Error saving to storage: {}", e),
            }
        });
    }
}

/// Writes run one at a time; a snapshot older than the last write is dropped.
fn write_if_newer(kv: &dyn KeyValueStore, persisted: &Mutex<u64>, generation: u64, json: &str) -> Result<bool> {
    let mut last = persisted.lock().map_err(|e| Error::Storage(e.to_string()))?;
    if generation <= *last {
        return Ok(false);
    }
    kv.set(STORAGE_KEY, json)?;
    *last = generation;
    Ok(true)
}

enum ReloadRead {
    Record(Option<String>),
    ReadFailed(Error),
    Unsaved(Error),
}

/// Flush `generation` if it is not on disk yet, then read the record while
/// still holding the write lock.
fn read_after_write(kv: &dyn KeyValueStore, persisted: &Mutex<u64>, generation: u64, json: &str) -> ReloadRead {
    let mut last = match persisted.lock() {
        Ok(last) => last,
        Err(e) => return ReloadRead::Unsaved(Error::Storage(e.to_string())),
    };
    if generation > *last {
        if let Err(e) = kv.set(STORAGE_KEY, json) {
            return ReloadRead::Unsaved(e);
        }
        *last = generation;
    }
    match kv.get(STORAGE_KEY) {
        Ok(record) => ReloadRead::Record(record),
        Err(e) => ReloadRead::ReadFailed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn pair(ticker: &str, id: u32, ts: &str) -> TickerPostPair {
        TickerPostPair::new(ticker, format!("https://x.com/u/status/{}", id), Some(ts.to_string()))
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::Storage("disk on fire".into()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(Error::Storage("disk on fire".into()))
        }
    }

    /// Writes take a while, like a busy disk.
    struct SlowStore {
        inner: MemoryStore,
        delay: std::time::Duration,
    }

    impl KeyValueStore for SlowStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str) -> Result<()> {
            std::thread::sleep(self.delay);
            self.inner.set(key, value)
        }
    }

    /// Reads work, writes fail.
    struct ReadOnlyStore(MemoryStore);

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(Error::Storage("read-only".into()))
        }
    }

    #[tokio::test]
    async fn merging_same_batch_twice_is_idempotent() {
        let store = AggregateStore::new(Arc::new(MemoryStore::new()));
        let batch = vec![pair("OSCR", 1, "t1"), pair("AAPL", 2, "t2")];

        assert_eq!(store.merge_incremental(batch.clone()).await.added, 2);
        let first = store.snapshot().await;
        assert_eq!(store.merge_incremental(batch).await.added, 0);
        assert_eq!(store.snapshot().await, first);
        assert_eq!(store.pending_emissions().await, 2);
    }

    #[tokio::test]
    async fn first_seen_timestamp_wins() {
        let store = AggregateStore::new(Arc::new(MemoryStore::new()));
        store.merge_incremental(vec![pair("OSCR", 1, "2024-01-01T00:00:00Z")]).await;
        store.merge_incremental(vec![pair("OSCR", 1, "2024-01-05T00:00:00Z")]).await;
        let snap = store.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn snapshot_keeps_insertion_order() {
        let store = AggregateStore::new(Arc::new(MemoryStore::new()));
        store.merge_incremental(vec![pair("B", 1, "t"), pair("A", 2, "t")]).await;
        store.merge_bulk(vec![pair("C", 3, "t")]).await;
        let tickers: Vec<String> = store.snapshot().await.into_iter().map(|p| p.ticker).collect();
        assert_eq!(tickers, ["B", "A", "C"]);
        let newest: Vec<String> = store.snapshot_newest_first().await.into_iter().map(|p| p.ticker).collect();
        assert_eq!(newest, ["C", "A", "B"]);
    }

    #[tokio::test]
    async fn export_due_exactly_once_at_threshold() {
        let store = AggregateStore::new(Arc::new(MemoryStore::new()));
        let mut due = Vec::new();
        for i in 0..20 {
            due.push(store.merge_incremental(vec![pair("T", i, "t")]).await.export_due);
        }
        assert_eq!(due.iter().filter(|d| **d).count(), 1);
        assert!(due[19]);
        assert_eq!(store.pending_emissions().await, 0);
    }

    #[tokio::test]
    async fn duplicates_do_not_advance_counter() {
        let store = AggregateStore::with_threshold(Arc::new(MemoryStore::new()), 2);
        store.merge_incremental(vec![pair("T", 1, "t")]).await;
        let report = store.merge_incremental(vec![pair("T", 1, "t")]).await;
        assert_eq!(report, MergeReport { added: 0, export_due: false });
        assert_eq!(store.pending_emissions().await, 1);
    }

    #[tokio::test]
    async fn threshold_is_checked_per_batch() {
        let store = AggregateStore::with_threshold(Arc::new(MemoryStore::new()), 3);
        let batch: Vec<_> = (0..7).map(|i| pair("T", i, "t")).collect();
        let report = store.merge_incremental(batch).await;
        assert_eq!(report, MergeReport { added: 7, export_due: true });
        assert_eq!(store.pending_emissions().await, 0);
    }

    #[tokio::test]
    async fn bulk_merge_counts_duplicates_and_resets_counter() {
        let store = AggregateStore::new(Arc::new(MemoryStore::new()));
        store.merge_incremental(vec![pair("OSCR", 1, "t")]).await;
        let report = store.merge_bulk(vec![pair("OSCR", 1, "other"), pair("AAPL", 2, "t"), pair("AAPL", 2, "t")]).await;
        assert_eq!(report, BulkReport { added: 1, duplicates: 2 });
        assert_eq!(report.summary(), "Added 1 new pairs (2 duplicates skipped)");
        assert_eq!(store.pending_emissions().await, 0);
        assert_eq!(store.size().await, 2);
    }

    #[tokio::test]
    async fn persists_and_reloads_in_order() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let store = AggregateStore::new(Arc::clone(&kv));
        store.merge_incremental(vec![pair("Z", 1, "t1"), pair("A", 2, "t2")]).await;
        store.flush().await.unwrap();

        let stored = kv.get(STORAGE_KEY).unwrap().unwrap();
        let value: Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(value["Z|https://x.com/u/status/1"]["timestamp"], "t1");

        let reloaded = AggregateStore::load(kv, AUTO_EXPORT_THRESHOLD).await;
        assert_eq!(reloaded.snapshot().await, store.snapshot().await);
        assert_eq!(reloaded.pending_emissions().await, 0);
    }

    #[tokio::test]
    async fn reload_skips_unreadable_entries() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        kv.set(STORAGE_KEY, r#"{"A|u":{"ticker":"A","url":"u","timestamp":null},"bad":{"nope":1}}"#).unwrap();
        let store = AggregateStore::load(Arc::clone(&kv), 20).await;
        assert_eq!(store.size().await, 1);
        assert_eq!(store.snapshot().await[0].timestamp, None);
    }

    #[tokio::test]
    async fn clear_empties_and_persists() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let store = AggregateStore::new(Arc::clone(&kv));
        store.merge_incremental(vec![pair("A", 1, "t")]).await;
        store.clear().await;
        store.flush().await.unwrap();
        assert_eq!(store.size().await, 0);
        assert_eq!(store.pending_emissions().await, 0);
        assert_eq!(kv.get(STORAGE_KEY).unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn storage_failures_never_roll_back_memory() {
        let store = AggregateStore::load(Arc::new(FailingStore), 20).await;
        assert_eq!(store.size().await, 0);
        let report = store.merge_incremental(vec![pair("A", 1, "t")]).await;
        assert_eq!(report.added, 1);
        assert!(store.flush().await.is_err());
        assert_eq!(store.size().await, 1);
    }

    #[tokio::test]
    async fn reload_during_pending_write_keeps_new_pairs() {
        let kv: Arc<dyn KeyValueStore> =
            Arc::new(SlowStore { inner: MemoryStore::new(), delay: std::time::Duration::from_millis(200) });
        let store = AggregateStore::new(Arc::clone(&kv));

        store.merge_incremental(vec![pair("OSCR", 1, "t1")]).await;
        assert_eq!(store.reload().await, 1);
        store.merge_incremental(vec![pair("AAPL", 2, "t2")]).await;
        store.flush().await.unwrap();

        assert_eq!(store.size().await, 2);
        let stored: Map<String, Value> = serde_json::from_str(&kv.get(STORAGE_KEY).unwrap().unwrap()).unwrap();
        let keys: Vec<&String> = stored.keys().collect();
        assert_eq!(keys, ["OSCR|https://x.com/u/status/1", "AAPL|https://x.com/u/status/2"]);
    }

    #[tokio::test]
    async fn reload_keeps_memory_when_unsaved_pairs_cannot_be_written() {
        let store = AggregateStore::new(Arc::new(ReadOnlyStore(MemoryStore::new())));
        store.merge_incremental(vec![pair("OSCR", 1, "t1")]).await;
        assert_eq!(store.reload().await, 1);
        assert_eq!(store.snapshot().await[0].ticker, "OSCR");
    }

    #[tokio::test]
    async fn flush_skips_when_nothing_changed() {
        let store = AggregateStore::new(Arc::new(MemoryStore::new()));
        assert!(!store.flush().await.unwrap());
        store.merge_bulk(vec![pair("A", 1, "t")]).await;
        store.flush().await.unwrap();
        assert!(!store.flush().await.unwrap());
    }
}

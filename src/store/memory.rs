//! In-Process Store Backend
//!
//! [`MemoryStore`] implements [`Storage`] over a single ordered map. It is
//! what `memory://` resolves to, and what the reclaim tests run against.
//!
//! ## Transactions
//!
//! Each transaction buffers its writes and reads through them. Reads see
//! the latest committed state. At commit, every written key is checked
//! against its last commit version; if another transaction committed the
//! same key after this one began, the commit fails with
//! [`StoreError::Conflict`] and nothing is applied.
//!
//! ## Version GC
//!
//! Commit versions outlive the keys they describe so that a delete still
//! conflicts with older transactions. [`Storage::gc`] drops the version of a
//! deleted key once it was committed before the safe point and no open
//! transaction started before it.
//!
//! ## Fault Injection
//!
//! Tests can make deletes under a prefix fail, or make the next N commits
//! report a conflict, to exercise rollback and retry paths.

use super::{unix_now, KvIterator, Storage, StoreError, StoreResult, Transaction};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use tracing::debug;

type Range = (Bound<Bytes>, Bound<Bytes>);

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<Bytes, Bytes>,
    /// Last write of each key, deletes included.
    versions: HashMap<Bytes, Version>,
    version: u64,
    /// Open transactions by start version.
    open: BTreeMap<u64, usize>,
    faults: Faults,
    last_safe_point: Option<i64>,
    gc_runs: u64,
}

#[derive(Debug, Clone, Copy)]
struct Version {
    version: u64,
    /// Unix seconds of the commit.
    committed_at: i64,
}

impl Inner {
    fn record(&mut self, key: Bytes, version: u64, committed_at: i64) {
        self.versions.insert(
            key,
            Version {
                version,
                committed_at,
            },
        );
    }

    fn release(&mut self, start_version: u64) {
        if let Some(count) = self.open.get_mut(&start_version) {
            *count -= 1;
            if *count == 0 {
                self.open.remove(&start_version);
            }
        }
    }

    /// Drops versions no open or future transaction can conflict with.
    fn prune(&mut self, safe_point: i64) -> usize {
        let oldest_open = self.open.keys().next().copied().unwrap_or(u64::MAX);
        let before = self.versions.len();
        let data = &self.data;
        self.versions.retain(|key, v| {
            data.contains_key(key) || v.committed_at >= safe_point || v.version > oldest_open
        });
        before - self.versions.len()
    }
}

#[derive(Debug, Default)]
struct Faults {
    delete_prefixes: Vec<Bytes>,
    commit_conflicts: usize,
}

/// Ordered-map store with optimistic transactions.
///
/// Cloning is cheap; clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a key outside of any transaction.
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        let mut inner = self.inner.lock().unwrap();
        inner.version += 1;
        let version = inner.version;
        let key = key.into();
        inner.record(key.clone(), version, unix_now());
        inner.data.insert(key, value.into());
    }

    /// Reads the latest committed value of `key`.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.inner.lock().unwrap().data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All committed keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Bytes> {
        let inner = self.inner.lock().unwrap();
        inner
            .data
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Makes every transactional delete of a key under `prefix` fail.
    pub fn fail_deletes_under(&self, prefix: impl Into<Bytes>) {
        self.inner
            .lock()
            .unwrap()
            .faults
            .delete_prefixes
            .push(prefix.into());
    }

    /// Makes the next `n` commits fail with a write conflict.
    pub fn fail_commits(&self, n: usize) {
        self.inner.lock().unwrap().faults.commit_conflicts = n;
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.inner.lock().unwrap().faults = Faults::default();
    }

    /// Safe point passed to the most recent [`Storage::gc`] call.
    pub fn last_safe_point(&self) -> Option<i64> {
        self.inner.lock().unwrap().last_safe_point
    }

    pub fn gc_runs(&self) -> u64 {
        self.inner.lock().unwrap().gc_runs
    }

    /// Number of keys, live or deleted, whose last commit version is kept.
    pub fn version_entries(&self) -> usize {
        self.inner.lock().unwrap().versions.len()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let start_version = {
            let mut inner = self.inner.lock().unwrap();
            let start_version = inner.version;
            *inner.open.entry(start_version).or_insert(0) += 1;
            start_version
        };
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            start_version,
            writes: BTreeMap::new(),
            finished: false,
        }))
    }

    async fn gc(&self, safe_point: i64, concurrency: usize) -> StoreResult<()> {
        if concurrency == 0 {
            return Err(StoreError::Backend("gc concurrency must be positive".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        let pruned = inner.prune(safe_point);
        inner.last_safe_point = Some(safe_point);
        inner.gc_runs += 1;
        debug!(safe_point, pruned, remaining = inner.versions.len(), "Pruned commit versions");
        Ok(())
    }
}

/// Buffered writes: `None` marks a delete.
type WriteSet = BTreeMap<Bytes, Option<Bytes>>;

struct MemoryTransaction {
    inner: Arc<Mutex<Inner>>,
    start_version: u64,
    writes: WriteSet,
    finished: bool,
}

impl MemoryTransaction {
    fn check_open(&self) -> StoreResult<()> {
        if self.finished {
            Err(StoreError::Finished)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, key: &[u8]) -> StoreResult<Option<Bytes>> {
        self.check_open()?;
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        Ok(self.inner.lock().unwrap().data.get(key).cloned())
    }

    async fn set(&mut self, key: Bytes, value: Bytes) -> StoreResult<()> {
        self.check_open()?;
        self.writes.insert(key, Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> StoreResult<()> {
        self.check_open()?;
        let injected = {
            let inner = self.inner.lock().unwrap();
            inner
                .faults
                .delete_prefixes
                .iter()
                .any(|p| key.starts_with(p))
        };
        if injected {
            return Err(StoreError::Backend(format!(
                "injected delete failure for {:?}",
                Bytes::copy_from_slice(key)
            )));
        }
        self.writes.insert(Bytes::copy_from_slice(key), None);
        Ok(())
    }

    async fn iter(&mut self, start: &[u8], upper: &[u8]) -> StoreResult<Box<dyn KvIterator>> {
        self.check_open()?;
        let upper = if upper.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(Bytes::copy_from_slice(upper))
        };
        let overlay: WriteSet = match bounded((Bound::Included(Bytes::copy_from_slice(start)), upper.clone())) {
            Some(range) => self
                .writes
                .range(range)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => WriteSet::new(),
        };

        let mut iter = MemoryIter {
            inner: Arc::clone(&self.inner),
            overlay,
            upper,
            current: None,
        };
        iter.seek(Bound::Included(Bytes::copy_from_slice(start)));
        Ok(Box::new(iter))
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.check_open()?;
        self.finished = true;
        let writes = std::mem::take(&mut self.writes);

        let mut inner = self.inner.lock().unwrap();
        inner.release(self.start_version);
        if inner.faults.commit_conflicts > 0 {
            inner.faults.commit_conflicts -= 1;
            let key = writes.keys().next().cloned().unwrap_or_default();
            return Err(StoreError::Conflict { key });
        }
        for key in writes.keys() {
            if inner.versions.get(key).is_some_and(|v| v.version > self.start_version) {
                return Err(StoreError::Conflict { key: key.clone() });
            }
        }
        if writes.is_empty() {
            return Ok(());
        }

        inner.version += 1;
        let version = inner.version;
        let committed_at = unix_now();
        for (key, value) in writes {
            inner.record(key.clone(), version, committed_at);
            match value {
                Some(value) => {
                    inner.data.insert(key, value);
                }
                None => {
                    inner.data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) {
        self.writes.clear();
        if !self.finished {
            self.finished = true;
            self.inner.lock().unwrap().release(self.start_version);
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Ok(mut inner) = self.inner.lock() {
                inner.release(self.start_version);
            }
        }
    }
}

/// Returns `range` unless it is empty, which `BTreeMap::range` rejects.
fn bounded(range: Range) -> Option<Range> {
    let lower = match &range.0 {
        Bound::Included(k) | Bound::Excluded(k) => k,
        Bound::Unbounded => return Some(range),
    };
    match &range.1 {
        Bound::Excluded(upper) if lower >= upper => None,
        _ => Some(range),
    }
}

/// Walks committed data merged with the transaction's pending writes.
///
/// Committed data is re-read on every step, so the iterator never holds
/// the store lock between calls.
struct MemoryIter {
    inner: Arc<Mutex<Inner>>,
    overlay: WriteSet,
    upper: Bound<Bytes>,
    current: Option<(Bytes, Bytes)>,
}

impl MemoryIter {
    fn seek(&mut self, mut lower: Bound<Bytes>) {
        let inner = self.inner.lock().unwrap();
        self.current = loop {
            let Some(range) = bounded((lower.clone(), self.upper.clone())) else {
                break None;
            };
            let committed = inner.data.range(range.clone()).next();
            let pending = self.overlay.range(range).next();

            let (key, value) = match (committed, pending) {
                (None, None) => break None,
                (Some((k, v)), None) => (k.clone(), Some(v.clone())),
                (None, Some((k, v))) => (k.clone(), v.clone()),
                (Some((ck, cv)), Some((pk, pv))) => {
                    if ck < pk {
                        (ck.clone(), Some(cv.clone()))
                    } else {
                        (pk.clone(), pv.clone())
                    }
                }
            };
            match value {
                Some(value) => break Some((key, value)),
                // Deleted in this transaction
                None => lower = Bound::Excluded(key),
            }
        };
    }
}

#[async_trait]
impl KvIterator for MemoryIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(k, _)| &k[..])
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(_, v)| &v[..])
    }

    async fn next(&mut self) -> StoreResult<()> {
        if let Some((key, _)) = self.current.take() {
            self.seek(Bound::Excluded(key));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(txn: &mut dyn Transaction, start: &[u8], upper: &[u8]) -> Vec<(Bytes, Bytes)> {
        let mut iter = txn.iter(start, upper).await.unwrap();
        let mut out = Vec::new();
        while iter.valid() {
            out.push((
                Bytes::copy_from_slice(iter.key()),
                Bytes::copy_from_slice(iter.value()),
            ));
            iter.next().await.unwrap();
        }
        out
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.set(Bytes::from("k"), Bytes::from("v")).await.unwrap();
        assert_eq!(store.get(b"k"), None);

        txn.commit().await.unwrap();
        assert_eq!(store.get(b"k"), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        store.put("k", "old");

        let mut txn = store.begin().await.unwrap();
        txn.delete(b"k").await.unwrap();
        txn.set(Bytes::from("n"), Bytes::from("v")).await.unwrap();
        txn.rollback().await;

        assert_eq!(store.get(b"k"), Some(Bytes::from("old")));
        assert_eq!(store.get(b"n"), None);
        assert_eq!(txn.get(b"k").await, Err(StoreError::Finished));
    }

    #[tokio::test]
    async fn test_reads_see_own_writes() {
        let store = MemoryStore::new();
        store.put("a", "1");
        store.put("b", "2");
        store.put("c", "3");

        let mut txn = store.begin().await.unwrap();
        txn.delete(b"b").await.unwrap();
        txn.set(Bytes::from("bb"), Bytes::from("x")).await.unwrap();
        txn.set(Bytes::from("a"), Bytes::from("9")).await.unwrap();

        assert_eq!(txn.get(b"b").await.unwrap(), None);
        let entries = collect(txn.as_mut(), b"", b"").await;
        let keys: Vec<&[u8]> = entries.iter().map(|(k, _)| &k[..]).collect();
        assert_eq!(keys, vec![&b"a"[..], b"bb", b"c"]);
        assert_eq!(entries[0].1, Bytes::from("9"));
    }

    #[tokio::test]
    async fn test_iter_bounds() {
        let store = MemoryStore::new();
        for key in ["p:1", "p:2", "p:3", "q:1"] {
            store.put(key, "v");
        }
        let mut txn = store.begin().await.unwrap();

        let entries = collect(txn.as_mut(), b"p:2", b"q:").await;
        assert_eq!(entries.len(), 2);
        assert!(collect(txn.as_mut(), b"z", b"a").await.is_empty());
        assert!(collect(txn.as_mut(), b"p:", b"p:").await.is_empty());
    }

    #[tokio::test]
    async fn test_write_conflict() {
        let store = MemoryStore::new();
        store.put("k", "0");

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.set(Bytes::from("k"), Bytes::from("1")).await.unwrap();
        second.delete(b"k").await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(store.get(b"k"), Some(Bytes::from("1")));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::new();
        store.put("s:1", "v");
        store.fail_deletes_under("s:");

        let mut txn = store.begin().await.unwrap();
        assert!(matches!(txn.delete(b"s:1").await, Err(StoreError::Backend(_))));
        txn.delete(b"t:1").await.unwrap();
        txn.rollback().await;

        store.clear_faults();
        store.fail_commits(1);
        let mut txn = store.begin().await.unwrap();
        txn.delete(b"s:1").await.unwrap();
        assert!(matches!(txn.commit().await, Err(StoreError::Conflict { .. })));

        let mut txn = store.begin().await.unwrap();
        txn.delete(b"s:1").await.unwrap();
        txn.commit().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_gc_records_safe_point() {
        let store = MemoryStore::new();
        assert_eq!(store.last_safe_point(), None);
        store.gc(1234, 2).await.unwrap();
        assert_eq!(store.last_safe_point(), Some(1234));
        assert_eq!(store.gc_runs(), 1);
        assert!(store.gc(1, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_gc_prunes_deleted_key_versions() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            let mut txn = store.begin().await.unwrap();
            txn.set(Bytes::from(format!("k{}", i)), Bytes::from("v")).await.unwrap();
            txn.commit().await.unwrap();
            let mut txn = store.begin().await.unwrap();
            txn.delete(format!("k{}", i).as_bytes()).await.unwrap();
            txn.commit().await.unwrap();
        }
        store.put("live", "v");
        assert_eq!(store.len(), 1);
        assert_eq!(store.version_entries(), 1001);

        store.gc(i64::MAX, 2).await.unwrap();
        assert_eq!(store.version_entries(), 1);
        assert_eq!(store.get(b"live"), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_gc_respects_safe_point() {
        let store = MemoryStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.delete(b"k").await.unwrap();
        txn.commit().await.unwrap();

        store.gc(unix_now() - 600, 2).await.unwrap();
        assert_eq!(store.version_entries(), 1);
    }

    #[tokio::test]
    async fn test_gc_keeps_versions_open_transactions_need() {
        let store = MemoryStore::new();
        store.put("k", "0");

        let mut old = store.begin().await.unwrap();
        let mut deleter = store.begin().await.unwrap();
        deleter.delete(b"k").await.unwrap();
        deleter.commit().await.unwrap();

        store.gc(i64::MAX, 2).await.unwrap();
        assert_eq!(store.version_entries(), 1);

        old.set(Bytes::from("k"), Bytes::from("1")).await.unwrap();
        assert!(matches!(old.commit().await, Err(StoreError::Conflict { .. })));

        store.gc(i64::MAX, 2).await.unwrap();
        assert_eq!(store.version_entries(), 0);
    }

    #[tokio::test]
    async fn test_dropped_transaction_does_not_pin_versions() {
        let store = MemoryStore::new();
        let pinned = store.begin().await.unwrap();
        let mut txn = store.begin().await.unwrap();
        txn.delete(b"k").await.unwrap();
        txn.commit().await.unwrap();

        drop(pinned);
        store.gc(i64::MAX, 2).await.unwrap();
        assert_eq!(store.version_entries(), 0);
    }
}

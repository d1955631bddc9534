//! Bounded Reclaim Pass
//!
//! A pass examines at most `batch_limit` records under one work prefix,
//! starting at a cursor, and deletes the objects that qualify. Everything a
//! pass deletes is committed in one transaction: if any delete fails the
//! whole batch is rolled back and the cursor does not move.
//!
//! ```text
//!  cursor                         next cursor
//!    │                                 │
//!    ▼                                 ▼
//!  ──┬──────┬──────┬─── ... ───┬──────┬──────
//!    │ rec0 │ rec1 │           │ recN │ ...      (N = batch_limit)
//!  ──┴──────┴──────┴─── ... ───┴──────┴──────
//!    └──────── one transaction ────────┘
//! ```

use crate::store::keys::{decode_garbage, prefix_end};
use crate::store::{
    delete_prefix, Database, Layout, Object, ObjectError, ObjectId, Storage, StoreError,
    Transaction,
};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Grace period after `expire_at` before an object is reclaimed.
pub const DEFAULT_EXPIRE_TOLERANCE: Duration = Duration::from_secs(300);

/// Which records a pass walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    /// Garbage entries left behind by logical deletes.
    Gc,
    /// Meta records whose expiry has passed.
    Expire,
}

impl WorkKind {
    pub fn name(self) -> &'static str {
        match self {
            WorkKind::Gc => "gc",
            WorkKind::Expire => "expire",
        }
    }

    /// Key prefix the pass iterates.
    pub fn prefix(self, db: &Database) -> Bytes {
        match self {
            WorkKind::Gc => db.garbage_prefix(),
            WorkKind::Expire => db.meta_prefix(),
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors that abort a pass.
#[derive(Debug, Error)]
pub enum ReclaimError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Leadership was lost before the pass could start.
    #[error("not the leader")]
    NotLeader,
}

impl ReclaimError {
    pub fn is_retriable(&self) -> bool {
        match self {
            ReclaimError::Store(err) => err.is_retriable(),
            ReclaimError::NotLeader => false,
        }
    }
}

/// Where the next pass should start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// More records remain; resume at `cursor`.
    More { cursor: Bytes },
    /// The prefix has been walked to the end.
    Exhausted,
}

impl Progress {
    pub fn cursor(&self) -> Option<&Bytes> {
        match self {
            Progress::More { cursor } => Some(cursor),
            Progress::Exhausted => None,
        }
    }
}

/// Running totals across passes.
#[derive(Debug, Default)]
pub struct ReclaimStats {
    pub passes: AtomicU64,
    pub examined: AtomicU64,
    pub reclaimed: AtomicU64,
    pub failed_passes: AtomicU64,
}

impl ReclaimStats {
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    pub fn examined(&self) -> u64 {
        self.examined.load(Ordering::Relaxed)
    }
}

/// Runs reclaim passes against one database.
pub struct Reclaimer {
    store: Arc<dyn Storage>,
    db: Database,
    tolerance: i64,
    stats: ReclaimStats,
}

struct Batch {
    examined: usize,
    reclaimed: usize,
    next: Option<Bytes>,
}

impl Reclaimer {
    pub fn new(store: Arc<dyn Storage>, db: Database) -> Self {
        Self {
            store,
            db,
            tolerance: DEFAULT_EXPIRE_TOLERANCE.as_secs() as i64,
            stats: ReclaimStats::default(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance.as_secs() as i64;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn stats(&self) -> &ReclaimStats {
        &self.stats
    }

    /// Runs one bounded pass of `kind` starting at `cursor`.
    ///
    /// `now` is unix seconds. The returned cursor is strictly greater than
    /// every key this pass examined.
    pub async fn run_pass(
        &self,
        kind: WorkKind,
        cursor: Option<&[u8]>,
        batch_limit: usize,
        now: i64,
    ) -> Result<Progress, ReclaimError> {
        let prefix = kind.prefix(&self.db);
        let start = match cursor {
            Some(cursor) if cursor > &prefix[..] => Bytes::copy_from_slice(cursor),
            _ => prefix.clone(),
        };

        let mut txn = self.store.begin().await?;
        let batch = match self
            .reclaim_batch(txn.as_mut(), kind, &prefix, &start, batch_limit.max(1), now)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                txn.rollback().await;
                self.stats.failed_passes.fetch_add(1, Ordering::Relaxed);
                return Err(err.into());
            }
        };
        if let Err(err) = txn.commit().await {
            self.stats.failed_passes.fetch_add(1, Ordering::Relaxed);
            return Err(err.into());
        }

        self.stats.passes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .examined
            .fetch_add(batch.examined as u64, Ordering::Relaxed);
        self.stats
            .reclaimed
            .fetch_add(batch.reclaimed as u64, Ordering::Relaxed);

        debug!(
            db = %self.db,
            kind = %kind,
            examined = batch.examined,
            reclaimed = batch.reclaimed,
            "Reclaim pass committed"
        );

        Ok(match batch.next {
            Some(cursor) => Progress::More { cursor },
            None => Progress::Exhausted,
        })
    }

    /// Runs passes back to back until the prefix is exhausted.
    ///
    /// Returns the number of objects reclaimed.
    pub async fn sweep(&self, kind: WorkKind, batch_limit: usize, now: i64) -> Result<u64, ReclaimError> {
        let before = self.stats.reclaimed();
        let mut cursor: Option<Bytes> = None;
        loop {
            match self.run_pass(kind, cursor.as_deref(), batch_limit, now).await? {
                Progress::More { cursor: next } => cursor = Some(next),
                Progress::Exhausted => break,
            }
        }
        Ok(self.stats.reclaimed() - before)
    }

    async fn reclaim_batch(
        &self,
        txn: &mut dyn Transaction,
        kind: WorkKind,
        prefix: &[u8],
        start: &[u8],
        batch_limit: usize,
        now: i64,
    ) -> Result<Batch, StoreError> {
        let upper = prefix_end(prefix);
        let mut records = Vec::with_capacity(batch_limit);
        let mut iter = txn.iter(start, &upper).await?;
        while iter.has_prefix(prefix) && records.len() < batch_limit {
            records.push((
                Bytes::copy_from_slice(iter.key()),
                Bytes::copy_from_slice(iter.value()),
            ));
            iter.next().await?;
        }
        let next = iter
            .has_prefix(prefix)
            .then(|| Bytes::copy_from_slice(iter.key()));
        drop(iter);

        let mut reclaimed = 0;
        for (key, value) in &records {
            let done = match kind {
                WorkKind::Expire => self.expire_one(txn, key, value, now).await?,
                WorkKind::Gc => self.collect_one(txn, key, value).await?,
            };
            if done {
                reclaimed += 1;
            }
        }

        Ok(Batch {
            examined: records.len(),
            reclaimed,
            next,
        })
    }

    async fn expire_one(
        &self,
        txn: &mut dyn Transaction,
        key: &Bytes,
        value: &[u8],
        now: i64,
    ) -> Result<bool, StoreError> {
        let object = match Object::decode(value) {
            Ok((object, _)) => object,
            Err(err) => {
                self.skip_corrupt(key, err);
                return Ok(false);
            }
        };
        if !object.is_expired(now, self.tolerance) {
            return Ok(false);
        }

        self.delete_ranges(txn, &object.id, object.object_type.layout())
            .await?;
        txn.delete(key).await?;
        trace!(
            db = %self.db,
            key = ?key,
            object_type = object.object_type.name(),
            expire_at = object.expire_at,
            "Expired object reclaimed"
        );
        Ok(true)
    }

    async fn collect_one(
        &self,
        txn: &mut dyn Transaction,
        key: &Bytes,
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let (id, object_type) = match decode_garbage(&self.db, key, value) {
            Ok(entry) => entry,
            Err(err) => {
                self.skip_corrupt(key, err);
                return Ok(false);
            }
        };

        self.delete_ranges(txn, &id, object_type.layout()).await?;
        txn.delete(key).await?;
        trace!(db = %self.db, id = ?id, object_type = object_type.name(), "Garbage collected");
        Ok(true)
    }

    /// Deletes the key ranges an object owns besides its meta key.
    async fn delete_ranges(
        &self,
        txn: &mut dyn Transaction,
        id: &ObjectId,
        layout: Layout,
    ) -> Result<(), StoreError> {
        match layout {
            Layout::Inline => {}
            Layout::Data => {
                delete_prefix(txn, &self.db.data_prefix(id)).await?;
            }
            Layout::Scored => {
                delete_prefix(txn, &self.db.data_prefix(id)).await?;
                delete_prefix(txn, &self.db.score_prefix(id)).await?;
            }
        }
        Ok(())
    }

    fn skip_corrupt(&self, key: &Bytes, err: ObjectError) {
        warn!(db = %self.db, key = ?key, error = %err, "Skipping unreadable record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ObjectType};

    const NOW: i64 = 1_700_000_000;

    fn setup() -> (MemoryStore, Reclaimer) {
        let store = MemoryStore::new();
        let reclaimer = Reclaimer::new(Arc::new(store.clone()), Database::new("test", 0));
        (store, reclaimer)
    }

    fn put_object(store: &MemoryStore, db: &Database, key: &str, id: u128, object_type: ObjectType, expire_at: i64) -> ObjectId {
        let id = ObjectId::from_u128(id);
        let object = Object::new(id, object_type, NOW - 1000).with_expire_at(expire_at);
        store.put(db.meta_key(key.as_bytes()), object.encode(b""));
        id
    }

    fn put_zset(store: &MemoryStore, db: &Database, key: &str, id: u128, expire_at: i64) -> ObjectId {
        let id = put_object(store, db, key, id, ObjectType::ZSet, expire_at);
        for (member, score) in [("a", 1.0), ("b", 2.5), ("c", -3.0)] {
            store.put(db.data_key(&id, member.as_bytes()), score.to_string());
            store.put(db.score_key(&id, score, member.as_bytes()), "");
        }
        id
    }

    #[tokio::test]
    async fn test_expire_respects_tolerance() {
        let (store, reclaimer) = setup();
        let db = reclaimer.database().clone();
        put_object(&store, &db, "old", 1, ObjectType::String, NOW - 400);
        put_object(&store, &db, "recent", 2, ObjectType::String, NOW - 200);
        put_object(&store, &db, "future", 3, ObjectType::String, NOW + 100);
        put_object(&store, &db, "forever", 4, ObjectType::String, 0);

        let progress = reclaimer
            .run_pass(WorkKind::Expire, None, 100, NOW)
            .await
            .unwrap();

        assert_eq!(progress, Progress::Exhausted);
        assert!(store.get(&db.meta_key(b"old")).is_none());
        assert!(store.get(&db.meta_key(b"recent")).is_some());
        assert!(store.get(&db.meta_key(b"future")).is_some());
        assert!(store.get(&db.meta_key(b"forever")).is_some());
        assert_eq!(reclaimer.stats().reclaimed(), 1);
        assert_eq!(reclaimer.stats().examined(), 4);
    }

    #[tokio::test]
    async fn test_expire_deletes_data_range() {
        let (store, reclaimer) = setup();
        let db = reclaimer.database().clone();
        let hash = put_object(&store, &db, "h", 1, ObjectType::Hash, NOW - 400);
        store.put(db.data_key(&hash, b"f1"), "v1");
        store.put(db.data_key(&hash, b"f2"), "v2");
        let live = put_object(&store, &db, "live", 2, ObjectType::List, 0);
        store.put(db.data_key(&live, b"0"), "x");

        reclaimer
            .run_pass(WorkKind::Expire, None, 100, NOW)
            .await
            .unwrap();

        assert!(store.keys_with_prefix(&db.data_prefix(&hash)).is_empty());
        assert_eq!(store.keys_with_prefix(&db.data_prefix(&live)).len(), 1);
        assert!(store.get(&db.meta_key(b"live")).is_some());
    }

    #[tokio::test]
    async fn test_zset_reclaimed_with_score_index() {
        let (store, reclaimer) = setup();
        let db = reclaimer.database().clone();
        let id = put_zset(&store, &db, "z", 1, NOW - 400);

        reclaimer
            .run_pass(WorkKind::Expire, None, 100, NOW)
            .await
            .unwrap();

        assert!(store.keys_with_prefix(&db.data_prefix(&id)).is_empty());
        assert!(store.keys_with_prefix(&db.score_prefix(&id)).is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_zset_failure_rolls_back_batch() {
        let (store, reclaimer) = setup();
        let db = reclaimer.database().clone();
        put_object(&store, &db, "a-string", 1, ObjectType::String, NOW - 400);
        let id = put_zset(&store, &db, "b-zset", 2, NOW - 400);
        let before = store.len();

        store.fail_deletes_under(db.score_prefix(&id));
        let result = reclaimer.run_pass(WorkKind::Expire, None, 100, NOW).await;

        assert!(matches!(result, Err(ReclaimError::Store(StoreError::Backend(_)))));
        assert_eq!(store.len(), before);
        assert_eq!(store.keys_with_prefix(&db.data_prefix(&id)).len(), 3);
        assert_eq!(store.keys_with_prefix(&db.score_prefix(&id)).len(), 3);
        assert!(store.get(&db.meta_key(b"a-string")).is_some());
        assert_eq!(reclaimer.stats().failed_passes.load(Ordering::Relaxed), 1);

        store.clear_faults();
        reclaimer
            .run_pass(WorkKind::Expire, None, 100, NOW)
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_resumes_across_passes() {
        let (store, reclaimer) = setup();
        let db = reclaimer.database().clone();
        let batch = 4;
        for i in 0..(3 * batch) {
            put_object(&store, &db, &format!("key-{:02}", i), i as u128, ObjectType::String, NOW - 400);
        }

        let mut cursor: Option<Bytes> = None;
        let mut cursors = Vec::new();
        let mut passes = 0;
        loop {
            passes += 1;
            let progress = reclaimer
                .run_pass(WorkKind::Expire, cursor.as_deref(), batch, NOW)
                .await
                .unwrap();
            match progress {
                Progress::More { cursor: next } => {
                    cursors.push(next.clone());
                    cursor = Some(next);
                }
                Progress::Exhausted => break,
            }
            assert!(passes < 10, "pass loop did not terminate");
        }

        assert_eq!(passes, 3);
        assert!(cursors.windows(2).all(|w| w[0] < w[1]));
        assert!(store.keys_with_prefix(&db.meta_prefix()).is_empty());
        assert_eq!(reclaimer.stats().reclaimed(), 3 * batch as u64);
    }

    #[tokio::test]
    async fn test_cursor_skips_examined_live_keys() {
        let (store, reclaimer) = setup();
        let db = reclaimer.database().clone();
        for i in 0..5u128 {
            put_object(&store, &db, &format!("live-{}", i), i, ObjectType::String, 0);
        }

        let first = reclaimer
            .run_pass(WorkKind::Expire, None, 2, NOW)
            .await
            .unwrap();
        let cursor = first.cursor().cloned().unwrap();
        assert_eq!(cursor, db.meta_key(b"live-2"));

        let second = reclaimer
            .run_pass(WorkKind::Expire, Some(&cursor[..]), 2, NOW)
            .await
            .unwrap();
        assert_eq!(second.cursor(), Some(&db.meta_key(b"live-4")));
        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn test_gc_removes_garbage_and_data() {
        let (store, reclaimer) = setup();
        let db = reclaimer.database().clone();
        let dead = ObjectId::from_u128(10);
        store.put(db.data_key(&dead, b"m1"), "1");
        store.put(db.score_key(&dead, 1.0, b"m1"), "");
        store.put(db.garbage_key(&dead), vec![ObjectType::ZSet.tag()]);
        let live = put_object(&store, &db, "set", 11, ObjectType::Set, 0);
        store.put(db.data_key(&live, b"m"), "");

        let reclaimed = reclaimer.sweep(WorkKind::Gc, 10, NOW).await.unwrap();

        assert_eq!(reclaimed, 1);
        assert!(store.keys_with_prefix(&db.garbage_prefix()).is_empty());
        assert!(store.keys_with_prefix(&db.data_prefix(&dead)).is_empty());
        assert!(store.keys_with_prefix(&db.score_prefix(&dead)).is_empty());
        assert_eq!(store.keys_with_prefix(&db.data_prefix(&live)).len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_records_are_skipped() {
        let (store, reclaimer) = setup();
        let db = reclaimer.database().clone();
        store.put(db.meta_key(b"junk"), "not a header");
        store.put(db.garbage_key(&ObjectId::from_u128(1)), vec![99u8]);

        assert_eq!(reclaimer.sweep(WorkKind::Expire, 10, NOW).await.unwrap(), 0);
        assert_eq!(reclaimer.sweep(WorkKind::Gc, 10, NOW).await.unwrap(), 0);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_other_databases_untouched() {
        let (store, reclaimer) = setup();
        let other = Database::new("test", 1);
        put_object(&store, &other, "old", 1, ObjectType::String, NOW - 400);

        reclaimer.sweep(WorkKind::Expire, 10, NOW).await.unwrap();
        assert!(store.get(&other.meta_key(b"old")).is_some());
    }

    #[tokio::test]
    async fn test_conflict_is_retriable() {
        let (store, reclaimer) = setup();
        let db = reclaimer.database().clone();
        put_object(&store, &db, "old", 1, ObjectType::String, NOW - 400);
        store.fail_commits(1);

        let err = reclaimer
            .run_pass(WorkKind::Expire, None, 10, NOW)
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert!(store.get(&db.meta_key(b"old")).is_some());
        assert!(!ReclaimError::NotLeader.is_retriable());
    }
}

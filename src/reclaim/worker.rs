//! Leader-Gated Reclaim Worker
//!
//! A [`Worker`] owns the cursor for one (database, work kind) pair. On every
//! tick it checks leadership, runs one pass from the cursor, and saves the
//! cursor the pass returned. A failed pass leaves the cursor where the last
//! committed pass put it, so the next tick retries the same records.

use super::pass::{Progress, ReclaimError, Reclaimer, WorkKind};
use super::shutdown_signal;
use crate::config::WorkerConfig;
use crate::coordination::Elect;
use crate::retry::{Failure, Retry, RetryError};
use crate::store::unix_now;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Another instance leads; nothing was touched.
    Follower,
    /// A pass committed.
    Ran(Progress),
}

pub struct Worker {
    reclaimer: Arc<Reclaimer>,
    elect: Arc<Elect>,
    kind: WorkKind,
    interval: Duration,
    batch_limit: usize,
    retry: Retry,
    cursor: Option<Bytes>,
}

impl Worker {
    pub fn new(
        reclaimer: Arc<Reclaimer>,
        elect: Arc<Elect>,
        kind: WorkKind,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            reclaimer,
            elect,
            kind,
            interval: config.interval,
            batch_limit: config.batch_limit,
            retry: Retry::global().clone(),
            cursor: None,
        }
    }

    /// Replaces the retry policy used around each pass.
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// First key the next pass will examine; `None` means the start.
    pub fn cursor(&self) -> Option<&Bytes> {
        self.cursor.as_ref()
    }

    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    /// Runs one pass if this instance leads.
    ///
    /// Retriable store errors are retried until `cancelled` resolves.
    pub async fn tick<C>(&mut self, cancelled: C) -> Result<Tick, RetryError<ReclaimError>>
    where
        C: Future<Output = ()>,
    {
        if !self.elect.is_leader() {
            trace!(db = %self.reclaimer.database(), kind = %self.kind, "Not leader, skipping");
            return Ok(Tick::Follower);
        }

        let reclaimer = &self.reclaimer;
        let elect = &self.elect;
        let kind = self.kind;
        let batch_limit = self.batch_limit;
        let cursor = self.cursor.clone();

        let progress = self
            .retry
            .run(cancelled, || {
                let cursor = cursor.clone();
                async move {
                    if !elect.is_leader() {
                        return Err(Failure::Permanent(ReclaimError::NotLeader));
                    }
                    reclaimer
                        .run_pass(kind, cursor.as_deref(), batch_limit, unix_now())
                        .await
                        .map_err(|err| Failure::classify(err, ReclaimError::is_retriable))
                }
            })
            .await?;

        self.cursor = progress.cursor().cloned();
        Ok(Tick::Ran(progress))
    }

    /// Runs the worker until `shutdown` flips to `true`.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let db = self.reclaimer.database().clone();
            let kind = self.kind;
            info!(db = %db, kind = %kind, interval_ms = self.interval.as_millis() as u64, "Reclaim worker started");

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }

                match self.tick(shutdown_signal(shutdown.clone())).await {
                    Ok(Tick::Follower) => {}
                    Ok(Tick::Ran(Progress::More { .. })) => {}
                    Ok(Tick::Ran(Progress::Exhausted)) => {
                        trace!(db = %db, kind = %kind, "Reached end of key range");
                    }
                    Err(RetryError::Cancelled(())) => break,
                    Err(RetryError::Failed(ReclaimError::NotLeader)) => {
                        debug!(db = %db, kind = %kind, "Leadership lost before pass");
                    }
                    Err(RetryError::Failed(err)) => {
                        warn!(db = %db, kind = %kind, error = %err, "Reclaim pass failed");
                    }
                }
            }

            info!(db = %db, kind = %kind, "Reclaim worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{register_elect, Coordinator, MemoryCoordinator};
    use crate::retry::Fixed;
    use crate::store::{Database, MemoryStore, Object, ObjectId, ObjectType};

    const TTL: Duration = Duration::from_secs(60);

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    fn put_expired(store: &MemoryStore, db: &Database, count: u128) {
        let now = unix_now();
        for i in 0..count {
            let object = Object::new(ObjectId::from_u128(i), ObjectType::String, now - 1000)
                .with_expire_at(now - 400);
            store.put(db.meta_key(format!("k{:03}", i).as_bytes()), object.encode(b"v"));
        }
    }

    struct Fixture {
        store: MemoryStore,
        db: Database,
        leader: Arc<Elect>,
        follower: Arc<Elect>,
        reclaimer: Arc<Reclaimer>,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let db = Database::new("test", 0);
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
        let key = db.leader_key("expire");

        let leader = register_elect(Arc::clone(&coordinator), key.clone(), "a", TTL);
        assert!(eventually(|| leader.is_leader()).await);
        let follower = register_elect(coordinator, key, "b", TTL);

        let reclaimer = Arc::new(Reclaimer::new(Arc::new(store.clone()), db.clone()));
        Fixture {
            store,
            db,
            leader,
            follower,
            reclaimer,
        }
    }

    fn config(batch_limit: usize) -> WorkerConfig {
        WorkerConfig {
            interval: Duration::from_millis(10),
            batch_limit,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_follower_does_nothing() {
        let f = fixture().await;
        put_expired(&f.store, &f.db, 3);

        let mut worker = Worker::new(Arc::clone(&f.reclaimer), f.follower, WorkKind::Expire, &config(10));
        let tick = worker.tick(std::future::pending()).await.unwrap();

        assert_eq!(tick, Tick::Follower);
        assert_eq!(f.store.len(), 3);
    }

    #[tokio::test]
    async fn test_cursor_advances_and_wraps() {
        let f = fixture().await;
        put_expired(&f.store, &f.db, 5);

        let mut worker = Worker::new(f.reclaimer, f.leader, WorkKind::Expire, &config(2));
        let mut previous: Option<Bytes> = None;
        for _ in 0..2 {
            let tick = worker.tick(std::future::pending()).await.unwrap();
            assert!(matches!(tick, Tick::Ran(Progress::More { .. })));
            let cursor = worker.cursor().cloned().unwrap();
            assert!(previous.as_ref().map_or(true, |p| *p < cursor));
            previous = Some(cursor);
        }

        let last = worker.tick(std::future::pending()).await.unwrap();
        assert_eq!(last, Tick::Ran(Progress::Exhausted));
        assert_eq!(worker.cursor(), None);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_pass_keeps_cursor() {
        let f = fixture().await;
        put_expired(&f.store, &f.db, 4);

        let mut worker = Worker::new(f.reclaimer, f.leader, WorkKind::Expire, &config(2));
        worker.tick(std::future::pending()).await.unwrap();
        let saved = worker.cursor().cloned();
        assert!(saved.is_some());

        f.store.fail_deletes_under(f.db.meta_prefix());
        let result = worker.tick(std::future::pending()).await;
        assert!(matches!(result, Err(RetryError::Failed(ReclaimError::Store(_)))));
        assert_eq!(worker.cursor().cloned(), saved);
        assert_eq!(f.store.len(), 2);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let f = fixture().await;
        put_expired(&f.store, &f.db, 1);
        f.store.fail_commits(2);

        let mut worker = Worker::new(f.reclaimer, f.leader, WorkKind::Expire, &config(10))
            .with_retry(Retry::new(Fixed::new(Duration::from_millis(1))));
        let tick = worker.tick(std::future::pending()).await.unwrap();

        assert_eq!(tick, Tick::Ran(Progress::Exhausted));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_worker_stops_on_shutdown() {
        let f = fixture().await;
        put_expired(&f.store, &f.db, 3);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Worker::new(f.reclaimer, f.leader, WorkKind::Expire, &config(10)).spawn(shutdown_rx);
        assert!(eventually(|| f.store.is_empty()).await);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}

//! Background Reclaim Engine
//!
//! Objects are never deleted in the request path when that would mean
//! touching an unbounded number of keys. Instead the command layer leaves a
//! garbage entry (or an expiry timestamp) behind, and the workers in this
//! module remove the data later, in bounded transactions, on exactly one
//! instance of the fleet.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────── Maintenance ──────────────────────────┐
//! │                                                                 │
//! │  db 0: Elect(gc) ──> Worker(gc)      Elect(expire) ──> Worker   │
//! │  db 1: Elect(gc) ──> Worker(gc)      Elect(expire) ──> Worker   │
//! │  ...                                                            │
//! │  namespace: Elect(storage-gc) ──> StorageGcWorker               │
//! │                                                                 │
//! └──────────────────── watch::channel shutdown ────────────────────┘
//! ```
//!
//! Each worker wakes on its interval, checks `is_leader()`, and runs one
//! [`Reclaimer::run_pass`] from its saved cursor.
//!
//! ## Modules
//!
//! - `pass`: One bounded scan-and-delete transaction
//! - `worker`: Leader-gated periodic driver with a resumable cursor
//! - `storage_gc`: Leader-gated trigger for the store's own MVCC GC
//! - `service`: Starts and stops every election and worker

pub mod pass;
pub mod service;
pub mod storage_gc;
pub mod worker;

pub use pass::{Progress, ReclaimError, ReclaimStats, Reclaimer, WorkKind, DEFAULT_EXPIRE_TOLERANCE};
pub use service::Maintenance;
pub use storage_gc::StorageGcWorker;
pub use worker::{Tick, Worker};

use tokio::sync::watch;

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(shutdown_signal(rx));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        waiter.await.unwrap();

        let (tx, rx) = watch::channel(false);
        drop(tx);
        shutdown_signal(rx).await;
    }
}

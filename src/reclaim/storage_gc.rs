//! Storage-Engine GC Trigger
//!
//! The backing store keeps old MVCC versions until told they are no longer
//! needed. One instance per namespace, chosen by election, periodically
//! asks the store to discard versions older than
//! `now - safe_point_lifetime`.

use super::shutdown_signal;
use crate::config::StorageGcConfig;
use crate::coordination::Elect;
use crate::retry::{Failure, Retry, RetryError};
use crate::store::{unix_now, Storage, StoreError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

pub struct StorageGcWorker {
    store: Arc<dyn Storage>,
    elect: Arc<Elect>,
    config: StorageGcConfig,
    retry: Retry,
}

impl StorageGcWorker {
    pub fn new(store: Arc<dyn Storage>, elect: Arc<Elect>, config: StorageGcConfig) -> Self {
        Self {
            store,
            elect,
            config,
            retry: Retry::global().clone(),
        }
    }

    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// Safe point for a GC run at `now` (unix seconds).
    pub fn safe_point(&self, now: i64) -> i64 {
        now - self.config.safe_point_lifetime.as_secs() as i64
    }

    /// Runs one GC round if this instance leads.
    ///
    /// Returns the safe point used, or `None` when not leader.
    pub async fn tick<C>(&self, now: i64, cancelled: C) -> Result<Option<i64>, RetryError<StoreError>>
    where
        C: Future<Output = ()>,
    {
        if !self.elect.is_leader() {
            trace!("Not storage GC leader, skipping");
            return Ok(None);
        }

        let safe_point = self.safe_point(now);
        let concurrency = self.config.concurrency;
        let store = &self.store;
        self.retry
            .run(cancelled, || async move {
                store
                    .gc(safe_point, concurrency)
                    .await
                    .map_err(|err| Failure::classify(err, StoreError::is_retriable))
            })
            .await?;

        info!(safe_point, concurrency, "Storage GC finished");
        Ok(Some(safe_point))
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                "Storage GC worker started"
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.interval) => {}
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }

                match self.tick(unix_now(), shutdown_signal(shutdown.clone())).await {
                    Ok(_) => {}
                    Err(RetryError::Cancelled(())) => break,
                    Err(RetryError::Failed(err)) => {
                        warn!(error = %err, "Storage GC failed");
                    }
                }
            }

            info!("Storage GC worker stopped");
        })
    }
}

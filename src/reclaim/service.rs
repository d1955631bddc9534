//! Maintenance Supervisor
//!
//! Starts, for every configured database, one election and one worker per
//! enabled work kind, plus the namespace-wide storage GC election and
//! worker. All of them stop when the [`Maintenance`] handle is dropped.

use super::pass::{Reclaimer, WorkKind};
use super::storage_gc::StorageGcWorker;
use super::worker::Worker;
use crate::config::{Config, WorkerConfig};
use crate::coordination::{register_elect, Coordinator, Elect};
use crate::store::keys::storage_gc_leader_key;
use crate::store::Storage;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Handle to every running election and worker.
///
/// Dropping the handle signals shutdown and releases all elections.
pub struct Maintenance {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    elections: Vec<Arc<Elect>>,
    reclaimers: Vec<Arc<Reclaimer>>,
}

impl Maintenance {
    pub fn start(store: Arc<dyn Storage>, coordinator: Arc<dyn Coordinator>, config: &Config) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let instance = config.server.instance_id();
        let mut tasks = Vec::new();
        let mut elections = Vec::new();
        let mut reclaimers = Vec::new();

        let kinds: [(WorkKind, &WorkerConfig); 2] = [
            (WorkKind::Gc, &config.gc),
            (WorkKind::Expire, &config.expire.worker),
        ];

        for db in config.databases() {
            let reclaimer = Arc::new(
                Reclaimer::new(Arc::clone(&store), db.clone()).with_tolerance(config.expire.tolerance),
            );
            for (kind, worker_config) in kinds {
                if worker_config.disable {
                    continue;
                }
                let elect = register_elect(
                    Arc::clone(&coordinator),
                    db.leader_key(kind.name()),
                    instance.clone(),
                    worker_config.leader_lifetime,
                );
                let worker = Worker::new(Arc::clone(&reclaimer), Arc::clone(&elect), kind, worker_config);
                tasks.push(worker.spawn(shutdown_rx.clone()));
                elections.push(elect);
            }
            reclaimers.push(reclaimer);
        }

        if !config.storage_gc.disable {
            let elect = register_elect(
                Arc::clone(&coordinator),
                storage_gc_leader_key(&config.server.namespace),
                instance.clone(),
                config.storage_gc.leader_lifetime,
            );
            let worker = StorageGcWorker::new(Arc::clone(&store), Arc::clone(&elect), config.storage_gc.clone());
            tasks.push(worker.spawn(shutdown_rx.clone()));
            elections.push(elect);
        }

        info!(
            instance = %instance,
            databases = config.server.databases,
            workers = tasks.len(),
            "Maintenance started"
        );

        Self {
            shutdown_tx,
            tasks,
            elections,
            reclaimers,
        }
    }

    pub fn workers(&self) -> usize {
        self.tasks.len()
    }

    pub fn elections(&self) -> &[Arc<Elect>] {
        &self.elections
    }

    /// Total objects reclaimed by every worker so far.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimers.iter().map(|r| r.stats().reclaimed()).sum()
    }

    /// Signals every worker to stop after its current pass.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops every worker and waits for them to finish.
    pub async fn shutdown(mut self) {
        self.stop();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("Maintenance stopped");
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.stop();
    }
}

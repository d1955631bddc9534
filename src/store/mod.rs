//! Backing Store Interface
//!
//! Strata keeps every object in a distributed transactional key-value
//! store. This module defines the operations the rest of the crate needs
//! from that store, plus the key scheme layered on top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   begin()   ┌──────────────────────────────┐
//! │ Reclaim pass  │────────────>│ Transaction                  │
//! │ Command layer │             │  get / set / delete          │
//! └───────────────┘             │  iter(start, upper) ──> KvIterator
//!                               │  commit / rollback           │
//!                               └──────────────────────────────┘
//! ```
//!
//! Writes are buffered inside the transaction and become visible
//! atomically at commit. A transaction that loses a write-write race fails
//! its commit with [`StoreError::Conflict`], which callers treat as
//! retriable.
//!
//! ## Modules
//!
//! - `keys`: Object key scheme and object header codec
//! - `memory`: In-process ordered-map backend

pub mod keys;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

pub use keys::{unix_now, Database, Layout, Object, ObjectError, ObjectId, ObjectType};
pub use memory::MemoryStore;

/// Errors reported by the backing store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another transaction committed a write to the same key first.
    #[error("write conflict on key {key:?}")]
    Conflict { key: Bytes },

    /// The store could not be reached or is temporarily overloaded.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    Finished,

    /// Any other store-side failure.
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether running the whole transaction again may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A transactional, ordered key-value store.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Starts a new transaction.
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>>;

    /// Runs the store's own MVCC garbage collection, discarding versions
    /// older than `safe_point` (unix seconds).
    async fn gc(&self, safe_point: i64, concurrency: usize) -> StoreResult<()>;
}

/// One optimistic transaction.
///
/// After `commit` or `rollback` every further call fails with
/// [`StoreError::Finished`].
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, key: &[u8]) -> StoreResult<Option<Bytes>>;

    async fn set(&mut self, key: Bytes, value: Bytes) -> StoreResult<()>;

    /// Deletes `key`. Deleting a missing key is not an error.
    async fn delete(&mut self, key: &[u8]) -> StoreResult<()>;

    /// Iterates keys in `[start, upper)` in ascending order, including this
    /// transaction's own uncommitted writes. An empty `upper` means no
    /// upper bound.
    async fn iter(&mut self, start: &[u8], upper: &[u8]) -> StoreResult<Box<dyn KvIterator>>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self);
}

/// Forward cursor over a key range.
#[async_trait]
pub trait KvIterator: Send {
    fn valid(&self) -> bool;

    /// Current key. Only meaningful while `valid()`.
    fn key(&self) -> &[u8];

    /// Current value. Only meaningful while `valid()`.
    fn value(&self) -> &[u8];

    async fn next(&mut self) -> StoreResult<()>;

    /// True while the iterator is positioned on a key starting with `prefix`.
    fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.valid() && self.key().starts_with(prefix)
    }
}

/// Deletes every key starting with `prefix` inside `txn`.
///
/// Returns the number of keys deleted.
pub async fn delete_prefix(txn: &mut dyn Transaction, prefix: &[u8]) -> StoreResult<usize> {
    let upper = keys::prefix_end(prefix);
    let mut iter = txn.iter(prefix, &upper).await?;
    let mut doomed = Vec::new();
    while iter.has_prefix(prefix) {
        doomed.push(Bytes::copy_from_slice(iter.key()));
        iter.next().await?;
    }
    drop(iter);

    for key in &doomed {
        txn.delete(key).await?;
    }
    Ok(doomed.len())
}

/// Opens the backing store named by `address`.
///
/// Only the in-process `memory://` backend ships with this crate; remote
/// stores are supplied by embedding applications through [`Storage`].
pub fn connect(address: &str) -> anyhow::Result<Arc<dyn Storage>> {
    match address.split_once("://") {
        Some(("memory", _)) => Ok(Arc::new(MemoryStore::new())),
        Some((scheme, _)) => anyhow::bail!("unsupported store scheme '{}' in {}", scheme, address),
        None => anyhow::bail!("store address must look like <scheme>://<host>, got '{}'", address),
    }
}

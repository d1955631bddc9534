//! Coordination Service Interface
//!
//! Leader election needs two things from the coordination service: leased
//! sessions that disappear when their owner stops renewing them, and a
//! campaign primitive that grants a key to at most one live session at a
//! time.
//!
//! ## Modules
//!
//! - `election`: Background campaign loop and the `is_leader()` flag
//! - `memory`: In-process coordinator with FIFO grants

pub mod election;
pub mod memory;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use election::{register_elect, Elect};
pub use memory::MemoryCoordinator;

/// Errors reported by the coordination service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordError {
    /// The session's lease ran out or was revoked.
    #[error("session expired")]
    SessionExpired,

    #[error("coordination service unavailable: {0}")]
    Unavailable(String),
}

pub type CoordResult<T> = Result<T, CoordError>;

/// Hands out leased sessions.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Creates a session whose lease lasts `ttl` without renewal.
    async fn session(&self, ttl: Duration) -> CoordResult<Box<dyn Session>>;
}

/// A leased session. Dropping it revokes the lease.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> u64;

    /// Waits until this session holds `key`, publishing `value` as the
    /// leader's identity. Fails if the session expires while waiting.
    async fn campaign(&self, key: &str, value: &str) -> CoordResult<()>;

    /// Resolves once the session is no longer valid.
    async fn done(&self);
}

/// Opens the coordination service named by `address`.
pub fn connect(address: &str) -> anyhow::Result<std::sync::Arc<dyn Coordinator>> {
    match address.split_once("://") {
        Some(("memory", _)) => Ok(std::sync::Arc::new(MemoryCoordinator::new())),
        Some((scheme, _)) => anyhow::bail!("unsupported coordination scheme '{}' in {}", scheme, address),
        None => anyhow::bail!("coordination address must look like <scheme>://<host>, got '{}'", address),
    }
}

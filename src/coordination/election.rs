//! Leader Election
//!
//! Each [`Elect`] runs one background campaign for a key. Many processes
//! may register the same key; the coordination service grants it to at
//! most one live session, and only that process observes `is_leader()`.
//!
//! ## Campaign Loop
//!
//! ```text
//!   ┌──> create session (ttl) ──> campaign(key, value) ──> leader = true
//!   │                                                        │
//!   │                                                  session.done()
//!   │                                                        │
//!   └─────────────────────────────────────────────── leader = false
//! ```
//!
//! Failures creating a session or campaigning are logged and retried after
//! a short pause. The flag is polled by workers, so a worker that just saw
//! `true` may still run one batch after the session was lost.

use super::{CoordError, Coordinator};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Pause before retrying a failed session or campaign request.
pub const DEFAULT_RETRY_PAUSE: Duration = Duration::from_millis(200);

/// Handle to a running campaign.
///
/// Dropping the handle aborts the campaign and releases its session.
#[derive(Debug)]
pub struct Elect {
    key: String,
    value: String,
    leader: Arc<RwLock<bool>>,
    task: JoinHandle<()>,
}

/// Starts campaigning for `key` in the background.
///
/// `value` identifies this process to observers of the election, usually
/// the instance id. `ttl` bounds how long a crashed leader keeps the key.
pub fn register_elect(
    coordinator: Arc<dyn Coordinator>,
    key: impl Into<String>,
    value: impl Into<String>,
    ttl: Duration,
) -> Arc<Elect> {
    Arc::new(Elect::spawn(coordinator, key, value, ttl, DEFAULT_RETRY_PAUSE))
}

impl Elect {
    /// Like [`register_elect`], with an explicit retry pause.
    pub fn spawn(
        coordinator: Arc<dyn Coordinator>,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
        retry_pause: Duration,
    ) -> Self {
        let key = key.into();
        let value = value.into();
        let leader = Arc::new(RwLock::new(false));

        let task = tokio::spawn(campaign_loop(
            coordinator,
            key.clone(),
            value.clone(),
            ttl,
            retry_pause,
            Arc::clone(&leader),
        ));

        Self {
            key,
            value,
            leader,
            task,
        }
    }

    /// Whether this process currently holds the key.
    pub fn is_leader(&self) -> bool {
        self.leader.read().map(|flag| *flag).unwrap_or(false)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Drop for Elect {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn set_leader(flag: &RwLock<bool>, leading: bool) {
    if let Ok(mut flag) = flag.write() {
        *flag = leading;
    }
}

async fn campaign_loop(
    coordinator: Arc<dyn Coordinator>,
    key: String,
    value: String,
    ttl: Duration,
    retry_pause: Duration,
    leader: Arc<RwLock<bool>>,
) {
    loop {
        let session = match coordinator.session(ttl).await {
            Ok(session) => session,
            Err(err) => {
                warn!(key = %key, error = %err, "Failed to create election session");
                tokio::time::sleep(retry_pause).await;
                continue;
            }
        };

        match session.campaign(&key, &value).await {
            Ok(()) => {}
            Err(CoordError::SessionExpired) => {
                warn!(key = %key, session = session.id(), "Session expired while campaigning");
                continue;
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Campaign failed");
                tokio::time::sleep(retry_pause).await;
                continue;
            }
        }

        set_leader(&leader, true);
        info!(key = %key, value = %value, session = session.id(), "Elected leader");

        session.done().await;

        set_leader(&leader, false);
        info!(key = %key, value = %value, "Lost leadership");
    }
}

//! In-Process Coordinator
//!
//! Candidates for a key queue up in campaign order; the head of the queue
//! is the leader. Invalidating a session removes it from every queue, which
//! promotes the next candidate. Sessions never expire on their own here:
//! the process that owns them is the process that would renew them.

use super::{CoordError, CoordResult, Coordinator, Session};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug)]
struct Candidate {
    session: u64,
    value: String,
}

#[derive(Debug)]
struct Election {
    queue: VecDeque<Candidate>,
    /// Session currently at the head of the queue.
    leader: watch::Sender<Option<u64>>,
}

impl Election {
    fn new() -> Self {
        let (leader, _) = watch::channel(None);
        Self {
            queue: VecDeque::new(),
            leader,
        }
    }

    fn publish(&self) {
        let head = self.queue.front().map(|c| c.session);
        self.leader.send_if_modified(|current| {
            if *current == head {
                false
            } else {
                *current = head;
                true
            }
        });
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_session: u64,
    /// Live sessions; the sender flips to `true` on invalidation.
    sessions: HashMap<u64, watch::Sender<bool>>,
    elections: HashMap<String, Election>,
    failing_sessions: usize,
}

impl Inner {
    fn invalidate(&mut self, session: u64) -> bool {
        let Some(expired) = self.sessions.remove(&session) else {
            return false;
        };
        let _ = expired.send(true);
        for election in self.elections.values_mut() {
            election.queue.retain(|c| c.session != session);
            election.publish();
        }
        true
    }
}

/// Coordinator backed by process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revokes a session as if its lease had run out.
    pub fn invalidate(&self, session: u64) -> bool {
        let invalidated = self.inner.lock().unwrap().invalidate(session);
        if invalidated {
            debug!(session, "Session invalidated");
        }
        invalidated
    }

    /// Revokes whichever session currently leads `key`.
    pub fn invalidate_leader(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let head = inner
            .elections
            .get(key)
            .and_then(|e| e.queue.front())
            .map(|c| c.session);
        match head {
            Some(session) => inner.invalidate(session),
            None => false,
        }
    }

    /// Value published by the current leader of `key`.
    pub fn leader(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .elections
            .get(key)
            .and_then(|e| e.queue.front())
            .map(|c| c.value.clone())
    }

    /// Number of sessions still alive.
    pub fn live_sessions(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Makes the next `n` session requests fail.
    pub fn fail_sessions(&self, n: usize) {
        self.inner.lock().unwrap().failing_sessions = n;
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn session(&self, _ttl: Duration) -> CoordResult<Box<dyn Session>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_sessions > 0 {
            inner.failing_sessions -= 1;
            return Err(CoordError::Unavailable("injected session failure".into()));
        }
        inner.next_session += 1;
        let id = inner.next_session;
        let (expired_tx, expired) = watch::channel(false);
        inner.sessions.insert(id, expired_tx);

        Ok(Box::new(MemorySession {
            id,
            inner: Arc::clone(&self.inner),
            expired,
        }))
    }
}

struct MemorySession {
    id: u64,
    inner: Arc<Mutex<Inner>>,
    expired: watch::Receiver<bool>,
}

impl MemorySession {
    /// Joins the queue for `key`, returning a watch on its head.
    fn enqueue(&self, key: &str, value: &str) -> CoordResult<watch::Receiver<Option<u64>>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.sessions.contains_key(&self.id) {
            return Err(CoordError::SessionExpired);
        }
        let election = inner
            .elections
            .entry(key.to_string())
            .or_insert_with(Election::new);
        if !election.queue.iter().any(|c| c.session == self.id) {
            election.queue.push_back(Candidate {
                session: self.id,
                value: value.to_string(),
            });
            election.publish();
        }
        Ok(election.leader.subscribe())
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn campaign(&self, key: &str, value: &str) -> CoordResult<()> {
        let mut leader = self.enqueue(key, value)?;
        let mut expired = self.expired.clone();

        loop {
            if *leader.borrow_and_update() == Some(self.id) {
                return Ok(());
            }
            tokio::select! {
                changed = leader.changed() => {
                    if changed.is_err() {
                        return Err(CoordError::SessionExpired);
                    }
                }
                _ = wait_expired(&mut expired) => return Err(CoordError::SessionExpired),
            }
        }
    }

    async fn done(&self) {
        wait_expired(&mut self.expired.clone()).await;
    }
}

/// Resolves once the flag turns `true` or the coordinator goes away.
async fn wait_expired(expired: &mut watch::Receiver<bool>) {
    while !*expired.borrow_and_update() {
        if expired.changed().await.is_err() {
            return;
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.invalidate(self.id);
        }
    }
}

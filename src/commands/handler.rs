//! Command Handler
//!
//! Executes parsed commands for one client connection. Connection-level
//! commands (`PING`, `ECHO`, `QUIT`, `SELECT`, `TIME`) are answered
//! directly; keyspace commands run inside one store transaction each.
//!
//! ## Keyspace
//!
//! ```text
//! String:  meta key holds header + value
//! Hash:    meta key holds header; fields live under the data range
//! ```
//!
//! Reads treat an object whose `expire_at` has passed as absent even before
//! the expire worker has removed it. Deleting or overwriting a hash only
//! removes its meta key and leaves a garbage entry; the GC worker deletes
//! the fields later.
//!
//! ## Conflicts
//!
//! A transaction that loses a write conflict is run again with the global
//! retry policy, for at most [`RETRY_BUDGET`].

use super::command::{Command, CommandError};
use crate::protocol::Frame;
use crate::retry::{Failure, Retry, RetryError};
use crate::store::keys::prefix_end;
use crate::store::{unix_now, Database, Layout, Object, ObjectId, ObjectType, Storage, Transaction};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// How long a command keeps retrying write conflicts.
pub const RETRY_BUDGET: Duration = Duration::from_secs(1);

/// The reply to one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub frame: Frame,
    /// Close the connection after sending `frame`.
    pub close: bool,
}

impl From<Frame> for Reply {
    fn from(frame: Frame) -> Self {
        Self { frame, close: false }
    }
}

/// Per-connection command executor.
///
/// Cloning is cheap; each connection owns one and tracks its selected
/// database in it.
#[derive(Clone)]
pub struct CommandHandler {
    store: Arc<dyn Storage>,
    namespace: String,
    databases: u32,
    db: Database,
}

impl CommandHandler {
    pub fn new(store: Arc<dyn Storage>, namespace: impl Into<String>, databases: u32) -> Self {
        let namespace = namespace.into();
        Self {
            db: Database::new(namespace.clone(), 0),
            store,
            namespace,
            databases,
        }
    }

    /// Currently selected database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Executes one request given as its bulk-string arguments.
    pub async fn execute(&mut self, args: Vec<Bytes>) -> Reply {
        let command = match Command::parse(&args) {
            Ok(command) => command,
            Err(err) => return Frame::error(err.to_string()).into(),
        };

        match command {
            Command::Ping(None) => Frame::pong().into(),
            Command::Ping(Some(message)) | Command::Echo(message) => Frame::bulk_string(message).into(),
            Command::Quit => Reply {
                frame: Frame::ok(),
                close: true,
            },
            Command::Select(index) => {
                if index >= self.databases {
                    return Frame::error(CommandError::InvalidDb.to_string()).into();
                }
                self.db = Database::new(self.namespace.clone(), index);
                Frame::ok().into()
            }
            Command::Time => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                Frame::array(vec![
                    Frame::bulk_string(now.as_secs().to_string()),
                    Frame::bulk_string(now.subsec_micros().to_string()),
                ])
                .into()
            }
            command => match self.run(&command).await {
                Ok(frame) => frame.into(),
                Err(err) => {
                    debug!(db = %self.db, error = %err, "Command failed");
                    Frame::error(err.to_string()).into()
                }
            },
        }
    }

    /// Runs `command` in a transaction, retrying write conflicts.
    async fn run(&self, command: &Command) -> Result<Frame, CommandError> {
        let budget = async {
            tokio::time::sleep(RETRY_BUDGET).await;
            CommandError::Busy
        };
        let result = Retry::global()
            .run(budget, || async {
                let classify = |err: CommandError| Failure::classify(err, CommandError::is_retriable);

                let mut txn = self.store.begin().await.map_err(|e| classify(e.into()))?;
                match self.apply(txn.as_mut(), command, unix_now()).await {
                    Ok(frame) => {
                        txn.commit().await.map_err(|e| classify(e.into()))?;
                        Ok(frame)
                    }
                    Err(err) => {
                        txn.rollback().await;
                        Err(classify(err))
                    }
                }
            })
            .await;

        match result {
            Ok(frame) => Ok(frame),
            Err(RetryError::Failed(err) | RetryError::Cancelled(err)) => Err(err),
        }
    }

    async fn apply(&self, txn: &mut dyn Transaction, command: &Command, now: i64) -> Result<Frame, CommandError> {
        match command {
            Command::Get(key) => match self.load(txn, key, now).await? {
                None => Ok(Frame::null()),
                Some((object, value)) => {
                    expect_type(&object, ObjectType::String)?;
                    Ok(Frame::bulk_string(value))
                }
            },
            Command::Set { key, value, ttl } => {
                let expire_at = match ttl {
                    Some(ttl) => expire_time(now, ttl).ok_or(CommandError::InvalidExpire("set"))?,
                    None => 0,
                };
                if let Some((old, _)) = self.load_any(txn, key).await? {
                    self.discard(txn, key, &old).await?;
                }
                let object = Object::new(next_object_id(), ObjectType::String, now).with_expire_at(expire_at);
                txn.set(self.db.meta_key(key), object.encode(value)).await?;
                Ok(Frame::ok())
            }
            Command::Del(keys) => {
                let mut deleted = 0;
                for key in keys {
                    if let Some((object, _)) = self.load_any(txn, key).await? {
                        self.discard(txn, key, &object).await?;
                        if !has_expired(&object, now) {
                            deleted += 1;
                        }
                    }
                }
                Ok(Frame::integer(deleted))
            }
            Command::Exists(keys) => {
                let mut found = 0;
                for key in keys {
                    if self.load(txn, key, now).await?.is_some() {
                        found += 1;
                    }
                }
                Ok(Frame::integer(found))
            }
            Command::Expire { key, seconds } => match self.load(txn, key, now).await? {
                None => Ok(Frame::integer(0)),
                Some((object, _)) if *seconds <= 0 => {
                    self.discard(txn, key, &object).await?;
                    Ok(Frame::integer(1))
                }
                Some((mut object, inline)) => {
                    object.expire_at = now
                        .checked_add(*seconds)
                        .ok_or(CommandError::InvalidExpire("expire"))?;
                    object.updated_at = now;
                    txn.set(self.db.meta_key(key), object.encode(&inline)).await?;
                    Ok(Frame::integer(1))
                }
            },
            Command::Ttl(key) => Ok(Frame::integer(match self.load(txn, key, now).await? {
                None => -2,
                Some((object, _)) if object.expire_at == 0 => -1,
                Some((object, _)) => (object.expire_at - now).max(0),
            })),
            Command::Persist(key) => match self.load(txn, key, now).await? {
                Some((mut object, inline)) if object.expire_at != 0 => {
                    object.expire_at = 0;
                    object.updated_at = now;
                    txn.set(self.db.meta_key(key), object.encode(&inline)).await?;
                    Ok(Frame::integer(1))
                }
                _ => Ok(Frame::integer(0)),
            },
            Command::Type(key) => Ok(Frame::simple_string(match self.load(txn, key, now).await? {
                None => "none",
                Some((object, _)) => object.object_type.name(),
            })),
            Command::HSet { key, pairs } => {
                let mut object = match self.load_any(txn, key).await? {
                    Some((old, _)) if has_expired(&old, now) => {
                        self.discard(txn, key, &old).await?;
                        Object::new(next_object_id(), ObjectType::Hash, now)
                    }
                    Some((old, _)) => {
                        expect_type(&old, ObjectType::Hash)?;
                        old
                    }
                    None => Object::new(next_object_id(), ObjectType::Hash, now),
                };
                object.updated_at = now;

                let mut added = 0;
                for (field, value) in pairs {
                    let data_key = self.db.data_key(&object.id, field);
                    if txn.get(&data_key).await?.is_none() {
                        added += 1;
                    }
                    txn.set(data_key, value.clone()).await?;
                }
                txn.set(self.db.meta_key(key), object.encode(b"")).await?;
                Ok(Frame::integer(added))
            }
            Command::HGet { key, field } => match self.load(txn, key, now).await? {
                None => Ok(Frame::null()),
                Some((object, _)) => {
                    expect_type(&object, ObjectType::Hash)?;
                    Ok(match txn.get(&self.db.data_key(&object.id, field)).await? {
                        Some(value) => Frame::bulk_string(value),
                        None => Frame::null(),
                    })
                }
            },
            Command::HGetAll(key) => match self.load(txn, key, now).await? {
                None => Ok(Frame::array(Vec::new())),
                Some((object, _)) => {
                    expect_type(&object, ObjectType::Hash)?;
                    let prefix = self.db.data_prefix(&object.id);
                    let mut iter = txn.iter(&prefix, &prefix_end(&prefix)).await?;
                    let mut items = Vec::new();
                    while iter.has_prefix(&prefix) {
                        items.push(Frame::bulk_string(Bytes::copy_from_slice(&iter.key()[prefix.len()..])));
                        items.push(Frame::bulk_string(Bytes::copy_from_slice(iter.value())));
                        iter.next().await?;
                    }
                    Ok(Frame::array(items))
                }
            },
            Command::Ping(_) | Command::Echo(_) | Command::Quit | Command::Select(_) | Command::Time => {
                Err(CommandError::Syntax)
            }
        }
    }

    /// Reads the object at `key`, treating expired objects as absent.
    async fn load(&self, txn: &mut dyn Transaction, key: &[u8], now: i64) -> Result<Option<(Object, Bytes)>, CommandError> {
        Ok(self
            .load_any(txn, key)
            .await?
            .filter(|(object, _)| !has_expired(object, now)))
    }

    /// Reads the object at `key`, expired or not.
    async fn load_any(&self, txn: &mut dyn Transaction, key: &[u8]) -> Result<Option<(Object, Bytes)>, CommandError> {
        match txn.get(&self.db.meta_key(key)).await? {
            None => Ok(None),
            Some(raw) => Object::decode(&raw)
                .map(Some)
                .map_err(|_| CommandError::Corrupt),
        }
    }

    /// Removes the object at `key`, leaving a garbage entry for any data it
    /// owns outside the meta record.
    async fn discard(&self, txn: &mut dyn Transaction, key: &[u8], object: &Object) -> Result<(), CommandError> {
        txn.delete(&self.db.meta_key(key)).await?;
        match object.object_type.layout() {
            Layout::Inline => {}
            Layout::Data | Layout::Scored => {
                txn.set(
                    self.db.garbage_key(&object.id),
                    Bytes::copy_from_slice(&[object.object_type.tag()]),
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// `expire_at` for a ttl starting at `now`, rounding partial seconds up.
/// `None` when the result does not fit.
fn expire_time(now: i64, ttl: &Duration) -> Option<i64> {
    let secs = i64::try_from(ttl.as_millis().div_ceil(1000)).ok()?;
    now.checked_add(secs)
}

fn has_expired(object: &Object, now: i64) -> bool {
    object.is_expired(now, 0)
}

fn expect_type(object: &Object, expected: ObjectType) -> Result<(), CommandError> {
    if object.object_type == expected {
        Ok(())
    } else {
        Err(CommandError::WrongType)
    }
}

/// Fresh object id: wall-clock nanoseconds, then process id and a counter.
fn next_object_id() -> ObjectId {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xffff_ffff;
    let low = (u64::from(std::process::id()) << 32) | seq;
    ObjectId::from_u128((u128::from(nanos) << 64) | u128::from(low))
}

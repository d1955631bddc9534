//! Object Key Scheme
//!
//! Pure functions mapping a logical object to the key ranges it occupies in
//! the backing store. Every key of a database starts with the same
//! `"{namespace}:{db}:"` prefix followed by a one-letter section:
//!
//! ```text
//! {ns}:{db}:M:{user key}        meta key, holds the object header
//! {ns}:{db}:D:{object id}...    data range of composite objects
//! {ns}:{db}:S:{object id}...    score index of sorted sets
//! {ns}:{db}:G:{object id}       garbage entry, value = type tag
//! {ns}:sys:leader:...           election keys
//! ```
//!
//! Object ids are fixed-width, so `D:{id}` never prefixes another object's
//! range.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const META: &[u8] = b"M:";
const DATA: &[u8] = b"D:";
const SCORE: &[u8] = b"S:";
const GARBAGE: &[u8] = b"G:";

const OBJECT_ID_LEN: usize = 16;

/// Encoded size of an [`Object`] header.
pub const OBJECT_HEADER_LEN: usize = OBJECT_ID_LEN + 1 + 8 + 8 + 8;

/// Errors decoding stored object metadata.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectError {
    #[error("object header truncated: {len} bytes")]
    Truncated { len: usize },

    #[error("unknown object type tag: {0}")]
    UnknownType(u8),

    #[error("malformed garbage entry")]
    MalformedGarbage,
}

/// A logical partition of the key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Database {
    pub namespace: String,
    pub id: u32,
}

impl Database {
    pub fn new(namespace: impl Into<String>, id: u32) -> Self {
        Self {
            namespace: namespace.into(),
            id,
        }
    }

    /// `"{namespace}:{id}:"`, shared by every key of this database.
    pub fn prefix(&self) -> Bytes {
        Bytes::from(format!("{}:{}:", self.namespace, self.id))
    }

    fn section(&self, section: &[u8], suffix: &[u8]) -> Bytes {
        let prefix = self.prefix();
        let mut key = BytesMut::with_capacity(prefix.len() + section.len() + suffix.len());
        key.put_slice(&prefix);
        key.put_slice(section);
        key.put_slice(suffix);
        key.freeze()
    }

    pub fn meta_prefix(&self) -> Bytes {
        self.section(META, b"")
    }

    pub fn meta_key(&self, key: &[u8]) -> Bytes {
        self.section(META, key)
    }

    pub fn data_prefix(&self, id: &ObjectId) -> Bytes {
        self.section(DATA, id.as_bytes())
    }

    /// Key of one element inside an object's data range.
    pub fn data_key(&self, id: &ObjectId, field: &[u8]) -> Bytes {
        let mut key = BytesMut::from(&self.data_prefix(id)[..]);
        key.put_slice(field);
        key.freeze()
    }

    pub fn score_prefix(&self, id: &ObjectId) -> Bytes {
        self.section(SCORE, id.as_bytes())
    }

    /// Score-index key: the score is stored in an order-preserving form so
    /// the index iterates in ascending score order.
    pub fn score_key(&self, id: &ObjectId, score: f64, member: &[u8]) -> Bytes {
        let mut key = BytesMut::from(&self.score_prefix(id)[..]);
        key.put_u64(sortable_score(score));
        key.put_u8(b':');
        key.put_slice(member);
        key.freeze()
    }

    pub fn garbage_prefix(&self) -> Bytes {
        self.section(GARBAGE, b"")
    }

    pub fn garbage_key(&self, id: &ObjectId) -> Bytes {
        self.section(GARBAGE, id.as_bytes())
    }

    /// Election key for a maintenance work type on this database.
    pub fn leader_key(&self, work: &str) -> String {
        format!("{}:sys:leader:{}:{}", self.namespace, self.id, work)
    }
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Current wall-clock time in unix seconds, the unit of every object
/// timestamp.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Election key for the namespace-wide storage GC worker.
pub fn storage_gc_leader_key(namespace: &str) -> String {
    format!("{}:sys:leader:storage-gc", namespace)
}

/// Smallest key strictly greater than every key starting with `prefix`.
///
/// Returns an empty key when no such bound exists (all bytes are 0xff),
/// which iterators treat as "no upper bound".
pub fn prefix_end(prefix: &[u8]) -> Bytes {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Bytes::from(end);
        }
    }
    Bytes::new()
}

fn sortable_score(score: f64) -> u64 {
    let bits = score.to_bits();
    if score.is_sign_negative() {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// Opaque 16-byte object identifier, unique within a database.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    pub const LEN: usize = OBJECT_ID_LEN;

    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_u128(n: u128) -> Self {
        Self(n.to_be_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; Self::LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Data type of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectType {
    String = 0,
    List = 1,
    Hash = 2,
    Set = 3,
    ZSet = 4,
}

impl ObjectType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self, ObjectError> {
        match tag {
            0 => Ok(ObjectType::String),
            1 => Ok(ObjectType::List),
            2 => Ok(ObjectType::Hash),
            3 => Ok(ObjectType::Set),
            4 => Ok(ObjectType::ZSet),
            other => Err(ObjectError::UnknownType(other)),
        }
    }

    /// Which key ranges an object of this type occupies.
    pub fn layout(self) -> Layout {
        match self {
            ObjectType::String => Layout::Inline,
            ObjectType::List | ObjectType::Hash | ObjectType::Set => Layout::Data,
            ObjectType::ZSet => Layout::Scored,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectType::String => "string",
            ObjectType::List => "list",
            ObjectType::Hash => "hash",
            ObjectType::Set => "set",
            ObjectType::ZSet => "zset",
        }
    }
}

/// Key ranges owned by an object besides its meta key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Value lives in the meta record.
    Inline,
    /// Elements live in the data range.
    Data,
    /// Elements live in the data range and are mirrored by a score index.
    Scored,
}

/// Object header stored under the meta key.
///
/// Layout, big-endian: id (16) | type (1) | created_at (8) | updated_at (8)
/// | expire_at (8). String objects append their value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub id: ObjectId,
    pub object_type: ObjectType,
    pub created_at: i64,
    pub updated_at: i64,
    /// Unix seconds; 0 means the object never expires.
    pub expire_at: i64,
}

impl Object {
    pub fn new(id: ObjectId, object_type: ObjectType, now: i64) -> Self {
        Self {
            id,
            object_type,
            created_at: now,
            updated_at: now,
            expire_at: 0,
        }
    }

    pub fn with_expire_at(mut self, expire_at: i64) -> Self {
        self.expire_at = expire_at;
        self
    }

    /// True when the object expired more than `tolerance` seconds before
    /// `now`.
    pub fn is_expired(&self, now: i64, tolerance: i64) -> bool {
        self.expire_at != 0 && self.expire_at < now.saturating_sub(tolerance)
    }

    /// Encodes the header followed by `inline` (the value of a string).
    pub fn encode(&self, inline: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(OBJECT_HEADER_LEN + inline.len());
        buf.put_slice(self.id.as_bytes());
        buf.put_u8(self.object_type.tag());
        buf.put_i64(self.created_at);
        buf.put_i64(self.updated_at);
        buf.put_i64(self.expire_at);
        buf.put_slice(inline);
        buf.freeze()
    }

    /// Decodes a meta record, returning the header and any inline value.
    pub fn decode(raw: &[u8]) -> Result<(Self, Bytes), ObjectError> {
        if raw.len() < OBJECT_HEADER_LEN {
            return Err(ObjectError::Truncated { len: raw.len() });
        }
        let mut buf = raw;
        let mut id = [0u8; ObjectId::LEN];
        buf.copy_to_slice(&mut id);
        let object_type = ObjectType::from_tag(buf.get_u8())?;
        let created_at = buf.get_i64();
        let updated_at = buf.get_i64();
        let expire_at = buf.get_i64();

        Ok((
            Self {
                id: ObjectId(id),
                object_type,
                created_at,
                updated_at,
                expire_at,
            },
            Bytes::copy_from_slice(buf),
        ))
    }
}

/// Parses a garbage entry back into the object it refers to.
pub fn decode_garbage(db: &Database, key: &[u8], value: &[u8]) -> Result<(ObjectId, ObjectType), ObjectError> {
    let id = key
        .strip_prefix(&db.garbage_prefix()[..])
        .and_then(ObjectId::from_slice)
        .ok_or(ObjectError::MalformedGarbage)?;
    let tag = match value {
        [tag] => *tag,
        _ => return Err(ObjectError::MalformedGarbage),
    };
    Ok((id, ObjectType::from_tag(tag)?))
}

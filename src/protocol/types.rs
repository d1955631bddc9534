//! RESP (Redis Serialization Protocol) Frame Types
//!
//! This module defines the frames exchanged with clients.
//! Every frame starts with a one-byte type prefix and its header line is
//! terminated with CRLF (`\r\n`). Bulk strings carry an explicit length
//! and array headers carry an explicit element count.
//!
//! ## Protocol Format
//!
//! - `+` Simple String: `+OK\r\n`
//! - `-` Error: `-ERR unknown command\r\n`
//! - `:` Integer: `:1000\r\n`
//! - `$` Bulk String: `$5\r\nhello\r\n`
//! - `$-1` Null Bulk String: `$-1\r\n`
//! - `*` Array: `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`

use crate::protocol::encoder;
use bytes::{Bytes, BytesMut};
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A complete protocol value.
///
/// The encoder and decoder work on individual frames, this enum is the
/// owned form used when a whole reply or command is built in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Non-binary-safe status line.
    /// Format: `+<string>\r\n`
    SimpleString(String),

    /// Error line.
    /// Format: `-<error message>\r\n`
    Error(String),

    /// 64-bit signed integer.
    /// Format: `:<integer>\r\n`
    Integer(i64),

    /// Binary-safe string with an explicit length.
    /// Format: `$<length>\r\n<data>\r\n`
    BulkString(Bytes),

    /// Null bulk string (`$-1\r\n`). A null array (`*-1\r\n`) also decodes
    /// to this variant.
    Null,

    /// Array header followed by its elements.
    /// Format: `*<count>\r\n<element1><element2>...`
    Array(Vec<Frame>),
}

impl Frame {
    pub fn simple_string(s: impl Into<String>) -> Self {
        Frame::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Frame::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        Frame::Integer(n)
    }

    /// Creates a new bulk string frame.
    ///
    /// # Example
    /// ```
    /// use strata::protocol::Frame;
    /// use bytes::Bytes;
    /// let bulk = Frame::bulk_string(Bytes::from("hello"));
    /// assert_eq!(bulk.serialize(), b"$5\r\nhello\r\n");
    /// ```
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        Frame::BulkString(data.into())
    }

    pub fn null() -> Self {
        Frame::Null
    }

    pub fn array(values: Vec<Frame>) -> Self {
        Frame::Array(values)
    }

    /// Common response for successful operations
    pub fn ok() -> Self {
        Frame::SimpleString("OK".to_string())
    }

    /// Common response for PING
    pub fn pong() -> Self {
        Frame::SimpleString("PONG".to_string())
    }

    /// Serializes the frame to its wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf.to_vec()
    }

    /// Serializes the frame into an existing buffer.
    ///
    /// Arrays are written as a header followed by each element in order.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::SimpleString(s) => encoder::put_simple_string(buf, s),
            Frame::Error(s) => encoder::put_error(buf, s),
            Frame::Integer(n) => encoder::put_integer(buf, *n),
            Frame::BulkString(data) => encoder::put_bulk_string(buf, data),
            Frame::Null => encoder::put_null_bulk_string(buf),
            Frame::Array(values) => {
                encoder::put_array_header(buf, values.len());
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Attempts to extract the inner string from SimpleString or BulkString.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::SimpleString(s) => Some(s),
            Frame::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::BulkString(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::SimpleString(s) => write!(f, "\"{}\"", s),
            Frame::Error(s) => write!(f, "(error) {}", s),
            Frame::Integer(n) => write!(f, "(integer) {}", n),
            Frame::BulkString(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            Frame::Null => write!(f, "(nil)"),
            Frame::Array(values) => {
                if values.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    writeln!(f)?;
                    for (i, v) in values.iter().enumerate() {
                        writeln!(f, "{}) {}", i + 1, v)?;
                    }
                    Ok(())
                }
            }
        }
    }
}

//! Frame Encoder
//!
//! The encoder accepts discrete write calls, one per frame, and appends the
//! exact byte layout of each to an internal buffer. `flush()` hands the
//! buffered bytes to the underlying writer in a single write, so a reply
//! built from several frames (an array header plus its elements) leaves
//! the process as one contiguous chunk.

use crate::protocol::types::{prefix, Frame, CRLF};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Initial capacity of the encode buffer
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Buffered frame writer over any async byte sink.
#[derive(Debug)]
pub struct Encoder<W> {
    writer: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }

    /// Writes `-<message>\r\n`.
    pub fn error(&mut self, message: &str) {
        put_error(&mut self.buf, message);
    }

    /// Writes `+<message>\r\n`.
    pub fn simple_string(&mut self, message: &str) {
        put_simple_string(&mut self.buf, message);
    }

    /// Writes `$<len>\r\n<payload>\r\n`.
    pub fn bulk_string(&mut self, payload: &[u8]) {
        put_bulk_string(&mut self.buf, payload);
    }

    /// Writes `$-1\r\n`.
    pub fn null_bulk_string(&mut self) {
        put_null_bulk_string(&mut self.buf);
    }

    /// Writes `:<n>\r\n`.
    pub fn integer(&mut self, n: i64) {
        put_integer(&mut self.buf, n);
    }

    /// Writes the array header `*<count>\r\n`. The caller writes the
    /// `count` elements with further calls.
    pub fn array(&mut self, count: usize) {
        put_array_header(&mut self.buf, count);
    }

    /// Writes `*-1\r\n`.
    pub fn null_array(&mut self) {
        self.buf.put_u8(prefix::ARRAY);
        self.buf.put_slice(b"-1");
        self.buf.put_slice(CRLF);
    }

    /// Writes a complete frame, recursing into arrays.
    pub fn frame(&mut self, frame: &Frame) {
        frame.serialize_into(&mut self.buf);
    }

    /// Bytes written so far but not yet flushed.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Sends every buffered frame to the writer and flushes it.
    ///
    /// Returns the number of bytes written.
    pub async fn flush(&mut self) -> std::io::Result<usize> {
        let written = self.buf.len();
        if written > 0 {
            self.writer.write_all(&self.buf).await?;
            self.buf.clear();
        }
        self.writer.flush().await?;
        Ok(written)
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

pub(crate) fn put_error(buf: &mut BytesMut, message: &str) {
    put_line(buf, prefix::ERROR, message.as_bytes());
}

pub(crate) fn put_simple_string(buf: &mut BytesMut, message: &str) {
    put_line(buf, prefix::SIMPLE_STRING, message.as_bytes());
}

pub(crate) fn put_integer(buf: &mut BytesMut, n: i64) {
    buf.put_u8(prefix::INTEGER);
    buf.put_slice(n.to_string().as_bytes());
    buf.put_slice(CRLF);
}

pub(crate) fn put_bulk_string(buf: &mut BytesMut, payload: &[u8]) {
    buf.reserve(payload.len() + 16);
    buf.put_u8(prefix::BULK_STRING);
    buf.put_slice(payload.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    buf.put_slice(payload);
    buf.put_slice(CRLF);
}

pub(crate) fn put_null_bulk_string(buf: &mut BytesMut) {
    buf.put_u8(prefix::BULK_STRING);
    buf.put_slice(b"-1");
    buf.put_slice(CRLF);
}

pub(crate) fn put_array_header(buf: &mut BytesMut, count: usize) {
    buf.put_u8(prefix::ARRAY);
    buf.put_slice(count.to_string().as_bytes());
    buf.put_slice(CRLF);
}

/// Writes a CRLF-terminated status line. CR and LF inside the message
/// become spaces so the line can never end early.
fn put_line(buf: &mut BytesMut, type_prefix: u8, message: &[u8]) {
    buf.reserve(message.len() + 3);
    buf.put_u8(type_prefix);
    for &b in message {
        buf.put_u8(if b == b'\r' || b == b'\n' { b' ' } else { b });
    }
    buf.put_slice(CRLF);
}

//! Stream Frame Decoder
//!
//! The decoder reads exactly one frame per call straight from an async
//! reader. It never buffers ahead: header lines are pulled one byte at a
//! time up to and including the LF, and bulk bodies are read with an exact
//! length. When a call returns, the reader's cursor sits immediately after
//! the frame, so the same stream can be handed to other protocol logic.
//!
//! Wrap raw sockets in `tokio::io::BufReader` before decoding; byte reads
//! then come out of the shared buffer rather than one syscall each.
//!
//! ## Error Kinds
//!
//! - [`DecodeError::Protocol`]: the peer sent bytes that are not a valid
//!   frame for the call made. Terminal for the frame.
//! - [`DecodeError::Eof`]: the stream ended while a line was being read.
//!   `partial` holds the bytes seen before the end.
//! - [`DecodeError::Io`]: any other transport failure.

use crate::protocol::types::{prefix, Frame};
use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Smallest valid line: a prefix byte plus CRLF
pub const MIN_LINE_LENGTH: usize = 3;

/// Longest header or status line accepted (64 KB)
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth accepted by [`Decoder::frame`]
pub const MAX_NESTING_DEPTH: usize = 32;

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Malformed frame: bad prefix, missing CRLF, bad number, short body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// End of stream reached in the middle of (or before) a line.
    #[error("unexpected end of stream after {} bytes", .partial.len())]
    Eof { partial: Bytes },

    /// Transport failure other than end of stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DecodeError {
    fn protocol(msg: impl Into<String>) -> Self {
        DecodeError::Protocol(msg.into())
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, DecodeError::Protocol(_))
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Reads frames from a shared async byte stream.
#[derive(Debug)]
pub struct Decoder<R> {
    reader: R,
    position: u64,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            position: 0,
        }
    }

    /// Total bytes consumed from the reader by this decoder.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads `-<message>\r\n`.
    pub async fn error(&mut self) -> DecodeResult<String> {
        let payload = self.expect_line(prefix::ERROR).await?;
        utf8(payload)
    }

    /// Reads `+<message>\r\n`.
    pub async fn simple_string(&mut self) -> DecodeResult<String> {
        let payload = self.expect_line(prefix::SIMPLE_STRING).await?;
        utf8(payload)
    }

    /// Reads `:<n>\r\n`.
    pub async fn integer(&mut self) -> DecodeResult<i64> {
        let payload = self.expect_line(prefix::INTEGER).await?;
        parse_decimal(&payload)
    }

    /// Reads a bulk string. Returns `None` for the null bulk string.
    pub async fn bulk_string(&mut self) -> DecodeResult<Option<Bytes>> {
        let payload = self.expect_line(prefix::BULK_STRING).await?;
        self.bulk_body(&payload).await
    }

    /// Reads an array header and returns the declared element count, or
    /// `None` for `*-1`. Elements are left on the stream for the caller.
    pub async fn array(&mut self) -> DecodeResult<Option<usize>> {
        let payload = self.expect_line(prefix::ARRAY).await?;
        parse_count(&payload)
    }

    /// Reads a client command: an array of non-null bulk strings.
    pub async fn command(&mut self) -> DecodeResult<Vec<Bytes>> {
        let count = match self.array().await? {
            Some(count) => count,
            None => return Err(DecodeError::protocol("null array is not a command")),
        };

        // Each element needs at least "$0\r\n\r\n"
        let mut args = Vec::with_capacity(count.min(MAX_LINE_LENGTH / 6));
        for _ in 0..count {
            match self.bulk_string().await? {
                Some(arg) => args.push(arg),
                None => return Err(DecodeError::protocol("null bulk string in command")),
            }
        }
        Ok(args)
    }

    /// Reads any single complete frame, descending into arrays.
    pub async fn frame(&mut self) -> DecodeResult<Frame> {
        // (elements collected so far, elements still expected)
        let mut stack: Vec<(Vec<Frame>, usize)> = Vec::new();

        loop {
            let line = self.read_line().await?;
            let mut value = match line[0] {
                prefix::SIMPLE_STRING => Frame::SimpleString(utf8(line.slice(1..))?),
                prefix::ERROR => Frame::Error(utf8(line.slice(1..))?),
                prefix::INTEGER => Frame::Integer(parse_decimal(&line[1..])?),
                prefix::BULK_STRING => match self.bulk_body(&line[1..]).await? {
                    Some(data) => Frame::BulkString(data),
                    None => Frame::Null,
                },
                prefix::ARRAY => match parse_count(&line[1..])? {
                    None => Frame::Null,
                    Some(0) => Frame::Array(Vec::new()),
                    Some(count) => {
                        if stack.len() >= MAX_NESTING_DEPTH {
                            return Err(DecodeError::protocol(format!(
                                "maximum nesting depth exceeded: {}",
                                MAX_NESTING_DEPTH
                            )));
                        }
                        stack.push((Vec::with_capacity(count.min(1024)), count));
                        continue;
                    }
                },
                other => {
                    return Err(DecodeError::protocol(format!(
                        "unknown type prefix: {:#04x}",
                        other
                    )))
                }
            };

            // Fold the finished value into its parents
            loop {
                match stack.last_mut() {
                    None => return Ok(value),
                    Some((elements, remaining)) => {
                        elements.push(value);
                        *remaining -= 1;
                        if *remaining > 0 {
                            break;
                        }
                    }
                }
                let (elements, _) = stack.pop().unwrap_or_default();
                value = Frame::Array(elements);
            }
        }
    }

    /// Reads the body of a bulk string whose length line was `len_field`.
    async fn bulk_body(&mut self, len_field: &[u8]) -> DecodeResult<Option<Bytes>> {
        let length = parse_decimal(len_field)?;
        if length == -1 {
            return Ok(None);
        }
        if length < 0 {
            return Err(DecodeError::protocol(format!(
                "invalid bulk string length: {}",
                length
            )));
        }
        let length = length as usize;
        if length > MAX_BULK_SIZE {
            return Err(DecodeError::protocol(format!(
                "bulk string too large: {} bytes (max: {})",
                length, MAX_BULK_SIZE
            )));
        }

        let mut body = vec![0u8; length + 2];
        match self.reader.read_exact(&mut body).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(DecodeError::protocol(format!(
                    "bulk string body shorter than declared {} bytes",
                    length
                )));
            }
            Err(e) => return Err(e.into()),
        }
        self.position += body.len() as u64;

        if &body[length..] != b"\r\n" {
            return Err(DecodeError::protocol("bulk string missing trailing CRLF"));
        }
        body.truncate(length);
        Ok(Some(Bytes::from(body)))
    }

    /// Reads a line with the given prefix and returns what follows the prefix.
    async fn expect_line(&mut self, type_prefix: u8) -> DecodeResult<Bytes> {
        let line = self.read_line().await?;
        if line[0] != type_prefix {
            return Err(DecodeError::protocol(format!(
                "expected type prefix {:?}, got {:#04x}",
                type_prefix as char, line[0]
            )));
        }
        Ok(line.slice(1..))
    }

    /// Reads up to and including the first LF, one byte at a time.
    ///
    /// Returns the line without its CRLF. The result is never empty.
    async fn read_line(&mut self) -> DecodeResult<Bytes> {
        let mut line = BytesMut::with_capacity(64);
        let mut byte = [0u8; 1];

        loop {
            let n = self.reader.read(&mut byte).await?;
            if n == 0 {
                return Err(DecodeError::Eof {
                    partial: line.freeze(),
                });
            }
            self.position += 1;

            if byte[0] == b'\n' {
                break;
            }
            if line.len() >= MAX_LINE_LENGTH {
                return Err(DecodeError::protocol(format!(
                    "line exceeds {} bytes",
                    MAX_LINE_LENGTH
                )));
            }
            line.extend_from_slice(&byte);
        }

        if line.last() != Some(&b'\r') {
            return Err(DecodeError::protocol("line terminated by LF without CR"));
        }
        if line.len() + 1 < MIN_LINE_LENGTH {
            return Err(DecodeError::protocol("line shorter than minimum frame"));
        }
        line.truncate(line.len() - 1);
        Ok(line.freeze())
    }
}

fn utf8(payload: Bytes) -> DecodeResult<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|e| DecodeError::protocol(format!("invalid UTF-8: {}", e)))
}

/// Parses an optional `-` followed by ASCII digits.
fn parse_decimal(field: &[u8]) -> DecodeResult<i64> {
    let digits = field.strip_prefix(b"-").unwrap_or(field);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::protocol(format!(
            "invalid integer: {:?}",
            String::from_utf8_lossy(field)
        )));
    }
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            DecodeError::protocol(format!(
                "integer out of range: {}",
                String::from_utf8_lossy(field)
            ))
        })
}

fn parse_count(field: &[u8]) -> DecodeResult<Option<usize>> {
    match parse_decimal(field)? {
        -1 => Ok(None),
        n if n < 0 => Err(DecodeError::protocol(format!("invalid array length: {}", n))),
        n => Ok(Some(n as usize)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Encoder;
    use std::io::Cursor;

    fn decoder(input: &[u8]) -> Decoder<Cursor<Vec<u8>>> {
        Decoder::new(Cursor::new(input.to_vec()))
    }

    #[tokio::test]
    async fn test_decode_each_kind() {
        let mut d = decoder(b"-ERR x\r\n+OK\r\n:-42\r\n$5\r\nhello\r\n$-1\r\n*3\r\n*-1\r\n");
        assert_eq!(d.error().await.unwrap(), "ERR x");
        assert_eq!(d.simple_string().await.unwrap(), "OK");
        assert_eq!(d.integer().await.unwrap(), -42);
        assert_eq!(d.bulk_string().await.unwrap(), Some(Bytes::from("hello")));
        assert_eq!(d.bulk_string().await.unwrap(), None);
        assert_eq!(d.array().await.unwrap(), Some(3));
        assert_eq!(d.array().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_roundtrip_edge_values() {
        let mut e = Encoder::new(Vec::new());
        e.simple_string("");
        e.error("");
        e.integer(0);
        e.integer(i64::MIN);
        e.integer(i64::MAX);
        e.bulk_string(b"");
        e.bulk_string(b"bin\x00\r\nary");
        e.null_bulk_string();
        e.array(0);
        e.flush().await.unwrap();

        let mut d = decoder(&e.into_inner());
        assert_eq!(d.simple_string().await.unwrap(), "");
        assert_eq!(d.error().await.unwrap(), "");
        assert_eq!(d.integer().await.unwrap(), 0);
        assert_eq!(d.integer().await.unwrap(), i64::MIN);
        assert_eq!(d.integer().await.unwrap(), i64::MAX);
        assert_eq!(d.bulk_string().await.unwrap(), Some(Bytes::new()));
        assert_eq!(
            d.bulk_string().await.unwrap(),
            Some(Bytes::from_static(b"bin\x00\r\nary"))
        );
        assert_eq!(d.bulk_string().await.unwrap(), None);
        assert_eq!(d.array().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_bulk_consumes_exactly_declared_length() {
        // Payload contains CRLF; the declared length wins.
        let input = b"$4\r\n\r\n\r\n\r\n:7\r\nrest";
        let mut d = decoder(input);

        assert_eq!(
            d.bulk_string().await.unwrap(),
            Some(Bytes::from_static(b"\r\n\r\n"))
        );
        assert_eq!(d.position(), 4 + 4 + 2);
        assert_eq!(d.get_ref().position(), 10);

        assert_eq!(d.integer().await.unwrap(), 7);
        assert_eq!(d.get_ref().position(), 14);

        // The stream still holds exactly what follows the two frames.
        let mut rest = Vec::new();
        d.get_mut().read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"rest");
    }

    #[tokio::test]
    async fn test_array_does_not_read_children() {
        let mut d = decoder(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        assert_eq!(d.array().await.unwrap(), Some(2));
        assert_eq!(d.position(), 4);
        assert_eq!(d.bulk_string().await.unwrap(), Some(Bytes::from("GET")));
        assert_eq!(d.bulk_string().await.unwrap(), Some(Bytes::from("k")));
    }

    #[tokio::test]
    async fn test_command() {
        let mut d = decoder(b"*3\r\n$3\r\nSET\r\n$8\r\nuser:101\r\n$4\r\nAriz\r\n");
        let args = d.command().await.unwrap();
        assert_eq!(
            args,
            vec![
                Bytes::from("SET"),
                Bytes::from("user:101"),
                Bytes::from("Ariz")
            ]
        );
    }

    #[tokio::test]
    async fn test_frame_nested() {
        let mut d = decoder(b"*3\r\n:1\r\n*2\r\n+a\r\n$-1\r\n*0\r\n:9\r\n");
        assert_eq!(
            d.frame().await.unwrap(),
            Frame::array(vec![
                Frame::integer(1),
                Frame::array(vec![Frame::simple_string("a"), Frame::Null]),
                Frame::array(vec![]),
            ])
        );
        assert_eq!(d.frame().await.unwrap(), Frame::integer(9));
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let nested = Frame::array(vec![
            Frame::bulk_string("SET"),
            Frame::error("ERR"),
            Frame::integer(-1),
            Frame::Null,
            Frame::array(vec![Frame::bulk_string("")]),
        ]);
        let mut d = decoder(&nested.serialize());
        assert_eq!(d.frame().await.unwrap(), nested);
    }

    #[tokio::test]
    async fn test_frame_nesting_limit() {
        let input = "*1\r\n".repeat(MAX_NESTING_DEPTH + 1) + ":1\r\n";
        let mut d = decoder(input.as_bytes());
        assert!(d.frame().await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_missing_cr() {
        let mut d = decoder(b"+OK\n");
        assert!(d.simple_string().await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_line_too_short() {
        let mut d = decoder(b"\r\n");
        assert!(d.simple_string().await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_wrong_prefix() {
        let mut d = decoder(b":1\r\n");
        assert!(d.simple_string().await.unwrap_err().is_protocol());
        let mut d = decoder(b"+OK\r\n");
        assert!(d.bulk_string().await.unwrap_err().is_protocol());
        let mut d = decoder(b"@x\r\n");
        assert!(d.frame().await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_non_numeric_fields() {
        for input in [
            &b":not_a_number\r\n"[..],
            b":\r\n",
            b":+5\r\n",
            b":99999999999999999999\r\n",
        ] {
            let mut d = decoder(input);
            assert!(d.integer().await.unwrap_err().is_protocol(), "{:?}", input);
        }
        let mut d = decoder(b"$abc\r\nabc\r\n");
        assert!(d.bulk_string().await.unwrap_err().is_protocol());
        let mut d = decoder(b"*x\r\n");
        assert!(d.array().await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_negative_lengths() {
        let mut d = decoder(b"$-2\r\n");
        assert!(d.bulk_string().await.unwrap_err().is_protocol());
        let mut d = decoder(b"*-5\r\n");
        assert!(d.array().await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_truncated_bulk_is_protocol_error() {
        let mut d = decoder(b"$5\r\nhel");
        assert!(d.bulk_string().await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_bulk_missing_trailing_crlf() {
        let mut d = decoder(b"$3\r\nabcXY");
        assert!(d.bulk_string().await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_null_inside_command() {
        let mut d = decoder(b"*2\r\n$3\r\nGET\r\n$-1\r\n");
        assert!(d.command().await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_eof_returns_partial_line() {
        let mut d = decoder(b"+PAR");
        match d.simple_string().await {
            Err(DecodeError::Eof { partial }) => assert_eq!(partial, Bytes::from("+PAR")),
            other => panic!("expected eof, got {:?}", other),
        }

        let mut d = decoder(b"");
        match d.frame().await {
            Err(DecodeError::Eof { partial }) => assert!(partial.is_empty()),
            other => panic!("expected eof, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_io_error_surfaces() {
        let mock = tokio_test::io::Builder::new()
            .read(b"+O")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut d = Decoder::new(mock);
        assert!(matches!(d.simple_string().await, Err(DecodeError::Io(_))));
    }

    #[tokio::test]
    async fn test_reads_across_fragmented_stream() {
        let mock = tokio_test::io::Builder::new()
            .read(b"$1")
            .read(b"1\r\nhello ")
            .read(b"world\r")
            .read(b"\n")
            .build();
        let mut d = Decoder::new(mock);
        assert_eq!(
            d.bulk_string().await.unwrap(),
            Some(Bytes::from("hello world"))
        );
    }
}

//! RESP Wire Codec
//!
//! This module is the client-facing contract of Strata: the exact byte
//! framing of the Redis Serialization Protocol.
//!
//! ## Modules
//!
//! - `types`: The owned [`Frame`] enum and its serialization
//! - `encoder`: Discrete, buffered frame writes over an `AsyncWrite`
//! - `decoder`: One-frame-per-call reads over an `AsyncRead` that never
//!   consume past the end of the frame
//!
//! ## Example
//!
//! ```
//! use strata::protocol::{Decoder, Encoder};
//!
//! # tokio_test::block_on(async {
//! let mut encoder = Encoder::new(Vec::new());
//! encoder.array(2);
//! encoder.bulk_string(b"GET");
//! encoder.bulk_string(b"name");
//! encoder.flush().await.unwrap();
//!
//! let wire = encoder.into_inner();
//! let mut decoder = Decoder::new(&wire[..]);
//! let args = decoder.command().await.unwrap();
//! assert_eq!(args.len(), 2);
//! # });
//! ```

pub mod decoder;
pub mod encoder;
pub mod types;

// Re-export commonly used types for convenience
pub use decoder::{DecodeError, DecodeResult, Decoder};
pub use encoder::Encoder;
pub use types::Frame;

//! Connection Handler Module
//!
//! Each client gets its own task that loops: decode one command frame from
//! the socket, execute it, encode the reply.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned, socket split into read and write halves
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  Decoder::command()          │
//!    │          │                   │
//!    │          ▼                   │
//!    │  CommandHandler::execute()   │
//!    │          │                   │
//!    │          ▼                   │
//!    │  Encoder::frame()            │
//!    │  flush when input is drained │
//!    │          │                   │
//!    │          ▼                   │
//!    │     [Loop back]              │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. QUIT, client disconnect, or protocol error
//! ```
//!
//! ## Pipelining
//!
//! Replies are buffered in the encoder and only flushed once the read
//! buffer holds no further complete input, so a pipelined batch is answered
//! with one write.

use crate::commands::CommandHandler;
use crate::protocol::{DecodeError, Decoder, Encoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Connections closed because of malformed input
    pub protocol_errors: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: u64) {
        self.bytes_read.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    decoder: Decoder<BufReader<OwnedReadHalf>>,
    encoder: Encoder<OwnedWriteHalf>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Per-connection command state (selected database)
    command_handler: CommandHandler,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();
        let (reader, writer) = stream.into_split();

        Self {
            decoder: Decoder::new(BufReader::new(reader)),
            encoder: Encoder::new(writer),
            addr,
            command_handler,
            stats,
        }
    }

    /// Runs the connection until the client leaves or misbehaves.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "Client disconnected")
            }
            Err(ConnectionError::Io(io_err)) if io_err.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        self.stats.connection_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let start = self.decoder.position();
            let args = match self.decoder.command().await {
                Ok(args) => args,
                Err(err) => {
                    self.stats.bytes_read(self.decoder.position() - start);
                    return self.fail(err, start).await;
                }
            };
            self.stats.bytes_read(self.decoder.position() - start);
            trace!(client = %self.addr, args = args.len(), "Decoded command");

            let reply = self.command_handler.execute(args).await;
            self.stats.command_processed();
            self.encoder.frame(&reply.frame);

            if reply.close {
                self.flush().await?;
                return Ok(());
            }
            if self.decoder.get_ref().buffer().is_empty() {
                self.flush().await?;
            }
        }
    }

    /// Maps a decode failure to the connection's final outcome.
    async fn fail(&mut self, err: DecodeError, start: u64) -> Result<(), ConnectionError> {
        // Anything already answered still goes out
        self.flush().await?;

        match err {
            DecodeError::Eof { partial } if partial.is_empty() && self.decoder.position() == start => {
                Err(ConnectionError::ClientDisconnected)
            }
            DecodeError::Eof { .. } => Err(ConnectionError::UnexpectedEof),
            DecodeError::Protocol(message) => {
                self.stats.protocol_error();
                warn!(client = %self.addr, error = %message, "Protocol error");
                self.encoder.error(&format!("ERR Protocol error: {}", message));
                self.flush().await?;
                Err(ConnectionError::Protocol(message))
            }
            DecodeError::Io(io_err) => Err(ConnectionError::Io(io_err)),
        }
    }

    async fn flush(&mut self) -> Result<(), ConnectionError> {
        let written = self.encoder.flush().await?;
        if written > 0 {
            self.stats.bytes_written(written);
            trace!(client = %self.addr, bytes = written, "Sent response");
        }
        Ok(())
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The client sent bytes that are not a command frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Client disconnected between commands
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Stream ended in the middle of a command
    #[error("Unexpected end of stream")]
    UnexpectedEof,
}

/// Handles a client connection to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}

//! Connection Handling
//!
//! Runs the wire codec over accepted TCP streams. The accept loop lives in
//! the server binary; this module owns everything from the first byte a
//! client sends to the socket being closed.
//!
//! ## Example
//!
//! ```ignore
//! use strata::commands::CommandHandler;
//! use strata::connection::{handle_connection, ConnectionStats};
//! use std::sync::Arc;
//!
//! let store = strata::store::connect("memory://")?;
//! let stats = Arc::new(ConnectionStats::new());
//!
//! // For each accepted connection...
//! let (stream, addr) = listener.accept().await?;
//! let handler = CommandHandler::new(Arc::clone(&store), "default", 16);
//! tokio::spawn(handle_connection(stream, addr, handler, Arc::clone(&stats)));
//! ```

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};

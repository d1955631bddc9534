//! # Strata
//!
//! A Redis-compatible server whose data lives in a distributed
//! transactional key-value store. Any number of server processes can share
//! one store; background maintenance (expiry, garbage collection, store
//! GC) runs on exactly one of them per database, chosen by leader election.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Strata                                 │
//! │                                                                     │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐              │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │              │
//! │  │ (Listener)  │    │ Dec / Enc   │    │  Handler    │              │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘              │
//! │                                               │ transactions        │
//! │                                               ▼                     │
//! │                     ┌───────────────────────────────────────────┐   │
//! │                     │            dyn Storage                    │   │
//! │                     │  meta / data / score / garbage ranges     │   │
//! │                     └───────────────────────────────────────────┘   │
//! │                                               ▲                     │
//! │                                               │ bounded passes      │
//! │  ┌─────────────┐    ┌─────────────────────────┴─────────────────┐   │
//! │  │ Coordinator │───>│  Maintenance: Elect + Worker per db/kind  │   │
//! │  │ (sessions)  │    │  and one StorageGcWorker per namespace    │   │
//! │  └─────────────┘    └───────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use strata::commands::CommandHandler;
//! use strata::config::Config;
//! use strata::connection::{handle_connection, ConnectionStats};
//! use strata::reclaim::Maintenance;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let store = strata::store::connect(&config.store.address)?;
//!     let coordinator = strata::coordination::connect(&config.store.address)?;
//!     let maintenance = Maintenance::start(Arc::clone(&store), coordinator, &config);
//!
//!     let stats = Arc::new(ConnectionStats::new());
//!     let listener = TcpListener::bind(config.server.bind_address()).await?;
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         let handler = CommandHandler::new(Arc::clone(&store), &config.server.namespace, config.server.databases);
//!         tokio::spawn(handle_connection(stream, addr, handler, Arc::clone(&stats)));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP frame encoder and decoder
//! - [`store`]: Backing store traits, key scheme, in-memory backend
//! - [`coordination`]: Sessions and leader election
//! - [`reclaim`]: Expire and GC passes, workers, and their supervisor
//! - [`retry`]: Backoff policies and the retry loop
//! - [`commands`]: Command parsing and execution
//! - [`connection`]: Client connection management
//! - [`config`]: Typed server configuration

pub mod commands;
pub mod config;
pub mod connection;
pub mod coordination;
pub mod protocol;
pub mod reclaim;
pub mod retry;
pub mod store;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::Config;
pub use connection::{handle_connection, ConnectionStats};
pub use coordination::{register_elect, Elect};
pub use protocol::{DecodeError, Decoder, Encoder, Frame};
pub use reclaim::{Maintenance, Reclaimer};
pub use retry::Retry;
pub use store::{Database, Storage};

/// The default port Strata listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host Strata binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of Strata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

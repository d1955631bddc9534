//! Command Dispatch
//!
//! Sits between the wire codec and the backing store.
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ Decoder         │  (protocol module)
//! └────────┬────────┘
//!          │ Vec<Bytes>
//!          ▼
//! ┌─────────────────┐
//! │ Command::parse  │  arity and argument checks
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  one store transaction per keyspace command
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │ dyn Storage     │  (store module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! ### Connection
//! - `PING [message]`, `ECHO message`, `QUIT`, `SELECT index`, `TIME`
//!
//! ### Strings and keys
//! - `SET key value [EX seconds | PX milliseconds]`, `GET key`
//! - `DEL key [key ...]`, `EXISTS key [key ...]`, `TYPE key`
//! - `EXPIRE key seconds`, `TTL key`, `PERSIST key`
//!
//! ### Hashes
//! - `HSET key field value [field value ...]`, `HGET key field`,
//!   `HGETALL key`

pub mod command;
pub mod handler;

pub use command::{Command, CommandError};
pub use handler::{CommandHandler, Reply, RETRY_BUDGET};

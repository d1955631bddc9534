//! Server Configuration
//!
//! A single statically-typed [`Config`] is built at startup (from command
//! line flags in the binaries) and handed to the components that need it.
//! Every field has a default, so `Config::default()` is a runnable setup.

use crate::store::Database;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    pub field: String,
    pub reason: String,
}

impl ConfigError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub gc: WorkerConfig,
    pub expire: ExpireConfig,
    pub storage_gc: StorageGcConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix separating this deployment's keys from others in the store.
    pub namespace: String,
    /// Number of logical databases; ids run from 0.
    pub databases: u32,
    /// Identity published in elections. Derived when unset.
    pub instance_id: Option<String>,
    /// PEM certificate chain for client TLS. Loaded by the TLS frontend.
    pub tls_cert: Option<PathBuf>,
    /// PEM private key matching `tls_cert`.
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            namespace: "default".to_string(),
            databases: 16,
            instance_id: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `"{host}:{port}:{pid}"` unless overridden.
    pub fn instance_id(&self) -> String {
        match &self.instance_id {
            Some(id) => id.clone(),
            None => format!("{}:{}:{}", self.host, self.port, std::process::id()),
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `<scheme>://<hosts>` of the backing store and its coordinator.
    pub address: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: "memory://".to_string(),
        }
    }
}

/// Tunables shared by the per-database reclaim workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub disable: bool,
    /// Pause between passes.
    pub interval: Duration,
    /// Election session ttl.
    pub leader_lifetime: Duration,
    /// Records examined per transaction.
    pub batch_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            disable: false,
            interval: Duration::from_secs(1),
            leader_lifetime: Duration::from_secs(3 * 60),
            batch_limit: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExpireConfig {
    pub worker: WorkerConfig,
    /// Grace period after `expire_at` before an object is deleted.
    pub tolerance: Duration,
}

impl Default for ExpireConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            tolerance: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageGcConfig {
    pub disable: bool,
    pub interval: Duration,
    pub leader_lifetime: Duration,
    /// How far behind now the GC safe point trails.
    pub safe_point_lifetime: Duration,
    pub concurrency: usize,
}

impl Default for StorageGcConfig {
    fn default() -> Self {
        Self {
            disable: false,
            interval: Duration::from_secs(20 * 60),
            leader_lifetime: Duration::from_secs(30 * 60),
            safe_point_lifetime: Duration::from_secs(10 * 60),
            concurrency: 2,
        }
    }
}

impl Config {
    /// Logical databases served by this instance.
    pub fn databases(&self) -> impl Iterator<Item = Database> + '_ {
        (0..self.server.databases).map(move |id| Database::new(self.server.namespace.clone(), id))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.namespace.is_empty() {
            return Err(ConfigError::new("namespace", "must not be empty"));
        }
        if self.server.namespace.contains(':') {
            return Err(ConfigError::new("namespace", "must not contain ':'"));
        }
        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(_), None) => return Err(ConfigError::new("tls_key", "required when tls_cert is set")),
            (None, Some(_)) => return Err(ConfigError::new("tls_cert", "required when tls_key is set")),
            _ => {}
        }
        validate_worker("gc", &self.gc)?;
        validate_worker("expire", &self.expire.worker)?;

        let storage_gc = &self.storage_gc;
        if storage_gc.interval.is_zero() {
            return Err(ConfigError::new("storage_gc.interval", "must be positive"));
        }
        if storage_gc.leader_lifetime < Duration::from_secs(1) {
            return Err(ConfigError::new("storage_gc.leader_lifetime", "must be at least 1s"));
        }
        if storage_gc.concurrency == 0 {
            return Err(ConfigError::new("storage_gc.concurrency", "must be positive"));
        }
        Ok(())
    }
}

fn validate_worker(section: &str, worker: &WorkerConfig) -> Result<(), ConfigError> {
    if worker.interval.is_zero() {
        return Err(ConfigError::new(format!("{}.interval", section), "must be positive"));
    }
    if worker.leader_lifetime < Duration::from_secs(1) {
        return Err(ConfigError::new(
            format!("{}.leader_lifetime", section),
            "must be at least 1s",
        ));
    }
    if worker.batch_limit == 0 {
        return Err(ConfigError::new(format!("{}.batch_limit", section), "must be positive"));
    }
    Ok(())
}

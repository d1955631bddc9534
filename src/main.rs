//! Strata server
//!
//! Accepts Redis clients, runs their commands against the backing store,
//! and takes part in the maintenance elections for every database.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata::commands::CommandHandler;
use strata::config::Config;
use strata::connection::{handle_connection, ConnectionStats};
use strata::reclaim::Maintenance;
use strata::store::Storage;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(author, version, about = "Redis-compatible server over a transactional key-value store")]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = strata::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = strata::DEFAULT_PORT)]
    port: u16,

    /// Key prefix separating this deployment from others in the store
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Number of logical databases
    #[arg(long, default_value_t = 16)]
    databases: u32,

    /// Backing store and coordinator address, e.g. memory://
    #[arg(long, default_value = "memory://")]
    store: String,

    /// Identity published in elections (default: host:port:pid)
    #[arg(long)]
    instance_id: Option<String>,

    /// PEM certificate chain for client TLS
    #[arg(long, value_name = "PATH", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for client TLS
    #[arg(long, value_name = "PATH", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Do not run the garbage collection workers
    #[arg(long)]
    gc_disable: bool,

    /// Seconds between garbage collection passes
    #[arg(long, value_name = "SECS")]
    gc_interval: Option<u64>,

    /// Records examined per garbage collection pass
    #[arg(long)]
    gc_batch_limit: Option<usize>,

    /// Election session ttl for the garbage collection workers
    #[arg(long, value_name = "SECS")]
    gc_leader_lifetime: Option<u64>,

    /// Do not run the expire workers
    #[arg(long)]
    expire_disable: bool,

    /// Seconds between expire passes
    #[arg(long, value_name = "SECS")]
    expire_interval: Option<u64>,

    /// Records examined per expire pass
    #[arg(long)]
    expire_batch_limit: Option<usize>,

    /// Election session ttl for the expire workers
    #[arg(long, value_name = "SECS")]
    expire_leader_lifetime: Option<u64>,

    /// Seconds past expire_at before an object is deleted
    #[arg(long, value_name = "SECS")]
    expire_tolerance: Option<u64>,

    /// Do not trigger the store's own version GC
    #[arg(long)]
    storage_gc_disable: bool,

    /// Seconds between store GC runs
    #[arg(long, value_name = "SECS")]
    storage_gc_interval: Option<u64>,

    /// Election session ttl for the store GC leader
    #[arg(long, value_name = "SECS")]
    storage_gc_leader_lifetime: Option<u64>,

    /// Seconds the store GC safe point trails behind now
    #[arg(long, value_name = "SECS")]
    storage_gc_safe_point_lifetime: Option<u64>,

    /// Parallel workers the store uses for one GC run
    #[arg(long)]
    storage_gc_concurrency: Option<usize>,
}

impl Args {
    fn into_config(self) -> Config {
        let mut config = Config::default();

        config.server.host = self.host;
        config.server.port = self.port;
        config.server.namespace = self.namespace;
        config.server.databases = self.databases;
        config.server.instance_id = self.instance_id;
        config.server.tls_cert = self.tls_cert;
        config.server.tls_key = self.tls_key;
        config.store.address = self.store;

        config.gc.disable = self.gc_disable;
        if let Some(secs) = self.gc_interval {
            config.gc.interval = Duration::from_secs(secs);
        }
        if let Some(limit) = self.gc_batch_limit {
            config.gc.batch_limit = limit;
        }
        if let Some(secs) = self.gc_leader_lifetime {
            config.gc.leader_lifetime = Duration::from_secs(secs);
        }

        config.expire.worker.disable = self.expire_disable;
        if let Some(secs) = self.expire_interval {
            config.expire.worker.interval = Duration::from_secs(secs);
        }
        if let Some(limit) = self.expire_batch_limit {
            config.expire.worker.batch_limit = limit;
        }
        if let Some(secs) = self.expire_leader_lifetime {
            config.expire.worker.leader_lifetime = Duration::from_secs(secs);
        }
        if let Some(secs) = self.expire_tolerance {
            config.expire.tolerance = Duration::from_secs(secs);
        }

        config.storage_gc.disable = self.storage_gc_disable;
        if let Some(secs) = self.storage_gc_interval {
            config.storage_gc.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.storage_gc_leader_lifetime {
            config.storage_gc.leader_lifetime = Duration::from_secs(secs);
        }
        if let Some(secs) = self.storage_gc_safe_point_lifetime {
            config.storage_gc.safe_point_lifetime = Duration::from_secs(secs);
        }
        if let Some(n) = self.storage_gc_concurrency {
            config.storage_gc.concurrency = n;
        }

        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    config.validate()?;
    if config.server.tls_enabled() {
        bail!("TLS termination is not built into this listener; terminate TLS in front of it");
    }

    let store = strata::store::connect(&config.store.address)
        .with_context(|| format!("connecting to store at {}", config.store.address))?;
    let coordinator = strata::coordination::connect(&config.store.address)
        .with_context(|| format!("connecting to coordinator at {}", config.store.address))?;
    info!(address = %config.store.address, "Store connected");

    let maintenance = Maintenance::start(Arc::clone(&store), coordinator, &config);

    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.server.bind_address())
        .await
        .with_context(|| format!("binding {}", config.server.bind_address()))?;
    info!(
        version = strata::VERSION,
        namespace = %config.server.namespace,
        "Listening on {}",
        config.server.bind_address()
    );

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Shutdown signal received, stopping server...");
    };

    tokio::select! {
        _ = accept_loop(listener, store, &config, stats) => {}
        _ = shutdown => {}
    }

    maintenance.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(listener: TcpListener, store: Arc<dyn Storage>, config: &Config, stats: Arc<ConnectionStats>) {
    let namespace = config.server.namespace.as_str();
    let databases = config.server.databases;

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = CommandHandler::new(Arc::clone(&store), namespace, databases);
                let stats = Arc::clone(&stats);

                tokio::spawn(async move {
                    handle_connection(stream, addr, handler, stats).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_config() {
        let config = Args::parse_from(["strata"]).into_config();
        let defaults = Config::default();
        assert_eq!(config.server.bind_address(), defaults.server.bind_address());
        assert_eq!(config.gc.leader_lifetime, defaults.gc.leader_lifetime);
        assert_eq!(config.storage_gc.safe_point_lifetime, defaults.storage_gc.safe_point_lifetime);
        assert!(config.server.tls_cert.is_none());
    }

    #[test]
    fn test_worker_flags() {
        let config = Args::parse_from([
            "strata",
            "--gc-leader-lifetime",
            "30",
            "--expire-leader-lifetime",
            "45",
            "--storage-gc-leader-lifetime",
            "600",
            "--storage-gc-safe-point-lifetime",
            "120",
            "--storage-gc-concurrency",
            "8",
        ])
        .into_config();

        assert_eq!(config.gc.leader_lifetime, Duration::from_secs(30));
        assert_eq!(config.expire.worker.leader_lifetime, Duration::from_secs(45));
        assert_eq!(config.storage_gc.leader_lifetime, Duration::from_secs(600));
        assert_eq!(config.storage_gc.safe_point_lifetime, Duration::from_secs(120));
        assert_eq!(config.storage_gc.concurrency, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tls_flags() {
        let config = Args::parse_from(["strata", "--tls-cert", "cert.pem", "--tls-key", "key.pem"]).into_config();
        assert_eq!(config.server.tls_cert, Some(PathBuf::from("cert.pem")));
        assert_eq!(config.server.tls_key, Some(PathBuf::from("key.pem")));
        assert!(config.server.tls_enabled());

        assert!(Args::try_parse_from(["strata", "--tls-cert", "cert.pem"]).is_err());
    }
}

//! One-shot reclaim tool
//!
//! Sweeps one database from start to end: first deletes every object past
//! its expiry (plus the grace period), then drains the garbage entries left
//! by logical deletes. Unlike the server's workers it does not take part in
//! elections, so run it only while no server is reclaiming the same
//! database.
//!
//! ```bash
//! strata-reclaim -db 2 -batch 500 -namespace prod memory://
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Instant;
use strata::reclaim::{Reclaimer, WorkKind};
use strata::store::{unix_now, Database};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the reclaim tool.
#[derive(Parser, Debug)]
#[command(author, version, about = "Delete expired and garbage objects of one database")]
struct Args {
    /// Database id to sweep
    #[arg(long, default_value_t = 0)]
    db: u32,

    /// Records examined per transaction
    #[arg(long, default_value_t = 10_000)]
    batch: usize,

    /// Key namespace the database lives under
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Backing store address, e.g. memory://
    store: String,
}

/// Long flags are accepted with a single dash (`-db 3`) as well as two.
fn normalize_flags<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    const LONG: [&str; 3] = ["db", "batch", "namespace"];

    args.into_iter()
        .map(|arg| {
            let Some(flag) = arg.strip_prefix('-').filter(|rest| !rest.starts_with('-')) else {
                return arg;
            };
            let name = flag.split_once('=').map_or(flag, |(name, _)| name);
            if LONG.contains(&name) {
                format!("-{}", arg)
            } else {
                arg
            }
        })
        .collect()
}

async fn run(args: Args) -> Result<()> {
    if args.batch == 0 {
        anyhow::bail!("batch must be positive");
    }

    let store = strata::store::connect(&args.store)
        .with_context(|| format!("connecting to store at {}", args.store))?;
    let db = Database::new(args.namespace, args.db);
    let reclaimer = Reclaimer::new(store, db.clone());

    for kind in [WorkKind::Expire, WorkKind::Gc] {
        let started = Instant::now();
        let reclaimed = reclaimer
            .sweep(kind, args.batch, unix_now())
            .await
            .with_context(|| format!("{} sweep of {}", kind, db))?;
        info!(
            db = %db,
            kind = %kind,
            reclaimed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sweep finished"
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse_from(normalize_flags(std::env::args()));

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!(db = args.db, batch = args.batch, namespace = %args.namespace, store = %args.store, "Reclaim started");

    if let Err(e) = run(args).await {
        error!("Reclaim failed: {:#}", e);
        std::process::exit(1);
    }

    info!("Reclaim finished");
}

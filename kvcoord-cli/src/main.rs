use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use humantime_serde::re::humantime;
use kvcoord_core::logging::init_logging_with_config;
use kvcoord_core::metrics::init_metrics;
use kvcoord_core::shutdown::install_signal_handlers;
use kvcoord_core::{
    create_client, Client, Config, JsonCodec, KvClient, LeaseCache, LeaseClient, MemoryStore,
    ShutdownCoordinator, StringCodec, TransformResult, WatchEvent,
};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kvcoord")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML config file; falls back to KVCOORD_* environment variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run concurrent CAS incrementers against one key and check for lost updates
    Contend {
        /// Number of concurrent writers
        #[arg(short, long, default_value_t = 8)]
        workers: u64,

        /// Increments per writer
        #[arg(short, long, default_value_t = 100)]
        increments: u64,

        /// Use the lease-aware client
        #[arg(long)]
        lease: bool,
    },

    /// Keep a registration alive with lease-aware CAS
    Heartbeat {
        /// Key to register under
        #[arg(short, long, default_value = "node-1")]
        key: String,

        /// Namespace the key is registered in (empty for none)
        #[arg(short, long, default_value = "members/")]
        prefix: String,

        /// Number of heartbeats
        #[arg(short, long, default_value_t = 10)]
        count: u32,

        /// Delay between heartbeats
        #[arg(long, value_parser = parse_duration, default_value = "200ms")]
        interval: Duration,

        /// Change the registered state every N heartbeats (0 = never)
        #[arg(long, default_value_t = 0)]
        flip_every: u32,
    },

    /// Watch a prefix while a writer task updates keys under it
    Watch {
        /// Prefix to watch
        #[arg(short, long, default_value = "config/")]
        prefix: String,

        /// Stop after this many events (0 = until Ctrl-C)
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Delay between writes
        #[arg(long, value_parser = parse_duration, default_value = "100ms")]
        interval: Duration,
    },
}

fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(raw)
}

#[derive(Debug, Serialize)]
struct ContendReport {
    workers: u64,
    increments: u64,
    expected: u64,
    observed: u64,
    conditional_puts: u64,
    committed_puts: u64,
    elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
struct HeartbeatReport {
    prefix: String,
    key: String,
    heartbeats: u32,
    committed: u64,
    skipped: u64,
    lease_grants: u64,
    lease_renewals: u64,
}

#[derive(Debug, Serialize)]
struct WatchReport {
    prefix: String,
    events: usize,
    writes: u64,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::from_env().context("Failed to load config from environment")?,
    };

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    config.validate()?;
    Ok(config)
}

fn print_report<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

async fn contend(
    config: &Config,
    shutdown: &ShutdownCoordinator,
    workers: u64,
    increments: u64,
    lease: bool,
) -> Result<()> {
    let store = MemoryStore::new();
    // Every writer can lose to every other one on each round
    let budget = u32::try_from(workers.saturating_mul(increments)).unwrap_or(u32::MAX).max(10);
    let client_config = config.client.clone().with_max_retries(budget);
    let base = KvClient::new(Arc::new(store.clone()), JsonCodec::<u64>::new(), client_config)?;
    let started = Instant::now();

    info!(workers, increments, lease, "Starting contention run");

    let mut handles = Vec::new();
    for worker in 0..workers {
        let cancel = shutdown.child_token();
        let base = base.clone();
        let lease_client =
            lease.then(|| LeaseClient::new(base.clone(), Arc::new(LeaseCache::new())));
        handles.push(tokio::spawn(async move {
            for _ in 0..increments {
                let increment = |current: Option<u64>| -> TransformResult<u64> {
                    Ok(Some(current.unwrap_or(0) + 1))
                };
                let result = match &lease_client {
                    Some(client) => client.cas(&cancel, "counter", increment).await,
                    None => base.cas(&cancel, "counter", increment).await,
                };
                if let Err(e) = result {
                    warn!(worker, error = %e, "Increment failed");
                    return Err(e);
                }
            }
            Ok(())
        }));
    }

    for handle in handles {
        handle.await??;
    }

    let observed = base.get(&shutdown.child_token(), "counter").await?.unwrap_or(0);
    let stats = store.stats()?;
    let report = ContendReport {
        workers,
        increments,
        expected: workers * increments,
        observed,
        conditional_puts: stats.conditional_puts,
        committed_puts: stats.committed_puts,
        elapsed_ms: started.elapsed().as_millis(),
    };
    print_report(&report)?;

    if report.observed != report.expected {
        bail!("lost updates: expected {}, observed {}", report.expected, report.observed);
    }
    Ok(())
}

async fn heartbeat(
    config: &Config,
    shutdown: &ShutdownCoordinator,
    prefix: String,
    key: String,
    count: u32,
    interval: Duration,
    flip_every: u32,
) -> Result<()> {
    let store = MemoryStore::new();
    let mut client_config = config.client.clone();
    if client_config.lease_ttl.is_none() {
        client_config = client_config.with_lease_ttl(Duration::from_secs(10));
    }
    let client = create_client(Arc::new(store.clone()), StringCodec, &prefix, client_config)?;
    let cancel = shutdown.child_token();

    let mut sent = 0;
    for beat in 0..count {
        if cancel.is_cancelled() {
            break;
        }
        let leaving = flip_every > 0 && (beat / flip_every) % 2 == 1;
        let state = if leaving { "LEAVING" } else { "ACTIVE" };
        let set = |_: Option<String>| -> TransformResult<String> { Ok(Some(state.to_string())) };
        client.cas(&cancel, &key, set).await?;
        sent += 1;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    let stats = store.stats()?;
    print_report(&HeartbeatReport {
        prefix,
        key,
        heartbeats: sent,
        committed: stats.committed_puts,
        skipped: u64::from(sent).saturating_sub(stats.committed_puts),
        lease_grants: stats.lease_grants,
        lease_renewals: stats.lease_renewals,
    })
}

async fn watch(
    config: &Config,
    shutdown: &ShutdownCoordinator,
    prefix: String,
    count: usize,
    interval: Duration,
) -> Result<()> {
    let store = MemoryStore::new();
    let client = KvClient::new(Arc::new(store.clone()), StringCodec, config.client.clone())?;
    let cancel = shutdown.child_token();

    let writer = tokio::spawn({
        let store = store.clone();
        let cancel = cancel.clone();
        let prefix = prefix.clone();
        async move {
            let mut writes = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return writes,
                    _ = tokio::time::sleep(interval) => {}
                }
                let key = format!("{}key-{}", prefix, writes % 3);
                if let Err(e) = store.put(&key, format!("value-{}", writes)) {
                    warn!(error = %e, "Writer failed");
                    return writes;
                }
                writes += 1;
            }
        }
    });

    let mut events = 0;
    client
        .watch_prefix(&cancel, &prefix, |event: WatchEvent<String>| {
            events += 1;
            info!(
                key = %event.key,
                kind = ?event.kind,
                revision = event.revision,
                value = ?event.value,
                "Watch event"
            );
            count == 0 || events < count
        })
        .await;

    cancel.cancel();
    let writes = writer.await?;
    print_report(&WatchReport { prefix, events, writes })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_logging_with_config(config.logging.to_log_config()?)?;
    init_metrics();

    let shutdown = Arc::new(ShutdownCoordinator::new());
    install_signal_handlers(shutdown.clone());

    info!("kvcoord CLI started");

    match args.command {
        Command::Contend { workers, increments, lease } => {
            contend(&config, &shutdown, workers, increments, lease).await?
        }
        Command::Heartbeat { key, prefix, count, interval, flip_every } => {
            heartbeat(&config, &shutdown, prefix, key, count, interval, flip_every).await?
        }
        Command::Watch { prefix, count, interval } => {
            watch(&config, &shutdown, prefix, count, interval).await?
        }
    }

    info!("kvcoord CLI finished");
    Ok(())
}

//! `chash`: inspect and exercise a consistent hashing ring.
//!
//! # Usage
//!
//! ```text
//! chash -t a:2181 -t b:2181 resolve user:42        # owner of a key
//! chash -c chash.toml resolve -n 3 user:42 abc     # three owners per key
//! chash -c chash.toml stats --keys 100000          # key share per target
//! chash -c chash.toml simulate --down b:2181 k1 k2 # owners before/after a failure
//! chash -c chash.toml watch user:42                # live view driven by down_file
//! ```

mod config;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chash_ring::{HashRing, TargetId};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "chash",
    version,
    about = "Consistent hashing ring: resolve keys, inspect balance, simulate failures"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Target to place on the ring. Replaces the configured targets.
    ///
    /// Can be specified multiple times.
    #[arg(short = 't', long = "target", global = true)]
    targets: Vec<String>,

    /// Override shadow identities per target.
    #[arg(short, long, global = true)]
    shadow_count: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the owner of each key.
    Resolve {
        /// Keys to resolve.
        #[arg(required = true)]
        keys: Vec<String>,

        /// Number of distinct owners to print per key.
        #[arg(short = 'n', long, default_value = "1")]
        replicas: usize,
    },

    /// Resolve synthetic keys and print each target's share.
    Stats {
        /// Number of synthetic keys.
        #[arg(long, default_value = "10000")]
        keys: usize,
    },

    /// Mark targets unhealthy, reconcile, and print owners before and after.
    Simulate {
        /// Target to mark unhealthy. Can be specified multiple times.
        #[arg(long, required = true)]
        down: Vec<String>,

        /// Keys to resolve before and after.
        keys: Vec<String>,
    },

    /// Run the liveness checker against `down_file` until Ctrl-C.
    Watch {
        /// Keys whose owners are logged every interval.
        keys: Vec<String>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    // CLI args override config file values.
    if !cli.targets.is_empty() {
        config.ring.targets = cli.targets;
    }
    if let Some(n) = cli.shadow_count {
        config.ring.shadow_count = n;
    }

    match cli.command {
        Commands::Resolve { keys, replicas } => cmd_resolve(&config, &keys, replicas),
        Commands::Stats { keys } => cmd_stats(&config, keys),
        Commands::Simulate { down, keys } => cmd_simulate(&config, &down, &keys),
        Commands::Watch { keys } => cmd_watch(&config, &keys).await,
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Build a ring holding every configured target.
fn build_ring(config: &CliConfig) -> Result<HashRing> {
    if config.ring.targets.is_empty() {
        bail!("no targets configured: pass --target or set [ring] targets");
    }

    let ring = HashRing::new();
    ring.build(config.shadow_count())
        .context("failed to build hash ring")?;
    for target in &config.ring.targets {
        if !ring
            .add_target(target)
            .with_context(|| format!("failed to add target {target:?}"))?
        {
            warn!(%target, "duplicate target ignored");
        }
    }
    debug!(nodes = ring.node_count(), "ring ready");
    Ok(ring)
}

fn join_targets(targets: &[TargetId]) -> String {
    if targets.is_empty() {
        return "-".to_string();
    }
    targets.iter().map(|t| &**t).collect::<Vec<_>>().join(", ")
}

// -----------------------------------------------------------------------
// chash resolve
// -----------------------------------------------------------------------

fn cmd_resolve(config: &CliConfig, keys: &[String], replicas: usize) -> Result<()> {
    let ring = build_ring(config)?;
    for key in keys {
        println!("{key}\t{}", join_targets(&ring.resolve_n(key, replicas)));
    }
    Ok(())
}

// -----------------------------------------------------------------------
// chash stats
// -----------------------------------------------------------------------

fn cmd_stats(config: &CliConfig, keys: usize) -> Result<()> {
    let ring = build_ring(config)?;

    let start = Instant::now();
    let shares = key_shares(&ring, keys);
    let elapsed = start.elapsed();

    println!("Ring");
    println!("  targets:      {}", ring.active_targets().len());
    println!("  shadow_count: {}", ring.shadow_count());
    println!("  nodes:        {}", ring.node_count());
    println!();
    println!(
        "Key share ({keys} keys, {:.1} ms)",
        elapsed.as_secs_f64() * 1000.0
    );
    let expected = 100.0 / shares.len().max(1) as f64;
    for (target, count) in &shares {
        let share = *count as f64 * 100.0 / keys.max(1) as f64;
        println!(
            "  {target:<24} {count:>8}  {share:>6.2}%  ({:+.2})",
            share - expected
        );
    }
    Ok(())
}

/// Count how many of `keys` synthetic keys each active target owns.
fn key_shares(ring: &HashRing, keys: usize) -> BTreeMap<TargetId, usize> {
    let mut shares: BTreeMap<TargetId, usize> =
        ring.active_targets().into_iter().map(|t| (t, 0)).collect();
    for i in 0..keys {
        if let Some(owner) = ring.resolve(&format!("key-{i}")) {
            *shares.entry(owner).or_default() += 1;
        }
    }
    shares
}

// -----------------------------------------------------------------------
// chash simulate
// -----------------------------------------------------------------------

fn cmd_simulate(config: &CliConfig, down: &[String], keys: &[String]) -> Result<()> {
    let ring = build_ring(config)?;
    for target in down {
        if !ring.is_active(target) {
            warn!(%target, "down target is not on the ring");
        }
    }

    let before: Vec<Vec<TargetId>> = keys.iter().map(|k| ring.resolve_n(k, 1)).collect();

    let down: HashSet<&str> = down.iter().map(String::as_str).collect();
    let summary = ring
        .reconcile(|target| !down.contains(target))
        .context("reconcile failed")?;

    println!("Quarantined: {}", join_targets(&summary.quarantined));
    println!("Active:      {}", join_targets(&ring.active_targets()));
    println!("Nodes:       {}", ring.node_count());
    if keys.is_empty() {
        return Ok(());
    }

    println!();
    for (key, before) in keys.iter().zip(&before) {
        let after = ring.resolve_n(key, 1);
        let marker = if after == *before { "" } else { "  (moved)" };
        println!(
            "{key}\t{} -> {}{marker}",
            join_targets(before),
            join_targets(&after)
        );
    }
    Ok(())
}

// -----------------------------------------------------------------------
// chash watch
// -----------------------------------------------------------------------

async fn cmd_watch(config: &CliConfig, keys: &[String]) -> Result<()> {
    let ring = build_ring(config)?;
    let interval = config.check_interval();

    // The down file is read once per pass and shared by every target's check.
    let down_file = config.checker.down_file.clone();
    ring.start_check_with(
        move || {
            let down = load_down_set(down_file.as_deref());
            move |target: &str| !down.contains(target)
        },
        interval,
    )
    .context("failed to start liveness checker")?;
    info!(
        interval_ms = interval.as_millis() as u64,
        down_file = ?config.checker.down_file,
        "watching ring, press Ctrl-C to stop"
    );

    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for Ctrl-C")?;
                break;
            }
            _ = tick.tick() => {
                let pending = ring.pending_targets();
                info!(
                    active = ring.active_targets().len(),
                    pending = pending.len(),
                    nodes = ring.node_count(),
                    "ring status"
                );
                if !pending.is_empty() {
                    info!(targets = %join_targets(&pending), "quarantined");
                }
                for key in keys {
                    info!(%key, owner = %join_targets(&ring.resolve_n(key, 1)), "resolved");
                }
            }
        }
    }

    ring.destroy();
    info!("watch stopped");
    Ok(())
}

/// Targets currently marked down, or none without a down file.
fn load_down_set(down_file: Option<&Path>) -> HashSet<String> {
    down_file.map(read_down_list).unwrap_or_default()
}

/// Targets listed in `path`, one per line. Blank lines and `#` comments are
/// skipped. A missing file means every target is healthy.
fn read_down_list(path: &Path) -> HashSet<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read down file");
            HashSet::new()
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

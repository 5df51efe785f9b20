// Cardinality Quota - CLI Entry Point
//
// Offline tooling around the quota evaluator:
// - simulate steady arrival of distinct hashes against one quota
// - replay recorded request batches
// - print the effective configuration

use anyhow::{Context, Result};
use cardinality_quota::cardinality::{
    Grant, MemoryStore, Quota, QuotaEvaluator, QuotaStore, RequestedQuota, RetryConfig,
};
use cardinality_quota::config::Config;
use cardinality_quota::logging;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// cardquota: sliding-window cardinality quotas
#[derive(Parser, Debug)]
#[command(name = "cardquota")]
#[command(version)]
#[command(about = "Sliding-window cardinality quota tooling", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Admit one new distinct hash every INTERVAL seconds and report the outcome
    Simulate {
        /// Window length in seconds
        #[arg(long, default_value_t = 3600)]
        window: u64,

        /// Bucket granularity in seconds
        #[arg(long, default_value_t = 60)]
        granularity: u64,

        /// Distinct hashes allowed per window
        #[arg(long, default_value_t = 10)]
        limit: u64,

        /// Seconds between arrivals
        #[arg(long, default_value_t = 360)]
        interval: u64,

        /// Number of arrivals
        #[arg(long, default_value_t = 100)]
        count: u64,

        /// Timestamp of the first arrival
        #[arg(long, default_value_t = 3600)]
        start: u64,

        /// Prefix the hashes are admitted under
        #[arg(long, default_value = "simulated")]
        prefix: String,
    },
    /// Check and commit recorded batches against an in-memory store
    Replay {
        /// JSON file with a list of batches ("-" for stdin)
        input: String,

        /// Only check, never commit
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the effective configuration
    ShowConfig,
}

/// One recorded batch for `replay`
#[derive(Debug, Deserialize)]
struct Batch {
    timestamp: Option<u64>,
    requests: Vec<RequestedQuota>,
}

/// Output line for `replay`
#[derive(Debug, Serialize)]
struct BatchOutcome {
    timestamp: u64,
    grants: Vec<Grant>,
}

/// Summary printed by `simulate`
#[derive(Debug, Default, Serialize)]
struct SimulationSummary {
    arrivals: u64,
    admitted: u64,
    denied: u64,
    estimated_cardinality: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if args.verbose {
        config.logging.level = "debug".to_string();
    }
    logging::init_tracing(&config.logging)?;
    cardinality_quota::metrics::init().context("Failed to initialize metrics")?;

    info!("Cardinality quota CLI v{} starting", env!("CARGO_PKG_VERSION"));

    match args.command {
        Some(Commands::Simulate {
            window,
            granularity,
            limit,
            interval,
            count,
            start,
            prefix,
        }) => {
            let quota = Quota::new(window, granularity, limit)?;
            let evaluator = build_evaluator(&config)?;
            let summary = simulate(&evaluator, &prefix, quota, interval, count, start).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Some(Commands::Replay { input, dry_run }) => {
            let evaluator = build_evaluator(&config)?;
            replay(&evaluator, &input, dry_run).await?;
        }
        Some(Commands::ShowConfig) => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        None => {
            info!("No command specified. Use \"cardquota --help\" for usage.");
        }
    }

    Ok(())
}

fn build_evaluator(config: &Config) -> Result<QuotaEvaluator> {
    let store: Arc<dyn QuotaStore> = Arc::new(MemoryStore::new());
    let evaluator = QuotaEvaluator::from_config(&config.limiter, Some(store))
        .context("Failed to build quota evaluator")?
        .with_retry(RetryConfig::from(&config.retry));
    Ok(evaluator)
}

async fn simulate(
    evaluator: &QuotaEvaluator,
    prefix: &str,
    quota: Quota,
    interval: u64,
    count: u64,
    start: u64,
) -> Result<SimulationSummary> {
    let mut summary = SimulationSummary::default();
    let mut timestamp = start;

    for hash in 0..count {
        timestamp = hash
            .checked_mul(interval)
            .and_then(|offset| start.checked_add(offset))
            .with_context(|| format!("Arrival {} overflows the timestamp range", hash))?;
        let request = RequestedQuota::new(prefix, vec![hash], vec![quota]);
        let (ts, grants) = evaluator
            .check_within_quotas(&[request], Some(timestamp))
            .await;
        evaluator.use_quotas(&grants, ts).await;

        summary.arrivals += 1;
        if grants.iter().all(Grant::is_empty) {
            summary.denied += 1;
        } else {
            summary.admitted += 1;
        }
    }

    if let Some(usage) = evaluator.usage(prefix, &quota, Some(timestamp)).await? {
        summary.estimated_cardinality = usage.estimated_cardinality;
    }

    info!(
        "Simulated {} arrivals: {} admitted, {} denied",
        summary.arrivals, summary.admitted, summary.denied
    );
    Ok(summary)
}

async fn replay(evaluator: &QuotaEvaluator, input: &str, dry_run: bool) -> Result<()> {
    let content = if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read batches from stdin")?;
        buffer
    } else {
        fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))?
    };

    let batches: Vec<Batch> =
        serde_json::from_str(&content).context("Failed to parse request batches")?;

    for batch in batches {
        let (timestamp, grants) = evaluator
            .check_within_quotas(&batch.requests, batch.timestamp)
            .await;
        if !dry_run {
            evaluator.use_quotas(&grants, timestamp).await;
        }
        println!(
            "{}",
            serde_json::to_string(&BatchOutcome { timestamp, grants })?
        );
    }

    Ok(())
}

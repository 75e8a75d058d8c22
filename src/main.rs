use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

use bucketgate::clock::{Clock, ManualClock, Timestamp};
use bucketgate::config::{FailurePolicy, GateConfig, StoreBackend};
use bucketgate::ratelimit::{AdmissionControl, AdmissionFacade, Algorithm, RateLimiter};

/// Replay a request trace through a rate limiter.
///
/// Reads one request per line from stdin, either `<seconds> <key>` or just
/// `<key>` (same time as the previous line), and prints the decision for each.
/// Defaults come from `BUCKETGATE__*` environment variables; flags override them.
#[derive(Parser, Debug)]
#[command(name = "bucketgate", version, about)]
struct Args {
    /// Admission algorithm: token or leaky
    #[arg(long)]
    algorithm: Option<Algorithm>,

    /// Bucket capacity (maximum burst)
    #[arg(long)]
    capacity: Option<f64>,

    /// Refill or leak rate per second
    #[arg(long)]
    rate: Option<f64>,

    /// Route state through the remote-store code path
    #[arg(long)]
    loopback: bool,

    /// Allow requests when the store is unavailable
    #[arg(long)]
    fail_open: bool,

    /// Print decisions as JSON lines
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = GateConfig::from_env().context("Failed to load configuration")?;
    if let Some(algorithm) = args.algorithm {
        config.limiter.algorithm = algorithm;
    }
    if let Some(capacity) = args.capacity {
        config.limiter.capacity = capacity;
    }
    if let Some(rate) = args.rate {
        config.limiter.rate = rate;
    }
    if args.loopback {
        config.store.backend = StoreBackend::Loopback;
    }
    if args.fail_open {
        config.failure_policy = FailurePolicy::FailOpen;
    }

    let clock = Arc::new(ManualClock::default());
    let limiter = Arc::new(RateLimiter::from_config(&config, clock.clone())?);
    let sweeper = config
        .store
        .sweep_interval()
        .map(|interval| limiter.spawn_sweeper(interval));
    let facade = AdmissionFacade::with_failure_policy(limiter, config.failure_policy);

    info!(algorithm = %config.limiter.algorithm, "Replaying requests from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (at, identifier) = parse_line(line)
            .with_context(|| format!("line {}: could not parse '{}'", line_no, line))?;
        if let Some(at) = at {
            clock.set(at);
        }

        let decision = facade.decide(identifier).await;
        let now = clock.now();

        if args.json {
            let record = serde_json::json!({
                "at": now.as_nanos() as f64 / 1e9,
                "key": identifier,
                "allowed": decision.allowed,
                "retry_after_secs": decision.retry_after.map(|d| d.as_secs_f64()),
                "degraded": decision.degraded,
            });
            println!("{}", record);
        } else {
            let verdict = match (decision.allowed, decision.retry_after) {
                (true, _) => "allowed".to_string(),
                (false, Some(wait)) => format!("denied (retry in {:.3}s)", wait.as_secs_f64()),
                (false, None) => "denied".to_string(),
            };
            println!("{} {} {}", now, identifier, verdict);
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    Ok(())
}

/// Split `<seconds> <key>` or `<key>`. A line whose first field is not a
/// number is taken whole as the key.
fn parse_line(line: &str) -> anyhow::Result<(Option<Timestamp>, &str)> {
    let Some((time, key)) = line.split_once(char::is_whitespace) else {
        return Ok((None, line));
    };
    let Ok(secs) = time.parse::<f64>() else {
        return Ok((None, line));
    };
    if !secs.is_finite() || secs < 0.0 {
        bail!("time must be a non-negative number of seconds, got {}", secs);
    }
    Ok((Some(Timestamp::from_secs_f64(secs)), key.trim()))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand, builder::PossibleValuesParser};
use rand::{SeedableRng, rngs::StdRng};
use tokio::sync::mpsc;
use tracing::{Level, info, warn};

use crate::{
    config::SessionConfig,
    market_data::WatchMarketData,
    orders::Order,
    schedule::{PriceRange, StepMode, TimeMode, compute_issue_times, compute_order_price},
    session::MarketSession,
    utils::shutdown_token,
};

/// Run double-auction market sessions and inspect their schedules
#[derive(Parser)]
#[command(name = "market_session")]
#[command(version, about = "Continuous double-auction market session scheduler")]
struct Cli {
    /// Log at DEBUG instead of INFO
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session from a JSON configuration file
    Run {
        /// Path to the session configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Seed for reproducible schedules (overrides the file)
        #[arg(long)]
        seed: Option<u64>,

        /// Seconds before the session opens (overrides the file)
        #[arg(long)]
        start_delay: Option<f64>,

        /// Session length in seconds (overrides the file)
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Print issue-time offsets for one refresh interval
    IssueTimes {
        #[arg(long)]
        traders: usize,

        #[arg(long, value_parser = PossibleValuesParser::new(["periodic", "drip-fixed", "drip-jitter", "drip-poisson"]))]
        mode: String,

        /// Refresh interval in seconds
        #[arg(long)]
        interval: f64,

        /// Rescale so the last arrival lands on the interval
        #[arg(long)]
        fit: bool,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Price the order of one participant within a zone
    Price {
        #[arg(long)]
        index: usize,

        #[arg(long)]
        traders: usize,

        #[arg(long)]
        min: f64,

        #[arg(long)]
        max: f64,

        #[arg(long, value_parser = PossibleValuesParser::new(["fixed", "jittered", "random"]))]
        step_mode: String,

        #[arg(long, default_value_t = 0.01)]
        tick: f64,

        #[arg(long)]
        seed: Option<u64>,
    },
}

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_os_rng(),
    }
}

async fn handle_run(
    path: PathBuf,
    seed: Option<u64>,
    start_delay: Option<f64>,
    duration: Option<f64>,
) -> anyhow::Result<()> {
    let mut cfg = SessionConfig::load(&path)?;
    if seed.is_some() {
        cfg.seed = seed;
    }
    if let Some(d) = start_delay {
        cfg.start_delay_secs = d;
    }
    if let Some(d) = duration {
        cfg.duration_secs = d;
    }

    let (outbox, mut submitted) = mpsc::unbounded_channel::<Order>();
    let (buyers, sellers) = cfg.build_population(Some(outbox));
    // no exchange is attached here, so the book stays empty
    let (_book_tx, market_data) = WatchMarketData::channel();

    let session = MarketSession::new(
        cfg.trial_id,
        buyers,
        sellers,
        cfg.order_schedule.clone(),
        Arc::new(market_data),
        cfg.options()?,
    )
    .with_context(|| format!("setting up session from {}", path.display()))?;

    tokio::spawn(async move {
        while let Some(order) = submitted.recv().await {
            info!(client = order.client_id(), %order, "order sent to exchange");
        }
    });

    let clock = session.run(cfg.start_delay()?, cfg.duration()?)?;
    info!(
        trial = cfg.trial_id,
        opens_in_secs = cfg.start_delay_secs,
        duration_secs = clock.duration().as_secs_f64(),
        "session scheduled"
    );

    let token = shutdown_token();
    tokio::select! {
        report = session.finished() => match report {
            Some(report) => {
                println!("{report}");
                println!("{}", serde_json::to_string_pretty(&session.stats())?);
            }
            None => warn!("session halted before producing a report"),
        },
        _ = token.cancelled() => {
            session.abort();
            session.cancel_open_orders();
            println!("{}", session.summarize());
        }
    }
    Ok(())
}

fn handle_issue_times(traders: usize, mode: &str, interval: f64, fit: bool, seed: Option<u64>) -> anyhow::Result<()> {
    let mode: TimeMode = mode.parse()?;
    let offsets = compute_issue_times(traders, mode, interval, fit, &mut rng(seed))?;
    for (i, t) in offsets.iter().enumerate() {
        println!("{i}: {t:.3}");
    }
    Ok(())
}

fn handle_price(
    index: usize,
    traders: usize,
    min: f64,
    max: f64,
    step_mode: &str,
    tick: f64,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let step_mode: StepMode = step_mode.parse()?;
    let ranges = [PriceRange::new(min, max)];
    let price = compute_order_price(index, traders, &ranges, step_mode, tick, &mut rng(seed))?;
    println!("{price:.2}");
    Ok(())
}

pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Run {
            config,
            seed,
            start_delay,
            duration,
        } => handle_run(config, seed, start_delay, duration).await,
        Commands::IssueTimes {
            traders,
            mode,
            interval,
            fit,
            seed,
        } => handle_issue_times(traders, &mode, interval, fit, seed),
        Commands::Price {
            index,
            traders,
            min,
            max,
            step_mode,
            tick,
            seed,
        } => handle_price(index, traders, min, max, &step_mode, tick, seed),
    }
}

//! Replay Lab: event-driven strategy backtesting and parameter optimization
//!
//! Usage:
//!   replay-lab backtest --strategy ema_trend --symbols BTCUSDT --days 30
//!   replay-lab optimize --strategy ema_trend --symbols BTCUSDT,ETHUSDT --days 30
//!   replay-lab import --symbol BTCUSDT --timeframe 1m --days 30
//!   replay-lab strategies

use chrono::Utc;
use clap::{Parser, Subcommand};
use engine::{
    required_timeframes, BacktestConfig, BacktestEngine, BacktestReport, BacktestStats, BarCache,
    BinanceClient, CacheConfig, DataLoader, DetectorRegistry, EngineError, OptimizeOutcome,
    OptimizeProgress, OptimizeRequest, OptimizerConfig, ParamBounds, StoreSource,
    StrategyOptimizer, Timeframe,
};
use persistence::repository::{
    BarRepository, BaselineRecord, BaselineRepository, PendingParamsRecord, PendingParamsRepository,
};
use persistence::Database;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

const DEFAULT_DB_PATH: &str = "data/replay_lab.db";

#[derive(Parser)]
#[command(name = "replay-lab")]
#[command(about = "Event-driven strategy backtesting and parameter optimization", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a strategy over historical bars
    Backtest {
        /// Registered strategy id
        #[arg(long)]
        strategy: String,
        /// Symbols to test (comma-separated)
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Number of days of historical data
        #[arg(long, default_value_t = 30)]
        days: u32,
        /// JSON file with a full backtest configuration
        #[arg(long)]
        config: Option<String>,
        /// Store the resulting expectancy as the strategy's baseline
        #[arg(long)]
        record_baseline: bool,
        /// Optional JSON export path for the full report
        #[arg(long)]
        export: Option<String>,
    },
    /// Search risk parameters with the genetic optimizer
    Optimize {
        /// Registered strategy id
        #[arg(long)]
        strategy: String,
        /// Symbols to test (comma-separated)
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Number of days of historical data
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long, default_value_t = 20)]
        population: usize,
        #[arg(long, default_value_t = 10)]
        generations: usize,
        /// Seed for a reproducible run
        #[arg(long)]
        seed: Option<u64>,
        /// Wall-clock budget; checked between generations
        #[arg(long)]
        deadline_secs: Option<u64>,
        /// Concurrent fitness evaluations
        #[arg(long, default_value_t = 4)]
        parallelism: usize,
        /// JSON file with a full backtest configuration
        #[arg(long)]
        config: Option<String>,
    },
    /// Pull bars from the REST provider into the local store
    Import {
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1m")]
        timeframe: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// List registered strategy ids
    Strategies,
    /// List optimizer results awaiting approval
    Pending {
        #[arg(long)]
        strategy: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("info,engine=debug,persistence=debug,replay_lab=debug")
    } else {
        EnvFilter::new("info,engine=info,replay_lab=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Backtest {
            strategy,
            symbols,
            days,
            config,
            record_baseline,
            export,
        } => {
            cmd_backtest(strategy, symbols, days, config, record_baseline, export).await?;
        }
        Commands::Optimize {
            strategy,
            symbols,
            days,
            population,
            generations,
            seed,
            deadline_secs,
            parallelism,
            config,
        } => {
            let optimizer = OptimizerConfig {
                population,
                generations,
                seed,
                deadline: deadline_secs.map(Duration::from_secs),
                parallelism,
                ..OptimizerConfig::default()
            };
            cmd_optimize(strategy, symbols, days, optimizer, config).await?;
        }
        Commands::Import {
            symbol,
            timeframe,
            days,
        } => {
            cmd_import(&symbol, &timeframe, days).await?;
        }
        Commands::Strategies => cmd_strategies(),
        Commands::Pending { strategy } => {
            cmd_pending(strategy.as_deref()).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Shared setup
// ============================================================================

async fn open_database() -> anyhow::Result<Database> {
    let db_path =
        std::env::var("REPLAY_LAB_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let db = Database::new(&db_path)
        .await
        .map_err(|e| anyhow::anyhow!("Database initialization failed: {}", e))?;
    info!("Database initialized: {}", db_path);
    Ok(db)
}

fn rest_client() -> BinanceClient {
    match std::env::var("REPLAY_LAB_REST_URL") {
        Ok(url) => BinanceClient::with_base_url(url),
        Err(_) => BinanceClient::new(),
    }
}

/// Store first, REST fallback, flow from the store
fn build_loader(db: &Database) -> DataLoader {
    let store = Arc::new(StoreSource::new(db.pool_clone()));
    DataLoader::new(Arc::new(BarCache::new(&CacheConfig::default())))
        .with_primary(store.clone())
        .with_secondary(Arc::new(rest_client()))
        .with_flow(store)
}

fn load_config(path: Option<&str>) -> anyhow::Result<BacktestConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("Cannot read config {}: {}", path, e))?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(BacktestConfig::default()),
    }
}

/// Fatal run configuration, checked before any data is fetched
fn check_run(strategy: &str, symbols: &[String]) -> anyhow::Result<()> {
    if symbols.is_empty() {
        return Err(EngineError::NoSymbols.into());
    }
    DetectorRegistry::resolve(strategy)?;
    Ok(())
}

fn fmt_pf(pf: f64) -> String {
    if pf.is_infinite() {
        "inf".to_string()
    } else {
        format!("{:.2}", pf)
    }
}

fn print_stats(stats: &BacktestStats) {
    println!(
        "  Trades: {} ({}W / {}L) | Win rate: {:.1}% | PF: {} | Expectancy: {:.3}R",
        stats.total_trades,
        stats.wins,
        stats.losses,
        stats.win_rate * 100.0,
        fmt_pf(stats.profit_factor),
        stats.expectancy
    );
    println!(
        "  Total: {:.2}R | Max DD: {:.2}R | Avg bars W/L: {:.1} / {:.1}",
        stats.total_r, stats.max_drawdown_r, stats.avg_bars_winners, stats.avg_bars_losers
    );
    if !stats.exit_reasons.is_empty() {
        let reasons: Vec<String> = stats
            .exit_reasons
            .iter()
            .map(|(reason, n)| format!("{}={}", reason, n))
            .collect();
        println!("  Exits: {}", reasons.join(", "));
    }
}

// ============================================================================
// Backtest command
// ============================================================================

async fn cmd_backtest(
    strategy: String,
    symbols: Vec<String>,
    days: u32,
    config_path: Option<String>,
    record_baseline: bool,
    export: Option<String>,
) -> anyhow::Result<()> {
    check_run(&strategy, &symbols)?;
    let detector = DetectorRegistry::resolve(&strategy)?;
    let mut config = load_config(config_path.as_deref())?;

    println!("\n=== Replay Lab v{} ===", APP_VERSION);
    println!("Strategy: {} | Symbols: {} | Days: {}", strategy, symbols.join(", "), days);

    let db = open_database().await?;
    let loader = build_loader(&db);

    let end = Utc::now().timestamp_millis();
    let start = end - days as i64 * Timeframe::D1.millis();
    let lead_in = config.warmup_bars as i64 * config.base_timeframe.millis();
    config.start = start;
    config.end = end;
    config.validate()?;

    let timeframes = required_timeframes(config.base_timeframe, detector.timeframe());
    let data = loader
        .load_many(&symbols, start - lead_in, end, &timeframes, 4)
        .await;

    let report: BacktestReport = BacktestEngine::run(&config, detector.as_ref(), &data)?;

    println!();
    for (symbol, stats) in &report.per_symbol {
        println!("{}:", symbol);
        print_stats(stats);
    }
    for symbol in &report.skipped_symbols {
        println!("{}: skipped (insufficient data)", symbol);
    }
    println!("\nAll symbols:");
    print_stats(&report.stats);

    if let Some(path) = export {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json)?;
        println!("\nReport exported to {}", path);
    }

    if record_baseline {
        let stats = &report.stats;
        let id = BaselineRepository::new(db.pool())
            .record(&BaselineRecord {
                id: None,
                strategy: strategy.clone(),
                expectancy: stats.expectancy.to_string(),
                total_trades: stats.total_trades as i64,
                win_rate: stats.win_rate.to_string(),
                profit_factor: stats.profit_factor.to_string(),
                recorded_at: None,
            })
            .await?;
        info!(strategy = %strategy, id, expectancy = stats.expectancy, "Baseline recorded");
    }

    Ok(())
}

// ============================================================================
// Optimize command
// ============================================================================

async fn cmd_optimize(
    strategy: String,
    symbols: Vec<String>,
    days: u32,
    optimizer: OptimizerConfig,
    config_path: Option<String>,
) -> anyhow::Result<()> {
    check_run(&strategy, &symbols)?;
    let backtest = load_config(config_path.as_deref())?;

    println!("\n=== Replay Lab v{} ===", APP_VERSION);
    println!(
        "Optimizing {} | Symbols: {} | Days: {} | Population: {} | Generations: {}",
        strategy,
        symbols.join(", "),
        days,
        optimizer.population,
        optimizer.generations
    );

    let db = open_database().await?;
    let baseline = BaselineRepository::new(db.pool())
        .latest(&strategy)
        .await?
        .and_then(|b| b.expectancy.parse::<f64>().ok());
    match baseline {
        Some(b) => println!("Baseline expectancy: {:.3}R", b),
        None => println!("No recorded baseline for {}", strategy),
    }
    println!("Press Ctrl+C to stop after the current generation\n");

    let request = OptimizeRequest {
        strategy,
        symbols,
        days,
        end: None,
        baseline_expectancy: baseline,
        bounds: ParamBounds::default(),
        optimizer,
        backtest,
    };

    let loader = Arc::new(build_loader(&db));
    let progress = Arc::new(OptimizeProgress::new());

    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    let progress_clone = progress.clone();
    let mut handle = tokio::spawn(async move {
        StrategyOptimizer::run_with_progress(&request, &loader, progress_clone).await
    });

    // Progress display loop
    let outcome = loop {
        tokio::select! {
            result = &mut handle => break result??,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                let pct = progress.progress_pct();
                let bar_len = 30;
                let filled = ((pct as usize * bar_len) / 100).min(bar_len);
                let bar: String = "=".repeat(filled) + &" ".repeat(bar_len - filled);
                print!(
                    "\r  [{}] {:.0}% ({} evaluations)   ",
                    bar,
                    pct,
                    progress.evaluations.load(Ordering::Relaxed)
                );
            }
        }
    };
    println!("\r  Complete!                                              ");

    print_outcome(&outcome);
    save_pending(&db, &outcome).await?;
    Ok(())
}

fn print_outcome(outcome: &OptimizeOutcome) {
    let p = &outcome.best_params;
    println!("\nBest parameters ({} generations, {} evaluations):", outcome.generations_run, outcome.evaluations);
    println!(
        "  target_multiple={:.2} stop_multiple={:.2} min_score={:.1} trim_at_r={:.2} max_hold_bars={}",
        p.target_multiple, p.stop_multiple, p.min_score, p.trim_at_r, p.max_hold_bars
    );
    print_stats(&outcome.best_stats);
    match (outcome.baseline_expectancy, outcome.improvement_pct) {
        (Some(b), Some(pct)) => println!(
            "  Expectancy {:.3}R → {:.3}R ({:+.1}%)",
            b, outcome.new_expectancy, pct
        ),
        _ => println!("  Expectancy {:.3}R (no baseline)", outcome.new_expectancy),
    }
}

async fn save_pending(db: &Database, outcome: &OptimizeOutcome) -> anyhow::Result<()> {
    if !outcome.is_qualified() {
        warn!(strategy = %outcome.strategy, "Best candidate below the trade floor, nothing saved");
        return Ok(());
    }

    let record = PendingParamsRecord {
        id: None,
        params_hash: outcome.params_hash.clone(),
        strategy: outcome.strategy.clone(),
        params: serde_json::to_string(&outcome.best_params)?,
        baseline_expectancy: outcome.baseline_expectancy.map(|v| v.to_string()),
        new_expectancy: outcome.new_expectancy.to_string(),
        improvement_pct: outcome.improvement_pct.map(|v| v.to_string()),
        stats: serde_json::to_string(&outcome.best_stats)?,
        status: "pending".to_string(),
        generations_run: Some(outcome.generations_run as i64),
        created_at: None,
    };

    if PendingParamsRepository::new(db.pool()).save(&record).await? {
        println!("\nSaved as pending parameters ({})", &outcome.params_hash[..12]);
    } else {
        println!("\nIdentical parameters already pending ({})", &outcome.params_hash[..12]);
    }
    Ok(())
}

// ============================================================================
// Import / listing commands
// ============================================================================

async fn cmd_import(symbol: &str, timeframe: &str, days: u32) -> anyhow::Result<()> {
    let timeframe: Timeframe = timeframe.parse()?;
    let db = open_database().await?;
    let store = StoreSource::new(db.pool_clone());
    let client = rest_client();

    let end = Utc::now().timestamp_millis();
    let start = end - days as i64 * Timeframe::D1.millis();
    info!(symbol, timeframe = %timeframe, days, "Importing bars");

    let bars = engine::types::normalize_bars(
        client
            .get_klines_paginated(symbol, timeframe, start, end)
            .await?,
    );
    let written = store.store_bars(symbol, timeframe, &bars, "rest").await?;

    let coverage = BarRepository::new(db.pool())
        .coverage(symbol, timeframe.as_str())
        .await?;
    println!("Imported {} bars for {} {}", written, symbol, timeframe);
    if let Some(c) = coverage {
        println!("Store now holds {} bars from {} to {}", c.count, c.first, c.last);
    }
    Ok(())
}

fn cmd_strategies() {
    println!("Registered strategies:");
    for id in DetectorRegistry::ids() {
        if let Ok(detector) = DetectorRegistry::resolve(id) {
            println!("  {:<16} {}", id, detector.timeframe());
        }
    }
}

async fn cmd_pending(strategy: Option<&str>) -> anyhow::Result<()> {
    let db = open_database().await?;
    let pending = PendingParamsRepository::new(db.pool())
        .list_pending(strategy)
        .await?;
    if pending.is_empty() {
        println!("No pending parameters");
        return Ok(());
    }
    for p in pending {
        println!(
            "{:<16} {} expectancy {} (baseline {}, improvement {}%) {}",
            p.strategy,
            &p.params_hash[..p.params_hash.len().min(12)],
            p.new_expectancy,
            p.baseline_expectancy.as_deref().unwrap_or("-"),
            p.improvement_pct.as_deref().unwrap_or("-"),
            p.params
        );
    }
    Ok(())
}

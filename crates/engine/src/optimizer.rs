//! Genetic parameter optimizer
//!
//! Searches [`StrategyParams`] with a generational GA: uniform random
//! initialization inside [`ParamBounds`], tournament selection, uniform
//! crossover, per-gene re-randomizing mutation and elitism. Each fitness
//! evaluation is a full replay of the pre-recorded signal tapes.

use futures_util::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::detectors::DetectorRegistry;
use crate::engine::{required_timeframes, BacktestConfig, BacktestEngine, SignalTape, StrategyParams};
use crate::error::{EngineError, EngineResult};
use crate::loader::{DataLoader, SymbolData};
use crate::stats::BacktestStats;
use crate::types::Timeframe;

// ============================================================================
// Types
// ============================================================================

/// Inclusive search range per gene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamBounds {
    pub target_multiple: (f64, f64),
    pub stop_multiple: (f64, f64),
    pub min_score: (f64, f64),
    pub trim_at_r: (f64, f64),
    pub max_hold_bars: (usize, usize),
}

impl Default for ParamBounds {
    fn default() -> Self {
        Self {
            target_multiple: (1.0, 4.0),
            stop_multiple: (0.5, 3.0),
            min_score: (0.0, 100.0),
            trim_at_r: (0.5, 2.5),
            max_hold_bars: (3, 60),
        }
    }
}

impl ParamBounds {
    pub fn validate(&self) -> EngineResult<()> {
        let ranges = [
            ("target_multiple", self.target_multiple),
            ("stop_multiple", self.stop_multiple),
            ("min_score", self.min_score),
            ("trim_at_r", self.trim_at_r),
            (
                "max_hold_bars",
                (self.max_hold_bars.0 as f64, self.max_hold_bars.1 as f64),
            ),
        ];
        for (name, (min, max)) in ranges {
            if !(min.is_finite() && max.is_finite() && min <= max) {
                return Err(EngineError::InvalidBounds { name, min, max });
            }
        }
        if self.target_multiple.0 <= 0.0 || self.stop_multiple.0 <= 0.0 || self.max_hold_bars.0 == 0 {
            return Err(EngineError::InvalidConfig(
                "target_multiple, stop_multiple and max_hold_bars must stay positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub population: usize,
    pub generations: usize,
    pub tournament_size: usize,
    /// Per-gene probability of re-randomizing a child's value
    pub mutation_rate: f64,
    /// Best individuals copied unchanged into the next generation
    pub elitism: usize,
    /// Fewer trades than this disqualifies an individual
    pub min_trades: usize,
    pub seed: Option<u64>,
    /// Wall-clock budget, checked between generations
    pub deadline: Option<Duration>,
    /// Concurrent fitness evaluations
    pub parallelism: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            population: 20,
            generations: 10,
            tournament_size: 3,
            mutation_rate: 0.15,
            elitism: 2,
            min_trades: 5,
            seed: None,
            deadline: None,
            parallelism: 4,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.population == 0 {
            return Err(EngineError::InvalidConfig("population must be positive".into()));
        }
        if self.generations == 0 {
            return Err(EngineError::InvalidConfig("generations must be positive".into()));
        }
        if self.tournament_size == 0 {
            return Err(EngineError::InvalidConfig("tournament_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(EngineError::InvalidConfig("mutation_rate must be within 0..=1".into()));
        }
        if self.elitism > self.population {
            return Err(EngineError::InvalidConfig("elitism exceeds population".into()));
        }
        Ok(())
    }
}

/// Request to optimize one strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub strategy: String,
    pub symbols: Vec<String>,
    pub days: u32,
    /// End of the test window in epoch ms; now when absent
    #[serde(default)]
    pub end: Option<i64>,
    /// Last recorded expectancy for the strategy
    #[serde(default)]
    pub baseline_expectancy: Option<f64>,
    #[serde(default)]
    pub bounds: ParamBounds,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
}

/// One candidate parameter vector. `stats` is `None` until evaluated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Individual {
    pub params: StrategyParams,
    pub fitness: f64,
    pub stats: Option<BacktestStats>,
}

impl Individual {
    pub fn new(params: StrategyParams) -> Self {
        Self {
            params,
            fitness: f64::NEG_INFINITY,
            stats: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizeOutcome {
    pub strategy: String,
    pub best_params: StrategyParams,
    pub best_stats: BacktestStats,
    pub fitness: f64,
    pub baseline_expectancy: Option<f64>,
    pub new_expectancy: f64,
    /// Relative change against the baseline; `None` without a usable baseline
    pub improvement_pct: Option<f64>,
    pub generations_run: usize,
    pub evaluations: usize,
    pub params_hash: String,
}

impl OptimizeOutcome {
    /// Whether the best individual cleared the minimum-trade floor
    pub fn is_qualified(&self) -> bool {
        self.fitness.is_finite()
    }
}

/// Shared progress tracker between the optimizer task and its caller
pub struct OptimizeProgress {
    pub total_generations: AtomicU32,
    pub completed_generations: AtomicU32,
    pub evaluations: AtomicU32,
    pub cancelled: AtomicBool,
}

impl OptimizeProgress {
    pub fn new() -> Self {
        Self {
            total_generations: AtomicU32::new(0),
            completed_generations: AtomicU32::new(0),
            evaluations: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Get progress as percentage
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_generations.load(Ordering::Relaxed);
        let done = self.completed_generations.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    /// Ask the run to stop after the current generation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl Default for OptimizeProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Genetic operators
// ============================================================================

const GENES: usize = 5;

fn randomize_gene(params: &mut StrategyParams, gene: usize, bounds: &ParamBounds, rng: &mut impl Rng) {
    let (min, max) = match gene {
        0 => bounds.target_multiple,
        1 => bounds.stop_multiple,
        2 => bounds.min_score,
        3 => bounds.trim_at_r,
        _ => {
            let (min, max) = bounds.max_hold_bars;
            params.max_hold_bars = rng.gen_range(min..=max);
            return;
        }
    };
    let value = rng.gen_range(min..=max);
    match gene {
        0 => params.target_multiple = value,
        1 => params.stop_multiple = value,
        2 => params.min_score = value,
        _ => params.trim_at_r = value,
    }
}

fn copy_gene(child: &mut StrategyParams, parent: &StrategyParams, gene: usize) {
    match gene {
        0 => child.target_multiple = parent.target_multiple,
        1 => child.stop_multiple = parent.stop_multiple,
        2 => child.min_score = parent.min_score,
        3 => child.trim_at_r = parent.trim_at_r,
        _ => child.max_hold_bars = parent.max_hold_bars,
    }
}

/// Every gene drawn uniformly inside its bounds
pub fn random_params(bounds: &ParamBounds, rng: &mut impl Rng) -> StrategyParams {
    let mut params = StrategyParams::default();
    for gene in 0..GENES {
        randomize_gene(&mut params, gene, bounds, rng);
    }
    params
}

/// expectancy × log10(n + 1), or −∞ below the trade floor
pub fn fitness(stats: &BacktestStats, min_trades: usize) -> f64 {
    if stats.total_trades < min_trades.max(1) {
        return f64::NEG_INFINITY;
    }
    stats.expectancy * ((stats.total_trades + 1) as f64).log10()
}

/// Sort best-first. Stable, so ties keep their previous order.
pub fn rank(population: &mut [Individual]) {
    population.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
}

fn tournament<'a>(population: &'a [Individual], k: usize, rng: &mut impl Rng) -> &'a Individual {
    let mut best = &population[rng.gen_range(0..population.len())];
    for _ in 1..k {
        let challenger = &population[rng.gen_range(0..population.len())];
        if challenger.fitness > best.fitness {
            best = challenger;
        }
    }
    best
}

/// Next generation from a ranked population: elites carried over with their
/// evaluation, the rest bred by tournament, uniform crossover and mutation.
pub fn evolve(
    ranked: &[Individual],
    bounds: &ParamBounds,
    config: &OptimizerConfig,
    rng: &mut impl Rng,
) -> Vec<Individual> {
    let mut next: Vec<Individual> = ranked.iter().take(config.elitism).cloned().collect();
    if ranked.is_empty() {
        return next;
    }

    while next.len() < config.population {
        let a = tournament(ranked, config.tournament_size, rng);
        let b = tournament(ranked, config.tournament_size, rng);
        let mut child = a.params.clone();
        for gene in 0..GENES {
            if rng.gen_bool(0.5) {
                copy_gene(&mut child, &b.params, gene);
            }
            if config.mutation_rate > 0.0 && rng.gen_bool(config.mutation_rate) {
                randomize_gene(&mut child, gene, bounds, rng);
            }
        }
        next.push(Individual::new(child));
    }
    next
}

// ============================================================================
// Evaluation
// ============================================================================

/// Replay the tapes under `params`
pub fn evaluate(
    params: &StrategyParams,
    base: &BacktestConfig,
    runs: &[(SymbolData, SignalTape)],
    min_trades: usize,
) -> (f64, BacktestStats) {
    let config = BacktestConfig {
        params: params.clone(),
        ..base.clone()
    };
    match BacktestEngine::replay(&config, runs) {
        Ok(report) => (fitness(&report.stats, min_trades), report.stats),
        Err(e) => {
            debug!(error = %e, "Candidate rejected");
            (f64::NEG_INFINITY, BacktestStats::default())
        }
    }
}

/// Evaluate every unevaluated individual concurrently. Returns the count.
async fn evaluate_population(
    population: &mut [Individual],
    base: &Arc<BacktestConfig>,
    runs: &Arc<Vec<(SymbolData, SignalTape)>>,
    min_trades: usize,
    parallelism: usize,
) -> usize {
    let pending: Vec<(usize, StrategyParams)> = population
        .iter()
        .enumerate()
        .filter(|(_, ind)| ind.stats.is_none())
        .map(|(i, ind)| (i, ind.params.clone()))
        .collect();
    let count = pending.len();

    let results: Vec<_> = stream::iter(pending)
        .map(|(i, params)| {
            let base = base.clone();
            let runs = runs.clone();
            async move {
                let result = tokio::task::spawn_blocking(move || {
                    evaluate(&params, &base, &runs, min_trades)
                })
                .await;
                (i, result)
            }
        })
        .buffer_unordered(parallelism.max(1))
        .collect()
        .await;

    for (i, result) in results {
        let (fitness, stats) = result.unwrap_or_else(|e| {
            warn!(error = %e, "Evaluation task failed");
            (f64::NEG_INFINITY, BacktestStats::default())
        });
        population[i].fitness = fitness;
        population[i].stats = Some(stats);
    }
    count
}

/// Deterministic id for a parameter set, used to dedupe pending records
pub fn params_hash(strategy: &str, params: &StrategyParams) -> String {
    let json = serde_json::to_string(params).unwrap_or_default();
    let input = format!("{}:{}", strategy, json);
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

fn improvement_pct(baseline: Option<f64>, new: f64) -> Option<f64> {
    baseline
        .filter(|b| b.is_finite() && *b != 0.0)
        .map(|b| (new - b) / b.abs() * 100.0)
}

// ============================================================================
// Driver
// ============================================================================

pub struct StrategyOptimizer;

impl StrategyOptimizer {
    pub async fn run(request: &OptimizeRequest, loader: &DataLoader) -> EngineResult<OptimizeOutcome> {
        Self::run_with_progress(request, loader, Arc::new(OptimizeProgress::new())).await
    }

    pub async fn run_with_progress(
        request: &OptimizeRequest,
        loader: &DataLoader,
        progress: Arc<OptimizeProgress>,
    ) -> EngineResult<OptimizeOutcome> {
        let started = Instant::now();

        // everything fatal is checked before any fetch
        if request.symbols.is_empty() {
            return Err(EngineError::NoSymbols);
        }
        let detector = DetectorRegistry::resolve(&request.strategy)?;
        request.bounds.validate()?;
        request.optimizer.validate()?;
        request.backtest.validate()?;
        if request.days == 0 {
            return Err(EngineError::InvalidConfig("days must be positive".into()));
        }

        let end = request
            .end
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let start = end - request.days as i64 * Timeframe::D1.millis();
        let base_tf = request.backtest.base_timeframe;
        let lead_in = request.backtest.warmup_bars as i64 * base_tf.millis();
        let base = Arc::new(BacktestConfig {
            start,
            end,
            ..request.backtest.clone()
        });

        info!(
            strategy = %request.strategy,
            symbols = request.symbols.len(),
            days = request.days,
            population = request.optimizer.population,
            generations = request.optimizer.generations,
            "Starting parameter optimization"
        );

        let timeframes = required_timeframes(base_tf, detector.timeframe());
        let data = loader
            .load_many(&request.symbols, start - lead_in, end, &timeframes, request.optimizer.parallelism)
            .await;

        let tape_config = base.clone();
        let runs: Vec<(SymbolData, SignalTape)> = tokio::task::spawn_blocking(move || {
            data.into_iter()
                .map(|d| {
                    let tape = SignalTape::record(detector.as_ref(), &d, &tape_config);
                    (d, tape)
                })
                .collect()
        })
        .await
        .map_err(|e| EngineError::Worker(e.to_string()))?;
        let runs = Arc::new(runs);

        let signals: usize = runs.iter().map(|(_, t)| t.len()).sum();
        if signals == 0 {
            warn!(strategy = %request.strategy, "No signals recorded; every candidate will be disqualified");
        }

        let cfg = &request.optimizer;
        let seed = cfg.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        debug!(seed, signals, "GA initialized");

        progress
            .total_generations
            .store(cfg.generations as u32, Ordering::Relaxed);

        let mut population: Vec<Individual> = (0..cfg.population)
            .map(|_| Individual::new(random_params(&request.bounds, &mut rng)))
            .collect();
        let mut generations_run = 0;
        let mut evaluations = 0;

        loop {
            evaluations += evaluate_population(
                &mut population,
                &base,
                &runs,
                cfg.min_trades,
                cfg.parallelism,
            )
            .await;
            rank(&mut population);
            generations_run += 1;

            progress
                .completed_generations
                .store(generations_run as u32, Ordering::Relaxed);
            progress.evaluations.store(evaluations as u32, Ordering::Relaxed);

            let best = &population[0];
            info!(
                generation = generations_run,
                fitness = %format!("{:.4}", best.fitness),
                expectancy = %format!(
                    "{:.3}R",
                    best.stats.as_ref().map(|s| s.expectancy).unwrap_or(0.0)
                ),
                trades = best.stats.as_ref().map(|s| s.total_trades).unwrap_or(0),
                "Generation complete"
            );

            if generations_run >= cfg.generations {
                break;
            }
            if cfg.deadline.is_some_and(|d| started.elapsed() >= d) {
                warn!(generations_run, "Optimizer deadline reached");
                break;
            }
            if progress.cancelled.load(Ordering::Relaxed) {
                warn!(generations_run, "Optimization cancelled");
                break;
            }

            population = evolve(&population, &request.bounds, cfg, &mut rng);
        }

        let best = population.swap_remove(0);
        let best_stats = best.stats.unwrap_or_default();
        let new_expectancy = best_stats.expectancy;
        let outcome = OptimizeOutcome {
            strategy: request.strategy.clone(),
            params_hash: params_hash(&request.strategy, &best.params),
            best_params: best.params,
            fitness: best.fitness,
            baseline_expectancy: request.baseline_expectancy,
            new_expectancy,
            improvement_pct: improvement_pct(request.baseline_expectancy, new_expectancy),
            best_stats,
            generations_run,
            evaluations,
        };

        info!(
            strategy = %outcome.strategy,
            expectancy = %format!("{:.3}R", outcome.new_expectancy),
            baseline = ?outcome.baseline_expectancy,
            improvement_pct = ?outcome.improvement_pct,
            evaluations,
            "Optimization complete"
        );
        Ok(outcome)
    }
}

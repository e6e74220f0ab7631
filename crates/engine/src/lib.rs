//! Replay Lab Engine: event-driven backtesting and parameter optimization
//!
//! Provides:
//! - Indicator library (EMA, SMA, Wilder RSI/ATR, VWAP, Bollinger Bands)
//! - Multi-timeframe data loader with an owned TTL cache
//! - Lookahead-free feature snapshots and pluggable detectors
//! - Bar-by-bar trade simulation with stop/target/max-hold/trailing management
//! - Genetic-algorithm optimizer over strategy risk parameters
//! - Binance public API client as a fallback bar provider

pub mod api;
pub mod detectors;
pub mod engine;
pub mod error;
pub mod features;
pub mod indicators;
pub mod loader;
pub mod optimizer;
pub mod stats;
pub mod types;

// Re-exports for convenience
pub use api::BinanceClient;
pub use detectors::{Detection, Detector, DetectorRegistry};
pub use engine::{
    required_timeframes, BacktestConfig, BacktestEngine, BacktestReport, SignalTape,
    SlippageModel, StrategyParams,
};
pub use error::{EngineError, EngineResult};
pub use features::{FeatureBuilder, FeatureSnapshot, HigherTimeframe, SessionConfig};
pub use loader::{BarCache, BarSource, CacheConfig, DataLoader, FlowSource, StoreSource, SymbolData};
pub use optimizer::{
    OptimizeOutcome, OptimizeProgress, OptimizeRequest, OptimizerConfig, ParamBounds,
    StrategyOptimizer,
};
pub use stats::BacktestStats;
pub use types::*;

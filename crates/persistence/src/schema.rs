//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices/amounts stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Historical OHLCV bars (primary store)
CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume TEXT NOT NULL,
    bid TEXT,
    ask TEXT,
    PRIMARY KEY (symbol, timeframe, timestamp)
);

-- Discrete order-flow prints (sweeps, blocks)
CREATE TABLE IF NOT EXISTS flow_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    kind TEXT NOT NULL,
    side TEXT NOT NULL,
    premium TEXT NOT NULL DEFAULT '0',
    size TEXT NOT NULL DEFAULT '0'
);

-- Expectancy recorded for a strategy's live parameters
CREATE TABLE IF NOT EXISTS strategy_baselines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy TEXT NOT NULL,
    expectancy TEXT NOT NULL,
    total_trades INTEGER NOT NULL DEFAULT 0,
    win_rate TEXT NOT NULL DEFAULT '0',
    profit_factor TEXT NOT NULL DEFAULT '0',
    recorded_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Optimizer output awaiting human approval
CREATE TABLE IF NOT EXISTS pending_parameters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    params_hash TEXT NOT NULL UNIQUE,
    strategy TEXT NOT NULL,
    params TEXT NOT NULL,
    baseline_expectancy TEXT,
    new_expectancy TEXT NOT NULL,
    improvement_pct TEXT,
    stats TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_flow_symbol_time ON flow_events(symbol, timestamp);
CREATE INDEX IF NOT EXISTS idx_baseline_strategy ON strategy_baselines(strategy, recorded_at DESC);
CREATE INDEX IF NOT EXISTS idx_pending_strategy ON pending_parameters(strategy, status)
"#;

/// Column additions applied after table creation.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE bars ADD COLUMN source TEXT",
    "ALTER TABLE pending_parameters ADD COLUMN generations_run INTEGER",
];

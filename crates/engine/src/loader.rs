//! Multi-timeframe data loader
//!
//! Bars come from a primary store with a REST fallback, pass through an
//! explicitly owned TTL cache keyed by (symbol, timeframe), and are handed to
//! the engine as one [`SymbolData`] per symbol. Provider failures never abort
//! a batch: the affected timeframe simply comes back empty.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use persistence::repository::{BarRecord, BarRepository, FlowEventRecord, FlowRepository};
use persistence::{parse_decimal, SqlitePool};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::{normalize_bars, Bar, FlowEvent, FlowKind, FlowSide, Quote, Timeframe};

// ============================================================================
// Provider traits
// ============================================================================

/// Anything that can produce ordered bars for a (symbol, timeframe, range)
#[async_trait]
pub trait BarSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<Bar>>;
}

/// Source of discrete order-flow events
#[async_trait]
pub trait FlowSource: Send + Sync {
    async fn fetch_flow(&self, symbol: &str, start: i64, end: i64) -> Result<Vec<FlowEvent>>;
}

// ============================================================================
// Primary store adapter
// ============================================================================

/// The SQLite bar/flow store as a provider
#[derive(Clone)]
pub struct StoreSource {
    pool: SqlitePool,
}

impl StoreSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write bars into the store, replacing any rows with the same key
    pub async fn store_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[Bar],
        source: &str,
    ) -> Result<u64> {
        let records: Vec<BarRecord> = bars
            .iter()
            .map(|bar| bar_to_record(symbol, timeframe, bar, source))
            .collect();
        Ok(BarRepository::new(&self.pool).insert_bars(&records).await?)
    }
}

fn decimal_text(value: f64) -> String {
    Decimal::from_f64(value)
        .map(|d| d.normalize().to_string())
        .unwrap_or_else(|| value.to_string())
}

fn bar_to_record(symbol: &str, timeframe: Timeframe, bar: &Bar, source: &str) -> BarRecord {
    BarRecord {
        symbol: symbol.to_string(),
        timeframe: timeframe.as_str().to_string(),
        timestamp: bar.timestamp,
        open: decimal_text(bar.open),
        high: decimal_text(bar.high),
        low: decimal_text(bar.low),
        close: decimal_text(bar.close),
        volume: decimal_text(bar.volume),
        bid: bar.quote.map(|q| decimal_text(q.bid)),
        ask: bar.quote.map(|q| decimal_text(q.ask)),
        source: Some(source.to_string()),
    }
}

fn price(raw: &str) -> Result<f64> {
    parse_decimal(raw)?
        .to_f64()
        .ok_or_else(|| anyhow::anyhow!("price out of range: {raw}"))
}

fn record_to_bar(record: &BarRecord) -> Result<Bar> {
    let quote = match (&record.bid, &record.ask) {
        (Some(bid), Some(ask)) => Some(Quote {
            bid: price(bid)?,
            ask: price(ask)?,
        }),
        _ => None,
    };
    Ok(Bar {
        timestamp: record.timestamp,
        open: price(&record.open)?,
        high: price(&record.high)?,
        low: price(&record.low)?,
        close: price(&record.close)?,
        volume: price(&record.volume)?,
        quote,
    })
}

fn record_to_flow(record: &FlowEventRecord) -> Result<FlowEvent> {
    let kind = match record.kind.as_str() {
        "sweep" => FlowKind::Sweep,
        "block" => FlowKind::Block,
        other => anyhow::bail!("unknown flow kind '{other}'"),
    };
    let side = match record.side.as_str() {
        "bullish" => FlowSide::Bullish,
        "bearish" => FlowSide::Bearish,
        other => anyhow::bail!("unknown flow side '{other}'"),
    };
    Ok(FlowEvent {
        symbol: record.symbol.clone(),
        timestamp: record.timestamp,
        kind,
        side,
        premium: price(&record.premium)?,
        size: price(&record.size)?,
    })
}

#[async_trait]
impl BarSource for StoreSource {
    fn name(&self) -> &str {
        "store"
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<Bar>> {
        let records = BarRepository::new(&self.pool)
            .get_bars(symbol, timeframe.as_str(), start, end)
            .await?;
        records.iter().map(record_to_bar).collect()
    }
}

#[async_trait]
impl FlowSource for StoreSource {
    async fn fetch_flow(&self, symbol: &str, start: i64, end: i64) -> Result<Vec<FlowEvent>> {
        let records = FlowRepository::new(&self.pool)
            .get_events(symbol, start, end)
            .await?;
        records.iter().map(record_to_flow).collect()
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds a fetched series stays valid
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

type CacheKey = (String, Timeframe);

struct CachedSeries {
    bars: Arc<Vec<Bar>>,
    fetched_at: Instant,
}

type Slot = Arc<Mutex<Option<CachedSeries>>>;

/// Bar cache shared by every loader in a process.
///
/// Each key has its own async mutex, so concurrent misses on the same
/// (symbol, timeframe) fetch once while other keys proceed independently.
/// Hits do not re-check date-range coverage.
pub struct BarCache {
    ttl: Duration,
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl BarCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, symbol: &str, timeframe: Timeframe) -> Slot {
        let mut slots = self.slots.lock().await;
        slots
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn fresh(&self, entry: &CachedSeries) -> bool {
        entry.fetched_at.elapsed() < self.ttl
    }

    /// Cached series if present and not expired
    pub async fn get(&self, symbol: &str, timeframe: Timeframe) -> Option<Arc<Vec<Bar>>> {
        let slot = self.slot(symbol, timeframe).await;
        let guard = slot.lock().await;
        guard
            .as_ref()
            .filter(|entry| self.fresh(entry))
            .map(|entry| entry.bars.clone())
    }

    /// Return the cached series or run `fetch` while holding the key's lock.
    /// Empty results are returned but not cached so the next call retries.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        fetch: F,
    ) -> Arc<Vec<Bar>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Vec<Bar>>,
    {
        let slot = self.slot(symbol, timeframe).await;
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref().filter(|entry| self.fresh(entry)) {
            debug!(symbol, timeframe = %timeframe, bars = entry.bars.len(), "Cache hit");
            return entry.bars.clone();
        }

        debug!(symbol, timeframe = %timeframe, "Cache miss");
        let bars = Arc::new(fetch().await);
        if !bars.is_empty() {
            *guard = Some(CachedSeries {
                bars: bars.clone(),
                fetched_at: Instant::now(),
            });
        }
        bars
    }

    /// Drop every entry for `symbol`
    pub async fn invalidate(&self, symbol: &str) {
        self.slots.lock().await.retain(|(s, _), _| s != symbol);
    }

    pub async fn clear(&self) {
        self.slots.lock().await.clear();
    }

    /// Number of populated, unexpired entries
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.as_ref().is_some_and(|e| self.fresh(e)) {
                count += 1;
            }
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ============================================================================
// Loaded data
// ============================================================================

/// Everything the engine needs for one symbol
#[derive(Debug, Clone)]
pub struct SymbolData {
    pub symbol: String,
    /// Finest loaded timeframe; the simulation clock
    pub base: Timeframe,
    pub series: BTreeMap<Timeframe, Arc<Vec<Bar>>>,
    pub flow: Arc<Vec<FlowEvent>>,
}

impl SymbolData {
    pub fn new(symbol: impl Into<String>, series: BTreeMap<Timeframe, Vec<Bar>>) -> Self {
        let base = series.keys().next().copied().unwrap_or(Timeframe::M1);
        Self {
            symbol: symbol.into(),
            base,
            series: series
                .into_iter()
                .map(|(tf, bars)| (tf, Arc::new(bars)))
                .collect(),
            flow: Arc::new(Vec::new()),
        }
    }

    pub fn with_flow(mut self, flow: Vec<FlowEvent>) -> Self {
        self.flow = Arc::new(flow);
        self
    }

    pub fn bars(&self, timeframe: Timeframe) -> &[Bar] {
        self.series.get(&timeframe).map(|b| b.as_slice()).unwrap_or(&[])
    }

    pub fn base_bars(&self) -> &[Bar] {
        self.bars(self.base)
    }

    /// Loaded timeframes coarser than the base clock
    pub fn higher_timeframes(&self) -> impl Iterator<Item = (Timeframe, &[Bar])> {
        self.series
            .iter()
            .filter(move |(tf, _)| **tf > self.base)
            .map(|(tf, bars)| (*tf, bars.as_slice()))
    }

    /// More base bars than the warm-up consumes
    pub fn is_sufficient(&self, warmup: usize) -> bool {
        self.base_bars().len() > warmup
    }
}

// ============================================================================
// Loader
// ============================================================================

pub struct DataLoader {
    primary: Option<Arc<dyn BarSource>>,
    secondary: Option<Arc<dyn BarSource>>,
    flow: Option<Arc<dyn FlowSource>>,
    cache: Arc<BarCache>,
}

impl DataLoader {
    pub fn new(cache: Arc<BarCache>) -> Self {
        Self {
            primary: None,
            secondary: None,
            flow: None,
            cache,
        }
    }

    pub fn with_primary(mut self, source: Arc<dyn BarSource>) -> Self {
        self.primary = Some(source);
        self
    }

    pub fn with_secondary(mut self, source: Arc<dyn BarSource>) -> Self {
        self.secondary = Some(source);
        self
    }

    pub fn with_flow(mut self, source: Arc<dyn FlowSource>) -> Self {
        self.flow = Some(source);
        self
    }

    pub fn cache(&self) -> &Arc<BarCache> {
        &self.cache
    }

    async fn fetch_from(
        source: &dyn BarSource,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Vec<Bar> {
        match source.fetch_bars(symbol, timeframe, start, end).await {
            Ok(bars) => {
                let bars = normalize_bars(bars);
                if bars.is_empty() {
                    debug!(source = source.name(), symbol, timeframe = %timeframe, "No coverage");
                }
                bars
            }
            Err(e) => {
                warn!(
                    source = source.name(),
                    symbol,
                    timeframe = %timeframe,
                    error = %e,
                    "Bar fetch failed"
                );
                Vec::new()
            }
        }
    }

    /// Primary first; the secondary only when the primary has nothing.
    async fn fetch_uncached(&self, symbol: &str, timeframe: Timeframe, start: i64, end: i64) -> Vec<Bar> {
        if let Some(primary) = &self.primary {
            let bars = Self::fetch_from(primary.as_ref(), symbol, timeframe, start, end).await;
            if !bars.is_empty() {
                return bars;
            }
        }
        if let Some(secondary) = &self.secondary {
            let bars = Self::fetch_from(secondary.as_ref(), symbol, timeframe, start, end).await;
            if !bars.is_empty() {
                info!(symbol, timeframe = %timeframe, bars = bars.len(), "Loaded from fallback provider");
            }
            return bars;
        }
        Vec::new()
    }

    /// One timeframe through the cache
    pub async fn load_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Arc<Vec<Bar>> {
        self.cache
            .get_or_fetch(symbol, timeframe, || {
                self.fetch_uncached(symbol, timeframe, start, end)
            })
            .await
    }

    /// Discrete flow events for a symbol. Not cached, not filtered; errors yield empty.
    pub async fn flow_events(&self, symbol: &str, start: i64, end: i64) -> Vec<FlowEvent> {
        let Some(source) = &self.flow else {
            return Vec::new();
        };
        match source.fetch_flow(symbol, start, end).await {
            Ok(mut events) => {
                events.sort_by_key(|e| e.timestamp);
                events
            }
            Err(e) => {
                warn!(symbol, error = %e, "Flow fetch failed");
                Vec::new()
            }
        }
    }

    /// All requested timeframes for one symbol, fetched concurrently.
    pub async fn load(
        &self,
        symbol: &str,
        start: i64,
        end: i64,
        timeframes: &[Timeframe],
    ) -> SymbolData {
        let mut wanted: Vec<Timeframe> = timeframes.to_vec();
        wanted.sort();
        wanted.dedup();

        let fetches = wanted
            .iter()
            .map(|&tf| async move { (tf, self.load_series(symbol, tf, start, end).await) });
        let (loaded, flow) = tokio::join!(join_all(fetches), self.flow_events(symbol, start, end));

        let base = wanted.first().copied().unwrap_or(Timeframe::M1);
        let series: BTreeMap<Timeframe, Arc<Vec<Bar>>> = loaded.into_iter().collect();

        debug!(
            symbol,
            base = %base,
            base_bars = series.get(&base).map(|b| b.len()).unwrap_or(0),
            flow_events = flow.len(),
            "Symbol loaded"
        );

        SymbolData {
            symbol: symbol.to_string(),
            base,
            series,
            flow: Arc::new(flow),
        }
    }

    /// Several symbols with bounded fan-out; output keeps the input order.
    pub async fn load_many(
        &self,
        symbols: &[String],
        start: i64,
        end: i64,
        timeframes: &[Timeframe],
        concurrency: usize,
    ) -> Vec<SymbolData> {
        let mut loaded: Vec<(usize, SymbolData)> = stream::iter(0..symbols.len())
            .map(|i| {
                let symbol = &symbols[i];
                async move { (i, self.load(symbol, start, end, timeframes).await) }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        loaded.sort_by_key(|(i, _)| *i);
        loaded.into_iter().map(|(_, data)| data).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        name: &'static str,
        calls: AtomicUsize,
        fail: bool,
        bars: Vec<Bar>,
    }

    impl FakeSource {
        fn new(name: &'static str, bars: Vec<Bar>, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail,
                bars,
            })
        }
    }

    #[async_trait]
    impl BarSource for FakeSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch_bars(&self, _: &str, _: Timeframe, _: i64, _: i64) -> Result<Vec<Bar>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("provider down");
            }
            Ok(self.bars.clone())
        }
    }

    fn bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar::new(i as i64 * 60_000, 10.0, 11.0, 9.0, 10.0, 5.0))
            .collect()
    }

    fn loader(primary: Arc<FakeSource>, secondary: Arc<FakeSource>) -> DataLoader {
        DataLoader::new(Arc::new(BarCache::new(&CacheConfig::default())))
            .with_primary(primary)
            .with_secondary(secondary)
    }

    #[tokio::test]
    async fn test_cache_hit_skips_refetch() {
        let primary = FakeSource::new("primary", bars(5), false);
        let secondary = FakeSource::new("secondary", bars(3), false);
        let loader = loader(primary.clone(), secondary.clone());

        let first = loader.load_series("SPY", Timeframe::M1, 0, 1).await;
        // different range, same key: still a hit
        let second = loader.load_series("SPY", Timeframe::M1, 0, 999_999).await;

        assert_eq!(first.len(), 5);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_secondary_on_failure() {
        let primary = FakeSource::new("primary", Vec::new(), true);
        let secondary = FakeSource::new("secondary", bars(3), false);
        let loader = loader(primary, secondary.clone());

        let series = loader.load_series("SPY", Timeframe::M5, 0, 1).await;
        assert_eq!(series.len(), 3);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_both_providers_failing_yields_empty_and_is_not_cached() {
        let primary = FakeSource::new("primary", Vec::new(), true);
        let secondary = FakeSource::new("secondary", Vec::new(), true);
        let loader = loader(primary.clone(), secondary);

        assert!(loader.load_series("SPY", Timeframe::M1, 0, 1).await.is_empty());
        assert!(loader.load_series("SPY", Timeframe::M1, 0, 1).await.is_empty());
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
        assert!(loader.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_load_builds_symbol_data_with_finest_base() {
        let primary = FakeSource::new("primary", bars(10), false);
        let secondary = FakeSource::new("secondary", Vec::new(), false);
        let loader = loader(primary, secondary);

        let data = loader
            .load("SPY", 0, 1, &[Timeframe::H1, Timeframe::M1, Timeframe::M5])
            .await;
        assert_eq!(data.base, Timeframe::M1);
        assert_eq!(data.series.len(), 3);
        assert_eq!(data.higher_timeframes().count(), 2);
        assert!(data.is_sufficient(9));
        assert!(!data.is_sufficient(10));
    }

    #[tokio::test]
    async fn test_cache_clear_invalidate_and_ttl() {
        let cache = BarCache::new(&CacheConfig::default());
        cache.get_or_fetch("SPY", Timeframe::M1, || async { bars(2) }).await;
        cache.get_or_fetch("QQQ", Timeframe::M1, || async { bars(2) }).await;
        assert_eq!(cache.len().await, 2);

        cache.invalidate("SPY").await;
        assert!(cache.get("SPY", Timeframe::M1).await.is_none());
        assert!(cache.get("QQQ", Timeframe::M1).await.is_some());

        cache.clear().await;
        assert!(cache.is_empty().await);

        let expired = BarCache::new(&CacheConfig { ttl_secs: 0 });
        expired.get_or_fetch("SPY", Timeframe::M1, || async { bars(2) }).await;
        assert!(expired.get("SPY", Timeframe::M1).await.is_none());
    }

    #[tokio::test]
    async fn test_load_many_keeps_order() {
        let primary = FakeSource::new("primary", bars(4), false);
        let secondary = FakeSource::new("secondary", Vec::new(), false);
        let loader = loader(primary, secondary);
        let symbols: Vec<String> = ["C", "A", "B"].iter().map(|s| s.to_string()).collect();

        let data = loader.load_many(&symbols, 0, 1, &[Timeframe::M1], 2).await;
        let names: Vec<&str> = data.iter().map(|d| d.symbol.as_str()).collect();
        assert_eq!(names, vec!["C", "A", "B"]);
    }

    #[tokio::test]
    async fn test_store_bars_round_trips_through_text() {
        let db = Database::in_memory().await.unwrap();
        let store = StoreSource::new(db.pool_clone());
        let mut bar = Bar::new(60_000, 101.25, 101.5, 100.75, 101.0, 2_500.0);
        bar.quote = Some(Quote { bid: 100.875, ask: 101.125 });

        assert_eq!(store.store_bars("SPY", Timeframe::M5, &[bar], "rest").await.unwrap(), 1);
        let loaded = store.fetch_bars("SPY", Timeframe::M5, 0, 120_000).await.unwrap();
        assert_eq!(loaded, vec![bar]);
    }

    #[tokio::test]
    async fn test_store_source_reads_primary_store() {
        let db = Database::in_memory().await.unwrap();
        let records: Vec<BarRecord> = (0..3)
            .map(|i| BarRecord {
                symbol: "SPY".to_string(),
                timeframe: "1m".to_string(),
                timestamp: i * 60_000,
                open: "100.10".to_string(),
                high: "100.50".to_string(),
                low: "99.90".to_string(),
                close: "100.20".to_string(),
                volume: "1500".to_string(),
                bid: Some("100.19".to_string()),
                ask: Some("100.21".to_string()),
                source: None,
            })
            .collect();
        BarRepository::new(db.pool()).insert_bars(&records).await.unwrap();
        FlowRepository::new(db.pool())
            .insert_events(&[FlowEventRecord {
                id: None,
                symbol: "SPY".to_string(),
                timestamp: 60_000,
                kind: "sweep".to_string(),
                side: "bearish".to_string(),
                premium: "50000".to_string(),
                size: "20".to_string(),
            }])
            .await
            .unwrap();

        let store = Arc::new(StoreSource::new(db.pool_clone()));
        let loader = DataLoader::new(Arc::new(BarCache::new(&CacheConfig::default())))
            .with_primary(store.clone())
            .with_flow(store);

        let data = loader.load("SPY", 0, 180_000, &[Timeframe::M1]).await;
        let base = data.base_bars();
        assert_eq!(base.len(), 3);
        assert_eq!(base[0].close, 100.2);
        let half = base[0].quote.unwrap().half_spread().unwrap();
        assert!((half - 0.01).abs() < 1e-9);
        assert_eq!(data.flow.len(), 1);
        assert_eq!(data.flow[0].side, FlowSide::Bearish);
    }
}

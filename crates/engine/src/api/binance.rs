//! Binance-compatible public kline endpoint, used as the secondary bar provider

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::loader::BarSource;
use crate::types::{Bar, Timeframe};

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: u32 = 1000;
const PAGE_PAUSE_MS: u64 = 100;

/// Public market data client (no authentication required)
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

/// Raw kline data from the API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

fn decimal_f64(raw: &str) -> Option<f64> {
    Decimal::from_str(raw).ok()?.to_f64()
}

fn parse_klines(raw: Vec<RawKline>) -> Vec<Bar> {
    raw.into_iter()
        .filter_map(|k| {
            Some(Bar::new(
                k.0,
                decimal_f64(&k.1)?,
                decimal_f64(&k.2)?,
                decimal_f64(&k.3)?,
                decimal_f64(&k.4)?,
                decimal_f64(&k.5)?,
            ))
        })
        .collect()
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Falls back to reqwest defaults, which carry no timeout, when the builder fails
fn build_client(builder: ClientBuilder) -> Client {
    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "HTTP client build failed, using defaults without timeout");
        Client::new()
    })
}

impl BinanceClient {
    /// Create a new client with the default base URL
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = build_client(Client::builder().timeout(Duration::from_secs(30)));
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch one page of klines
    pub async fn get_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<Bar>> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}",
            self.base_url,
            symbol,
            timeframe.as_str()
        );

        if let Some(start) = start_time {
            url.push_str(&format!("&startTime={}", start));
        }
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={}", end));
        }

        let limit = limit.unwrap_or(500).min(MAX_KLINES_PER_REQUEST);
        url.push_str(&format!("&limit={}", limit));

        debug!(symbol, interval = %timeframe, "Fetching klines");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("kline API error {}: {}", status, body);
        }

        let raw: Vec<RawKline> = response.json().await?;
        let bars = parse_klines(raw);

        debug!(count = bars.len(), "Fetched klines");
        Ok(bars)
    }

    /// Fetch klines with automatic pagination for ranges > 1000 bars
    pub async fn get_klines_paginated(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<Bar>> {
        let mut all = Vec::new();
        let mut current_start = start_time;

        info!(symbol, interval = %timeframe, "Fetching paginated klines");

        while current_start < end_time {
            let page = self
                .get_klines(
                    symbol,
                    timeframe,
                    Some(current_start),
                    Some(end_time),
                    Some(MAX_KLINES_PER_REQUEST),
                )
                .await?;

            let Some(last_open) = page.last().map(|b| b.timestamp) else {
                break;
            };
            all.extend(page);

            // Move start past the last candle
            current_start = last_open + timeframe.millis();

            tokio::time::sleep(Duration::from_millis(PAGE_PAUSE_MS)).await;
        }

        info!(total = all.len(), "Paginated kline fetch complete");
        Ok(all)
    }
}

#[async_trait]
impl BarSource for BinanceClient {
    fn name(&self) -> &str {
        "rest"
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<Bar>> {
        self.get_klines_paginated(symbol, timeframe, start, end).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_falls_back_when_builder_fails() {
        let broken = Client::builder().user_agent("bad\nagent");
        let _client = build_client(broken);

        let client = BinanceClient::with_base_url("http://localhost:9/");
        assert_eq!(client.base_url, "http://localhost:9");
    }

    #[test]
    fn test_parse_klines_skips_malformed_rows() {
        let json = r#"[
            [0, "100.5", "101.0", "100.0", "100.8", "1234.5", 59999, "0", 10, "0", "0", "0"],
            [60000, "bad", "101.0", "100.0", "100.8", "1.0", 119999, "0", 10, "0", "0", "0"]
        ]"#;
        let raw: Vec<RawKline> = serde_json::from_str(json).unwrap();
        let bars = parse_klines(raw);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].timestamp, 0);
        assert_eq!(bars[0].open, 100.5);
        assert_eq!(bars[0].volume, 1234.5);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = BinanceClient::with_base_url("http://localhost:9000/");
        assert_eq!(client.base_url, "http://localhost:9000");
    }
}

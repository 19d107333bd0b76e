//! Candle snapshot client.
//!
//! Fetches OHLCV history from the upstream info endpoint and normalizes it
//! into [`Kline`] bars. Only the single supported coin is accepted; intervals
//! are validated against the timeframe whitelist upstream of this module. A
//! short-TTL cache keyed by the full request payload absorbs repeated polls.

use crate::models::{Kline, Timeframe};
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(6);

/// Candle row as served upstream: ms timestamps plus string-encoded OHLCV.
#[derive(Debug, Deserialize)]
struct RawCandle {
    t: i64,
    #[serde(rename = "T")]
    t_close: Option<i64>,
    o: serde_json::Value,
    h: serde_json::Value,
    l: serde_json::Value,
    c: serde_json::Value,
    v: serde_json::Value,
    n: Option<i64>,
}

pub struct KlineClient {
    client: Client,
    info_url: String,
    coin: String,
    cache_sec: i64,
    cache: Mutex<HashMap<String, (i64, Vec<Kline>)>>,
}

impl KlineClient {
    pub fn new(info_url: String, coin: String, cache_sec: i64) -> Result<Self> {
        let client = Client::builder()
            .timeout(SNAPSHOT_TIMEOUT)
            .build()
            .context("Failed to build kline http client")?;

        Ok(Self {
            client,
            info_url,
            coin,
            cache_sec,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Reject anything other than the single supported instrument. Accepts
    /// the bare coin ("BTC") and the symbol spelling ("BTCUSDT").
    pub fn validate_coin(&self, requested: &str) -> Result<()> {
        let norm = requested.to_ascii_uppercase();
        if norm == self.coin || norm == format!("{}USDT", self.coin) {
            return Ok(());
        }
        bail!("unsupported symbol: {}", requested);
    }

    /// Fetch up to `limit` candles for `tf` covering `[start_ms, end_ms]`
    /// (open-time bounds, both optional).
    pub async fn fetch(
        &self,
        tf: Timeframe,
        limit: usize,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<Vec<Kline>> {
        let interval_ms = tf.interval_ms();
        let end = end_ms.unwrap_or(now_ms);
        let start = start_ms.unwrap_or_else(|| end - (limit as i64) * interval_ms);

        let body = json!({
            "type": "candleSnapshot",
            "req": {
                "coin": self.coin,
                "interval": tf.as_str(),
                "startTime": start,
                "endTime": end,
            }
        });
        let cache_key = format!("{}|{}", self.info_url, body);

        if let Some(hit) = self.cache_get(&cache_key, now_ms) {
            return Ok(hit);
        }

        let resp = self
            .client
            .post(&self.info_url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("candle snapshot request failed ({})", tf.as_str()))?;

        if !resp.status().is_success() {
            bail!("candle snapshot upstream status {}", resp.status());
        }

        let raw: Vec<RawCandle> = resp
            .json()
            .await
            .context("candle snapshot decode failed")?;

        let mut bars = raw
            .into_iter()
            .map(|r| normalize(r, interval_ms))
            .collect::<Result<Vec<_>>>()?;
        bars.sort_by_key(|b| b.open_time);
        if bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }

        debug!(
            interval = tf.as_str(),
            bars = bars.len(),
            "candle snapshot fetched"
        );

        self.cache_put(cache_key, now_ms, bars.clone());
        Ok(bars)
    }

    /// Fetch a trailing window of `count` candles whose final bar closes at
    /// exactly `close_ms` (inclusive close time).
    pub async fn fetch_window_ending(
        &self,
        tf: Timeframe,
        close_ms: i64,
        count: usize,
        now_ms: i64,
    ) -> Result<Vec<Kline>> {
        let interval_ms = tf.interval_ms();
        let last_open = close_ms + 1 - interval_ms;
        let first_open = last_open - (count.saturating_sub(1) as i64) * interval_ms;
        self.fetch(tf, count, Some(first_open), Some(last_open), now_ms)
            .await
    }

    /// Fetch the single candle with exactly this inclusive close time, if the
    /// upstream has it.
    pub async fn fetch_candle_closing_at(
        &self,
        tf: Timeframe,
        close_ms: i64,
        now_ms: i64,
    ) -> Result<Option<Kline>> {
        let bars = self.fetch_window_ending(tf, close_ms, 1, now_ms).await?;
        Ok(bars.into_iter().find(|b| b.close_time == close_ms))
    }

    fn cache_get(&self, key: &str, now_ms: i64) -> Option<Vec<Kline>> {
        let cache = self.cache.lock();
        let (fetched_at, bars) = cache.get(key)?;
        if now_ms - fetched_at <= self.cache_sec * 1000 {
            Some(bars.clone())
        } else {
            None
        }
    }

    fn cache_put(&self, key: String, now_ms: i64, bars: Vec<Kline>) {
        let mut cache = self.cache.lock();
        // Drop expired entries opportunistically so the map stays small.
        cache.retain(|_, (fetched_at, _)| now_ms - *fetched_at <= self.cache_sec * 1000);
        cache.insert(key, (now_ms, bars));
    }
}

fn normalize(raw: RawCandle, interval_ms: i64) -> Result<Kline> {
    Ok(Kline {
        open_time: raw.t,
        close_time: raw.t_close.unwrap_or(raw.t + interval_ms),
        open: num(&raw.o, "o")?,
        high: num(&raw.h, "h")?,
        low: num(&raw.l, "l")?,
        close: num(&raw.c, "c")?,
        volume: num(&raw.v, "v")?,
        trades_count: raw.n,
    })
}

/// Upstream encodes prices as JSON strings; tolerate plain numbers too.
fn num(v: &serde_json::Value, field: &str) -> Result<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        .filter(|f| f.is_finite())
        .ok_or_else(|| anyhow!("candle field {} is not numeric: {}", field, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(t: i64, t_close: Option<i64>) -> RawCandle {
        RawCandle {
            t,
            t_close,
            o: json!("100.5"),
            h: json!("101.0"),
            l: json!(99.5),
            c: json!("100.8"),
            v: json!("12.5"),
            n: Some(42),
        }
    }

    #[test]
    fn test_normalize_string_and_numeric_fields() {
        let bar = normalize(raw(60_000, Some(119_999)), 60_000).unwrap();
        assert_eq!(bar.open_time, 60_000);
        assert_eq!(bar.close_time, 119_999);
        assert_eq!(bar.open, 100.5);
        assert_eq!(bar.low, 99.5);
        assert_eq!(bar.trades_count, Some(42));
    }

    #[test]
    fn test_normalize_synthesizes_close_time() {
        let bar = normalize(raw(60_000, None), 60_000).unwrap();
        assert_eq!(bar.close_time, 120_000);
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        let mut r = raw(0, None);
        r.c = json!("not-a-price");
        assert!(normalize(r, 60_000).is_err());
    }

    #[test]
    fn test_validate_coin() {
        let client = KlineClient::new("http://localhost".into(), "BTC".into(), 15).unwrap();
        assert!(client.validate_coin("BTC").is_ok());
        assert!(client.validate_coin("btc").is_ok());
        assert!(client.validate_coin("BTCUSDT").is_ok());
        assert!(client.validate_coin("ETH").is_err());
        assert!(client.validate_coin("ETHUSDT").is_err());
    }

    #[test]
    fn test_cache_round_trip_and_expiry() {
        let client = KlineClient::new("http://localhost".into(), "BTC".into(), 15).unwrap();
        let bars = vec![normalize(raw(0, None), 60_000).unwrap()];
        client.cache_put("k".into(), 1_000, bars.clone());
        assert_eq!(client.cache_get("k", 10_000), Some(bars));
        assert_eq!(client.cache_get("k", 17_000), None);
    }
}

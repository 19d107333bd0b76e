//! Public endpoints: health, summary polling, forced advance, kline proxy,
//! reason stats, and feed diagnostics.

use super::error::ApiError;
use super::routes::AppState;
use crate::models::Timeframe;
use crate::stats;
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "time": now_ms() }))
}

pub async fn summary(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let summary = state.rounds.build_summary(now_ms())?;
    Ok(Json(serde_json::to_value(summary).map_err(|e| {
        ApiError::Internal(anyhow::Error::new(e))
    })?))
}

/// Force one advancer tick. Idempotent between deadlines.
pub async fn advance(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = state.advancer.tick(now_ms()).await?;
    Ok(Json(json!({ "ok": true, "report": report })))
}

#[derive(Debug, Deserialize)]
pub struct KlineQuery {
    pub symbol: Option<String>,
    pub coin: Option<String>,
    pub intervals: Option<String>,
    pub limit: Option<usize>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub raw: Option<String>,
}

/// Candle proxy. Per-interval failures land in the `errors` map and never
/// discard the intervals that did resolve.
pub async fn klines(
    State(state): State<AppState>,
    Query(q): Query<KlineQuery>,
) -> Result<Json<Value>, ApiError> {
    let coin = q
        .coin
        .or(q.symbol)
        .unwrap_or_else(|| state.cfg.coin.clone());
    state
        .klines
        .validate_coin(&coin)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let limit = q
        .limit
        .unwrap_or(state.cfg.kline_default_limit)
        .min(state.cfg.kline_max_limit);

    let requested: Vec<String> = match &q.intervals {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => state
            .cfg
            .kline_default_intervals
            .iter()
            .map(|tf| tf.as_str().to_string())
            .collect(),
    };
    if requested.is_empty() {
        return Err(ApiError::Validation("no intervals requested".into()));
    }

    let now = now_ms();
    let mut bars_by_interval = BTreeMap::new();
    let mut errors = BTreeMap::new();

    for name in requested {
        let Some(tf) = Timeframe::from_str(&name) else {
            errors.insert(name, "unsupported interval".to_string());
            continue;
        };
        match state
            .klines
            .fetch(tf, limit, q.start_time, q.end_time, now)
            .await
        {
            Ok(bars) => {
                bars_by_interval.insert(name, bars);
            }
            Err(e) => {
                errors.insert(name, format!("{:#}", e));
            }
        }
    }

    let raw = matches!(q.raw.as_deref(), Some("1") | Some("true"));
    if raw {
        return Ok(Json(serde_json::to_value(bars_by_interval).map_err(
            |e| ApiError::Internal(anyhow::Error::new(e)),
        )?));
    }

    Ok(Json(json!({
        "ok": errors.is_empty(),
        "symbol": format!("{}USDT", state.cfg.coin),
        "intervals": bars_by_interval,
        "errors": errors,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

pub async fn reason_stats(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    let stats = stats::reason_stats(&state.store, q.since, q.until, q.limit, None, now_ms())?;
    Ok(Json(json!({ "ok": true, "stats": stats })))
}

pub async fn agent_reason_stats(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_agent(&agent_id)?.is_none() {
        return Err(ApiError::NotFound(format!("unknown agent: {}", agent_id)));
    }
    let stats = stats::reason_stats(
        &state.store,
        q.since,
        q.until,
        q.limit,
        Some(&agent_id),
        now_ms(),
    )?;
    Ok(Json(json!({ "ok": true, "agent_id": agent_id, "stats": stats })))
}

/// Feed diagnostics; the snapshot is also persisted for post-mortems.
pub async fn feed_diagnostics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let diag = state.feed.diag();
    let diag_json =
        serde_json::to_string(&diag).map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;
    state.store.save_feed_diag(&diag_json)?;
    Ok(Json(json!({ "ok": true, "diag": diag })))
}

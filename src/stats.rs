//! Aggregate accuracy statistics over evaluated reason rules.

use crate::db::Store;
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_LIMIT: usize = 5_000;
pub const MAX_LIMIT: usize = 20_000;
pub const DEFAULT_WINDOW_MS: i64 = 30 * 24 * 3_600_000;

#[derive(Debug, Default, Serialize)]
pub struct BucketStats {
    pub total: i64,
    pub valid: i64,
    pub correct: i64,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ReasonStats {
    pub since: i64,
    pub until: i64,
    pub total_evaluated: i64,
    pub total_valid: i64,
    pub accuracy_all: Option<f64>,
    pub accuracy_valid: Option<f64>,
    pub avg_delta_pct: Option<f64>,
    pub avg_abs_delta_pct: Option<f64>,
    pub by_timeframe: BTreeMap<String, BucketStats>,
    pub by_pattern: BTreeMap<String, BucketStats>,
}

/// Compute stats over `[since, until]` (defaults: last 30 days ending now),
/// bounded by the row cap. `agent_id` scopes to one agent.
pub fn reason_stats(
    store: &Store,
    since: Option<i64>,
    until: Option<i64>,
    limit: Option<usize>,
    agent_id: Option<&str>,
    now_ms: i64,
) -> Result<ReasonStats> {
    let until = until.unwrap_or(now_ms);
    let since = since.unwrap_or(until - DEFAULT_WINDOW_MS);
    let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let rows = store.reason_rows(since, until, limit, agent_id)?;

    let mut stats = ReasonStats {
        since,
        until,
        total_evaluated: 0,
        total_valid: 0,
        accuracy_all: None,
        accuracy_valid: None,
        avg_delta_pct: None,
        avg_abs_delta_pct: None,
        by_timeframe: BTreeMap::new(),
        by_pattern: BTreeMap::new(),
    };

    let mut correct_all = 0i64;
    let mut correct_valid = 0i64;
    let mut delta_sum = 0.0;
    let mut delta_abs_sum = 0.0;
    let mut delta_count = 0i64;

    for (timeframe, pattern, holds, correct, delta_pct) in &rows {
        stats.total_evaluated += 1;
        let valid = *holds == Some(true);
        if valid {
            stats.total_valid += 1;
            if *correct {
                correct_valid += 1;
            }
        }
        if *correct {
            correct_all += 1;
        }
        if let Some(d) = delta_pct {
            delta_sum += d;
            delta_abs_sum += d.abs();
            delta_count += 1;
        }

        for (key, map) in [
            (timeframe, &mut stats.by_timeframe),
            (pattern, &mut stats.by_pattern),
        ] {
            let bucket = map.entry(key.clone()).or_default();
            bucket.total += 1;
            if valid {
                bucket.valid += 1;
            }
            if *correct {
                bucket.correct += 1;
            }
        }
    }

    if stats.total_evaluated > 0 {
        stats.accuracy_all = Some(correct_all as f64 / stats.total_evaluated as f64);
    }
    if stats.total_valid > 0 {
        stats.accuracy_valid = Some(correct_valid as f64 / stats.total_valid as f64);
    }
    if delta_count > 0 {
        stats.avg_delta_pct = Some(delta_sum / delta_count as f64);
        stats.avg_abs_delta_pct = Some(delta_abs_sum / delta_count as f64);
    }
    for bucket in stats
        .by_timeframe
        .values_mut()
        .chain(stats.by_pattern.values_mut())
    {
        if bucket.total > 0 {
            bucket.accuracy = Some(bucket.correct as f64 / bucket.total as f64);
        }
    }

    Ok(stats)
}

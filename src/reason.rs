//! Reason rule service.
//!
//! Normalizes raw rule submissions against the timeframe/pattern whitelists,
//! aligns analysis end times to inclusive candle closes, evaluates the rule
//! at submit time against fetched history, and later judges it at horizon via
//! the pending sweep. Sweep failures are captured per row and never abort the
//! pass.

use crate::db::Store;
use crate::klines::KlineClient;
use crate::models::{round6, Direction, Judgment, ReasonRule, Timeframe};
use crate::patterns::Pattern;
use anyhow::Result;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub const MAX_HORIZON_BARS: u32 = 200;
pub const DEFAULT_SWEEP_ROWS: usize = 50;

/// Rule as received on the wire, before any validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawReasonRule {
    pub timeframe: Option<String>,
    pub pattern: Option<String>,
    pub direction: Option<String>,
    pub horizon_bars: Option<i64>,
}

/// Failure modes surfaced to the API boundary.
#[derive(Debug)]
pub enum ReasonError {
    Validation(String),
    InsufficientHistory(String),
    Misalignment(String),
    Upstream(String),
}

impl fmt::Display for ReasonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonError::Validation(msg) => write!(f, "invalid reason_rule: {}", msg),
            ReasonError::InsufficientHistory(msg) => write!(f, "insufficient history: {}", msg),
            ReasonError::Misalignment(msg) => write!(f, "misaligned analysis window: {}", msg),
            ReasonError::Upstream(msg) => write!(f, "upstream candle source failed: {}", msg),
        }
    }
}

impl std::error::Error for ReasonError {}

/// Validate and canonicalize a raw rule. `allowed_intervals` and
/// `expected_direction` tighten the check when the rule rides along a
/// judgment submission.
pub fn normalize_rule(
    raw: &RawReasonRule,
    allowed_intervals: Option<&[Timeframe]>,
    expected_direction: Option<Direction>,
) -> Result<ReasonRule, ReasonError> {
    let tf_str = raw
        .timeframe
        .as_deref()
        .ok_or_else(|| ReasonError::Validation("timeframe is required".into()))?;
    let timeframe = Timeframe::from_str(tf_str)
        .ok_or_else(|| ReasonError::Validation(format!("unsupported timeframe: {}", tf_str)))?;
    if let Some(allowed) = allowed_intervals {
        if !allowed.contains(&timeframe) {
            return Err(ReasonError::Validation(format!(
                "timeframe {} not in declared intervals",
                timeframe.as_str()
            )));
        }
    }

    let pattern_id = raw
        .pattern
        .as_deref()
        .ok_or_else(|| ReasonError::Validation("pattern is required".into()))?;
    let pattern = Pattern::from_id(pattern_id)
        .ok_or_else(|| ReasonError::Validation(format!("unknown pattern: {}", pattern_id)))?;

    let dir_str = raw
        .direction
        .as_deref()
        .ok_or_else(|| ReasonError::Validation("direction is required".into()))?;
    let direction = Direction::from_str(dir_str)
        .ok_or_else(|| ReasonError::Validation(format!("invalid direction: {}", dir_str)))?;
    if let Some(expected) = expected_direction {
        if direction != expected {
            return Err(ReasonError::Validation(
                "reason_rule direction must match judgment direction".into(),
            ));
        }
    }

    let horizon = raw
        .horizon_bars
        .ok_or_else(|| ReasonError::Validation("horizon_bars is required".into()))?;
    if !(1..=MAX_HORIZON_BARS as i64).contains(&horizon) {
        return Err(ReasonError::Validation(format!(
            "horizon_bars must be in [1, {}]",
            MAX_HORIZON_BARS
        )));
    }

    Ok(ReasonRule {
        timeframe,
        pattern: pattern.id().to_string(),
        direction,
        horizon_bars: horizon as u32,
    })
}

/// Inclusive close of the last completed candle at or before `end_ms`.
pub fn align_close_ms(end_ms: i64, tf: Timeframe) -> i64 {
    let interval = tf.interval_ms();
    (end_ms / interval) * interval - 1
}

/// Close time of the candle `horizon_bars` intervals past the aligned close.
pub fn target_close_ms(aligned_close_ms: i64, horizon_bars: u32, tf: Timeframe) -> i64 {
    aligned_close_ms + horizon_bars as i64 * tf.interval_ms()
}

/// FLAT below the threshold magnitude, otherwise the sign of the move.
pub fn outcome_for(delta_pct: f64, flat_threshold_pct: f64) -> Direction {
    if delta_pct.abs() < flat_threshold_pct {
        Direction::Flat
    } else if delta_pct > 0.0 {
        Direction::Up
    } else {
        Direction::Down
    }
}

/// Result of the at-submit evaluation, persisted onto the judgment row.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SubmitEvaluation {
    pub t_close_ms: i64,
    pub target_close_ms: i64,
    #[serde(skip)]
    pub base_close: f64,
    pub pattern_holds: bool,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub evaluated: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct ReasonService {
    store: Arc<Store>,
    klines: Arc<KlineClient>,
    flat_threshold_pct: f64,
    sweep_max_rows: usize,
}

impl ReasonService {
    pub fn new(store: Arc<Store>, klines: Arc<KlineClient>, flat_threshold_pct: f64) -> Self {
        Self {
            store,
            klines,
            flat_threshold_pct,
            sweep_max_rows: DEFAULT_SWEEP_ROWS,
        }
    }

    /// Evaluate a normalized rule against history ending at the aligned close
    /// of `analysis_end_ms`.
    pub async fn evaluate_at_submit(
        &self,
        rule: &ReasonRule,
        analysis_end_ms: i64,
        now_ms: i64,
    ) -> Result<SubmitEvaluation, ReasonError> {
        let pattern = Pattern::from_id(&rule.pattern)
            .ok_or_else(|| ReasonError::Validation(format!("unknown pattern: {}", rule.pattern)))?;
        let required = pattern.required_bars();

        let aligned = align_close_ms(analysis_end_ms, rule.timeframe);
        let target = target_close_ms(aligned, rule.horizon_bars, rule.timeframe);

        let bars = self
            .klines
            .fetch_window_ending(rule.timeframe, aligned, required, now_ms)
            .await
            .map_err(|e| ReasonError::Upstream(format!("{:#}", e)))?;

        if bars.len() < required {
            return Err(ReasonError::InsufficientHistory(format!(
                "pattern {} needs {} bars, got {}",
                rule.pattern,
                required,
                bars.len()
            )));
        }

        let aligned_idx = bars
            .iter()
            .rposition(|b| b.close_time == aligned)
            .ok_or_else(|| {
                ReasonError::Misalignment(format!(
                    "no candle closing at {} for {}",
                    aligned,
                    rule.timeframe.as_str()
                ))
            })?;
        let through_aligned = &bars[..=aligned_idx];
        if through_aligned.len() < required {
            return Err(ReasonError::InsufficientHistory(format!(
                "pattern {} needs {} bars ending at the aligned close, got {}",
                rule.pattern,
                required,
                through_aligned.len()
            )));
        }
        let base_close = through_aligned[aligned_idx].close;

        let window = &through_aligned[through_aligned.len() - required..];
        let pattern_holds = pattern.evaluate(window);

        Ok(SubmitEvaluation {
            t_close_ms: aligned,
            target_close_ms: target,
            base_close,
            pattern_holds,
        })
    }

    /// Judge every pending row whose horizon has passed. Rows whose target
    /// candle is not yet available are skipped and retried next sweep; other
    /// failures are recorded on the row.
    pub async fn sweep_pending(&self, now_ms: i64) -> Result<SweepReport> {
        let rows = self.store.pending_reason_rows(now_ms, self.sweep_max_rows)?;
        let mut report = SweepReport {
            scanned: rows.len(),
            ..Default::default()
        };

        for judgment in rows {
            match self.evaluate_at_horizon(&judgment, now_ms).await {
                Ok(true) => report.evaluated += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    let msg = format!("{:#}", e);
                    warn!(
                        round = %judgment.round_id,
                        agent = %judgment.agent_id,
                        error = %msg,
                        "reason evaluation failed"
                    );
                    if let Err(store_err) = self.store.set_reason_eval_error(
                        &judgment.round_id,
                        &judgment.agent_id,
                        &msg,
                    ) {
                        warn!("failed to record reason eval error: {:#}", store_err);
                    }
                }
            }
        }

        if report.scanned > 0 {
            debug!(?report, "reason sweep complete");
        }
        Ok(report)
    }

    async fn evaluate_at_horizon(&self, judgment: &Judgment, now_ms: i64) -> Result<bool> {
        let target_ms = judgment
            .reason_target_close_ms
            .ok_or_else(|| anyhow::anyhow!("judgment has no target close"))?;
        let base_close = judgment
            .reason_base_close
            .ok_or_else(|| anyhow::anyhow!("judgment has no base close"))?;
        if base_close <= 0.0 {
            anyhow::bail!("invalid base close: {}", base_close);
        }

        let Some(candle) = self
            .klines
            .fetch_candle_closing_at(judgment.reason_rule.timeframe, target_ms, now_ms)
            .await?
        else {
            return Ok(false);
        };

        let delta_pct = round6((candle.close - base_close) / base_close * 100.0);
        let outcome = outcome_for(delta_pct, self.flat_threshold_pct);
        let correct = judgment.reason_rule.direction == outcome;

        self.store.apply_reason_outcome(
            &judgment.round_id,
            &judgment.agent_id,
            candle.close,
            delta_pct,
            outcome,
            correct,
            now_ms,
        )?;
        Ok(true)
    }
}

//! Round lifecycle service.
//!
//! Owns every round transition (start, lock, cancel, settle), the canonical
//! scoring rule, flip card construction, the judgment submit flow, and the
//! polled summary snapshot. Settlement is applied through one atomic store
//! batch so partial results are never visible.

use crate::db::{SettlementBatch, Store};
use crate::models::{
    round1, round2, round_id_for, Agent, CardResult, Config, Direction, FlipCard, Judgment,
    MetaState, ReasonRule, Round, RoundStatus, ScoreEvent, Timeframe, Verdict,
};
use crate::reason::{
    normalize_rule, outcome_for, RawReasonRule, ReasonError, ReasonService, SubmitEvaluation,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

pub const SYMBOL: &str = "BTCUSDT";
pub const MAX_COMMENT_LEN: usize = 140;
pub const FEED_PAGE: usize = 30;
pub const HIGH_CONFIDENCE: i64 = 80;
pub const RECENT_EVENTS: usize = 5;

/// Canonical scoring rule, used by settlement and by the summary highlight.
pub fn score_change(correct: bool, confidence: i64) -> i64 {
    if correct {
        confidence
    } else {
        -((confidence as f64 * 1.5).round() as i64)
    }
}

/// Build the display card for one judgment against a round result. Settlement
/// and the highlight reconstruction share this single formatter.
pub fn flip_card_for(
    round_id: &str,
    agent_id: &str,
    agent_name: &str,
    direction: Direction,
    confidence: i64,
    result: Direction,
    timestamp: i64,
) -> FlipCard {
    let correct = direction == result;
    let change = score_change(correct, confidence);
    let card_result = if correct {
        CardResult::Win
    } else {
        CardResult::Fail
    };
    let sign = if change >= 0 { "+" } else { "" };
    FlipCard {
        id: None,
        round_id: round_id.to_string(),
        agent_id: agent_id.to_string(),
        agent_name: agent_name.to_string(),
        result: card_result,
        confidence,
        score_change: change,
        title: format!("{} {}{}", agent_name, sign, change),
        text: format!(
            "Called {} at {}% confidence, round went {}.",
            direction.as_str(),
            confidence,
            result.as_str()
        ),
        timestamp,
    }
}

/// Judgment submission failures, mapped to HTTP statuses at the boundary.
#[derive(Debug)]
pub enum SubmitError {
    Validation(String),
    NotFound(String),
    Precondition(String),
    Reason(ReasonError),
    Internal(anyhow::Error),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Validation(msg) => write!(f, "{}", msg),
            SubmitError::NotFound(msg) => write!(f, "{}", msg),
            SubmitError::Precondition(msg) => write!(f, "{}", msg),
            SubmitError::Reason(e) => write!(f, "{}", e),
            SubmitError::Internal(e) => write!(f, "{}", e),
        }
    }
}

impl From<anyhow::Error> for SubmitError {
    fn from(e: anyhow::Error) -> Self {
        SubmitError::Internal(e)
    }
}

/// Raw judgment submission body.
#[derive(Debug, Clone, Deserialize)]
pub struct JudgmentPayload {
    pub round_id: Option<String>,
    pub direction: Option<String>,
    pub confidence: Option<i64>,
    pub comment: Option<String>,
    pub intervals: Option<Vec<String>>,
    pub analysis_start_time: Option<i64>,
    pub analysis_end_time: Option<i64>,
    pub reason_rule: Option<RawReasonRule>,
}

/// Payload after validation, before any I/O.
#[derive(Debug, Clone)]
pub struct ValidPayload {
    pub round_id: String,
    pub direction: Direction,
    pub confidence: i64,
    pub comment: String,
    pub intervals: Vec<Timeframe>,
    pub analysis_start_time: i64,
    pub analysis_end_time: i64,
    pub reason_rule: ReasonRule,
}

/// Validate an untyped submission into a normalized record. Pure.
pub fn validate_payload(payload: &JudgmentPayload) -> Result<ValidPayload, SubmitError> {
    let round_id = payload
        .round_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SubmitError::Validation("round_id is required".into()))?
        .to_string();

    let direction = payload
        .direction
        .as_deref()
        .and_then(Direction::from_str)
        .ok_or_else(|| SubmitError::Validation("direction must be UP, DOWN or FLAT".into()))?;

    let confidence = payload
        .confidence
        .ok_or_else(|| SubmitError::Validation("confidence is required".into()))?;
    if !(0..=100).contains(&confidence) {
        return Err(SubmitError::Validation(
            "confidence must be in [0, 100]".into(),
        ));
    }

    let comment = payload
        .comment
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if comment.is_empty() || comment.chars().count() > MAX_COMMENT_LEN {
        return Err(SubmitError::Validation(format!(
            "comment must be 1 to {} characters",
            MAX_COMMENT_LEN
        )));
    }

    let raw_intervals = payload
        .intervals
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SubmitError::Validation("intervals must be non-empty".into()))?;
    let mut intervals = Vec::with_capacity(raw_intervals.len());
    for raw in raw_intervals {
        let tf = Timeframe::from_str(raw).ok_or_else(|| {
            SubmitError::Validation(format!("unsupported interval: {}", raw))
        })?;
        if !intervals.contains(&tf) {
            intervals.push(tf);
        }
    }

    let start = payload
        .analysis_start_time
        .ok_or_else(|| SubmitError::Validation("analysis_start_time is required".into()))?;
    let end = payload
        .analysis_end_time
        .ok_or_else(|| SubmitError::Validation("analysis_end_time is required".into()))?;
    if start >= end {
        return Err(SubmitError::Validation(
            "analysis_start_time must precede analysis_end_time".into(),
        ));
    }

    let raw_rule = payload
        .reason_rule
        .as_ref()
        .ok_or_else(|| SubmitError::Validation("reason_rule is required".into()))?;
    let reason_rule = normalize_rule(raw_rule, Some(&intervals), Some(direction))
        .map_err(SubmitError::Reason)?;

    Ok(ValidPayload {
        round_id,
        direction,
        confidence,
        comment,
        intervals,
        analysis_start_time: start,
        analysis_end_time: end,
        reason_rule,
    })
}

/// Accepted-submission receipt returned to the agent.
#[derive(Debug, Serialize)]
pub struct SubmitReceipt {
    pub ok: bool,
    pub reason: SubmitEvaluation,
}

pub struct RoundService {
    store: Arc<Store>,
    cfg: Arc<Config>,
}

impl RoundService {
    pub fn new(store: Arc<Store>, cfg: Arc<Config>) -> Self {
        Self { store, cfg }
    }

    /// Open a fresh round if no non-settled round exists, the meta price is
    /// known, and at least one active agent can play.
    pub fn start_round(&self, meta: &MetaState, now_ms: i64) -> Result<Option<Round>> {
        if self.store.live_round()?.is_some() {
            return Ok(None);
        }
        let Some(price) = meta.current_price else {
            return Ok(None);
        };
        if self.store.count_active_agents()? == 0 {
            return Ok(None);
        }

        let round = Round {
            round_id: round_id_for(now_ms),
            symbol: SYMBOL.to_string(),
            duration_min: self.cfg.round_duration_min,
            start_price: round2(price),
            end_price: None,
            status: RoundStatus::Betting,
            start_time: now_ms,
            end_time: now_ms + self.cfg.round_duration_ms(),
        };

        if !self.store.insert_round(&round)? {
            warn!(round = %round.round_id, "round id already taken, skipping start");
            return Ok(None);
        }
        info!(round = %round.round_id, start_price = round.start_price, "round started");
        Ok(Some(round))
    }

    pub fn lock_round(&self, round: &Round) -> Result<()> {
        self.store.lock_round(&round.round_id)?;
        info!(round = %round.round_id, "round locked");
        Ok(())
    }

    /// Remove an empty round so a fresh one can start immediately.
    pub fn cancel_round(&self, round: &Round) -> Result<()> {
        self.store.cancel_round(&round.round_id)?;
        info!(round = %round.round_id, "round cancelled (no judgments)");
        Ok(())
    }

    /// Settle a locked round: verdict, score events, agent scores, and flip
    /// cards in one batch. Idempotent on already-settled rounds.
    pub fn settle_round(
        &self,
        round: &Round,
        meta: &MetaState,
        now_ms: i64,
    ) -> Result<Option<Verdict>> {
        if round.status == RoundStatus::Settled {
            return Ok(None);
        }
        let price = meta
            .current_price
            .context("cannot settle round without a current price")?;

        let end_price = round2(price);
        let delta_pct = round1((end_price - round.start_price) / round.start_price * 100.0);
        let result = outcome_for(delta_pct, self.cfg.flat_threshold_pct);

        let verdict = Verdict {
            round_id: round.round_id.clone(),
            result,
            delta_pct,
            timestamp: now_ms,
        };

        let judgments = self.store.judgments_for_round(&round.round_id)?;
        let mut score_events = Vec::with_capacity(judgments.len());
        let mut flip_cards = Vec::with_capacity(judgments.len());
        let mut score_deltas = Vec::with_capacity(judgments.len());

        for j in &judgments {
            let correct = j.direction == result;
            let change = score_change(correct, j.confidence);
            let agent_name = self
                .store
                .get_agent(&j.agent_id)?
                .map(|a| a.name)
                .unwrap_or_else(|| j.agent_id.clone());

            score_events.push(ScoreEvent {
                id: None,
                round_id: round.round_id.clone(),
                agent_id: j.agent_id.clone(),
                correct,
                confidence: j.confidence,
                score_change: change,
                reason: if correct {
                    "Correct".to_string()
                } else {
                    "High confidence failure".to_string()
                },
                timestamp: now_ms,
            });
            flip_cards.push(flip_card_for(
                &round.round_id,
                &j.agent_id,
                &agent_name,
                j.direction,
                j.confidence,
                result,
                now_ms,
            ));
            score_deltas.push((j.agent_id.clone(), change));
        }

        self.store.apply_settlement(&SettlementBatch {
            round_id: round.round_id.clone(),
            end_price,
            verdict: verdict.clone(),
            score_events,
            flip_cards,
            score_deltas,
        })?;

        info!(
            round = %round.round_id,
            result = result.as_str(),
            delta_pct,
            judgments = judgments.len(),
            "round settled"
        );
        Ok(Some(verdict))
    }

    /// Full submit flow: validate, check the round window, evaluate the rule
    /// at submit, then replace any prior judgment in one batch.
    pub async fn submit_judgment(
        &self,
        reason: &ReasonService,
        agent: &Agent,
        payload: JudgmentPayload,
        now_ms: i64,
    ) -> Result<SubmitReceipt, SubmitError> {
        let valid = validate_payload(&payload)?;

        let round = self
            .store
            .get_round(&valid.round_id)
            .map_err(SubmitError::Internal)?
            .ok_or_else(|| SubmitError::NotFound(format!("unknown round: {}", valid.round_id)))?;
        if round.status != RoundStatus::Betting {
            return Err(SubmitError::Precondition(format!(
                "round {} is not accepting judgments",
                round.round_id
            )));
        }
        if now_ms >= round.lock_time(self.cfg.lock_window_min) {
            return Err(SubmitError::Precondition(format!(
                "round {} is locked",
                round.round_id
            )));
        }

        let eval = reason
            .evaluate_at_submit(&valid.reason_rule, valid.analysis_end_time, now_ms)
            .await
            .map_err(SubmitError::Reason)?;

        let judgment = Judgment {
            round_id: round.round_id.clone(),
            agent_id: agent.id.clone(),
            direction: valid.direction,
            confidence: valid.confidence,
            comment: valid.comment,
            timestamp: now_ms,
            intervals: valid.intervals,
            analysis_start_time: valid.analysis_start_time,
            analysis_end_time: valid.analysis_end_time,
            reason_rule: valid.reason_rule,
            reason_t_close_ms: Some(eval.t_close_ms),
            reason_target_close_ms: Some(eval.target_close_ms),
            reason_base_close: Some(eval.base_close),
            reason_pattern_holds: Some(eval.pattern_holds),
            reason_target_close: None,
            reason_delta_pct: None,
            reason_outcome: None,
            reason_correct: None,
            reason_evaluated_at: None,
            reason_eval_error: None,
        };
        self.store
            .replace_judgment(&judgment)
            .map_err(SubmitError::Internal)?;

        info!(
            round = %round.round_id,
            agent = %agent.id,
            direction = valid.direction.as_str(),
            confidence = valid.confidence,
            pattern_holds = eval.pattern_holds,
            "judgment accepted"
        );
        Ok(SubmitReceipt {
            ok: true,
            reason: eval,
        })
    }

    /// Snapshot for client polling.
    pub fn build_summary(&self, now_ms: i64) -> Result<Summary> {
        let live = match self.store.live_round()? {
            Some(round) => {
                let countdown_ms = match round.status {
                    RoundStatus::Betting => round.lock_time(self.cfg.lock_window_min) - now_ms,
                    _ => round.end_time - now_ms,
                }
                .max(0);
                let judgments = self.store.judgments_for_round(&round.round_id)?;
                Some(LiveRound {
                    round,
                    countdown_ms,
                    judgments,
                })
            }
            None => None,
        };

        let last_verdict = self.store.last_verdict()?;
        let highlight = match &last_verdict {
            Some(v) => self.build_highlight(v)?,
            None => None,
        };

        let mut agents = Vec::new();
        for agent in self.store.agents_by_score()? {
            let events = self.store.recent_score_events(&agent.id, RECENT_EVENTS)?;
            let recent_high_conf_failures = events
                .iter()
                .filter(|e| !e.correct && e.confidence >= HIGH_CONFIDENCE)
                .count() as i64;
            let recent_rounds = events
                .into_iter()
                .map(|e| RecentRound {
                    round_id: e.round_id,
                    correct: e.correct,
                    score_change: e.score_change,
                })
                .collect();
            agents.push(AgentSummary {
                id: agent.id,
                name: agent.name,
                persona: agent.persona,
                status: agent.status,
                score: agent.score,
                recent_rounds,
                recent_high_conf_failures,
            });
        }

        let mut feed = self
            .store
            .recent_flip_card_failures(HIGH_CONFIDENCE, FEED_PAGE)?;
        if feed.is_empty() {
            feed = self.store.recent_flip_cards(FEED_PAGE)?;
        }

        Ok(Summary {
            server_time: now_ms,
            round: live,
            last_verdict,
            highlight,
            agents,
            feed,
        })
    }

    /// Reconstruct the top-confidence card of the last verdict with the same
    /// formula settlement uses.
    fn build_highlight(&self, verdict: &Verdict) -> Result<Option<FlipCard>> {
        let judgments = self.store.judgments_for_round(&verdict.round_id)?;
        let Some(top) = judgments.iter().reduce(|best, j| {
            if j.confidence > best.confidence {
                j
            } else {
                best
            }
        }) else {
            return Ok(None);
        };
        let agent_name = self
            .store
            .get_agent(&top.agent_id)?
            .map(|a| a.name)
            .unwrap_or_else(|| top.agent_id.clone());
        Ok(Some(flip_card_for(
            &verdict.round_id,
            &top.agent_id,
            &agent_name,
            top.direction,
            top.confidence,
            verdict.result,
            verdict.timestamp,
        )))
    }
}

#[derive(Debug, Serialize)]
pub struct Summary {
    pub server_time: i64,
    pub round: Option<LiveRound>,
    pub last_verdict: Option<Verdict>,
    pub highlight: Option<FlipCard>,
    pub agents: Vec<AgentSummary>,
    pub feed: Vec<FlipCard>,
}

#[derive(Debug, Serialize)]
pub struct LiveRound {
    #[serde(flatten)]
    pub round: Round,
    pub countdown_ms: i64,
    pub judgments: Vec<Judgment>,
}

#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub persona: String,
    pub status: crate::models::AgentStatus,
    pub score: i64,
    pub recent_rounds: Vec<RecentRound>,
    pub recent_high_conf_failures: i64,
}

#[derive(Debug, Serialize)]
pub struct RecentRound {
    pub round_id: String,
    pub correct: bool,
    pub score_change: i64,
}

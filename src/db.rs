//! SQLite-backed row store.
//!
//! Single connection behind a mutex, WAL journal mode, schema applied as one
//! batch. Multi-row mutations (judgment replace, settlement, cancellation)
//! run inside explicit transactions so partial state is never observable.
//! Retention trims run inside the same transaction as the write that grew the
//! table.

use crate::models::{
    Agent, AgentStatus, CardResult, Direction, FlipCard, Judgment, MetaState, ReasonRule, Round,
    RoundStatus, ScoreEvent, Timeframe, Verdict,
};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::info;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    persona TEXT NOT NULL DEFAULT '',
    prompt TEXT NOT NULL DEFAULT '',
    score INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    secret TEXT UNIQUE NOT NULL,
    claim_token TEXT NOT NULL,
    verification_code TEXT NOT NULL,
    claimed_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS rounds (
    round_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    duration_min INTEGER NOT NULL,
    start_price REAL NOT NULL,
    end_price REAL,
    status TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rounds_status ON rounds(status);

CREATE TABLE IF NOT EXISTS judgments (
    round_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    confidence INTEGER NOT NULL,
    comment TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    intervals TEXT NOT NULL,
    analysis_start_time INTEGER NOT NULL,
    analysis_end_time INTEGER NOT NULL,
    reason_rule TEXT NOT NULL,
    reason_timeframe TEXT NOT NULL,
    reason_pattern TEXT NOT NULL,
    reason_direction TEXT NOT NULL,
    reason_horizon_bars INTEGER NOT NULL,
    reason_t_close_ms INTEGER,
    reason_target_close_ms INTEGER,
    reason_base_close REAL,
    reason_pattern_holds INTEGER,
    reason_target_close REAL,
    reason_delta_pct REAL,
    reason_outcome TEXT,
    reason_correct INTEGER,
    reason_evaluated_at INTEGER,
    reason_eval_error TEXT,
    PRIMARY KEY (round_id, agent_id)
);

CREATE INDEX IF NOT EXISTS idx_judgments_round ON judgments(round_id);
CREATE INDEX IF NOT EXISTS idx_judgments_agent ON judgments(agent_id);
CREATE INDEX IF NOT EXISTS idx_judgments_target_close ON judgments(reason_target_close_ms);
CREATE INDEX IF NOT EXISTS idx_judgments_reason_correct ON judgments(reason_correct);

CREATE TABLE IF NOT EXISTS verdicts (
    round_id TEXT PRIMARY KEY,
    result TEXT NOT NULL,
    delta_pct REAL NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS score_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    round_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    correct INTEGER NOT NULL,
    confidence INTEGER NOT NULL,
    score_change INTEGER NOT NULL,
    reason TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_score_events_agent_round ON score_events(agent_id, round_id);

CREATE TABLE IF NOT EXISTS flip_cards (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    round_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    result TEXT NOT NULL,
    confidence INTEGER NOT NULL,
    score_change INTEGER NOT NULL,
    title TEXT NOT NULL,
    text TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_flip_cards_round_ts ON flip_cards(round_id, timestamp);

CREATE TABLE IF NOT EXISTS meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_price REAL,
    current_price REAL,
    last_delta_pct REAL,
    last_price_at INTEGER,
    feed_diag TEXT
);

INSERT OR IGNORE INTO meta (id) VALUES (1);
"#;

/// Retention caps applied by the trim statements.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub feed_limit: usize,
    pub verdict_limit: usize,
    pub judgment_limit: usize,
    pub round_limit: usize,
    pub score_event_limit: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            feed_limit: 200,
            verdict_limit: 200,
            judgment_limit: 800,
            round_limit: 200,
            score_event_limit: 1000,
        }
    }
}

/// Everything settlement writes in one atomic batch.
#[derive(Debug)]
pub struct SettlementBatch {
    pub round_id: String,
    pub end_price: f64,
    pub verdict: Verdict,
    pub score_events: Vec<ScoreEvent>,
    pub flip_cards: Vec<FlipCard>,
    /// (agent_id, score delta)
    pub score_deltas: Vec<(String, i64)>,
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    retention: Retention,
}

impl Store {
    pub fn open(db_path: &str, retention: Retention) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        Self::from_connection(conn, retention, Some(db_path))
    }

    /// In-memory store for tests.
    pub fn open_in_memory(retention: Retention) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn, retention, None)
    }

    fn from_connection(
        conn: Connection,
        retention: Retention,
        db_path: Option<&str>,
    ) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        if let Some(path) = db_path {
            let rounds: i64 = conn
                .query_row("SELECT COUNT(*) FROM rounds", [], |row| row.get(0))
                .unwrap_or(0);
            let agents: i64 = conn
                .query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))
                .unwrap_or(0);
            info!(path, rounds, agents, "database initialized");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retention,
        })
    }

    // ===== Agents =====

    pub fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agents
             (id, name, persona, prompt, score, status, secret, claim_token, verification_code, claimed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                agent.id,
                agent.name,
                agent.persona,
                agent.prompt,
                agent.score,
                agent.status.as_str(),
                agent.secret,
                agent.claim_token,
                agent.verification_code,
                agent.claimed_at,
                agent.created_at,
            ],
        )
        .context("Failed to insert agent")?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock();
        let result = conn.prepare(&format!("{} WHERE id = ?1", AGENT_SELECT))?
            .query_row(params![id], map_agent)
            .optional()
            .context("Failed to load agent");
        result
    }

    pub fn get_agent_by_secret(&self, secret: &str) -> Result<Option<Agent>> {
        if secret.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock();
        let result = conn.prepare(&format!("{} WHERE secret = ?1", AGENT_SELECT))?
            .query_row(params![secret], map_agent)
            .optional()
            .context("Failed to load agent by secret");
        result
    }

    pub fn get_agent_by_claim_token(&self, token: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock();
        let result = conn.prepare(&format!("{} WHERE claim_token = ?1", AGENT_SELECT))?
            .query_row(params![token], map_agent)
            .optional()
            .context("Failed to load agent by claim token");
        result
    }

    /// Activate a pending agent. Idempotent: re-claiming an active agent is a
    /// no-op that keeps the original claimed_at.
    pub fn claim_agent(&self, id: &str, now_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agents SET status = 'active', claimed_at = COALESCE(claimed_at, ?2)
             WHERE id = ?1",
            params![id, now_ms],
        )
        .context("Failed to claim agent")?;
        Ok(())
    }

    pub fn count_active_agents(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE status = 'active' AND secret != ''",
            [],
            |row| row.get(0),
        )
        .context("Failed to count active agents")
    }

    pub fn agents_by_score(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("{} ORDER BY score DESC, id ASC", AGENT_SELECT))?;
        let agents = stmt
            .query_map([], map_agent)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    // ===== Rounds =====

    /// Insert a round if its id is free. Returns false when a round with the
    /// same id already exists (two advancers racing: one wins).
    pub fn insert_round(&self, round: &Round) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO rounds
             (round_id, symbol, duration_min, start_price, end_price, status, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                round.round_id,
                round.symbol,
                round.duration_min,
                round.start_price,
                round.end_price,
                round.status.as_str(),
                round.start_time,
                round.end_time,
            ],
        )?;
        tx.execute(
            "DELETE FROM rounds WHERE round_id NOT IN
             (SELECT round_id FROM rounds ORDER BY start_time DESC LIMIT ?1)",
            params![self.retention.round_limit as i64],
        )?;
        tx.execute(
            "DELETE FROM judgments WHERE round_id NOT IN (SELECT round_id FROM rounds)",
            [],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    /// The at-most-one round that has not settled yet.
    pub fn live_round(&self) -> Result<Option<Round>> {
        let conn = self.conn.lock();
        let result = conn.prepare(&format!(
            "{} WHERE status != 'settled' ORDER BY start_time DESC LIMIT 1",
            ROUND_SELECT
        ))?
        .query_row([], map_round)
        .optional()
        .context("Failed to load live round");
        result
    }

    pub fn get_round(&self, round_id: &str) -> Result<Option<Round>> {
        let conn = self.conn.lock();
        let result = conn.prepare(&format!("{} WHERE round_id = ?1", ROUND_SELECT))?
            .query_row(params![round_id], map_round)
            .optional()
            .context("Failed to load round");
        result
    }

    pub fn lock_round(&self, round_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE rounds SET status = 'locked' WHERE round_id = ?1 AND status = 'betting'",
            params![round_id],
        )
        .context("Failed to lock round")?;
        Ok(())
    }

    /// Delete an empty betting round together with any judgments, atomically.
    pub fn cancel_round(&self, round_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM judgments WHERE round_id = ?1",
            params![round_id],
        )?;
        tx.execute("DELETE FROM rounds WHERE round_id = ?1", params![round_id])?;
        tx.commit().context("Failed to cancel round")
    }

    /// Apply a full settlement in one transaction: round close, verdict,
    /// score events, agent score updates, flip cards, and retention trims.
    pub fn apply_settlement(&self, batch: &SettlementBatch) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE rounds SET status = 'settled', end_price = ?2 WHERE round_id = ?1",
            params![batch.round_id, batch.end_price],
        )?;

        tx.execute(
            "INSERT OR REPLACE INTO verdicts (round_id, result, delta_pct, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                batch.verdict.round_id,
                batch.verdict.result.as_str(),
                batch.verdict.delta_pct,
                batch.verdict.timestamp,
            ],
        )?;

        for ev in &batch.score_events {
            tx.execute(
                "INSERT INTO score_events
                 (round_id, agent_id, correct, confidence, score_change, reason, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    ev.round_id,
                    ev.agent_id,
                    ev.correct as i64,
                    ev.confidence,
                    ev.score_change,
                    ev.reason,
                    ev.timestamp,
                ],
            )?;
        }

        for (agent_id, delta) in &batch.score_deltas {
            tx.execute(
                "UPDATE agents SET score = score + ?2 WHERE id = ?1",
                params![agent_id, delta],
            )?;
        }

        for card in &batch.flip_cards {
            tx.execute(
                "INSERT INTO flip_cards
                 (round_id, agent_id, agent_name, result, confidence, score_change, title, text, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    card.round_id,
                    card.agent_id,
                    card.agent_name,
                    card.result.as_str(),
                    card.confidence,
                    card.score_change,
                    card.title,
                    card.text,
                    card.timestamp,
                ],
            )?;
        }

        tx.execute(
            "DELETE FROM verdicts WHERE round_id NOT IN
             (SELECT round_id FROM verdicts ORDER BY timestamp DESC LIMIT ?1)",
            params![self.retention.verdict_limit as i64],
        )?;
        tx.execute(
            "DELETE FROM score_events WHERE id NOT IN
             (SELECT id FROM score_events ORDER BY timestamp DESC, id DESC LIMIT ?1)",
            params![self.retention.score_event_limit as i64],
        )?;
        tx.execute(
            "DELETE FROM flip_cards WHERE id NOT IN
             (SELECT id FROM flip_cards ORDER BY timestamp DESC, id DESC LIMIT ?1)",
            params![self.retention.feed_limit as i64],
        )?;

        tx.commit().context("Failed to apply settlement batch")
    }

    // ===== Judgments =====

    /// Replace any prior judgment for (round, agent) with the new row, in one
    /// transaction.
    pub fn replace_judgment(&self, j: &Judgment) -> Result<()> {
        let intervals = serde_json::to_string(&j.intervals)?;
        let reason_rule = serde_json::to_string(&j.reason_rule)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM judgments WHERE round_id = ?1 AND agent_id = ?2",
            params![j.round_id, j.agent_id],
        )?;
        tx.execute(
            "INSERT INTO judgments
             (round_id, agent_id, direction, confidence, comment, timestamp, intervals,
              analysis_start_time, analysis_end_time, reason_rule, reason_timeframe,
              reason_pattern, reason_direction, reason_horizon_bars, reason_t_close_ms,
              reason_target_close_ms, reason_base_close, reason_pattern_holds,
              reason_target_close, reason_delta_pct, reason_outcome, reason_correct,
              reason_evaluated_at, reason_eval_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                j.round_id,
                j.agent_id,
                j.direction.as_str(),
                j.confidence,
                j.comment,
                j.timestamp,
                intervals,
                j.analysis_start_time,
                j.analysis_end_time,
                reason_rule,
                j.reason_rule.timeframe.as_str(),
                j.reason_rule.pattern,
                j.reason_rule.direction.as_str(),
                j.reason_rule.horizon_bars,
                j.reason_t_close_ms,
                j.reason_target_close_ms,
                j.reason_base_close,
                j.reason_pattern_holds.map(|b| b as i64),
                j.reason_target_close,
                j.reason_delta_pct,
                j.reason_outcome.map(|d| d.as_str()),
                j.reason_correct.map(|b| b as i64),
                j.reason_evaluated_at,
                j.reason_eval_error,
            ],
        )?;
        tx.execute(
            "DELETE FROM judgments WHERE (round_id, agent_id) NOT IN
             (SELECT round_id, agent_id FROM judgments ORDER BY timestamp DESC LIMIT ?1)",
            params![self.retention.judgment_limit as i64],
        )?;
        tx.commit().context("Failed to replace judgment")
    }

    pub fn judgments_for_round(&self, round_id: &str) -> Result<Vec<Judgment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE round_id = ?1 ORDER BY timestamp ASC",
            JUDGMENT_SELECT
        ))?;
        let rows = stmt
            .query_map(params![round_id], map_judgment)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_judgments_for_round(&self, round_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM judgments WHERE round_id = ?1",
            params![round_id],
            |row| row.get(0),
        )
        .context("Failed to count judgments")
    }

    /// Judgments whose horizon has been reached but not yet judged, oldest
    /// target first, bounded.
    pub fn pending_reason_rows(&self, now_ms: i64, max_rows: usize) -> Result<Vec<Judgment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE reason_target_close_ms IS NOT NULL
                AND reason_target_close_ms <= ?1
                AND reason_correct IS NULL
              ORDER BY reason_target_close_ms ASC
              LIMIT ?2",
            JUDGMENT_SELECT
        ))?;
        let rows = stmt
            .query_map(params![now_ms, max_rows as i64], map_judgment)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record a successful horizon evaluation and clear any stored error.
    pub fn apply_reason_outcome(
        &self,
        round_id: &str,
        agent_id: &str,
        target_close: f64,
        delta_pct: f64,
        outcome: Direction,
        correct: bool,
        evaluated_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE judgments SET
                reason_target_close = ?3,
                reason_delta_pct = ?4,
                reason_outcome = ?5,
                reason_correct = ?6,
                reason_evaluated_at = ?7,
                reason_eval_error = NULL
             WHERE round_id = ?1 AND agent_id = ?2",
            params![
                round_id,
                agent_id,
                target_close,
                delta_pct,
                outcome.as_str(),
                correct as i64,
                evaluated_at,
            ],
        )
        .context("Failed to store reason outcome")?;
        Ok(())
    }

    pub fn set_reason_eval_error(&self, round_id: &str, agent_id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE judgments SET reason_eval_error = ?3 WHERE round_id = ?1 AND agent_id = ?2",
            params![round_id, agent_id, error],
        )
        .context("Failed to store reason eval error")?;
        Ok(())
    }

    // ===== Verdicts / score events / flip cards =====

    pub fn last_verdict(&self) -> Result<Option<Verdict>> {
        let conn = self.conn.lock();
        let result = conn.prepare(
            "SELECT round_id, result, delta_pct, timestamp FROM verdicts
             ORDER BY timestamp DESC LIMIT 1",
        )?
        .query_row([], map_verdict)
        .optional()
        .context("Failed to load last verdict");
        result
    }

    pub fn recent_score_events(&self, agent_id: &str, limit: usize) -> Result<Vec<ScoreEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, round_id, agent_id, correct, confidence, score_change, reason, timestamp
             FROM score_events WHERE agent_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![agent_id, limit as i64], map_score_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recent_flip_cards(&self, limit: usize) -> Result<Vec<FlipCard>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY timestamp DESC, id DESC LIMIT ?1",
            FLIP_CARD_SELECT
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], map_flip_card)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// High-confidence failures, the preferred feed subset.
    pub fn recent_flip_card_failures(
        &self,
        min_confidence: i64,
        limit: usize,
    ) -> Result<Vec<FlipCard>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE result = 'FAIL' AND confidence >= ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
            FLIP_CARD_SELECT
        ))?;
        let rows = stmt
            .query_map(params![min_confidence, limit as i64], map_flip_card)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ===== Meta =====

    pub fn load_meta(&self) -> Result<MetaState> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT last_price, current_price, last_delta_pct, last_price_at FROM meta WHERE id = 1",
            [],
            |row| {
                Ok(MetaState {
                    last_price: row.get(0)?,
                    current_price: row.get(1)?,
                    last_delta_pct: row.get(2)?,
                    last_price_at: row.get(3)?,
                })
            },
        )
        .context("Failed to load meta state")
    }

    pub fn save_meta(&self, meta: &MetaState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE meta SET last_price = ?1, current_price = ?2, last_delta_pct = ?3, last_price_at = ?4
             WHERE id = 1",
            params![
                meta.last_price,
                meta.current_price,
                meta.last_delta_pct,
                meta.last_price_at,
            ],
        )
        .context("Failed to save meta state")?;
        Ok(())
    }

    pub fn save_feed_diag(&self, diag_json: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE meta SET feed_diag = ?1 WHERE id = 1",
            params![diag_json],
        )
        .context("Failed to save feed diagnostics")?;
        Ok(())
    }

    // ===== Reason stats =====

    /// Evaluated reason rows inside `[since, until]`, newest first, capped.
    /// Returns (timeframe, pattern, pattern_holds, correct, delta_pct).
    pub fn reason_rows(
        &self,
        since_ms: i64,
        until_ms: i64,
        limit: usize,
        agent_id: Option<&str>,
    ) -> Result<Vec<(String, String, Option<bool>, bool, Option<f64>)>> {
        let conn = self.conn.lock();
        let base = "SELECT reason_timeframe, reason_pattern, reason_pattern_holds, reason_correct, reason_delta_pct
             FROM judgments
             WHERE reason_correct IS NOT NULL AND timestamp >= ?1 AND timestamp <= ?2";
        let mut rows = Vec::new();
        let mut push = |r: &Row<'_>| -> rusqlite::Result<()> {
            rows.push((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<i64>>(2)?.map(|v| v != 0),
                r.get::<_, i64>(3)? != 0,
                r.get::<_, Option<f64>>(4)?,
            ));
            Ok(())
        };
        match agent_id {
            Some(agent) => {
                let mut stmt = conn.prepare(&format!(
                    "{} AND agent_id = ?3 ORDER BY timestamp DESC LIMIT ?4",
                    base
                ))?;
                let mut q = stmt.query(params![since_ms, until_ms, agent, limit as i64])?;
                while let Some(r) = q.next()? {
                    push(r)?;
                }
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("{} ORDER BY timestamp DESC LIMIT ?3", base))?;
                let mut q = stmt.query(params![since_ms, until_ms, limit as i64])?;
                while let Some(r) = q.next()? {
                    push(r)?;
                }
            }
        }
        Ok(rows)
    }
}

const AGENT_SELECT: &str = "SELECT id, name, persona, prompt, score, status, secret, claim_token, verification_code, claimed_at, created_at FROM agents";

const ROUND_SELECT: &str = "SELECT round_id, symbol, duration_min, start_price, end_price, status, start_time, end_time FROM rounds";

const JUDGMENT_SELECT: &str = "SELECT round_id, agent_id, direction, confidence, comment, timestamp, intervals, analysis_start_time, analysis_end_time, reason_rule, reason_timeframe, reason_pattern, reason_direction, reason_horizon_bars, reason_t_close_ms, reason_target_close_ms, reason_base_close, reason_pattern_holds, reason_target_close, reason_delta_pct, reason_outcome, reason_correct, reason_evaluated_at, reason_eval_error FROM judgments";

const FLIP_CARD_SELECT: &str = "SELECT id, round_id, agent_id, agent_name, result, confidence, score_change, title, text, timestamp FROM flip_cards";

fn map_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let status_str: String = row.get(5)?;
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        persona: row.get(2)?,
        prompt: row.get(3)?,
        score: row.get(4)?,
        status: AgentStatus::from_str(&status_str).unwrap_or(AgentStatus::Inactive),
        secret: row.get(6)?,
        claim_token: row.get(7)?,
        verification_code: row.get(8)?,
        claimed_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn map_round(row: &Row<'_>) -> rusqlite::Result<Round> {
    let status_str: String = row.get(5)?;
    Ok(Round {
        round_id: row.get(0)?,
        symbol: row.get(1)?,
        duration_min: row.get(2)?,
        start_price: row.get(3)?,
        end_price: row.get(4)?,
        status: RoundStatus::from_str(&status_str).unwrap_or(RoundStatus::Settled),
        start_time: row.get(6)?,
        end_time: row.get(7)?,
    })
}

fn map_judgment(row: &Row<'_>) -> rusqlite::Result<Judgment> {
    let direction_str: String = row.get(2)?;
    let intervals_json: String = row.get(6)?;
    let rule_json: String = row.get(9)?;
    let outcome_str: Option<String> = row.get(20)?;

    let intervals: Vec<Timeframe> = serde_json::from_str(&intervals_json).unwrap_or_default();
    let reason_rule: ReasonRule = serde_json::from_str(&rule_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Judgment {
        round_id: row.get(0)?,
        agent_id: row.get(1)?,
        direction: Direction::from_str(&direction_str).unwrap_or(Direction::Flat),
        confidence: row.get(3)?,
        comment: row.get(4)?,
        timestamp: row.get(5)?,
        intervals,
        analysis_start_time: row.get(7)?,
        analysis_end_time: row.get(8)?,
        reason_rule,
        reason_t_close_ms: row.get(14)?,
        reason_target_close_ms: row.get(15)?,
        reason_base_close: row.get(16)?,
        reason_pattern_holds: row.get::<_, Option<i64>>(17)?.map(|v| v != 0),
        reason_target_close: row.get(18)?,
        reason_delta_pct: row.get(19)?,
        reason_outcome: outcome_str.and_then(|s| Direction::from_str(&s)),
        reason_correct: row.get::<_, Option<i64>>(21)?.map(|v| v != 0),
        reason_evaluated_at: row.get(22)?,
        reason_eval_error: row.get(23)?,
    })
}

fn map_verdict(row: &Row<'_>) -> rusqlite::Result<Verdict> {
    let result_str: String = row.get(1)?;
    Ok(Verdict {
        round_id: row.get(0)?,
        result: Direction::from_str(&result_str).unwrap_or(Direction::Flat),
        delta_pct: row.get(2)?,
        timestamp: row.get(3)?,
    })
}

fn map_score_event(row: &Row<'_>) -> rusqlite::Result<ScoreEvent> {
    Ok(ScoreEvent {
        id: row.get(0)?,
        round_id: row.get(1)?,
        agent_id: row.get(2)?,
        correct: row.get::<_, i64>(3)? != 0,
        confidence: row.get(4)?,
        score_change: row.get(5)?,
        reason: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

fn map_flip_card(row: &Row<'_>) -> rusqlite::Result<FlipCard> {
    let result_str: String = row.get(4)?;
    Ok(FlipCard {
        id: row.get(0)?,
        round_id: row.get(1)?,
        agent_id: row.get(2)?,
        agent_name: row.get(3)?,
        result: CardResult::from_str(&result_str).unwrap_or(CardResult::Fail),
        confidence: row.get(5)?,
        score_change: row.get(6)?,
        title: row.get(7)?,
        text: row.get(8)?,
        timestamp: row.get(9)?,
    })
}

/// Map duplicate-key failures to a domain error the API layer can turn into
/// a 409.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<rusqlite::Error>()
        .map(|e| {
            matches!(
                e,
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation
            )
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory(Retention::default()).unwrap()
    }

    pub fn test_agent(id: &str) -> Agent {
        Agent {
            id: id.to_string(),
            name: id.to_string(),
            persona: String::new(),
            prompt: String::new(),
            score: 0,
            status: AgentStatus::Active,
            secret: format!("secret-{}", id),
            claim_token: format!("token-{}", id),
            verification_code: "123456".to_string(),
            claimed_at: Some(1),
            created_at: 1,
        }
    }

    pub fn test_round(id: &str, start: i64) -> Round {
        Round {
            round_id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            duration_min: 30,
            start_price: 97_000.0,
            end_price: None,
            status: RoundStatus::Betting,
            start_time: start,
            end_time: start + 30 * 60_000,
        }
    }

    pub fn test_judgment(round_id: &str, agent_id: &str, ts: i64) -> Judgment {
        Judgment {
            round_id: round_id.to_string(),
            agent_id: agent_id.to_string(),
            direction: Direction::Up,
            confidence: 80,
            comment: "momentum continuation".to_string(),
            timestamp: ts,
            intervals: vec![Timeframe::M1, Timeframe::M5],
            analysis_start_time: ts - 3_600_000,
            analysis_end_time: ts,
            reason_rule: ReasonRule {
                timeframe: Timeframe::M1,
                pattern: "candle.bullish_engulfing.v1".to_string(),
                direction: Direction::Up,
                horizon_bars: 5,
            },
            reason_t_close_ms: Some(ts - 1),
            reason_target_close_ms: Some(ts - 1 + 5 * 60_000),
            reason_base_close: Some(97_000.0),
            reason_pattern_holds: Some(true),
            reason_target_close: None,
            reason_delta_pct: None,
            reason_outcome: None,
            reason_correct: None,
            reason_evaluated_at: None,
            reason_eval_error: None,
        }
    }

    #[test]
    fn test_agent_round_trip() {
        let store = store();
        store.insert_agent(&test_agent("alpha")).unwrap();

        let by_id = store.get_agent("alpha").unwrap().unwrap();
        assert_eq!(by_id.name, "alpha");
        assert_eq!(by_id.status, AgentStatus::Active);

        let by_secret = store.get_agent_by_secret("secret-alpha").unwrap().unwrap();
        assert_eq!(by_secret.id, "alpha");
        assert!(store.get_agent_by_secret("nope").unwrap().is_none());
        assert!(store.get_agent_by_secret("").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_agent_id_is_constraint_error() {
        let store = store();
        store.insert_agent(&test_agent("alpha")).unwrap();
        let mut dup = test_agent("alpha");
        dup.secret = "other-secret".to_string();
        let err = store.insert_agent(&dup).unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[test]
    fn test_claim_agent_is_idempotent() {
        let store = store();
        let mut agent = test_agent("beta");
        agent.status = AgentStatus::PendingClaim;
        agent.claimed_at = None;
        store.insert_agent(&agent).unwrap();

        store.claim_agent("beta", 1_000).unwrap();
        let first = store.get_agent("beta").unwrap().unwrap();
        assert_eq!(first.status, AgentStatus::Active);
        assert_eq!(first.claimed_at, Some(1_000));

        store.claim_agent("beta", 2_000).unwrap();
        let second = store.get_agent("beta").unwrap().unwrap();
        assert_eq!(second.claimed_at, Some(1_000));
    }

    #[test]
    fn test_round_insert_and_duplicate_race() {
        let store = store();
        assert!(store.insert_round(&test_round("r_1", 0)).unwrap());
        assert!(!store.insert_round(&test_round("r_1", 0)).unwrap());
        let live = store.live_round().unwrap().unwrap();
        assert_eq!(live.round_id, "r_1");
    }

    #[test]
    fn test_round_trim_keeps_most_recent() {
        let retention = Retention {
            round_limit: 3,
            ..Default::default()
        };
        let store = Store::open_in_memory(retention).unwrap();
        for i in 0..5 {
            let mut r = test_round(&format!("r_{}", i), i * 1_000);
            r.status = RoundStatus::Settled;
            store.insert_round(&r).unwrap();
        }
        assert!(store.get_round("r_0").unwrap().is_none());
        assert!(store.get_round("r_1").unwrap().is_none());
        assert!(store.get_round("r_4").unwrap().is_some());
    }

    #[test]
    fn test_judgment_replace_semantics() {
        let store = store();
        store.insert_round(&test_round("r_1", 0)).unwrap();
        store.insert_agent(&test_agent("alpha")).unwrap();

        store
            .replace_judgment(&test_judgment("r_1", "alpha", 1_000))
            .unwrap();
        let mut second = test_judgment("r_1", "alpha", 2_000);
        second.direction = Direction::Down;
        store.replace_judgment(&second).unwrap();

        let rows = store.judgments_for_round("r_1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].direction, Direction::Down);
        assert_eq!(rows[0].timestamp, 2_000);
    }

    #[test]
    fn test_judgment_maps_reason_columns() {
        let store = store();
        store.insert_round(&test_round("r_1", 0)).unwrap();
        store
            .replace_judgment(&test_judgment("r_1", "alpha", 1_000))
            .unwrap();

        let j = &store.judgments_for_round("r_1").unwrap()[0];
        assert_eq!(j.reason_rule.pattern, "candle.bullish_engulfing.v1");
        assert_eq!(j.reason_rule.timeframe, Timeframe::M1);
        assert_eq!(j.reason_pattern_holds, Some(true));
        assert_eq!(j.reason_correct, None);
    }

    #[test]
    fn test_pending_sweep_selection_and_outcome() {
        let store = store();
        store.insert_round(&test_round("r_1", 0)).unwrap();
        let j = test_judgment("r_1", "alpha", 1_000);
        store.replace_judgment(&j).unwrap();
        let target = j.reason_target_close_ms.unwrap();

        // Horizon not reached yet.
        assert!(store.pending_reason_rows(target - 1, 50).unwrap().is_empty());
        // Reached.
        let pending = store.pending_reason_rows(target, 50).unwrap();
        assert_eq!(pending.len(), 1);

        store
            .apply_reason_outcome("r_1", "alpha", 97_100.0, 0.103093, Direction::Up, true, target)
            .unwrap();
        // Idempotent: judged rows drop out of the sweep.
        assert!(store.pending_reason_rows(target, 50).unwrap().is_empty());

        let j = &store.judgments_for_round("r_1").unwrap()[0];
        assert_eq!(j.reason_correct, Some(true));
        assert_eq!(j.reason_outcome, Some(Direction::Up));
        assert_eq!(j.reason_eval_error, None);
    }

    #[test]
    fn test_reason_eval_error_stored_and_cleared() {
        let store = store();
        store.insert_round(&test_round("r_1", 0)).unwrap();
        let j = test_judgment("r_1", "alpha", 1_000);
        store.replace_judgment(&j).unwrap();

        store
            .set_reason_eval_error("r_1", "alpha", "candle missing")
            .unwrap();
        let row = &store.judgments_for_round("r_1").unwrap()[0];
        assert_eq!(row.reason_eval_error.as_deref(), Some("candle missing"));

        store
            .apply_reason_outcome("r_1", "alpha", 97_100.0, 0.1, Direction::Up, true, 1)
            .unwrap();
        let row = &store.judgments_for_round("r_1").unwrap()[0];
        assert_eq!(row.reason_eval_error, None);
    }

    #[test]
    fn test_settlement_batch_is_atomic_and_updates_scores() {
        let store = store();
        store.insert_agent(&test_agent("alpha")).unwrap();
        store.insert_round(&test_round("r_1", 0)).unwrap();

        let batch = SettlementBatch {
            round_id: "r_1".to_string(),
            end_price: 97_200.0,
            verdict: Verdict {
                round_id: "r_1".to_string(),
                result: Direction::Up,
                delta_pct: 0.2,
                timestamp: 100,
            },
            score_events: vec![ScoreEvent {
                id: None,
                round_id: "r_1".to_string(),
                agent_id: "alpha".to_string(),
                correct: true,
                confidence: 80,
                score_change: 80,
                reason: "Correct".to_string(),
                timestamp: 100,
            }],
            flip_cards: vec![FlipCard {
                id: None,
                round_id: "r_1".to_string(),
                agent_id: "alpha".to_string(),
                agent_name: "alpha".to_string(),
                result: CardResult::Win,
                confidence: 80,
                score_change: 80,
                title: "alpha +80".to_string(),
                text: "UP @ 80".to_string(),
                timestamp: 100,
            }],
            score_deltas: vec![("alpha".to_string(), 80)],
        };
        store.apply_settlement(&batch).unwrap();

        let round = store.get_round("r_1").unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Settled);
        assert_eq!(round.end_price, Some(97_200.0));
        assert_eq!(store.get_agent("alpha").unwrap().unwrap().score, 80);
        assert_eq!(store.last_verdict().unwrap().unwrap().round_id, "r_1");
        assert_eq!(store.recent_flip_cards(10).unwrap().len(), 1);
        assert_eq!(store.recent_score_events("alpha", 5).unwrap().len(), 1);
        assert!(store.live_round().unwrap().is_none());
    }

    #[test]
    fn test_cancel_round_removes_round_and_judgments() {
        let store = store();
        store.insert_round(&test_round("r_1", 0)).unwrap();
        store
            .replace_judgment(&test_judgment("r_1", "alpha", 1_000))
            .unwrap();

        store.cancel_round("r_1").unwrap();
        assert!(store.get_round("r_1").unwrap().is_none());
        assert_eq!(store.count_judgments_for_round("r_1").unwrap(), 0);
    }

    #[test]
    fn test_meta_round_trip() {
        let store = store();
        let empty = store.load_meta().unwrap();
        assert_eq!(empty.current_price, None);

        let meta = MetaState {
            last_price: Some(96_000.0),
            current_price: Some(97_000.0),
            last_delta_pct: Some(1.04),
            last_price_at: Some(5_000),
        };
        store.save_meta(&meta).unwrap();
        let loaded = store.load_meta().unwrap();
        assert_eq!(loaded.current_price, Some(97_000.0));
        assert_eq!(loaded.last_price_at, Some(5_000));
    }

    #[test]
    fn test_flip_card_failure_filter() {
        let store = store();
        store.insert_round(&test_round("r_1", 0)).unwrap();
        let mk = |result: CardResult, confidence: i64, ts: i64| FlipCard {
            id: None,
            round_id: "r_1".to_string(),
            agent_id: "a".to_string(),
            agent_name: "a".to_string(),
            result,
            confidence,
            score_change: 0,
            title: String::new(),
            text: String::new(),
            timestamp: ts,
        };
        let batch = SettlementBatch {
            round_id: "r_1".to_string(),
            end_price: 1.0,
            verdict: Verdict {
                round_id: "r_1".to_string(),
                result: Direction::Flat,
                delta_pct: 0.0,
                timestamp: 1,
            },
            score_events: vec![],
            flip_cards: vec![
                mk(CardResult::Fail, 90, 1),
                mk(CardResult::Fail, 50, 2),
                mk(CardResult::Win, 95, 3),
            ],
            score_deltas: vec![],
        };
        store.apply_settlement(&batch).unwrap();

        let failures = store.recent_flip_card_failures(80, 30).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].confidence, 90);
    }

    #[test]
    fn test_reason_rows_window_and_agent_filter() {
        let store = store();
        store.insert_round(&test_round("r_1", 0)).unwrap();
        let mut j = test_judgment("r_1", "alpha", 1_000);
        store.replace_judgment(&j).unwrap();
        store
            .apply_reason_outcome("r_1", "alpha", 97_100.0, 0.1, Direction::Up, true, 2_000)
            .unwrap();
        j.agent_id = "beta".to_string();
        store.replace_judgment(&j).unwrap();

        // Only alpha's row is evaluated.
        let all = store.reason_rows(0, 10_000, 100, None).unwrap();
        assert_eq!(all.len(), 1);
        let beta = store.reason_rows(0, 10_000, 100, Some("beta")).unwrap();
        assert!(beta.is_empty());
        let outside = store.reason_rows(5_000, 10_000, 100, None).unwrap();
        assert!(outside.is_empty());
    }
}

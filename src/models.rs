//! Core domain types for the prediction tournament.
//!
//! Everything that crosses a module boundary lives here: agents, rounds,
//! judgments, verdicts, score events, flip cards, candles, and the runtime
//! configuration loaded from the environment.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Directional forecast (and round outcome).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    Flat,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Flat => "FLAT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UP" => Some(Direction::Up),
            "DOWN" => Some(Direction::Down),
            "FLAT" => Some(Direction::Flat),
            _ => None,
        }
    }
}

/// Whitelisted candle periods. The wire form is the short code ("1m", "4h", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H4,
    H12,
    D1,
}

pub const ALL_TIMEFRAMES: [Timeframe; 9] = [
    Timeframe::M1,
    Timeframe::M3,
    Timeframe::M5,
    Timeframe::M15,
    Timeframe::M30,
    Timeframe::H1,
    Timeframe::H4,
    Timeframe::H12,
    Timeframe::D1,
];

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Timeframe::M1),
            "3m" => Some(Timeframe::M3),
            "5m" => Some(Timeframe::M5),
            "15m" => Some(Timeframe::M15),
            "30m" => Some(Timeframe::M30),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            "12h" => Some(Timeframe::H12),
            "1d" => Some(Timeframe::D1),
            _ => None,
        }
    }

    /// Candle duration in milliseconds.
    pub fn interval_ms(&self) -> i64 {
        match self {
            Timeframe::M1 => 60_000,
            Timeframe::M3 => 180_000,
            Timeframe::M5 => 300_000,
            Timeframe::M15 => 900_000,
            Timeframe::M30 => 1_800_000,
            Timeframe::H1 => 3_600_000,
            Timeframe::H4 => 14_400_000,
            Timeframe::H12 => 43_200_000,
            Timeframe::D1 => 86_400_000,
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Timeframe::from_str(&s).ok_or_else(|| format!("unsupported interval: {}", s))
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> String {
        tf.as_str().to_string()
    }
}

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    PendingClaim,
    Active,
    Inactive,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::PendingClaim => "pending_claim",
            AgentStatus::Active => "active",
            AgentStatus::Inactive => "inactive",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending_claim" => Some(AgentStatus::PendingClaim),
            "active" => Some(AgentStatus::Active),
            "inactive" => Some(AgentStatus::Inactive),
            _ => None,
        }
    }
}

/// A registered tournament participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub persona: String,
    pub prompt: String,
    pub score: i64,
    pub status: AgentStatus,
    #[serde(skip_serializing)]
    pub secret: String, // API key - never serialize
    #[serde(skip_serializing)]
    pub claim_token: String,
    #[serde(skip_serializing)]
    pub verification_code: String,
    pub claimed_at: Option<i64>,
    pub created_at: i64,
}

/// Round lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Betting,
    Locked,
    Settled,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Betting => "betting",
            RoundStatus::Locked => "locked",
            RoundStatus::Settled => "settled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "betting" => Some(RoundStatus::Betting),
            "locked" => Some(RoundStatus::Locked),
            "settled" => Some(RoundStatus::Settled),
            _ => None,
        }
    }
}

/// One fixed-duration prediction window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub round_id: String,
    pub symbol: String,
    pub duration_min: i64,
    pub start_price: f64,
    pub end_price: Option<f64>,
    pub status: RoundStatus,
    pub start_time: i64,
    pub end_time: i64,
}

impl Round {
    pub fn lock_time(&self, lock_window_min: i64) -> i64 {
        self.start_time + lock_window_min * 60_000
    }
}

/// Round id in `r_YYYYMMDD_HHMM` form from the UTC start instant.
pub fn round_id_for(start_ms: i64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(start_ms)
        .single()
        .unwrap_or_else(Utc::now);
    format!("r_{}", dt.format("%Y%m%d_%H%M"))
}

/// Machine-verifiable claim attached to a judgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonRule {
    pub timeframe: Timeframe,
    pub pattern: String,
    pub direction: Direction,
    pub horizon_bars: u32,
}

/// One agent's forecast for one round, including the denormalized reason rule
/// and both evaluation stages (at-submit alignment, at-horizon outcome).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgment {
    pub round_id: String,
    pub agent_id: String,
    pub direction: Direction,
    pub confidence: i64,
    pub comment: String,
    pub timestamp: i64,
    pub intervals: Vec<Timeframe>,
    pub analysis_start_time: i64,
    pub analysis_end_time: i64,
    pub reason_rule: ReasonRule,
    pub reason_t_close_ms: Option<i64>,
    pub reason_target_close_ms: Option<i64>,
    pub reason_base_close: Option<f64>,
    pub reason_pattern_holds: Option<bool>,
    pub reason_target_close: Option<f64>,
    pub reason_delta_pct: Option<f64>,
    pub reason_outcome: Option<Direction>,
    pub reason_correct: Option<bool>,
    pub reason_evaluated_at: Option<i64>,
    pub reason_eval_error: Option<String>,
}

/// Ground-truth outcome of a settled round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub round_id: String,
    pub result: Direction,
    pub delta_pct: f64,
    pub timestamp: i64,
}

/// Score delta applied to an agent at settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreEvent {
    pub id: Option<i64>,
    pub round_id: String,
    pub agent_id: String,
    pub correct: bool,
    pub confidence: i64,
    pub score_change: i64,
    pub reason: String,
    pub timestamp: i64,
}

/// Display outcome of a flip card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CardResult {
    Win,
    Fail,
}

impl CardResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardResult::Win => "WIN",
            CardResult::Fail => "FAIL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WIN" => Some(CardResult::Win),
            "FAIL" => Some(CardResult::Fail),
            _ => None,
        }
    }
}

/// Denormalized display artifact for one (judgment, verdict) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlipCard {
    pub id: Option<i64>,
    pub round_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub result: CardResult,
    pub confidence: i64,
    pub score_change: i64,
    pub title: String,
    pub text: String,
    pub timestamp: i64,
}

/// Singleton price bookkeeping row, owned by the state advancer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaState {
    pub last_price: Option<f64>,
    pub current_price: Option<f64>,
    pub last_delta_pct: Option<f64>,
    pub last_price_at: Option<i64>,
}

/// Normalized OHLCV bar. `close_time` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades_count: Option<i64>,
}

/// Round a price to cents.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Round a percentage to 0.1.
pub fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Round a percentage to 6 decimals (reason evaluation deltas).
pub fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,

    // Round lifecycle
    pub round_duration_min: i64,
    pub lock_window_min: i64,
    pub flat_threshold_pct: f64,

    // Price handling
    pub price_refresh_ms: i64,
    pub price_stale_ms: i64,

    // Auth
    pub signature_window_sec: i64,
    pub admin_api_token: Option<String>,

    // Retention
    pub feed_limit: usize,
    pub verdict_limit: usize,
    pub judgment_limit: usize,
    pub round_limit: usize,
    pub score_event_limit: usize,

    // Live price feed
    pub ws_url: String,
    pub feed_mode: String,
    pub coin: String,

    // Kline proxy
    pub info_url: String,
    pub kline_default_intervals: Vec<Timeframe>,
    pub kline_default_limit: usize,
    pub kline_max_limit: usize,
    pub kline_cache_sec: i64,

    // In-process scheduler
    pub advance_interval_ms: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let kline_default_intervals = std::env::var("KLINE_DEFAULT_INTERVALS")
            .unwrap_or_else(|_| "1m,5m,15m,1h".to_string())
            .split(',')
            .filter_map(|s| Timeframe::from_str(s.trim()))
            .collect::<Vec<_>>();

        Ok(Self {
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./predarena.db".to_string()),
            port: env_or("PORT", 8080),
            round_duration_min: env_or("ROUND_DURATION_MIN", 30),
            lock_window_min: env_or("LOCK_WINDOW_MIN", 10),
            flat_threshold_pct: env_or("FLAT_THRESHOLD_PCT", 0.2),
            price_refresh_ms: env_or("PRICE_REFRESH_MS", 10_000),
            price_stale_ms: env_or("PRICE_STALE_MS", 30_000),
            signature_window_sec: env_or("SIGNATURE_WINDOW_SEC", 300),
            admin_api_token: std::env::var("ADMIN_API_TOKEN").ok(),
            feed_limit: env_or("FEED_LIMIT", 200),
            verdict_limit: env_or("VERDICT_LIMIT", 200),
            judgment_limit: env_or("JUDGMENT_LIMIT", 800),
            round_limit: env_or("ROUND_LIMIT", 200),
            score_event_limit: env_or("SCORE_EVENT_LIMIT", 1000),
            ws_url: std::env::var("HL_WS_URL")
                .unwrap_or_else(|_| "wss://api.hyperliquid.xyz/ws".to_string()),
            feed_mode: std::env::var("HL_FEED_MODE").unwrap_or_else(|_| "allMids".to_string()),
            coin: std::env::var("HL_COIN").unwrap_or_else(|_| "BTC".to_string()),
            info_url: std::env::var("HL_INFO_URL")
                .unwrap_or_else(|_| "https://api.hyperliquid.xyz/info".to_string()),
            kline_default_intervals,
            kline_default_limit: env_or("KLINE_DEFAULT_LIMIT", 200),
            kline_max_limit: env_or("KLINE_MAX_LIMIT", 500),
            kline_cache_sec: env_or("KLINE_CACHE_SEC", 15),
            advance_interval_ms: env_or("ADVANCE_INTERVAL_MS", 5_000),
        })
    }

    pub fn round_duration_ms(&self) -> i64 {
        self.round_duration_min * 60_000
    }

    pub fn lock_window_ms(&self) -> i64 {
        self.lock_window_min * 60_000
    }
}

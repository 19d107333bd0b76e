//! State advancer.
//!
//! Single entry-point tick that reconciles the meta price, drives round
//! transitions, seeds the next round, and finishes with the pending reason
//! sweep. Invoked by the in-process scheduler and by POST /api/advance; a
//! tokio mutex serializes concurrent ticks inside one process. Cross-process
//! races are resolved by the round_id primary key.

use crate::db::Store;
use crate::feed::PriceFeed;
use crate::models::{Config, MetaState, RoundStatus};
use crate::reason::{ReasonService, SweepReport};
use crate::rounds::RoundService;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TickReport {
    pub price_refreshed: bool,
    pub locked: bool,
    pub cancelled: bool,
    pub settled: bool,
    pub started: bool,
    pub sweep: SweepReport,
}

pub struct Advancer {
    store: Arc<Store>,
    cfg: Arc<Config>,
    feed: Arc<PriceFeed>,
    rounds: Arc<RoundService>,
    reason: Arc<ReasonService>,
    tick_gate: Mutex<()>,
}

impl Advancer {
    pub fn new(
        store: Arc<Store>,
        cfg: Arc<Config>,
        feed: Arc<PriceFeed>,
        rounds: Arc<RoundService>,
        reason: Arc<ReasonService>,
    ) -> Self {
        Self {
            store,
            cfg,
            feed,
            rounds,
            reason,
            tick_gate: Mutex::new(()),
        }
    }

    /// One full reconciliation pass.
    pub async fn tick(&self, now_ms: i64) -> Result<TickReport> {
        let _serialized = self.tick_gate.lock().await;
        let mut report = TickReport::default();

        let mut meta = self.store.load_meta()?;
        report.price_refreshed = self.refresh_price(&mut meta, now_ms);

        if let Some(round) = self.store.live_round()? {
            if round.status == RoundStatus::Betting
                && now_ms >= round.lock_time(self.cfg.lock_window_min)
            {
                if self.store.count_judgments_for_round(&round.round_id)? == 0 {
                    self.rounds.cancel_round(&round)?;
                    report.cancelled = true;
                } else {
                    self.rounds.lock_round(&round)?;
                    report.locked = true;
                }
            }
        }

        if let Some(round) = self.store.live_round()? {
            if round.status == RoundStatus::Locked && now_ms >= round.end_time {
                report.settled = self
                    .rounds
                    .settle_round(&round, &meta, now_ms)?
                    .is_some();
            }
        }

        if self.store.live_round()?.is_none() {
            report.started = self.rounds.start_round(&meta, now_ms)?.is_some();
        }

        self.store.save_meta(&meta)?;

        report.sweep = self.reason.sweep_pending(now_ms).await?;

        debug!(?report, "advancer tick complete");
        Ok(report)
    }

    /// Pull a fresh price into meta when the refresh window elapsed, refusing
    /// stale feed samples.
    fn refresh_price(&self, meta: &mut MetaState, now_ms: i64) -> bool {
        let due = meta
            .last_price_at
            .map_or(true, |at| now_ms - at >= self.cfg.price_refresh_ms);
        if !due {
            return false;
        }

        let Some(sample) = self.feed.price() else {
            return false;
        };
        if now_ms - sample.updated_at >= self.cfg.price_stale_ms {
            debug!(
                age_ms = now_ms - sample.updated_at,
                "feed sample too stale, keeping previous meta price"
            );
            return false;
        }

        if let (Some(prev), true) = (meta.current_price, sample.price > 0.0) {
            if prev > 0.0 {
                meta.last_delta_pct = Some((sample.price - prev) / prev * 100.0);
            }
        }
        meta.last_price = meta.current_price;
        meta.current_price = Some(sample.price);
        meta.last_price_at = Some(now_ms);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Retention;
    use crate::klines::KlineClient;
    use crate::models::{
        Agent, AgentStatus, Direction, Judgment, ReasonRule, Timeframe,
    };

    const MIN: i64 = 60_000;

    fn harness() -> (Arc<Store>, Advancer) {
        let cfg = Arc::new(Config {
            database_path: ":memory:".into(),
            port: 0,
            round_duration_min: 30,
            lock_window_min: 10,
            flat_threshold_pct: 0.2,
            price_refresh_ms: 10_000,
            price_stale_ms: 30_000,
            signature_window_sec: 300,
            admin_api_token: None,
            feed_limit: 200,
            verdict_limit: 200,
            judgment_limit: 800,
            round_limit: 200,
            score_event_limit: 1000,
            ws_url: String::new(),
            feed_mode: "allMids".into(),
            coin: "BTC".into(),
            info_url: "http://localhost:1".into(),
            kline_default_intervals: vec![Timeframe::M1],
            kline_default_limit: 200,
            kline_max_limit: 500,
            kline_cache_sec: 15,
            advance_interval_ms: 5_000,
        });
        let store = Arc::new(Store::open_in_memory(Retention::default()).unwrap());
        let feed = PriceFeed::new(cfg.ws_url.clone(), cfg.feed_mode.clone(), cfg.coin.clone());
        let klines = Arc::new(
            KlineClient::new(cfg.info_url.clone(), cfg.coin.clone(), cfg.kline_cache_sec).unwrap(),
        );
        let rounds = Arc::new(RoundService::new(store.clone(), cfg.clone()));
        let reason = Arc::new(ReasonService::new(
            store.clone(),
            klines,
            cfg.flat_threshold_pct,
        ));
        let advancer = Advancer::new(store.clone(), cfg, feed, rounds, reason);
        (store, advancer)
    }

    fn seed_agent(store: &Store) {
        store
            .insert_agent(&Agent {
                id: "alpha".into(),
                name: "alpha".into(),
                persona: String::new(),
                prompt: String::new(),
                score: 0,
                status: AgentStatus::Active,
                secret: "secret".into(),
                claim_token: "token".into(),
                verification_code: "000000".into(),
                claimed_at: Some(0),
                created_at: 0,
            })
            .unwrap();
    }

    /// Meta primed so the refresh window is quiet and the price is usable.
    fn prime_meta(store: &Store, now_ms: i64, price: f64) {
        store
            .save_meta(&MetaState {
                last_price: None,
                current_price: Some(price),
                last_delta_pct: None,
                last_price_at: Some(now_ms),
            })
            .unwrap();
    }

    /// Judgment whose reason horizon is far in the future, so the sweep stays
    /// out of the picture.
    fn far_judgment(round_id: &str) -> Judgment {
        Judgment {
            round_id: round_id.to_string(),
            agent_id: "alpha".to_string(),
            direction: Direction::Up,
            confidence: 70,
            comment: "test".to_string(),
            timestamp: 1,
            intervals: vec![Timeframe::D1],
            analysis_start_time: 0,
            analysis_end_time: 1,
            reason_rule: ReasonRule {
                timeframe: Timeframe::D1,
                pattern: "candle.doji.v1".to_string(),
                direction: Direction::Up,
                horizon_bars: 200,
            },
            reason_t_close_ms: Some(0),
            reason_target_close_ms: Some(i64::MAX / 2),
            reason_base_close: Some(100.0),
            reason_pattern_holds: Some(false),
            reason_target_close: None,
            reason_delta_pct: None,
            reason_outcome: None,
            reason_correct: None,
            reason_evaluated_at: None,
            reason_eval_error: None,
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle_with_submission() {
        let (store, advancer) = harness();
        seed_agent(&store);
        prime_meta(&store, 0, 100.0);

        // T0: a round starts.
        let report = advancer.tick(0).await.unwrap();
        assert!(report.started);
        let round = store.live_round().unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Betting);

        // One judgment lands during the betting window.
        store.replace_judgment(&far_judgment(&round.round_id)).unwrap();

        // T0+10m: locked, not cancelled.
        prime_meta(&store, 10 * MIN, 100.0);
        let report = advancer.tick(10 * MIN).await.unwrap();
        assert!(report.locked && !report.cancelled);
        assert_eq!(
            store.live_round().unwrap().unwrap().status,
            RoundStatus::Locked
        );

        // T0+30m: settled, and the next round opens in the same tick.
        prime_meta(&store, 30 * MIN, 101.0);
        let report = advancer.tick(30 * MIN).await.unwrap();
        assert!(report.settled && report.started);

        let settled = store.get_round(&round.round_id).unwrap().unwrap();
        assert_eq!(settled.status, RoundStatus::Settled);
        assert_eq!(settled.end_price, Some(101.0));
        assert_eq!(store.get_agent("alpha").unwrap().unwrap().score, 70);

        let next = store.live_round().unwrap().unwrap();
        assert_ne!(next.round_id, round.round_id);
        assert_eq!(next.status, RoundStatus::Betting);
    }

    #[tokio::test]
    async fn test_empty_round_cancelled_and_replaced() {
        let (store, advancer) = harness();
        seed_agent(&store);
        prime_meta(&store, 0, 100.0);

        advancer.tick(0).await.unwrap();
        let first = store.live_round().unwrap().unwrap();

        // No judgments by lock time: cancel, then a fresh round starts.
        prime_meta(&store, 10 * MIN, 100.0);
        let report = advancer.tick(10 * MIN).await.unwrap();
        assert!(report.cancelled && report.started && !report.locked);

        assert!(store.get_round(&first.round_id).unwrap().is_none());
        let fresh = store.live_round().unwrap().unwrap();
        assert_ne!(fresh.round_id, first.round_id);
        assert_eq!(fresh.start_time, 10 * MIN);
    }

    #[tokio::test]
    async fn test_tick_without_agents_starts_nothing() {
        let (store, advancer) = harness();
        prime_meta(&store, 0, 100.0);

        let report = advancer.tick(0).await.unwrap();
        assert!(!report.started);
        assert!(store.live_round().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tick_is_idempotent_between_deadlines() {
        let (store, advancer) = harness();
        seed_agent(&store);
        prime_meta(&store, 0, 100.0);

        advancer.tick(0).await.unwrap();
        let round = store.live_round().unwrap().unwrap();

        // Re-ticking before the lock deadline changes nothing.
        let report = advancer.tick(MIN).await.unwrap();
        assert!(!report.started && !report.locked && !report.cancelled && !report.settled);
        assert_eq!(store.live_round().unwrap().unwrap().round_id, round.round_id);
    }

    #[tokio::test]
    async fn test_no_feed_sample_keeps_meta() {
        let (store, advancer) = harness();
        seed_agent(&store);
        // Stale refresh window, but the feed has no sample: price stays unset
        // and no round can start.
        let report = advancer.tick(0).await.unwrap();
        assert!(!report.price_refreshed && !report.started);
        assert_eq!(store.load_meta().unwrap().current_price, None);
    }
}

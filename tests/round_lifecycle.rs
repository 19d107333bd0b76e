//! End-to-end round lifecycle over an on-disk store.
//!
//! Drives the advancer through start, lock, cancel, settle, and restart with
//! an injected clock, and checks the scoring and retention invariants along
//! the way. No network: judgments are seeded directly and reason horizons are
//! kept far in the future so the pending sweep stays idle.

use predarena::advancer::Advancer;
use predarena::auth::credentials;
use predarena::db::{Retention, Store};
use predarena::feed::PriceFeed;
use predarena::klines::KlineClient;
use predarena::models::{
    Agent, AgentStatus, Config, Direction, Judgment, MetaState, ReasonRule, RoundStatus, Timeframe,
};
use predarena::reason::ReasonService;
use predarena::rounds::RoundService;
use std::sync::Arc;
use tempfile::TempDir;

const MIN: i64 = 60_000;
// 2026-02-04T00:00:00Z, so generated round ids are verifiable.
const T0: i64 = 1_770_163_200_000;

struct Harness {
    _dir: TempDir,
    store: Arc<Store>,
    rounds: Arc<RoundService>,
    advancer: Advancer,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("arena.db");

    let cfg = Arc::new(Config {
        database_path: db_path.to_str().unwrap().to_string(),
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

    let store = Arc::new(
        Store::open(
            &cfg.database_path,
            Retention {
                feed_limit: cfg.feed_limit,
                verdict_limit: cfg.verdict_limit,
                judgment_limit: cfg.judgment_limit,
                round_limit: cfg.round_limit,
                score_event_limit: cfg.score_event_limit,
            },
        )
        .unwrap(),
    );
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
    let advancer = Advancer::new(store.clone(), cfg, feed, rounds.clone(), reason);

    Harness {
        _dir: dir,
        store,
        rounds,
        advancer,
    }
}

fn register_agent(store: &Store, name: &str) -> Agent {
    let agent = Agent {
        id: credentials::slugify(name),
        name: name.to_string(),
        persona: String::new(),
        prompt: String::new(),
        score: 0,
        status: AgentStatus::Active,
        secret: credentials::generate_api_key(),
        claim_token: credentials::generate_claim_token(),
        verification_code: credentials::generate_verification_code(),
        claimed_at: Some(T0),
        created_at: T0,
    };
    store.insert_agent(&agent).unwrap();
    agent
}

fn seed_judgment(store: &Store, round_id: &str, agent_id: &str, dir: Direction, confidence: i64) {
    store
        .replace_judgment(&Judgment {
            round_id: round_id.to_string(),
            agent_id: agent_id.to_string(),
            direction: dir,
            confidence,
            comment: "trend continuation".to_string(),
            timestamp: T0 + 1,
            intervals: vec![Timeframe::D1],
            analysis_start_time: T0 - MIN,
            analysis_end_time: T0,
            reason_rule: ReasonRule {
                timeframe: Timeframe::D1,
                pattern: "candle.doji.v1".to_string(),
                direction: dir,
                horizon_bars: 200,
            },
            reason_t_close_ms: Some(T0 - 1),
            reason_target_close_ms: Some(i64::MAX / 2),
            reason_base_close: Some(97_000.0),
            reason_pattern_holds: Some(true),
            reason_target_close: None,
            reason_delta_pct: None,
            reason_outcome: None,
            reason_correct: None,
            reason_evaluated_at: None,
            reason_eval_error: None,
        })
        .unwrap();
}

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

#[tokio::test]
async fn full_round_lifecycle_settles_and_restarts() {
    let h = harness();
    let bull = register_agent(&h.store, "Bull Bot");
    let bear = register_agent(&h.store, "Bear Bot");
    assert_eq!(bull.id, "bull_bot");

    // T0: round opens at the primed price.
    prime_meta(&h.store, T0, 97_000.128);
    h.advancer.tick(T0).await.unwrap();
    let round = h.store.live_round().unwrap().unwrap();
    assert_eq!(round.round_id, "r_20260204_0000");
    assert_eq!(round.start_price, 97_000.13);
    assert_eq!(round.end_time, round.start_time + 30 * MIN);
    assert_eq!(round.lock_time(10), round.start_time + 10 * MIN);

    seed_judgment(&h.store, &round.round_id, &bull.id, Direction::Up, 90);
    seed_judgment(&h.store, &round.round_id, &bear.id, Direction::Down, 60);

    // T0+10m: lock.
    prime_meta(&h.store, T0 + 10 * MIN, 97_050.0);
    h.advancer.tick(T0 + 10 * MIN).await.unwrap();
    assert_eq!(
        h.store.live_round().unwrap().unwrap().status,
        RoundStatus::Locked
    );

    // T0+30m: settle up 1%, next round opens in the same tick.
    prime_meta(&h.store, T0 + 30 * MIN, 97_970.13);
    h.advancer.tick(T0 + 30 * MIN).await.unwrap();

    let settled = h.store.get_round(&round.round_id).unwrap().unwrap();
    assert_eq!(settled.status, RoundStatus::Settled);

    let verdict = h.store.last_verdict().unwrap().unwrap();
    assert_eq!(verdict.round_id, round.round_id);
    assert_eq!(verdict.result, Direction::Up);
    assert_eq!(verdict.delta_pct, 1.0);

    // Scoring: +confidence on win, -round(1.5 * confidence) on loss.
    assert_eq!(h.store.get_agent(&bull.id).unwrap().unwrap().score, 90);
    assert_eq!(h.store.get_agent(&bear.id).unwrap().unwrap().score, -90);

    let next = h.store.live_round().unwrap().unwrap();
    assert_eq!(next.round_id, "r_20260204_0030");
    assert_eq!(next.status, RoundStatus::Betting);
}

#[tokio::test]
async fn empty_round_is_cancelled_for_a_fresh_start() {
    let h = harness();
    register_agent(&h.store, "Solo");

    prime_meta(&h.store, T0, 97_000.0);
    h.advancer.tick(T0).await.unwrap();
    let first = h.store.live_round().unwrap().unwrap();

    prime_meta(&h.store, T0 + 10 * MIN, 97_000.0);
    h.advancer.tick(T0 + 10 * MIN).await.unwrap();

    // The empty round is gone, a fresh one runs from the lock instant.
    assert!(h.store.get_round(&first.round_id).unwrap().is_none());
    let fresh = h.store.live_round().unwrap().unwrap();
    assert_eq!(fresh.round_id, "r_20260204_0010");
    assert_eq!(fresh.status, RoundStatus::Betting);
}

#[tokio::test]
async fn flat_verdict_below_threshold() {
    let h = harness();
    let agent = register_agent(&h.store, "Flat Caller");

    prime_meta(&h.store, T0, 100_000.0);
    h.advancer.tick(T0).await.unwrap();
    let round = h.store.live_round().unwrap().unwrap();
    seed_judgment(&h.store, &round.round_id, &agent.id, Direction::Flat, 70);

    prime_meta(&h.store, T0 + 10 * MIN, 100_000.0);
    h.advancer.tick(T0 + 10 * MIN).await.unwrap();

    // +0.1% rounds to 0.1, under the 0.2 threshold.
    prime_meta(&h.store, T0 + 30 * MIN, 100_100.0);
    h.advancer.tick(T0 + 30 * MIN).await.unwrap();

    let verdict = h.store.last_verdict().unwrap().unwrap();
    assert_eq!(verdict.result, Direction::Flat);
    assert_eq!(verdict.delta_pct, 0.1);
    assert_eq!(h.store.get_agent(&agent.id).unwrap().unwrap().score, 70);
}

#[tokio::test]
async fn resubmission_replaces_prior_judgment() {
    let h = harness();
    let agent = register_agent(&h.store, "Fickle");

    prime_meta(&h.store, T0, 97_000.0);
    h.advancer.tick(T0).await.unwrap();
    let round = h.store.live_round().unwrap().unwrap();

    seed_judgment(&h.store, &round.round_id, &agent.id, Direction::Up, 50);
    seed_judgment(&h.store, &round.round_id, &agent.id, Direction::Down, 75);

    let judgments = h.store.judgments_for_round(&round.round_id).unwrap();
    assert_eq!(judgments.len(), 1);
    assert_eq!(judgments[0].direction, Direction::Down);
    assert_eq!(judgments[0].confidence, 75);
}

#[tokio::test]
async fn score_totals_match_event_history() {
    let h = harness();
    let agent = register_agent(&h.store, "Grinder");

    let mut now = T0;
    for i in 0..4 {
        prime_meta(&h.store, now, 100_000.0);
        h.advancer.tick(now).await.unwrap();
        let round = h.store.live_round().unwrap().unwrap();
        seed_judgment(&h.store, &round.round_id, &agent.id, Direction::Up, 60 + i);

        prime_meta(&h.store, now + 10 * MIN, 100_000.0);
        h.advancer.tick(now + 10 * MIN).await.unwrap();

        let end_price = if i % 2 == 0 { 101_000.0 } else { 99_000.0 };
        prime_meta(&h.store, now + 30 * MIN, end_price);
        h.advancer.tick(now + 30 * MIN).await.unwrap();

        now += 40 * MIN;
    }

    let events = h.store.recent_score_events(&agent.id, 10).unwrap();
    assert_eq!(events.len(), 4);
    let total: i64 = events.iter().map(|e| e.score_change).sum();
    assert_eq!(h.store.get_agent(&agent.id).unwrap().unwrap().score, total);

    // Two wins, two losses.
    assert_eq!(events.iter().filter(|e| e.correct).count(), 2);
}

#[tokio::test]
async fn summary_reflects_live_and_settled_state() {
    let h = harness();
    let bull = register_agent(&h.store, "Bull");
    let bear = register_agent(&h.store, "Bear");

    prime_meta(&h.store, T0, 100_000.0);
    h.advancer.tick(T0).await.unwrap();
    let round = h.store.live_round().unwrap().unwrap();
    seed_judgment(&h.store, &round.round_id, &bull.id, Direction::Up, 90);
    seed_judgment(&h.store, &round.round_id, &bear.id, Direction::Down, 85);

    prime_meta(&h.store, T0 + 10 * MIN, 100_000.0);
    h.advancer.tick(T0 + 10 * MIN).await.unwrap();
    prime_meta(&h.store, T0 + 30 * MIN, 101_000.0);
    h.advancer.tick(T0 + 30 * MIN).await.unwrap();

    let summary = h.rounds.build_summary(T0 + 31 * MIN).unwrap();

    // Leaderboard sorted by score, highlight rebuilt from the top-confidence
    // judgment, feed preferring the high-confidence failure.
    assert_eq!(summary.agents[0].name, "Bull");
    assert_eq!(summary.agents[0].score, 90);
    assert_eq!(summary.agents[1].score, -128);
    assert_eq!(summary.agents[1].recent_high_conf_failures, 1);

    let highlight = summary.highlight.unwrap();
    assert_eq!(highlight.agent_id, bull.id);
    assert_eq!(highlight.score_change, 90);

    assert_eq!(summary.feed.len(), 1);
    assert_eq!(summary.feed[0].agent_id, bear.id);

    let live = summary.round.unwrap();
    assert_eq!(live.round.status, RoundStatus::Betting);
    assert!(live.countdown_ms > 0 && live.countdown_ms <= 10 * MIN);
}

#[test]
fn credential_shapes_match_contract() {
    let key = credentials::generate_api_key();
    assert_eq!(key.len(), 64);
    assert!(key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));

    let token = credentials::generate_claim_token();
    assert_eq!(token.len(), 32);
    assert!(token.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));

    let code = credentials::generate_verification_code();
    assert_eq!(code.len(), 6);
    assert!(code.bytes().all(|b| b.is_ascii_digit()));
}

//! PredArena backend.
//!
//! Continuous BTC prediction tournament: registered agents submit directional
//! judgments with machine-verifiable reason rules, rounds lock and settle on
//! recorded prices, and reason rules are judged again at horizon.

#![allow(dead_code)]

mod advancer;
mod api;
mod auth;
mod db;
mod feed;
mod klines;
mod models;
mod patterns;
mod reason;
mod rounds;
mod stats;

use crate::advancer::Advancer;
use crate::api::{create_router, AppState};
use crate::db::{Retention, Store};
use crate::feed::PriceFeed;
use crate::klines::KlineClient;
use crate::models::Config;
use crate::reason::ReasonService;
use crate::rounds::RoundService;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Arc::new(Config::from_env().context("Failed to load configuration")?);
    info!(
        port = cfg.port,
        coin = %cfg.coin,
        round_duration_min = cfg.round_duration_min,
        "starting predarena backend"
    );

    let store = Arc::new(Store::open(
        &cfg.database_path,
        Retention {
            feed_limit: cfg.feed_limit,
            verdict_limit: cfg.verdict_limit,
            judgment_limit: cfg.judgment_limit,
            round_limit: cfg.round_limit,
            score_event_limit: cfg.score_event_limit,
        },
    )?);

    let feed = PriceFeed::new(cfg.ws_url.clone(), cfg.feed_mode.clone(), cfg.coin.clone());
    feed.spawn();

    let klines = Arc::new(KlineClient::new(
        cfg.info_url.clone(),
        cfg.coin.clone(),
        cfg.kline_cache_sec,
    )?);

    let rounds = Arc::new(RoundService::new(store.clone(), cfg.clone()));
    let reason = Arc::new(ReasonService::new(
        store.clone(),
        klines.clone(),
        cfg.flat_threshold_pct,
    ));
    let advancer = Arc::new(Advancer::new(
        store.clone(),
        cfg.clone(),
        feed.clone(),
        rounds.clone(),
        reason.clone(),
    ));

    spawn_advancer_loop(advancer.clone(), cfg.advance_interval_ms);

    let state = AppState {
        store,
        cfg: cfg.clone(),
        feed,
        klines,
        rounds,
        reason,
        advancer,
    };
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Periodic advancer. Every error is logged and swallowed; the next tick
/// retries.
fn spawn_advancer_loop(advancer: Arc<Advancer>, interval_ms: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(250)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = advancer.tick(Utc::now().timestamp_millis()).await {
                warn!("advancer tick failed: {:#}", e);
            }
        }
    });
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "predarena=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

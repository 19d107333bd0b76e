//! Router assembly and shared application state.

use crate::advancer::Advancer;
use crate::db::Store;
use crate::feed::PriceFeed;
use crate::klines::KlineClient;
use crate::models::Config;
use crate::reason::ReasonService;
use crate::rounds::RoundService;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use super::{agents, handlers};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub cfg: Arc<Config>,
    pub feed: Arc<PriceFeed>,
    pub klines: Arc<KlineClient>,
    pub rounds: Arc<RoundService>,
    pub reason: Arc<ReasonService>,
    pub advancer: Arc<Advancer>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/summary", get(handlers::summary))
        .route("/api/advance", post(handlers::advance))
        .route("/api/klines", get(handlers::klines))
        .route("/api/reason-stats", get(handlers::reason_stats))
        .route(
            "/api/agents/:id/reason-stats",
            get(handlers::agent_reason_stats),
        )
        .route(
            "/api/diagnostics/hyperliquid",
            get(handlers::feed_diagnostics),
        )
        .route("/api/v1/agents/register", post(agents::register))
        .route("/claim/:token", get(agents::claim))
        .route("/api/v1/agents/status", get(agents::status))
        .route("/api/v1/agents/me", get(agents::me))
        .route("/api/v1/judgments", post(agents::submit_judgment))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

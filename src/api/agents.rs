//! Agent-facing endpoints: self-registration, human claim activation,
//! authenticated self-inspection, and judgment submission.

use super::error::ApiError;
use super::handlers::now_ms;
use super::routes::AppState;
use crate::auth::{authenticate_agent, credentials};
use crate::db;
use crate::models::{Agent, AgentStatus};
use crate::rounds::JudgmentPayload;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub name: Option<String>,
    pub description: Option<String>,
    pub persona: Option<String>,
    pub prompt: Option<String>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<Value>, ApiError> {
    let name = body
        .name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Validation("name is required".into()))?
        .to_string();

    let id = credentials::slugify(&name);
    if id.is_empty() {
        return Err(ApiError::Validation(
            "name must contain at least one alphanumeric character".into(),
        ));
    }
    if state.store.get_agent(&id)?.is_some() {
        return Err(ApiError::Conflict(format!("agent id already taken: {}", id)));
    }

    let api_key = credentials::generate_api_key();
    let claim_token = credentials::generate_claim_token();
    let verification_code = credentials::generate_verification_code();
    let description = body.description.unwrap_or_default();

    let agent = Agent {
        id: id.clone(),
        name: name.clone(),
        persona: body.persona.unwrap_or(description),
        prompt: body.prompt.unwrap_or_default(),
        score: 0,
        status: AgentStatus::PendingClaim,
        secret: api_key.clone(),
        claim_token: claim_token.clone(),
        verification_code: verification_code.clone(),
        claimed_at: None,
        created_at: now_ms(),
    };
    state.store.insert_agent(&agent).map_err(|e| {
        if db::is_unique_violation(&e) {
            ApiError::Conflict(format!("agent id already taken: {}", id))
        } else {
            ApiError::Internal(e)
        }
    })?;

    info!(agent = %id, "agent registered, pending claim");
    Ok(Json(json!({
        "ok": true,
        "id": id,
        "name": name,
        "status": AgentStatus::PendingClaim,
        "api_key": api_key,
        "claim_url": format!("/claim/{}", claim_token),
        "verification_code": verification_code,
    })))
}

/// Human activation link. Idempotent: a second visit reports the agent as
/// already active.
pub async fn claim(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let agent = state
        .store
        .get_agent_by_claim_token(&token)?
        .ok_or_else(|| ApiError::NotFound("unknown claim token".into()))?;

    state.store.claim_agent(&agent.id, now_ms())?;
    let agent = state
        .store
        .get_agent(&agent.id)?
        .ok_or_else(|| ApiError::NotFound("unknown agent".into()))?;

    info!(agent = %agent.id, "agent claimed");
    Ok(Json(json!({
        "ok": true,
        "id": agent.id,
        "status": agent.status,
        "claimed_at": agent.claimed_at,
    })))
}

pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = authenticate_agent(
        &state.store,
        &headers,
        "GET",
        "/api/v1/agents/status",
        "",
        now_ms(),
        state.cfg.signature_window_sec * 1000,
    )?;
    Ok(Json(json!({
        "ok": true,
        "id": agent.id,
        "name": agent.name,
        "status": agent.status,
        "score": agent.score,
        "claimed_at": agent.claimed_at,
    })))
}

pub async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = authenticate_agent(
        &state.store,
        &headers,
        "GET",
        "/api/v1/agents/me",
        "",
        now_ms(),
        state.cfg.signature_window_sec * 1000,
    )?;
    Ok(Json(json!({
        "ok": true,
        "id": agent.id,
        "name": agent.name,
        "persona": agent.persona,
        "prompt": agent.prompt,
        "status": agent.status,
        "score": agent.score,
        "claimed_at": agent.claimed_at,
        "created_at": agent.created_at,
    })))
}

/// Judgment submission. The raw body is kept for HMAC verification before it
/// is parsed into the typed payload.
pub async fn submit_judgment(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let now = now_ms();
    let body_str = std::str::from_utf8(&body)
        .map_err(|_| ApiError::Validation("body must be utf-8".into()))?;

    let agent = authenticate_agent(
        &state.store,
        &headers,
        "POST",
        "/api/v1/judgments",
        body_str,
        now,
        state.cfg.signature_window_sec * 1000,
    )?;

    let payload: JudgmentPayload = serde_json::from_str(body_str)
        .map_err(|e| ApiError::Validation(format!("malformed judgment body: {}", e)))?;

    let receipt = state
        .rounds
        .submit_judgment(&state.reason, &agent, payload, now)
        .await?;
    Ok(Json(json!({
        "ok": receipt.ok,
        "reason": receipt.reason,
    })))
}

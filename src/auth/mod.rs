//! Agent authentication.
//!
//! Two channels resolve a caller to an agent row: a bearer API key matched
//! exactly against `agents.secret`, and an HMAC-signed request (agent id,
//! timestamp, signature headers) for machine callers. Both end at the same
//! [`AuthError`] taxonomy.

pub mod bearer;
pub mod credentials;
pub mod hmac;

use crate::db::Store;
use crate::models::{Agent, AgentStatus};
use axum::http::HeaderMap;
use std::fmt;

pub const AGENT_ID_HEADER: &str = "x-agent-id";
pub const TIMESTAMP_HEADER: &str = "x-ts";
pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingCredentials,
    InvalidToken,
    InvalidSignature,
    StaleSignature,
    InactiveAgent,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingCredentials => write!(f, "missing credentials"),
            AuthError::InvalidToken => write!(f, "invalid bearer token"),
            AuthError::InvalidSignature => write!(f, "invalid signature"),
            AuthError::StaleSignature => write!(f, "signature timestamp outside allowed window"),
            AuthError::InactiveAgent => write!(f, "agent is not active"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Resolve the calling agent from either auth channel. The bearer header
/// wins when both are present.
pub fn authenticate_agent(
    store: &Store,
    headers: &HeaderMap,
    method: &str,
    path: &str,
    body: &str,
    now_ms: i64,
    signature_window_ms: i64,
) -> Result<Agent, AuthError> {
    if let Some(token) = bearer::bearer_token(headers) {
        let agent = store
            .get_agent_by_secret(&token)
            .map_err(|_| AuthError::InvalidToken)?
            .ok_or(AuthError::InvalidToken)?;
        return require_active(agent);
    }

    let agent_id = header_str(headers, AGENT_ID_HEADER);
    let ts = header_str(headers, TIMESTAMP_HEADER);
    let signature = header_str(headers, SIGNATURE_HEADER);
    if let (Some(agent_id), Some(ts), Some(signature)) = (agent_id, ts, signature) {
        let ts_ms: i64 = ts.parse().map_err(|_| AuthError::InvalidSignature)?;
        let agent = store
            .get_agent(&agent_id)
            .map_err(|_| AuthError::InvalidSignature)?
            .ok_or(AuthError::InvalidSignature)?;
        hmac::verify_signed_request(
            &agent.secret,
            ts_ms,
            method,
            path,
            body,
            &signature,
            now_ms,
            signature_window_ms,
        )?;
        return require_active(agent);
    }

    Err(AuthError::MissingCredentials)
}

fn require_active(agent: Agent) -> Result<Agent, AuthError> {
    if agent.status != AgentStatus::Active {
        return Err(AuthError::InactiveAgent);
    }
    Ok(agent)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

//! Request orchestrator (C8, §4.8).
//!
//! Wires the `/v1/messages` surface (plus the `count_tokens`/`models` helper
//! endpoints SPEC_FULL.md adds) to the account pool, token manager, upstream
//! client, and translation layers. This is the only place in the crate that
//! turns a [`crate::error::GatewayError`] into bytes on the wire.

pub mod messages;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{Mutex, RwLock};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::pool::AccountPool;
use crate::store::prompt_log::PromptLog;
use crate::token::TokenManager;
use crate::upstream::UpstreamClient;

/// Shared application state (§2 "Orchestrator" row). Cloned per-request by
/// axum's `State` extractor — cheap, since every field is already an `Arc`
/// or an internally-synchronized type.
pub struct AppStateInner {
    pub config: GatewayConfig,
    pub pool: AccountPool,
    pub upstream: UpstreamClient,
    pub http: reqwest::Client,
    pub prompt_log: PromptLog,
    /// Lazily-loaded per-account token managers, keyed by account id.
    pub tokens: RwLock<HashMap<String, Arc<TokenManager>>>,
    /// Last system prompt seen from a client, for the write-back file.
    pub last_system_prompt: RwLock<Option<String>>,
    /// Account ids with a health check currently running, so the single-
    /// account and bulk endpoints never probe the same account at once (§4.6).
    pub health_check_inflight: Mutex<HashSet<String>>,
}

pub type AppState = Arc<AppStateInner>;

/// Shared-secret auth (§6): accepts either `Authorization: Bearer <key>` or
/// `x-api-key: <key>`.
pub fn check_auth(headers: &HeaderMap, required_key: &str) -> Result<(), GatewayError> {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    if bearer == Some(required_key) || api_key == Some(required_key) {
        Ok(())
    } else {
        Err(GatewayError::Unauthorized)
    }
}

/// Load (or fetch from cache) the [`TokenManager`] for an account's
/// credentials file.
pub async fn token_for(
    state: &AppStateInner,
    account_id: &str,
    credentials_ref: &str,
) -> Result<Arc<TokenManager>, crate::error::TokenError> {
    if let Some(existing) = state.tokens.read().await.get(account_id) {
        return Ok(existing.clone());
    }

    let path = std::path::PathBuf::from(credentials_ref);
    let manager = TokenManager::load(path, state.http.clone()).await?;
    state.tokens.write().await.insert(account_id.to_string(), manager.clone());
    Ok(manager)
}

async fn healthz() -> &'static str {
    "ok"
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages::handle_messages))
        .route("/v1/messages/count_tokens", post(messages::handle_count_tokens))
        .route("/v1/models", get(messages::handle_list_models))
        .route("/healthz", get(healthz))
        .with_state(state)
}

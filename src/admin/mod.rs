//! Admin CRUD surface (C9, §4.9).
//!
//! Same shared-secret auth as C8, exposed under `/api/*` for operator
//! tooling: account lifecycle, health checks, usage queries, and the
//! device-code bootstrap's first leg.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::error::{GatewayError, UpstreamError};
use crate::orchestrator::{check_auth, token_for, AppState, AppStateInner};
use crate::store::{AuthDialect, StoredAccount, UsageCacheEntry};
use crate::translate::{ClaudeMessage, ClaudeRequest, MessageContent};

const USAGE_CACHE_TTL_MS: i64 = 5 * 60 * 1000;
const USAGE_PROVIDER_TYPE: &str = "codewhisperer";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/accounts", get(list_accounts).post(create_account))
        .route("/api/accounts/batch-delete", post(batch_delete))
        .route("/api/accounts/cleanup-duplicates", post(cleanup_duplicates))
        .route("/api/accounts/health-check", post(health_check_all))
        .route("/api/accounts/reset-health", post(reset_health_all))
        .route("/api/accounts/generate-auth-url", post(generate_auth_url))
        .route("/api/accounts/:id", delete(delete_account))
        .route("/api/accounts/:id/toggle", post(toggle_account))
        .route("/api/accounts/:id/health-check", post(health_check_one))
        .route("/api/usage", get(get_usage_all))
        .route("/api/usage/:id", get(get_usage_one))
        .with_state(state)
}

fn account_to_json(a: &StoredAccount) -> Value {
    let status = if a.disabled {
        "disabled"
    } else if a.healthy {
        "healthy"
    } else {
        "banned"
    };
    json!({
        "id": a.id,
        "auth_dialect": a.auth_dialect,
        "region": a.region,
        "status": status,
        "healthy": a.healthy,
        "disabled": a.disabled,
        "error_count": a.error_count,
        "usage_count": a.usage_count,
        "cached_email": a.cached_email,
        "cached_user_id": a.cached_user_id,
        "not_supported_models": a.not_supported_models,
        "last_used": a.last_used,
        "last_error_time": a.last_error_time,
        "last_error_message": a.last_error_message,
        "last_health_check_time": a.last_health_check_time,
        "last_health_check_model": a.last_health_check_model,
    })
}

async fn list_accounts(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    let accounts = state.pool.list_accounts().await;
    let (mut healthy, mut banned, mut disabled) = (0u32, 0u32, 0u32);
    for a in &accounts {
        if a.disabled {
            disabled += 1;
        } else if a.healthy {
            healthy += 1;
        } else {
            banned += 1;
        }
    }
    let items: Vec<Value> = accounts.iter().map(account_to_json).collect();
    Json(json!({
        "accounts": items,
        "counts": { "total": accounts.len(), "healthy": healthy, "banned": banned, "disabled": disabled },
    }))
    .into_response()
}

#[derive(Deserialize)]
struct CreateAccountRequest {
    id: String,
    auth_dialect: AuthDialect,
    credentials_ref: String,
    region: String,
}

async fn create_account(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<CreateAccountRequest>) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    let account = StoredAccount::new(req.id, req.auth_dialect, req.credentials_ref, req.region);
    match state.pool.add(account.clone()).await {
        Ok(()) => Json(account_to_json(&account)).into_response(),
        Err(e) => GatewayError::Store(e).into_response(),
    }
}

async fn delete_account(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    match state.pool.remove(&id).await {
        Ok(()) => Json(json!({ "deleted": id })).into_response(),
        Err(e) => GatewayError::Store(e).into_response(),
    }
}

async fn toggle_account(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    let Some(account) = state.pool.get(&id).await else {
        return GatewayError::Store(crate::error::StoreError::NotFound(id)).into_response();
    };
    match state.pool.set_disabled(&id, !account.disabled).await {
        Ok(()) => Json(json!({ "id": id, "disabled": !account.disabled })).into_response(),
        Err(e) => GatewayError::Store(e).into_response(),
    }
}

#[derive(Deserialize)]
struct BatchDeleteRequest {
    ids: Vec<String>,
}

async fn batch_delete(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<BatchDeleteRequest>) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    let mut deleted = Vec::new();
    for id in req.ids {
        if state.pool.remove(&id).await.is_ok() {
            deleted.push(id);
        }
    }
    Json(json!({ "deleted": deleted })).into_response()
}

#[derive(Deserialize, Default)]
struct DryRunQuery {
    #[serde(default)]
    dry_run: bool,
}

/// Groups accounts by `cached_user_id`; within each group with more than one
/// member, keeps the lowest id and deletes the rest (§4.9).
async fn cleanup_duplicates(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<DryRunQuery>) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    let mut accounts = state.pool.list_accounts().await;
    accounts.sort_by(|a, b| a.id.cmp(&b.id));

    let mut by_user: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
    for a in &accounts {
        if let Some(uid) = &a.cached_user_id {
            by_user.entry(uid.clone()).or_default().push(a.id.clone());
        }
    }

    let mut to_delete = Vec::new();
    for ids in by_user.values() {
        if ids.len() > 1 {
            to_delete.extend(ids.iter().skip(1).cloned());
        }
    }

    if !q.dry_run {
        for id in &to_delete {
            state.pool.remove(id).await.ok();
        }
    }

    Json(json!({ "dry_run": q.dry_run, "removed": to_delete })).into_response()
}

/// Builds a minimal probe request and checks whether the backend accepts it.
async fn probe_account(state: &AppStateInner, account: &StoredAccount, probe_model: &str) -> Result<(), UpstreamError> {
    let token = token_for(state, &account.id, &account.credentials_ref).await?;
    token.ensure_fresh(true).await?;

    let probe_request = ClaudeRequest {
        model: probe_model.to_string(),
        messages: vec![ClaudeMessage { role: "user".into(), content: MessageContent::Text("ping".into()) }],
        system: None,
        tools: Vec::new(),
        stream: true,
        thinking: None,
    };
    let conversation_state = crate::translate::request::build_conversation_state(&probe_request);
    let region = token.region().await;
    state.upstream.call_streaming(&token, &region, probe_model, &conversation_state).await?;
    Ok(())
}

async fn run_health_check(state: &AppStateInner, account: &StoredAccount) -> Value {
    let probe_model = state.pool.probe_model().to_string();
    let result = probe_account(state, account, &probe_model).await;

    let (success, error_message) = match &result {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    };

    state
        .pool
        .record_health_check(&account.id, success, &probe_model, error_message.clone())
        .await
        .ok();

    match result {
        Ok(()) => {
            state.pool.mark_healthy(&account.id, false, Some(probe_model), None, None).await.ok();
        }
        Err(UpstreamError::Status { status, body }) => {
            state.pool.mark_unhealthy(&account.id, status, &body).await.ok();
        }
        Err(_) => {
            state.pool.mark_unhealthy(&account.id, 503, error_message.as_deref().unwrap_or("probe failed")).await.ok();
        }
    }

    json!({ "id": account.id, "success": success, "error": error_message })
}

/// Runs `run_health_check` unless this account already has a check in
/// flight, in which case it's skipped rather than queued (§4.6: never run
/// twice in parallel for the same account).
async fn run_health_check_guarded(state: &AppStateInner, account: &StoredAccount) -> Option<Value> {
    {
        let mut inflight = state.health_check_inflight.lock().await;
        if !inflight.insert(account.id.clone()) {
            return None;
        }
    }
    let result = run_health_check(state, account).await;
    state.health_check_inflight.lock().await.remove(&account.id);
    Some(result)
}

async fn health_check_one(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    let Some(account) = state.pool.get(&id).await else {
        return GatewayError::Store(crate::error::StoreError::NotFound(id)).into_response();
    };
    match run_health_check_guarded(&state, &account).await {
        Some(result) => Json(result).into_response(),
        None => Json(json!({ "id": account.id, "skipped": true, "reason": "health check already in progress" })).into_response(),
    }
}

async fn health_check_all(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    let accounts = state.pool.list_accounts().await;
    let semaphore = Arc::new(Semaphore::new(state.config.health_check_concurrency.max(1)));

    let mut handles = Vec::new();
    for account in accounts {
        let state = state.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            run_health_check_guarded(&state, &account).await
        }));
    }

    let mut results = Vec::new();
    for h in handles {
        if let Ok(Some(v)) = h.await {
            results.push(v);
        }
    }
    Json(json!({ "results": results })).into_response()
}

async fn reset_health_all(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    let accounts = state.pool.list_accounts().await;
    for account in &accounts {
        state.pool.mark_healthy(&account.id, false, None, None, None).await.ok();
    }
    Json(json!({ "reset": accounts.len() })).into_response()
}

async fn fetch_usage(state: &AppStateInner, account: &StoredAccount) -> Result<Value, UpstreamError> {
    let token = token_for(state, &account.id, &account.credentials_ref).await?;
    let region = token.region().await;
    let usage = state.upstream.get_usage(&token, &region).await?;

    let email = usage.get("email").and_then(Value::as_str).map(str::to_string);
    let user_id = usage.get("userId").and_then(Value::as_str).map(str::to_string);
    state.pool.update_cached_identity(&account.id, email, user_id).await.ok();

    Ok(usage)
}

/// Cached-or-refresh lookup (§4.9): returns the cache entry if still within
/// TTL, otherwise calls upstream and writes a fresh one back.
async fn usage_for_account(state: &AppStateInner, account: &StoredAccount) -> Value {
    let now_ms = Utc::now().timestamp_millis();
    if let Ok(Some(cached)) = state.pool.store().get_usage_cache(&account.id, USAGE_PROVIDER_TYPE).await {
        if cached.expires_at > now_ms {
            return cached.usage_data;
        }
    }

    match fetch_usage(state, account).await {
        Ok(data) => {
            let entry = UsageCacheEntry {
                account_id: account.id.clone(),
                provider_type: USAGE_PROVIDER_TYPE.to_string(),
                usage_data: data.clone(),
                cached_at: Utc::now(),
                expires_at: now_ms + USAGE_CACHE_TTL_MS,
            };
            state.pool.store().set_usage_cache(entry).await.ok();
            data
        }
        Err(e) => json!({ "error": e.to_string() }),
    }
}

async fn get_usage_one(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    let Some(account) = state.pool.get(&id).await else {
        return GatewayError::Store(crate::error::StoreError::NotFound(id)).into_response();
    };
    Json(json!({ "id": id, "usage": usage_for_account(&state, &account).await })).into_response()
}

async fn get_usage_all(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    state.pool.store().clean_expired_usage_cache().await.ok();

    let accounts = state.pool.list_accounts().await;
    let semaphore = Arc::new(Semaphore::new(state.config.usage_query_concurrency.max(1)));
    let mut handles = Vec::new();
    for account in accounts {
        let state = state.clone();
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let usage = usage_for_account(&state, &account).await;
            json!({ "id": account.id, "usage": usage })
        }));
    }

    let mut results = Vec::new();
    for h in handles {
        if let Ok(v) = h.await {
            results.push(v);
        }
    }
    Json(json!({ "results": results })).into_response()
}

#[derive(Deserialize)]
struct GenerateAuthUrlRequest {
    region: String,
    start_url: String,
}

/// First leg of the device-code bootstrap (§4.4): registers a client and
/// requests a device authorization, returning the URL an operator opens in
/// a browser. Completing the flow (polling `/token` until the user
/// finishes) is a separate, longer-running step this endpoint does not
/// block on.
async fn generate_auth_url(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<GenerateAuthUrlRequest>) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    let http = reqwest::Client::new();
    match crate::token::device_oidc::start_device_authorization(&http, &req.region, &req.start_url).await {
        Ok((_client, authorization)) => Json(json!({
            "verification_uri_complete": authorization.verification_uri_complete,
            "user_code": authorization.user_code,
            "device_code": authorization.device_code,
            "interval": authorization.interval,
            "expires_in": authorization.expires_in,
        }))
        .into_response(),
        Err(e) => GatewayError::Token(e).into_response(),
    }
}

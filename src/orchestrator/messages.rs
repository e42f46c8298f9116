//! `/v1/messages` and its helper endpoints (C8, §4.8).

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio_stream::StreamExt;

use crate::codec::StreamCodec;
use crate::config::SystemPromptMode;
use crate::error::{ErrorCategory, GatewayError, UpstreamError};
use crate::orchestrator::{check_auth, token_for, AppState};
use crate::translate::stream::{assemble_message, SseChunk, StreamTranslator};
use crate::translate::{request::build_conversation_state, request::reverse_param_renames, ClaudeRequest, ThinkingConfig};

/// Claude models this gateway fronts through the CodeWhisperer backend.
const SUPPORTED_MODELS: &[&str] = &[
    "claude-sonnet-4-20250514",
    "claude-3-7-sonnet-20250219",
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
];

/// Crude char-based token estimate (§4.8): no tokenizer is wired in, so this
/// stands in both for the pre-flight `count_tokens` answer and the
/// `message_start` usage block, which `message_delta`'s metering-derived
/// count later supersedes.
fn estimate_tokens(text: &str) -> u64 {
    ((text.chars().count() as f64) / 4.0).ceil().max(1.0) as u64
}

pub async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }

    let mut request: ClaudeRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return GatewayError::InvalidRequest(e.to_string()).into_response(),
    };

    if request.thinking.is_none() && state.config.enable_thinking_by_default {
        request.thinking = Some(ThinkingConfig { enabled: true });
    }
    let thinking_requested = request.thinking.as_ref().map(|t| t.enabled).unwrap_or(false);

    record_system_prompt_if_changed(&state, &request).await;
    apply_system_prompt_override(&mut request, &state).await;

    let model = request.model.clone();
    let is_stream = request.stream;

    let eligible = state.pool.eligible_account_count().await;
    if eligible == 0 {
        return GatewayError::PoolExhausted.into_response();
    }
    let max_retries = eligible.min(3).max(1);

    let mut last_error = GatewayError::PoolExhausted;

    for _ in 0..max_retries {
        let Some(account) = state.pool.select(Some(&model), false).await else {
            break;
        };

        let token = match token_for(&state, &account.id, &account.credentials_ref).await {
            Ok(t) => t,
            Err(e) => {
                last_error = GatewayError::Token(e);
                continue;
            }
        };

        if let Err(e) = token.ensure_fresh(false).await {
            last_error = GatewayError::Token(e);
            continue;
        }

        let conversation_state = build_conversation_state(&request);
        let region = token.region().await;
        let input_tokens = estimate_tokens(&conversation_state.to_string());

        match state.upstream.call_streaming(&token, &region, &model, &conversation_state).await {
            Ok(response) => {
                state.pool.mark_healthy(&account.id, false, None, None, None).await.ok();
                state.prompt_log.record(&account.id, &model, &conversation_state.to_string()).await;

                if is_stream {
                    return stream_sse_response(state.clone(), account.id.clone(), response, model, thinking_requested, input_tokens)
                        .into_response();
                }

                // Nothing has reached the client yet at this point, so a
                // failure here is the "otherwise" branch of §4.8 step 6:
                // mark the account and re-select rather than terminate.
                match drain_to_message(response, &model, thinking_requested, input_tokens).await {
                    Ok(body) => return Json(body).into_response(),
                    Err(e) => {
                        let (status, msg) = match &e {
                            GatewayError::Upstream(UpstreamError::Status { status, body }) => (*status, body.clone()),
                            other => (503, other.to_string()),
                        };
                        state.pool.mark_unhealthy(&account.id, status, &msg).await.ok();
                        last_error = e;
                        continue;
                    }
                }
            }
            Err(UpstreamError::Status { status, body }) => {
                let category = UpstreamError::classify(status, &body);
                state.pool.mark_unhealthy(&account.id, status, &body).await.ok();
                last_error = GatewayError::Upstream(UpstreamError::Status { status, body });
                if category == ErrorCategory::ClientRequest {
                    return last_error.into_response();
                }
            }
            Err(e) => {
                last_error = GatewayError::Upstream(e);
            }
        }
    }

    last_error.into_response()
}

fn sse_event(name: &str, value: &Value) -> Event {
    Event::default()
        .event(name)
        .json_data(value)
        .unwrap_or_else(|_| Event::default().event("error").data("{\"type\":\"error\"}"))
}

fn stream_sse_response(
    state: AppState,
    account_id: String,
    upstream: reqwest::Response,
    model: String,
    prompt_uses_injected_thinking: bool,
    input_tokens: u64,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, std::convert::Infallible>>(32);

    tokio::spawn(async move {
        let mut codec = StreamCodec::new();
        let mut translator = StreamTranslator::new(input_tokens, prompt_uses_injected_thinking);

        let (name, mut start_value) = translator.message_start();
        start_value["message"]["model"] = Value::String(model.clone());
        if tx.send(Ok(sse_event(name, &start_value))).await.is_err() {
            return;
        }

        let mut bytes_stream = upstream.bytes_stream();
        let mut failed = false;

        while let Some(chunk) = bytes_stream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    // Mid-stream transport failure: bytes already reached the
                    // client, so this is the in-band-error branch of §4.8's
                    // retry rule, not a candidate for re-selecting an account.
                    state.pool.mark_unhealthy(&account_id, 503, &e.to_string()).await.ok();
                    let (name, value) = StreamTranslator::error_chunk(&e.to_string());
                    let _ = tx.send(Ok(sse_event(name, &value))).await;
                    failed = true;
                    break;
                }
            };

            match codec.push(&bytes) {
                Ok(events) => {
                    let mut out: Vec<SseChunk> = Vec::new();
                    for event in events {
                        translator.handle_event(event, &mut out);
                    }
                    for (name, value) in out {
                        if tx.send(Ok(sse_event(name, &value))).await.is_err() {
                            return;
                        }
                    }
                }
                Err(reason) => {
                    state.pool.mark_unhealthy(&account_id, 503, &reason).await.ok();
                    let (name, value) = StreamTranslator::error_chunk(&reason);
                    let _ = tx.send(Ok(sse_event(name, &value))).await;
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            let final_chunks = translator.finish(&|tool_name, input| reverse_param_renames(tool_name, input));
            for (name, value) in final_chunks {
                if tx.send(Ok(sse_event(name, &value))).await.is_err() {
                    return;
                }
            }
        }
    });

    Sse::new(tokio_stream::wrappers::ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

/// Drains the upstream event-stream to completion and assembles the single
/// non-streaming Claude Message body (§4.8: non-streaming requests still hit
/// a backend that only speaks event-stream framing).
async fn drain_to_message(
    upstream: reqwest::Response,
    model: &str,
    prompt_uses_injected_thinking: bool,
    input_tokens: u64,
) -> Result<Value, GatewayError> {
    let mut codec = StreamCodec::new();
    let mut translator = StreamTranslator::new(input_tokens, prompt_uses_injected_thinking);
    let mut chunks: Vec<SseChunk> = vec![translator.message_start()];

    let mut bytes_stream = upstream.bytes_stream();
    while let Some(chunk) = bytes_stream.next().await {
        let bytes = chunk.map_err(|e| GatewayError::Upstream(e.into()))?;
        let events = codec.push(&bytes).map_err(GatewayError::Internal)?;
        for event in events {
            translator.handle_event(event, &mut chunks);
        }
    }

    chunks.extend(translator.finish(&|tool_name, input| reverse_param_renames(tool_name, input)));
    Ok(assemble_message(&chunks, model))
}

pub async fn handle_count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.required_api_key) {
        return e.into_response();
    }
    let request: ClaudeRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return GatewayError::InvalidRequest(e.to_string()).into_response(),
    };
    let conversation_state = build_conversation_state(&request);
    let tokens = estimate_tokens(&conversation_state.to_string());
    Json(json!({ "input_tokens": tokens })).into_response()
}

pub async fn handle_list_models() -> Response {
    let data: Vec<Value> = SUPPORTED_MODELS
        .iter()
        .map(|id| json!({ "id": id, "type": "model", "display_name": id }))
        .collect();
    Json(json!({ "data": data, "has_more": false })).into_response()
}

/// §6 `SYSTEM_PROMPT_FILE_PATH`/`SYSTEM_PROMPT_MODE`: when configured,
/// overwrite or append the file's contents to whatever system prompt the
/// client sent.
async fn apply_system_prompt_override(request: &mut ClaudeRequest, state: &crate::orchestrator::AppStateInner) {
    let Some(path) = &state.config.system_prompt_file_path else {
        return;
    };
    let file_text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(err = %e, path = %path.display(), "failed to read system prompt override file");
            return;
        }
    };

    let merged = match state.config.system_prompt_mode {
        SystemPromptMode::Overwrite => file_text,
        SystemPromptMode::Append => {
            let existing = request.system.as_ref().map(|s| s.as_text()).unwrap_or_default();
            if existing.is_empty() {
                file_text
            } else {
                format!("{existing}\n\n{file_text}")
            }
        }
    };
    request.system = Some(crate::translate::SystemField::Text(merged));
}

/// Writes the client's original system prompt to `last_system_prompt.txt`
/// next to the config dir whenever it changes, so operators can see what a
/// client is actually asking for without turning on full prompt logging.
async fn record_system_prompt_if_changed(state: &crate::orchestrator::AppStateInner, request: &ClaudeRequest) {
    let Some(system) = &request.system else { return };
    let text = system.as_text();
    if text.is_empty() {
        return;
    }

    {
        let cached = state.last_system_prompt.read().await;
        if cached.as_deref() == Some(text.as_str()) {
            return;
        }
    }
    *state.last_system_prompt.write().await = Some(text.clone());

    let path = state.config.config_dir.join("last_system_prompt.txt");
    if let Err(e) = tokio::fs::write(&path, &text).await {
        tracing::warn!(err = %e, "failed to write last_system_prompt.txt");
    }
}

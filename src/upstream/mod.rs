//! Upstream HTTPS client (C5, §4.5).
//!
//! Issues streaming calls against the CodeWhisperer/Kiro backend, applying
//! the masquerade headers and retry policy §4.5 describes. Error
//! classification is shared with C6 via [`crate::error::UpstreamError::classify`].

use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorCategory, UpstreamError};
use crate::token::TokenManager;

const DEFAULT_MAX_RETRIES: u32 = 8;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(3);
const CONNECTION_RESET_SLEEP: Duration = Duration::from_secs(1);

pub struct UpstreamClient {
    http: reqwest::Client,
    max_retries: u32,
    base_delay: Duration,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            http,
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    pub fn with_defaults(http: reqwest::Client) -> Self {
        Self {
            http,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    fn base_url(region: &str, model: &str) -> String {
        if model.starts_with("amazonq") {
            format!("https://q.{region}.amazonaws.com/generateAssistantResponse")
        } else {
            format!("https://codewhisperer.{region}.amazonaws.com/generateAssistantResponse")
        }
    }

    /// Account usage/quota lookup (admin `GET /api/usage`). No retry
    /// back-off beyond a single forced token refresh on 401 — this is an
    /// operator-facing query, not a user request in the hot path.
    pub async fn get_usage(&self, token: &TokenManager, region: &str) -> Result<Value, UpstreamError> {
        let url = format!("https://codewhisperer.{region}.amazonaws.com/getUsageLimits");
        let mut forced_refresh_used = false;

        loop {
            token.ensure_fresh(false).await?;
            let access_token = token.access_token().await;
            let response = self
                .http
                .post(&url)
                .bearer_auth(&access_token)
                .header("content-type", "application/json")
                .json(&serde_json::json!({}))
                .send()
                .await?;

            if response.status().is_success() {
                return Ok(response.json::<Value>().await?);
            }

            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            if status == 401 && !forced_refresh_used {
                forced_refresh_used = true;
                token.ensure_fresh(true).await?;
                continue;
            }
            return Err(UpstreamError::Status { status, body });
        }
    }

    fn build_request(
        &self,
        region: &str,
        model: &str,
        access_token: &str,
        body: &Value,
    ) -> reqwest::RequestBuilder {
        let url = Self::base_url(region, model);
        let invocation_id = Uuid::new_v4().to_string();
        let retry_hint = format!("attempt={};max={}", 1, self.max_retries);

        self.http
            .post(url)
            .bearer_auth(access_token)
            .header("amz-sdk-invocation-id", invocation_id)
            .header("amz-sdk-request", retry_hint)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .header("x-amzn-kiro-agent-mode", "vibe")
            .header("x-amz-user-agent", "aws-sdk-rust/kiro-gateway")
            .header("user-agent", "kiro-gateway/0.1")
            .json(body)
    }

    /// Streaming call: returns the still-open response. The caller drives
    /// `response.bytes_stream()` into C1 directly so the retry loop above
    /// never has to hold a stream across an error branch. CodeWhisperer
    /// always speaks event-stream framing regardless of the client's
    /// `stream` flag, so this is the only call shape C8 needs.
    pub async fn call_streaming(
        &self,
        token: &TokenManager,
        region: &str,
        model: &str,
        body: &Value,
    ) -> Result<reqwest::Response, UpstreamError> {
        self.send_with_retries(token, region, model, body).await
    }

    /// Shared retry loop (§4.5):
    /// connection-level failures retry up to `max_retries` with a flat 1s
    /// sleep; a single 401 triggers one forced token refresh + retry; 429/5xx
    /// back off exponentially; everything else is classified and surfaced.
    async fn send_with_retries(
        &self,
        token: &TokenManager,
        region: &str,
        model: &str,
        body: &Value,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut attempt = 0u32;
        let mut forced_refresh_used = false;

        loop {
            token.ensure_fresh(false).await?;
            let access_token = token.access_token().await;
            let request = self.build_request(region, model, &access_token, body);

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let response_body = response.text().await.unwrap_or_default();

                    if status == 401 && !forced_refresh_used {
                        forced_refresh_used = true;
                        token.ensure_fresh(true).await?;
                        continue;
                    }

                    let category = UpstreamError::classify(status, &response_body);
                    match category {
                        ErrorCategory::Transient | ErrorCategory::RateLimited => {
                            if attempt >= self.max_retries {
                                return Err(UpstreamError::Status { status, body: response_body });
                            }
                            let delay = self.base_delay * 2u32.saturating_pow(attempt);
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        _ => return Err(UpstreamError::Status { status, body: response_body }),
                    }
                }
                Err(e) if is_connection_level(&e) => {
                    if attempt >= self.max_retries {
                        return Err(UpstreamError::Connection(e.to_string()));
                    }
                    tokio::time::sleep(CONNECTION_RESET_SLEEP).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(UpstreamError::Http(e)),
            }
        }
    }
}

fn is_connection_level(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amazonq_models_route_to_q_endpoint() {
        assert!(UpstreamClient::base_url("us-east-1", "amazonq-chat").contains("q.us-east-1"));
    }

    #[test]
    fn other_models_route_to_codewhisperer_endpoint() {
        assert!(
            UpstreamClient::base_url("us-east-1", "claude-sonnet-4-20250514")
                .contains("codewhisperer.us-east-1")
        );
    }
}

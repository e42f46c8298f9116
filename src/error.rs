//! Crate-wide error taxonomy (§7) and its mapping onto Claude-native HTTP
//! error shapes.
//!
//! Lower layers (C1-C7) return typed errors; the request orchestrator (C8)
//! is the sole place that turns a `GatewayError` into bytes on the wire —
//! everything funnels through `IntoResponse` here so no handler hand-builds
//! an error JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("account has no refresh token on file")]
    NoRefreshToken,
    #[error("refresh token expired and could not be renewed")]
    Expired,
    #[error("refresh response did not contain an access token")]
    InvalidRefreshResponse,
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("account pool file is malformed: {0}")]
    MalformedPool(String),
    #[error("account {0} not found")]
    NotFound(String),
}

/// Classification produced by C5's upstream error handling and consumed by
/// C6's `MarkUnhealthy` and C8's retry loop (§4.5, §4.6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// HTTP 400 / malformed body — returned verbatim, no pool mutation.
    ClientRequest,
    /// Transient: connection reset, timeout, 5xx, pure 429 — retry, don't
    /// bump `error_count`.
    Transient,
    /// Rate-limit wording without being fatal — same retry treatment as
    /// Transient but classified separately for `MarkUnhealthy` logging.
    RateLimited,
    /// 402/403/401-after-refresh/suspended/locked/quota/invalid-token —
    /// account marked unhealthy immediately.
    FatalAccount,
    /// Malformed upstream frame / impossible internal state.
    InternalInvariant,
    /// No eligible account remains in the pool.
    PoolExhausted,
}

impl ErrorCategory {
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorCategory::ClientRequest => StatusCode::BAD_REQUEST,
            ErrorCategory::Transient | ErrorCategory::RateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ErrorCategory::FatalAccount => StatusCode::FORBIDDEN,
            ErrorCategory::InternalInvariant => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCategory::PoolExhausted => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream connection error: {0}")]
    Connection(String),
    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl UpstreamError {
    /// Classify per §4.5's table. `body` is scanned case-insensitively for
    /// the wording the spec names (quota/suspended/locked/forbidden/rate
    /// limit/too many requests).
    pub fn classify(status: u16, body: &str) -> ErrorCategory {
        let lower = body.to_ascii_lowercase();
        let has = |needle: &str| lower.contains(needle);

        if status == 400 {
            return ErrorCategory::ClientRequest;
        }
        if status == 402 || status == 403 {
            return ErrorCategory::FatalAccount;
        }
        if status == 429 {
            if has("quota") || has("suspended") || has("locked") || has("forbidden") {
                return ErrorCategory::FatalAccount;
            }
            return ErrorCategory::RateLimited;
        }
        if status >= 500 {
            return ErrorCategory::Transient;
        }
        if status == 401 {
            return ErrorCategory::FatalAccount;
        }
        ErrorCategory::ClientRequest
    }
}

/// The root error type returned by the orchestrator (C8, §7).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no healthy account available")]
    PoolExhausted,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Claude-native error `type` string derived from HTTP status (§4.8, §7).
    pub fn native_type(status: StatusCode) -> &'static str {
        match status {
            StatusCode::UNAUTHORIZED => "authentication_error",
            StatusCode::FORBIDDEN => "permission_error",
            StatusCode::TOO_MANY_REQUESTS => "rate_limit_error",
            s if s.as_u16() >= 500 => "server_error",
            _ => "invalid_request_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(UpstreamError::Status { status, body }) => {
                StatusCode::from_u16(*status)
                    .unwrap_or_else(|_| UpstreamError::classify(*status, body).status_code())
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Token(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::PoolExhausted => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Build the Claude-native unary error body `{type:"error", error:{type, message}}`.
    pub fn to_native_body(&self) -> ClaudeErrorBody {
        let status = self.status_code();
        ClaudeErrorBody {
            body_type: "error",
            error: ClaudeErrorDetail {
                error_type: Self::native_type(status).to_string(),
                message: self.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClaudeErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ClaudeErrorBody {
    #[serde(rename = "type")]
    pub body_type: &'static str,
    pub error: ClaudeErrorDetail,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_native_body();
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_400_as_client_request() {
        assert_eq!(
            UpstreamError::classify(400, "bad input"),
            ErrorCategory::ClientRequest
        );
    }

    #[test]
    fn classifies_403_as_fatal() {
        assert_eq!(
            UpstreamError::classify(403, "Forbidden"),
            ErrorCategory::FatalAccount
        );
    }

    #[test]
    fn classifies_429_quota_wording_as_fatal() {
        assert_eq!(
            UpstreamError::classify(429, "Quota exceeded for this account"),
            ErrorCategory::FatalAccount
        );
    }

    #[test]
    fn classifies_plain_429_as_rate_limited() {
        assert_eq!(
            UpstreamError::classify(429, "Too Many Requests"),
            ErrorCategory::RateLimited
        );
    }

    #[test]
    fn classifies_5xx_as_transient() {
        assert_eq!(
            UpstreamError::classify(503, "service unavailable"),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn native_type_mapping() {
        assert_eq!(
            GatewayError::native_type(StatusCode::UNAUTHORIZED),
            "authentication_error"
        );
        assert_eq!(
            GatewayError::native_type(StatusCode::TOO_MANY_REQUESTS),
            "rate_limit_error"
        );
        assert_eq!(
            GatewayError::native_type(StatusCode::INTERNAL_SERVER_ERROR),
            "server_error"
        );
    }
}

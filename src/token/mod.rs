//! Per-account token manager (C4, §4.4).
//!
//! One [`TokenManager`] per account. Holds the live credential fields plus a
//! mutex that doubles as the in-flight-refresh coalescing point: whoever
//! acquires it first runs the refresh, everyone else just awaits the same
//! guard and reads the result it left behind.

pub mod device_oidc;
pub mod social;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::TokenError;
use crate::store::AuthDialect;

const REQUEST_PATH_WINDOW: Duration = Duration::from_secs(5 * 60);
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(30);

/// On-disk credential shape (§3 Credentials, §6 `configs/kiro/<file>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "authMethod")]
    pub auth_method: AuthDialect,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "clientSecret", skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(rename = "profileArn", skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    pub region: String,
}

struct State {
    credentials: Credentials,
    last_refresh_attempt: Option<Instant>,
}

pub struct TokenManager {
    path: std::path::PathBuf,
    http: reqwest::Client,
    state: Mutex<State>,
    /// Coalesces concurrent `ensure_fresh` calls: only the first caller runs
    /// the refresh, the rest await this same future.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl TokenManager {
    pub fn new(path: std::path::PathBuf, http: reqwest::Client, credentials: Credentials) -> Arc<Self> {
        Arc::new(Self {
            path,
            http,
            state: Mutex::new(State {
                credentials,
                last_refresh_attempt: None,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub async fn load(path: std::path::PathBuf, http: reqwest::Client) -> Result<Arc<Self>, TokenError> {
        let contents = tokio::fs::read_to_string(&path).await?;
        let credentials: Credentials = serde_json::from_str(&contents)?;
        Ok(Self::new(path, http, credentials))
    }

    pub async fn access_token(&self) -> String {
        self.state.lock().await.credentials.access_token.clone()
    }

    pub async fn region(&self) -> String {
        self.state.lock().await.credentials.region.clone()
    }

    /// §4.4 `EnsureFresh`.
    pub async fn ensure_fresh(&self, force: bool) -> Result<(), TokenError> {
        let refresh_token_empty = self.state.lock().await.credentials.refresh_token.is_empty();
        if refresh_token_empty {
            return Err(TokenError::NoRefreshToken);
        }

        // Coalesce: if another caller is mid-refresh, this blocks on the
        // same mutex and then re-checks freshness rather than refreshing
        // again.
        let _guard = self.refresh_lock.lock().await;

        let (time_until_expiry, last_attempt) = {
            let state = self.state.lock().await;
            (state.credentials.expires_at - Utc::now(), state.last_refresh_attempt)
        };

        if !force && time_until_expiry > chrono::Duration::from_std(REQUEST_PATH_WINDOW).unwrap() {
            return Ok(());
        }

        if let Some(last) = last_attempt {
            if last.elapsed() < DEBOUNCE_WINDOW {
                if time_until_expiry <= chrono::Duration::zero() {
                    return Err(TokenError::Expired);
                }
                return Ok(());
            }
        }

        {
            let mut state = self.state.lock().await;
            state.last_refresh_attempt = Some(Instant::now());
        }

        self.refresh().await
    }

    /// §4.4 `Refresh`, dialect-dependent.
    async fn refresh(&self) -> Result<(), TokenError> {
        let (dialect, refresh_token, region, client_id, client_secret) = {
            let state = self.state.lock().await;
            (
                state.credentials.auth_method,
                state.credentials.refresh_token.clone(),
                state.credentials.region.clone(),
                state.credentials.client_id.clone(),
                state.credentials.client_secret.clone(),
            )
        };

        let response = match dialect {
            AuthDialect::Social => social::refresh(&self.http, &region, &refresh_token).await?,
            AuthDialect::DeviceOidc => {
                let client_id = client_id.ok_or(TokenError::InvalidRefreshResponse)?;
                let client_secret = client_secret.ok_or(TokenError::InvalidRefreshResponse)?;
                device_oidc::refresh(&self.http, &region, &refresh_token, &client_id, &client_secret).await?
            }
        };

        let Some(access_token) = response.access_token else {
            return Err(TokenError::InvalidRefreshResponse);
        };

        let expires_at = response
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64))
            .or(response.expires_at)
            .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1));

        {
            let mut state = self.state.lock().await;
            state.credentials.access_token = access_token;
            state.credentials.expires_at = expires_at;
            if let Some(new_refresh) = response.refresh_token {
                state.credentials.refresh_token = new_refresh;
            }
        }

        self.persist().await
    }

    async fn persist(&self) -> Result<(), TokenError> {
        let credentials = self.state.lock().await.credentials.clone();
        let json = serde_json::to_string_pretty(&credentials)?;

        let dir = self.path.parent().unwrap_or_else(|| std::path::Path::new("."));
        tokio::fs::create_dir_all(dir).await?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        tmp.write_all(json.as_bytes()).await?;
        tmp.sync_all().await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

/// Shared shape of a successful refresh response across both dialects.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct RefreshResponse {
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,
    #[serde(rename = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiresIn")]
    pub expires_in: Option<u64>,
    #[serde(rename = "expiresAt")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_credentials(expires_in_secs: i64) -> Credentials {
        Credentials {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
            auth_method: AuthDialect::Social,
            client_id: None,
            client_secret: None,
            profile_arn: None,
            region: "us-east-1".into(),
        }
    }

    #[tokio::test]
    async fn ensure_fresh_returns_ok_without_network_when_far_from_expiry() {
        let manager = TokenManager::new(
            std::path::PathBuf::from("/tmp/does-not-matter.json"),
            reqwest::Client::new(),
            sample_credentials(3600),
        );
        assert!(manager.ensure_fresh(false).await.is_ok());
    }

    #[tokio::test]
    async fn ensure_fresh_fails_fast_with_no_refresh_token() {
        let mut creds = sample_credentials(3600);
        creds.refresh_token = String::new();
        let manager = TokenManager::new(
            std::path::PathBuf::from("/tmp/does-not-matter.json"),
            reqwest::Client::new(),
            creds,
        );
        assert!(matches!(
            manager.ensure_fresh(false).await,
            Err(TokenError::NoRefreshToken)
        ));
    }
}

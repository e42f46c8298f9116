//! Device-code OIDC refresh dialect and bootstrap (§4.4, §6).

use serde::Deserialize;

use crate::error::TokenError;
use crate::token::RefreshResponse;

#[derive(serde::Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
    #[serde(rename = "clientId")]
    client_id: &'a str,
    #[serde(rename = "clientSecret")]
    client_secret: &'a str,
    #[serde(rename = "grantType")]
    grant_type: &'static str,
}

pub async fn refresh(
    http: &reqwest::Client,
    region: &str,
    refresh_token: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<RefreshResponse, TokenError> {
    let url = format!("https://oidc.{region}.amazonaws.com/token");
    let response = http
        .post(url)
        .json(&RefreshRequest {
            refresh_token,
            client_id,
            client_secret,
            grant_type: "refresh_token",
        })
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(TokenError::RefreshFailed(format!("HTTP {status}: {body}")));
    }

    Ok(response.json::<RefreshResponse>().await?)
}

#[derive(Debug, Deserialize)]
pub struct DeviceAuthorization {
    #[serde(rename = "deviceCode")]
    pub device_code: String,
    #[serde(rename = "userCode")]
    pub user_code: String,
    #[serde(rename = "verificationUri")]
    pub verification_uri: String,
    #[serde(rename = "verificationUriComplete")]
    pub verification_uri_complete: String,
    pub interval: u64,
    #[serde(rename = "expiresIn")]
    pub expires_in: u64,
}

#[derive(serde::Serialize)]
struct ClientRegistration<'a> {
    #[serde(rename = "clientName")]
    client_name: &'a str,
    #[serde(rename = "clientType")]
    client_type: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct RegisteredClient {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
}

/// §4.4 device-code bootstrap, step 1: register a client, then request a
/// device authorization against `start_url`.
pub async fn start_device_authorization(
    http: &reqwest::Client,
    region: &str,
    start_url: &str,
) -> Result<(RegisteredClient, DeviceAuthorization), TokenError> {
    let register_url = format!("https://oidc.{region}.amazonaws.com/client/register");
    let client: RegisteredClient = http
        .post(register_url)
        .json(&ClientRegistration {
            client_name: "kiro-gateway",
            client_type: "public",
        })
        .send()
        .await?
        .json()
        .await?;

    #[derive(serde::Serialize)]
    struct DeviceAuthRequest<'a> {
        #[serde(rename = "clientId")]
        client_id: &'a str,
        #[serde(rename = "clientSecret")]
        client_secret: &'a str,
        #[serde(rename = "startUrl")]
        start_url: &'a str,
    }

    let auth_url = format!("https://oidc.{region}.amazonaws.com/device_authorization");
    let authorization: DeviceAuthorization = http
        .post(auth_url)
        .json(&DeviceAuthRequest {
            client_id: &client.client_id,
            client_secret: &client.client_secret,
            start_url,
        })
        .send()
        .await?
        .json()
        .await?;

    Ok((client, authorization))
}

/// §4.4 device-code bootstrap, step 2: poll `/token` at `interval` until the
/// user completes the browser flow or `expires_in` elapses.
pub async fn poll_device_token(
    http: &reqwest::Client,
    region: &str,
    client: &RegisteredClient,
    device_code: &str,
    interval_secs: u64,
    expires_in_secs: u64,
) -> Result<RefreshResponse, TokenError> {
    #[derive(serde::Serialize)]
    struct PollRequest<'a> {
        #[serde(rename = "clientId")]
        client_id: &'a str,
        #[serde(rename = "clientSecret")]
        client_secret: &'a str,
        #[serde(rename = "deviceCode")]
        device_code: &'a str,
        #[serde(rename = "grantType")]
        grant_type: &'static str,
    }

    let url = format!("https://oidc.{region}.amazonaws.com/token");
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(expires_in_secs);

    loop {
        if tokio::time::Instant::now() >= deadline {
            return Err(TokenError::Expired);
        }

        let response = http
            .post(&url)
            .json(&PollRequest {
                client_id: &client.client_id,
                client_secret: &client.client_secret,
                device_code,
                grant_type: "urn:ietf:params:oauth:grant-type:device_code",
            })
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response.json::<RefreshResponse>().await?);
        }

        // Authorization still pending: keep polling at the server-given
        // interval. Any other status is a hard failure.
        let status = response.status();
        if status.as_u16() == 400 {
            tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
            continue;
        }

        let body = response.text().await.unwrap_or_default();
        return Err(TokenError::RefreshFailed(format!("HTTP {status}: {body}")));
    }
}

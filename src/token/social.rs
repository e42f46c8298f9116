//! Social (Kiro desktop) OAuth refresh dialect (§4.4, §6).

use crate::error::TokenError;
use crate::token::RefreshResponse;

#[derive(serde::Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

pub async fn refresh(
    http: &reqwest::Client,
    region: &str,
    refresh_token: &str,
) -> Result<RefreshResponse, TokenError> {
    let url = format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken");
    let response = http
        .post(url)
        .json(&RefreshRequest { refresh_token })
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(TokenError::RefreshFailed(format!("HTTP {status}: {body}")));
    }

    Ok(response.json::<RefreshResponse>().await?)
}

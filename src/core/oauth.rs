//! Refresh-token exchange against the external authorization provider.
//! Workers call this when a stored access token has expired; the session
//! store's per-owner compare-and-set decides whose refreshed token wins.

use anyhow::{Result, anyhow};
use serde::Deserialize;

use crate::core::types::{CredentialData, unix_now};

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchange a refresh token for a new access token. Returns a credential set
/// carrying over the scopes and (unless rotated) the refresh token of `prior`.
pub async fn refresh_access_token(
    config: &OAuthConfig,
    prior: &CredentialData,
) -> Result<CredentialData> {
    let refresh_token = prior
        .refresh_token
        .as_deref()
        .ok_or_else(|| anyhow!("no refresh token stored for this session"))?;

    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", &config.client_id),
        ("client_secret", &config.client_secret),
    ];

    let client = reqwest::Client::new();
    let response = client
        .post(&config.token_url)
        .form(&params)
        .send()
        .await
        .map_err(|e| anyhow!("token endpoint request failed: {e}"))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("failed to read token response: {e}"))?;

    if !status.is_success() {
        return Err(anyhow!("token refresh failed (HTTP {status}): {body}"));
    }

    let token: TokenResponse =
        serde_json::from_str(&body).map_err(|e| anyhow!("failed to parse token response: {e}"))?;

    if let Some(error) = token.error {
        let desc = token.error_description.unwrap_or_default();
        return Err(anyhow!("OAuth error: {error} - {desc}"));
    }

    let access_token = token
        .access_token
        .ok_or_else(|| anyhow!("no access_token in response. Response was: {body}"))?;

    Ok(CredentialData {
        access_token,
        refresh_token: token
            .refresh_token
            .or_else(|| prior.refresh_token.clone()),
        expires_at: token.expires_in.map(|secs| unix_now() + secs),
        scopes: prior.scopes.clone(),
    })
}

//! Bearer-token authentication for the API.
//!
//! Tokens are compact HS256 JWTs signed with the service secret. The
//! middleware verifies the signature and expiry and stashes the caller's
//! identity in request extensions for handlers to pick up.

use anyhow::{Result, anyhow, bail};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::AppState;
use crate::core::types::unix_now;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    #[serde(default)]
    pub email: String,
    pub exp: i64,
}

/// The verified caller, inserted into request extensions by `require_auth`.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: String,
    pub email: String,
}

pub fn sign_token(secret: &str, owner_id: &str, email: &str, ttl_secs: u64) -> Result<String> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = Claims {
        id: owner_id.to_string(),
        email: email.to_string(),
        exp: unix_now() + ttl_secs as i64,
    };
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
    let signing_input = format!("{header}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("invalid signing key: {e}"))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed token");
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("invalid signing key: {e}"))?;
    mac.update(format!("{header}.{payload}").as_bytes());
    let given = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| anyhow!("malformed token signature"))?;
    mac.verify_slice(&given)
        .map_err(|_| anyhow!("token signature mismatch"))?;

    let claims: Claims = serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| anyhow!("malformed token payload"))?,
    )?;
    if claims.exp <= unix_now() {
        bail!("token expired");
    }
    Ok(claims)
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let raw_token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(raw_token) = raw_token else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "Missing or invalid Authorization header. Use: Bearer <token>"
            })),
        )
            .into_response();
    };

    match verify_token(&state.jwt_secret, &raw_token) {
        Ok(claims) => {
            req.extensions_mut().insert(AuthedUser {
                id: claims.id,
                email: claims.email,
            });
            next.run(req).await
        }
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": format!("invalid token: {e}") })),
        )
            .into_response(),
    }
}

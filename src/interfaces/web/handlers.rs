//! HTTP handlers for the job API.
//!
//! Submission snapshots the caller's environment (API key, provider tokens,
//! authorized scope URLs) into the job at enqueue time; workers re-derive the
//! scope grant at execution time, so the snapshot only has to be good enough
//! for the toolkit to start from.

use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::AppState;
use super::auth::AuthedUser;
use crate::core::error::Error;
use crate::core::scopes::{self, AVAILABLE_SCOPES};

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retriable = self.0.is_retriable();
        match self.0 {
            Error::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": msg })),
            )
                .into_response(),
            Error::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "not found" })),
            )
                .into_response(),
            // The record exists but the broker rejected the message; the
            // caller may retry, and the maintenance pass will re-publish the
            // orphan either way.
            Error::Publish { job_id, source } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": format!("task could not be queued: {source}"),
                    "job_id": job_id,
                    "retriable": retriable,
                })),
            )
                .into_response(),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": other.to_string() })),
            )
                .into_response(),
        }
    }
}

#[derive(serde::Deserialize)]
pub struct RunRequest {
    pub message: String,
}

pub async fn run_job(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Json(req): Json<RunRequest>,
) -> Result<Response, ApiError> {
    let env_context = submission_env(&state, &user.id).await?;
    let job_id = state
        .gateway
        .submit(&user.id, &req.message, env_context)
        .await?;
    debug!(%job_id, owner_id = %user.id, "job accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": job_id, "status": "pending" })),
    )
        .into_response())
}

/// Environment snapshot captured at submission: the service API key plus the
/// caller's provider tokens and authorized scope URLs when a session exists.
async fn submission_env(state: &AppState, owner_id: &str) -> Result<HashMap<String, String>, Error> {
    let mut env = HashMap::new();
    if let Some(key) = &state.openai_api_key {
        env.insert("OPENAI_API_KEY".to_string(), key.clone());
    }
    env.insert("SESSION_USER_ID".to_string(), owner_id.to_string());

    if let Some(session) = state.storage.get_session(owner_id).await? {
        if session.authenticated {
            let allowed = state
                .storage
                .scope_filter(owner_id, &session.requested_scopes)
                .await?;
            env.insert(
                "GOOGLE_AUTHORIZED_SCOPES".to_string(),
                serde_json::to_string(&scopes::urls_for(&allowed))?,
            );
            env.insert(
                "GOOGLE_ACCESS_TOKEN".to_string(),
                session.credential_data.access_token.clone(),
            );
            if let Some(refresh) = &session.credential_data.refresh_token {
                env.insert("GOOGLE_REFRESH_TOKEN".to_string(), refresh.clone());
            }
        }
    }
    Ok(env)
}

pub async fn get_result(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state.gateway.get(&job_id, &user.id).await?;
    Ok(Json(job).into_response())
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Response, ApiError> {
    let jobs = state.gateway.list(&user.id).await?;
    Ok(Json(serde_json::json!({ "jobs": jobs })).into_response())
}

pub async fn auth_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Response, ApiError> {
    let session = state.storage.get_session(&user.id).await?;
    let body = match session {
        Some(s) => serde_json::json!({
            "authenticated": s.authenticated,
            "profile": s.profile,
            "requested_scopes": s.requested_scopes,
            "granted_scopes": s.granted_scopes,
        }),
        // No provider session yet: echo the identity the bearer token proved.
        None => serde_json::json!({
            "authenticated": false,
            "profile": { "email": user.email },
        }),
    };
    Ok(Json(body).into_response())
}

pub async fn list_scopes() -> Response {
    let scopes: Vec<_> = AVAILABLE_SCOPES
        .iter()
        .map(|s| {
            serde_json::json!({
                "name": s.name,
                "url": s.url,
                "description": s.description,
            })
        })
        .collect();
    Json(serde_json::json!({ "scopes": scopes })).into_response()
}

pub async fn health() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

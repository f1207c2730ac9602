use axum::{
    Router,
    http::Method,
    middleware,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use super::AppState;
use super::auth;
use super::handlers;

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

pub fn build_api_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/auth/scopes", get(handlers::list_scopes));

    let authed_routes = Router::new()
        .route("/api/run", post(handlers::run_job))
        .route("/api/result/{job_id}", get(handlers::get_result))
        .route("/api/jobs", get(handlers::list_jobs))
        .route("/api/auth/status", get(handlers::auth_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    public_routes
        .merge(authed_routes)
        .layer(build_cors())
        .with_state(state)
}

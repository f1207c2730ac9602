pub(crate) mod auth;
mod handlers;
mod router;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::core::gateway::Gateway;
use crate::core::storage::Storage;
use crate::core::worker::WorkerContext;

pub struct ApiServer {
    api_host: String,
    api_port: u16,
}

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub storage: Arc<Storage>,
    pub worker_ctx: Arc<WorkerContext>,
    pub jwt_secret: String,
    pub openai_api_key: Option<String>,
}

impl ApiServer {
    pub fn new(api_host: String, api_port: u16) -> Self {
        Self { api_host, api_port }
    }

    pub async fn serve(&self, state: AppState) -> Result<()> {
        let addr = format!("{}:{}", self.api_host, self.api_port);
        let app = router::build_api_router(state);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("API server running at http://{addr}");
        axum::serve(listener, app).await?;
        Ok(())
    }
}

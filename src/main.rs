mod config;
mod core;
mod interfaces;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{error, info};

use crate::config::Config;
use crate::core::gateway::Gateway;
use crate::core::queue::sqlite::SqliteQueue;
use crate::core::storage::Storage;
use crate::core::toolkit::ChatToolkit;
use crate::core::worker::{WorkerContext, run_maintenance, run_worker};
use crate::interfaces::web::{ApiServer, AppState};

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(e) = run().await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("run");
    let config = Config::from_env()?;

    match command {
        "init-db" => {
            Storage::open(&config.db_path).await?;
            info!(path = %config.db_path.display(), "database initialized");
            Ok(())
        }
        "token" => {
            let owner_id = args
                .get(1)
                .context("usage: agentq token <owner_id> [email]")?;
            let email = args.get(2).map(String::as_str).unwrap_or("");
            let token = interfaces::web::auth::sign_token(
                &config.jwt_secret,
                owner_id,
                email,
                config.token_ttl_secs,
            )?;
            println!("{token}");
            Ok(())
        }
        "serve" => {
            let state = build_state(&config).await?;
            serve_api(&config, state).await
        }
        "work" => {
            let state = build_state(&config).await?;
            spawn_workers(&config, &state);
            info!(workers = config.worker_count, "worker pool running");
            tokio::signal::ctrl_c().await?;
            Ok(())
        }
        // Default: API and workers in one process, like the dev deployment.
        "run" => {
            let state = build_state(&config).await?;
            spawn_workers(&config, &state);
            serve_api(&config, state).await
        }
        other => bail!("unknown command: {other} (expected serve | work | run | init-db | token)"),
    }
}

async fn build_state(config: &Config) -> Result<AppState> {
    let storage = Arc::new(Storage::open(&config.db_path).await?);
    let queue = Arc::new(SqliteQueue::new(storage.get_db()));
    let gateway = Arc::new(Gateway::new(
        storage.clone(),
        queue.clone(),
        config.queue_name.clone(),
    ));
    let toolkit = Arc::new(ChatToolkit::new(
        config.toolkit_base_url.clone(),
        config.toolkit_model.clone(),
        config.toolkit_timeout(),
    ));
    let worker_ctx = Arc::new(WorkerContext {
        storage: storage.clone(),
        queue,
        toolkit,
        oauth: config.oauth_config(),
        queue_name: config.queue_name.clone(),
        visibility: config.lease_visibility(),
        retry: config.retry_policy(),
        staleness: config.staleness_timeout(),
        orphan_age: config.orphan_age(),
        retention: config.retention_period(),
    });
    Ok(AppState {
        gateway,
        storage,
        worker_ctx,
        jwt_secret: config.jwt_secret.clone(),
        openai_api_key: config.openai_api_key.clone(),
    })
}

fn spawn_workers(config: &Config, state: &AppState) {
    for worker_id in 0..config.worker_count {
        let ctx = state.worker_ctx.clone();
        tokio::spawn(async move {
            run_worker(ctx, worker_id).await;
        });
    }
    let ctx = state.worker_ctx.clone();
    tokio::spawn(async move {
        run_maintenance(ctx).await;
    });
}

async fn serve_api(config: &Config, state: AppState) -> Result<()> {
    let server = ApiServer::new(config.api_host.clone(), config.api_port);
    server.serve(state).await
}

use anyhow::Context as _;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use context_gateway::api::{build_router, AppState};
use context_gateway::config::{Config, LoggingConfig};
use context_gateway::pipeline::{ChatPipeline, PipelineContext};

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging);

    let context = PipelineContext::from_config(&config).context("failed to build pipeline")?;
    if let Some(path) = &config.knowledge.seed_path {
        match context.store.load_seed_file(path).await {
            Ok(report) => info!(path = %path, inserted = report.inserted, "Knowledge seeded"),
            Err(e) => warn!(path = %path, error = %e, "Knowledge seed failed, starting empty"),
        }
    }

    let context = Arc::new(context);
    let _maintenance = context.executor().spawn_maintenance();

    let state = AppState {
        pipeline: ChatPipeline::new(context),
    };
    let router = build_router(state, config.server.max_body_bytes);

    let address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!(address = %address, "Context gateway listening");

    axum::serve(listener, router).await?;
    Ok(())
}

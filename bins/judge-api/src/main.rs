mod handlers;
mod routes;

use axum::Router;
use judge_common::config::{CommonConfig, LogFormat};
use judge_common::redis::RedisStore;
use judge_common::{ContestStore, ProblemStore, SubmissionQueue, SubmissionStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

pub struct AppState {
    pub submissions: Arc<dyn SubmissionStore>,
    pub problems: Arc<dyn ProblemStore>,
    pub contests: Arc<dyn ContestStore>,
    pub queue: Arc<dyn SubmissionQueue>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CommonConfig::from_env();
    init_tracing(config.log_format);

    info!("Judge API booting...");

    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    info!("Connected to Redis: {}", config.redis_url);

    let state = Arc::new(AppState {
        submissions: store.clone(),
        problems: store.clone(),
        contests: store.clone(),
        queue: store,
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = std::env::var("API_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

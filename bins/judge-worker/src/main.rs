mod config;
mod dispatch;
mod docker;
mod engine;
mod error;
mod evaluator;
mod executor;
mod runner;
mod state;

#[cfg(test)]
mod testing;

use config::{LanguageConfigManager, WorkerConfig};
use dispatch::{DispatchReceipt, Dispatcher};
use docker::DockerBackend;
use engine::{SandboxInvoker, SandboxLimits};
use executor::JudgePipeline;
use judge_common::config::LogFormat;
use judge_common::redis::{self, RedisStore};
use runner::TestRunner;
use state::SubmissionStateMachine;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;
    init_tracing(config.common.log_format);

    info!("Judge worker booting...");

    let languages = LanguageConfigManager::load_or_builtin(&config.languages_config).map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    let backend = DockerBackend::connect()?;
    backend.ping().await?;
    info!("Connected to Docker daemon");

    let store = Arc::new(RedisStore::connect(&config.common.redis_url).await?);
    info!("Connected to Redis: {}", config.common.redis_url);

    let invoker = SandboxInvoker::new(
        Arc::new(backend),
        languages,
        SandboxLimits {
            work_root: config.work_root.clone(),
            cpu_limit: config.cpu_limit,
            pids_limit: config.pids_limit,
        },
    );
    let pipeline = Arc::new(JudgePipeline::new(
        SubmissionStateMachine::new(store.clone()).with_claim_lease(config.claim_lease),
        store.clone(),
        store.clone(),
        TestRunner::new(Arc::new(invoker)),
    ));
    let (dispatcher, pool) = Dispatcher::spawn(pipeline, config.workers, config.queue_capacity);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => warn!("Received shutdown signal, draining queue..."),
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let mut conn = store.connection();
    intake_loop(&mut conn, &dispatcher, shutdown_rx).await;

    drop(dispatcher);
    pool.join().await;

    info!("Worker shutdown complete");
    Ok(())
}

/// Move submission ids from the Redis queue into the worker pool.
///
/// Shutdown is only observed between pops; an id already popped is always
/// handed to the dispatcher.
async fn intake_loop(
    conn: &mut ::redis::aio::ConnectionManager,
    dispatcher: &Dispatcher,
    shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_submission(conn, 5.0).await {
            Ok(Some(id)) => match dispatcher.dispatch(id).await {
                Ok(DispatchReceipt::Queued) => info!(submission_id = %id, "Received submission"),
                Ok(DispatchReceipt::AlreadyInFlight) => {
                    debug!(submission_id = %id, "Submission already being judged")
                }
                Err(e) => {
                    error!(submission_id = %id, error = %e, "Dispatch failed");
                    return;
                }
            },
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init(),
    }
}

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use repobox::agent;
use repobox::cleaner::Cleaner;
use repobox::config::RunnerArgs;
use repobox::consumer::{ConsumerSettings, StreamConsumer};
use repobox::crypto::Decryptor;
use repobox::logging::init_tracing;
use repobox::pipeline::{Executor, PipelineSettings};
use repobox::pool::WorkerPool;
use repobox::shutdown::install_shutdown_handler;
use repobox::store::{self, JobQueue, JobStore, RedisQueue, RedisStore};
use repobox::workdir::ActiveWorkDirs;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; every setting has a flag or default.
    let _ = dotenvy::dotenv();
    let config = RunnerArgs::parse()
        .into_config()
        .context("Invalid configuration")?;
    let _log_guard = init_tracing(config.json_logs);

    let decryptor = Arc::new(
        Decryptor::new(config.encryption_key.expose_secret())
            .context("Invalid encryption key")?,
    );

    tracing::info!(
        consumer = %config.consumer,
        stream = %config.stream,
        group = %config.group,
        pool_size = config.pool_size,
        per_user_limit = config.per_user_limit,
        temp_dir = %config.temp_dir.display(),
        "starting repobox runner"
    );

    // Blocking stream reads get their own connection so they never stall
    // status and output writes.
    let store_conn = store::redis::connect(&config.redis_url).await?;
    let queue_conn = store::redis::connect(&config.redis_url).await?;
    let job_store: Arc<dyn JobStore> = Arc::new(RedisStore::new(store_conn));
    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
        queue_conn,
        &config.stream,
        &config.group,
        &config.consumer,
    ));

    std::fs::create_dir_all(&config.temp_dir).with_context(|| {
        format!("Failed to create temp dir {}", config.temp_dir.display())
    })?;
    let active = ActiveWorkDirs::new();

    let cleaner = Arc::new(Cleaner::new(
        config.temp_dir.clone(),
        config.cleanup.clone(),
        job_store.clone(),
        active.clone(),
    ));
    if config.cleanup.on_startup {
        cleaner.sweep_startup().await;
    }

    let backend = agent::from_config(&config.agent);
    tracing::info!(agent = backend.name(), "agent backend selected");

    let executor = Arc::new(Executor::new(
        job_store.clone(),
        queue.clone(),
        decryptor,
        backend,
        PipelineSettings {
            temp_dir: config.temp_dir.clone(),
            job_timeout: config.job_timeout,
            cleanup_after_job: config.cleanup.after_job,
            identity: config.git_identity.clone(),
        },
        active,
    ));
    let shutdown = install_shutdown_handler(executor.cancel_token());

    let pool = Arc::new(WorkerPool::start(
        config.pool_size,
        config.queue_capacity,
        executor,
    ));
    let cleaner_task = cleaner.spawn(shutdown.clone());

    let consumer = StreamConsumer::new(
        queue,
        job_store,
        pool.clone(),
        ConsumerSettings {
            per_user_limit: config.per_user_limit,
            job_timeout: config.job_timeout,
            reclaim_interval: config.reclaim_interval,
            reclaim_idle: config.reclaim_idle,
            ..Default::default()
        },
    );
    let keepalive_stop = CancellationToken::new();
    let keepalive = consumer.spawn_keepalive(keepalive_stop.clone());
    let consumed = consumer.run(shutdown.clone()).await;

    // Stop accepting work either way, then let running jobs finish.
    shutdown.cancel();
    pool.stop().await;
    keepalive_stop.cancel();
    if let Err(e) = keepalive.await {
        tracing::warn!(error = %e, "keepalive task failed");
    }
    if let Err(e) = cleaner_task.await {
        tracing::warn!(error = %e, "cleaner task failed");
    }
    consumed.context("Stream consumer failed")?;
    tracing::info!("runner stopped");
    Ok(())
}

//! Task Bridge server: boots the Consumer (Queue + Store + Heartbeat +
//! Scale-In Guard + a compute function) and exposes its probe surface
//! over HTTP (spec.md §4.4, §6).
//!
//! Bootstrap shape grounded in the teacher's `bin/fc-router::main`: load
//! `.env`, init structured logging, branch dev-mode (embedded sqlite,
//! no AWS credentials needed) vs production (SQS + DynamoDB), start the
//! Consumer, serve the axum probe router, wait on Ctrl+C/SIGTERM, then
//! shut both down in reverse order.

mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use tb_common::compute::{ComputeFailure, ComputeFn};
use tb_config::AppConfig;
use tb_consumer::{Consumer, ConsumerConfig};
use tb_guard::{GuardConfig, HttpScaleInGuard, NoopScaleInGuard, ScaleInGuard};
use tb_queue::QueueConsumer;
use tb_store::StatusStore;

/// Echoes the request body back as the result, annotated with the
/// message_id. A stand-in for the caller-supplied compute function this
/// binary does not itself define (spec.md's Producer/Consumer contract
/// takes the compute function as an external dependency); replace this
/// with a real implementation of `ComputeFn` to do actual work.
struct EchoCompute;

#[async_trait]
impl ComputeFn for EchoCompute {
    async fn compute(&self, body: Value, message_id: String) -> Result<Value, ComputeFailure> {
        Ok(serde_json::json!({ "received_body": body, "message_id": message_id }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tb_common::logging::init_logging("tb-server");

    info!("starting task-bridge server");

    let config = AppConfig::load().context("failed to load configuration")?;

    let queue: Arc<dyn QueueConsumer> = build_queue(&config).await?;
    let store: Arc<dyn StatusStore> = build_store(&config).await?;
    let guard: Arc<dyn ScaleInGuard> = build_guard(&config);

    let consumer_config = ConsumerConfig {
        queue_wait_time_seconds: config.consumer.queue_wait_time_seconds,
        in_progress_ttl_seconds: config.consumer.in_progress_ttl_seconds,
        heartbeat_visibility_timeout_seconds: config.consumer.heartbeat_visibility_timeout_seconds,
        heartbeat_interval_seconds: config.consumer.heartbeat_interval_seconds,
        non_retryable_error_kinds: config.consumer.non_retryable_error_kinds.clone(),
        stop_timeout: std::time::Duration::from_secs(config.consumer.stop_timeout_seconds),
    };

    let consumer = Arc::new(Consumer::new(queue, store, guard, Arc::new(EchoCompute), consumer_config));
    consumer.start_consuming().context("failed to start consumer")?;

    let app = api::router(api::AppState { consumer: consumer.clone() })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "probe server listening");

    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "probe server exited with an error");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");

    server_task.abort();
    consumer
        .stop_consuming(None)
        .await
        .context("consumer failed to stop within its timeout")?;

    info!("task-bridge server shutdown complete");
    Ok(())
}

async fn build_queue(config: &AppConfig) -> Result<Arc<dyn QueueConsumer>> {
    if config.dev_mode || config.queue.backend == "sqlite" {
        let path = format!("{}/queue.db", config.data_dir);
        std::fs::create_dir_all(&config.data_dir).context("failed to create data_dir")?;
        let pool = SqlitePoolOptions::new()
            .connect(&format!("sqlite://{path}?mode=rwc"))
            .await
            .context("failed to open embedded queue database")?;
        let queue = Arc::new(tb_queue::sqlite::SqliteQueue::new(
            pool,
            config.queue.name.clone(),
            config.consumer.heartbeat_visibility_timeout_seconds,
        ));
        tb_queue::EmbeddedQueue::init_schema(&*queue)
            .await
            .context("failed to initialize embedded queue schema")?;
        return Ok(queue);
    }

    let aws_config = load_aws_config(&config.queue.sqs.endpoint_url, &config.queue.sqs.region).await;
    let client = aws_sdk_sqs::Client::new(&aws_config);
    let consumer = tb_queue::sqs::SqsQueueConsumer::from_queue_url(
        client,
        config.queue.sqs.queue_url.clone(),
        config.consumer.heartbeat_visibility_timeout_seconds as i32,
    )
    .await
    .with_wait_time_seconds(config.consumer.queue_wait_time_seconds as i32);
    Ok(Arc::new(consumer))
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn StatusStore>> {
    if config.dev_mode || config.store.backend == "sqlite" {
        let path = format!("{}/store.db", config.data_dir);
        std::fs::create_dir_all(&config.data_dir).context("failed to create data_dir")?;
        let pool = SqlitePoolOptions::new()
            .connect(&format!("sqlite://{path}?mode=rwc"))
            .await
            .context("failed to open embedded store database")?;
        let store = Arc::new(tb_store::sqlite::SqliteStore::new(pool));
        store.init_schema().await.context("failed to initialize embedded store schema")?;
        return Ok(store);
    }

    let aws_config = load_aws_config(&config.store.dynamodb.endpoint_url, &config.store.dynamodb.region).await;
    let client = aws_sdk_dynamodb::Client::new(&aws_config);
    Ok(Arc::new(tb_store::dynamodb::DynamoDbStore::new(
        client,
        config.store.dynamodb.table_name.clone(),
    )))
}

async fn load_aws_config(endpoint_url: &str, region: &str) -> aws_config::SdkConfig {
    let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(aws_config::Region::new(region.to_string()));
    if !endpoint_url.is_empty() {
        builder = builder.endpoint_url(endpoint_url);
    }
    builder.load().await
}

fn build_guard(config: &AppConfig) -> Arc<dyn ScaleInGuard> {
    if !config.guard.enabled || config.guard.agent_uri.is_empty() {
        info!("scale-in guard disabled, using no-op guard");
        return Arc::new(NoopScaleInGuard);
    }

    Arc::new(HttpScaleInGuard::new(GuardConfig {
        agent_uri: config.guard.agent_uri.clone(),
        expires_in_minutes: Some(config.guard.expires_in_minutes),
        raise_for_req_error: config.guard.raise_for_req_error,
        raise_for_agent_error: config.guard.raise_for_agent_error,
        request_timeout: std::time::Duration::from_secs(config.guard.request_timeout_seconds),
        retries: config.guard.retries,
        backoff_factor: config.guard.backoff_factor,
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

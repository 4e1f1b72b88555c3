use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use chrono_tz::Tz;
use common_auth::JwtCodec;
use common_jobs::{ClaimedTask, TaskKind};
use common_observability::ServiceMetrics;
use common_storage::{HttpObjectGateway, LocalDiskGateway, StorageGateway};
use document_service::app::AppState;
use document_service::config::{load_document_config, StorageBackend};
use document_service::external::{
    AuditRendererClient, ConcatClient, EmailProvider, FieldLocatorClient, MailgunEmailProvider, StampClient,
};
use job_worker::config::{load_worker_config, WorkerConfig};
use job_worker::error::TaskError;
use job_worker::tasks;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))
        .body(axum::body::Body::from(state.metrics.encode()))
        .expect("failed to build metrics response")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let document_config = load_document_config()?;
    let worker_config = load_worker_config();

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&document_config.database_url)
        .await?;

    let jwt_codec = Arc::new(JwtCodec::new(&document_config.secret_key, document_config.jwt_config()));
    let metrics = Arc::new(ServiceMetrics::new("job-worker"));
    let http_client = reqwest::Client::new();

    let storage: Arc<dyn StorageGateway> = match document_config.storage_backend {
        StorageBackend::Disk => Arc::new(LocalDiskGateway::new(document_config.storage_root.clone())),
        StorageBackend::Http => Arc::new(HttpObjectGateway::new(
            http_client.clone(),
            document_config.storage_base_url.clone().unwrap_or_default(),
        )),
    };

    let field_locator = Arc::new(FieldLocatorClient::new(http_client.clone(), document_config.field_locator_url.clone()));
    let stamp_client = Arc::new(StampClient::new(http_client.clone(), document_config.stamp_service_url.clone()));
    let audit_renderer = Arc::new(AuditRendererClient::new(http_client.clone(), document_config.audit_renderer_url.clone()));
    let concat_client = Arc::new(ConcatClient::new(http_client.clone(), document_config.concat_service_url.clone()));

    let email_provider = match (&document_config.email_provider_url, &document_config.email_api_key) {
        (Some(url), Some(key)) => Some(Arc::new(MailgunEmailProvider::new(
            http_client.clone(),
            url.clone(),
            key.clone(),
            "noreply@document-service".to_string(),
        )) as Arc<dyn EmailProvider>),
        _ => {
            tracing::warn!("EMAIL_PROVIDER_URL/EMAIL_API_KEY not configured; send_email deliveries are skipped");
            None
        }
    };

    let business_timezone = Tz::from_str("UTC").expect("UTC is always a valid timezone");

    let state = AppState {
        db,
        jwt_codec,
        metrics,
        storage,
        field_locator,
        stamp_client,
        audit_renderer,
        concat_client,
        email_provider,
        max_file_size_bytes: document_config.max_file_size_bytes,
        business_timezone,
    };

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/internal/metrics", get(metrics_endpoint))
        .with_state(state.clone());

    let addr = SocketAddr::from((worker_config.host.parse::<std::net::IpAddr>()?, worker_config.port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "serving job-worker health/metrics");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            tracing::error!(%err, "health/metrics server exited");
        }
    });

    {
        let depth_state = state.clone();
        tokio::spawn(async move {
            queue_depth_loop(depth_state).await;
        });
    }

    let task_time_limit = Duration::from_secs(document_config.task_time_limit_secs);
    claim_loop(state, worker_config, task_time_limit).await;
    Ok(())
}

/// Rows currently pending in `scheduled_tasks`, polled on its own interval
/// rather than incremented/decremented around every claim so the gauge
/// stays correct across multiple worker processes sharing the same queue.
async fn queue_depth_loop(state: AppState) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        match sqlx::query_scalar::<_, i64>("SELECT count(*) FROM scheduled_tasks WHERE status = 'pending'")
            .fetch_one(&state.db)
            .await
        {
            Ok(count) => state.metrics.task_queue_depth.set(count),
            Err(err) => tracing::warn!(%err, "failed to sample queue depth"),
        }
    }
}

/// The claim/execute/complete-or-reschedule loop: claim one due row with
/// `FOR UPDATE SKIP LOCKED`, run its task body under the hard time limit,
/// and either delete it or reschedule it with backoff.
async fn claim_loop(state: AppState, worker_config: WorkerConfig, task_time_limit: Duration) {
    let webhook_client = reqwest::Client::new();
    loop {
        match common_jobs::claim_next(&state.db, &worker_config.worker_id).await {
            Ok(Some(task)) => {
                execute_claimed_task(&state, &webhook_client, &worker_config, task_time_limit, task).await;
            }
            Ok(None) => {
                tokio::time::sleep(Duration::from_millis(worker_config.poll_interval_ms)).await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to claim next task");
                tokio::time::sleep(Duration::from_millis(worker_config.poll_interval_ms)).await;
            }
        }
    }
}

async fn run_timed<F>(limit: Duration, fut: F) -> Result<(), TaskError>
where
    F: Future<Output = Result<(), TaskError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TaskError::TimedOut),
    }
}

async fn execute_claimed_task(
    state: &AppState,
    webhook_client: &reqwest::Client,
    worker_config: &WorkerConfig,
    task_time_limit: Duration,
    task: ClaimedTask,
) {
    let kind = match task.task_kind() {
        Ok(kind) => kind,
        Err(err) => {
            tracing::error!(task_id = %task.id, kind = %task.kind, %err, "unrecognized task kind");
            let _ = common_jobs::fail_and_reschedule(&state.db, &task).await;
            return;
        }
    };

    let start = std::time::Instant::now();
    let result = dispatch(state, webhook_client, worker_config, task_time_limit, kind, &task.payload).await;
    let elapsed = start.elapsed().as_secs_f64();
    state.metrics.task_duration_seconds.with_label_values(&[kind.as_str()]).observe(elapsed);

    match result {
        Ok(()) => {
            state.metrics.task_executions_total.with_label_values(&[kind.as_str(), "success"]).inc();
            if let Err(err) = common_jobs::complete(&state.db, task.id).await {
                tracing::error!(task_id = %task.id, %err, "failed to mark task complete");
            }
        }
        Err(err) => {
            let retryable = is_retryable(kind, &err);
            state.metrics.task_executions_total.with_label_values(&[kind.as_str(), "error"]).inc();
            tracing::warn!(task_id = %task.id, %kind, %err, retryable, "task execution failed");
            if retryable {
                if let Err(err) = common_jobs::fail_and_reschedule(&state.db, &task).await {
                    tracing::error!(task_id = %task.id, %err, "failed to reschedule task");
                }
            } else if let Err(err) = common_jobs::complete(&state.db, task.id).await {
                tracing::error!(task_id = %task.id, %err, "failed to drop non-retryable task");
            }
        }
    }
}

/// `invoke_webhooks_fileusage` retries only on the enqueue-before-commit
/// missing-row race; every other kind retries on any error. A
/// delivery failure to a subscriber URL never surfaces here: `dispatch_webhooks`
/// swallows those internally and counts them under `webhook_dispatch_total`
/// instead, so in practice this only ever sees `TaskError::MissingRow` for
/// that kind, but the check stays explicit so the contract doesn't silently
/// drift if the task body changes.
fn is_retryable(kind: TaskKind, err: &TaskError) -> bool {
    if kind.retries_on_any_error() {
        return true;
    }
    matches!(err, TaskError::MissingRow(_))
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: &AppState,
    webhook_client: &reqwest::Client,
    worker_config: &WorkerConfig,
    task_time_limit: Duration,
    kind: TaskKind,
    payload: &serde_json::Value,
) -> Result<(), TaskError> {
    match kind {
        TaskKind::LocateFields => {
            let payload = serde_json::from_value(payload.clone())?;
            run_timed(task_time_limit, tasks::locate_fields(state, payload)).await
        }
        TaskKind::StampPdf => {
            let payload = serde_json::from_value(payload.clone())?;
            run_timed(task_time_limit, tasks::stamp_pdf(state, payload)).await
        }
        TaskKind::RenderPages => {
            let payload = serde_json::from_value(payload.clone())?;
            run_timed(
                task_time_limit,
                tasks::render_pages(state, &worker_config.ghostscript_bin, payload),
            )
            .await
        }
        TaskKind::SendEmail => {
            let payload = serde_json::from_value(payload.clone())?;
            run_timed(task_time_limit, tasks::send_email(state, payload)).await
        }
        TaskKind::InvokeWebhooksFileUsage => {
            let payload = serde_json::from_value(payload.clone())?;
            run_timed(task_time_limit, tasks::invoke_webhooks_fileusage(state, webhook_client, payload)).await
        }
        TaskKind::InvokeWebhooksFieldUsage => {
            let payload = serde_json::from_value(payload.clone())?;
            run_timed(task_time_limit, tasks::invoke_webhooks_fieldusage(state, webhook_client, payload)).await
        }
        TaskKind::DeleteBlobs => {
            let payload = serde_json::from_value(payload.clone())?;
            run_timed(task_time_limit, tasks::delete_blobs(state, payload)).await
        }
    }
}

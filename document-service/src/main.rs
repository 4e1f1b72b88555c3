use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::Response,
    routing::{get, post},
    Router,
};
use chrono_tz::Tz;
use common_auth::JwtCodec;
use common_observability::ServiceMetrics;
use common_storage::{HttpObjectGateway, LocalDiskGateway, StorageGateway};
use document_service::app::AppState;
use document_service::config::{load_document_config, StorageBackend};
use document_service::external::{
    AuditRendererClient, ConcatClient, FieldLocatorClient, MailgunEmailProvider, StampClient,
};
use document_service::handlers::{
    account_documents, account_fields, agree_tos, bulk_fill, create_document, delete_document,
    document_audit, document_info, fill_signature, fill_text, get_document, remind,
};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(axum::extract::State(state): axum::extract::State<AppState>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))
        .body(axum::body::Body::from(state.metrics.encode()))
        .expect("failed to build metrics response")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = load_document_config()?;
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    let jwt_codec = Arc::new(JwtCodec::new(&config.secret_key, config.jwt_config()));
    let metrics = Arc::new(ServiceMetrics::new("document-service"));
    let http_client = reqwest::Client::new();

    let storage: Arc<dyn StorageGateway> = match config.storage_backend {
        StorageBackend::Disk => Arc::new(LocalDiskGateway::new(config.storage_root.clone())),
        StorageBackend::Http => Arc::new(HttpObjectGateway::new(
            http_client.clone(),
            config.storage_base_url.clone().unwrap_or_default(),
        )),
    };

    let field_locator = Arc::new(FieldLocatorClient::new(http_client.clone(), config.field_locator_url.clone()));
    let stamp_client = Arc::new(StampClient::new(http_client.clone(), config.stamp_service_url.clone()));
    let audit_renderer = Arc::new(AuditRendererClient::new(http_client.clone(), config.audit_renderer_url.clone()));
    let concat_client = Arc::new(ConcatClient::new(http_client.clone(), config.concat_service_url.clone()));

    let email_provider = match (&config.email_provider_url, &config.email_api_key) {
        (Some(url), Some(key)) => Some(Arc::new(MailgunEmailProvider::new(
            http_client.clone(),
            url.clone(),
            key.clone(),
            "noreply@document-service".to_string(),
        )) as Arc<dyn document_service::external::EmailProvider>),
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
        max_file_size_bytes: config.max_file_size_bytes,
        business_timezone,
    };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/document", post(create_document))
        .route("/document/:id", get(get_document).delete(delete_document))
        .route("/document/:id/info", get(document_info))
        .route("/document/:id/audit", get(document_audit))
        .route("/document/:id/agree-tos", post(agree_tos))
        .route("/document/:id/remind", post(remind))
        .route("/field/:id/fill", post(fill_signature))
        .route("/field/:id/fill-text", post(fill_text))
        .route("/field/bulk-fill", post(bulk_fill))
        .route("/account/documents", get(account_documents))
        .route("/account/fields", get(account_fields))
        .with_state(state)
        .layer(cors);

    let addr = SocketAddr::from((config.host.parse::<std::net::IpAddr>()?, config.port));

    tracing::info!(%addr, "starting document-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

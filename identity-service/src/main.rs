use std::{env, net::SocketAddr, sync::Arc};

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::Response,
    routing::{get, post},
    Router,
};
use common_auth::JwtCodec;
use common_observability::ServiceMetrics;
use identity_service::app::AppState;
use identity_service::config::load_identity_config;
use identity_service::handlers::{
    access_id_auth, change_password, create_account, delete_account, login, resurrect_account,
};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))
        .body(axum::body::Body::from(state.metrics.encode()))
        .expect("failed to build metrics response")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = load_identity_config()?;
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    let jwt_codec = Arc::new(JwtCodec::new(&config.secret_key, config.jwt_config()));
    let metrics = Arc::new(ServiceMetrics::new("identity-service"));

    let state = AppState {
        db,
        jwt_codec,
        metrics,
    };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/auth", post(login))
        .route("/auth/access-id", post(access_id_auth))
        .route("/account/create", post(create_account))
        .route("/account/change-password", post(change_password))
        .route("/account/delete", post(delete_account))
        .route("/account/resurrect", post(resurrect_account))
        .with_state(state)
        .layer(cors);

    let host = env::var("HOST").unwrap_or_else(|_| config.host.clone());
    let addr = SocketAddr::from((host.parse::<std::net::IpAddr>()?, config.port));

    tracing::info!(%addr, "starting identity-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

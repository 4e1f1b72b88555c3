use std::sync::Arc;

use axum::extract::FromRef;
use common_auth::JwtCodec;
use common_observability::ServiceMetrics;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub jwt_codec: Arc<JwtCodec>,
    pub metrics: Arc<ServiceMetrics>,
}

impl FromRef<AppState> for Arc<JwtCodec> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt_codec.clone()
    }
}

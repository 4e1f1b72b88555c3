use std::sync::Arc;

use axum::extract::FromRef;
use chrono_tz::Tz;
use common_auth::JwtCodec;
use common_observability::ServiceMetrics;
use common_storage::StorageGateway;
use sqlx::PgPool;

use crate::external::{AuditRendererClient, ConcatClient, EmailProvider, FieldLocatorClient, StampClient};

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub jwt_codec: Arc<JwtCodec>,
    pub metrics: Arc<ServiceMetrics>,
    pub storage: Arc<dyn StorageGateway>,
    pub field_locator: Arc<FieldLocatorClient>,
    pub stamp_client: Arc<StampClient>,
    pub audit_renderer: Arc<AuditRendererClient>,
    pub concat_client: Arc<ConcatClient>,
    pub email_provider: Option<Arc<dyn EmailProvider>>,
    pub max_file_size_bytes: u64,
    pub business_timezone: Tz,
}

impl FromRef<AppState> for Arc<JwtCodec> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt_codec.clone()
    }
}

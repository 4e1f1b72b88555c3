use common_http_errors::ApiError;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::external::AuditRendererClient;
use crate::repo;

/// Normalized audit row. `status` absorbs the `endstamp` null/non-null
/// remap; everything else passes its `usage_type` straight through.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub status: String,
    pub timestamp: String,
    pub data: Value,
}

/// JSON materialization: a repository query plus in-process mapping. Order
/// is ascending by timestamp (the HTTP surface may reverse it for display).
pub async fn document_audit_json(pool: &PgPool, document_id: Uuid) -> Result<Vec<AuditEntry>, ApiError> {
    let mut entries = Vec::new();

    let file_usages = repo::file_usages_for_audit(pool, document_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    for usage in file_usages {
        let status = if usage.usage_type == "endstamp" {
            if usage.file_id.is_some() { "stamp_success".to_string() } else { "stamp_failed".to_string() }
        } else {
            usage.usage_type.clone()
        };
        entries.push(AuditEntry {
            status,
            timestamp: usage.timestamp.to_rfc3339(),
            data: usage.data,
        });
    }

    let field_usages = repo::field_usages_for_document_with_user(pool, document_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    for row in field_usages {
        let mut data = row.usage.data;
        if let Value::Object(map) = &mut data {
            map.insert("user".to_string(), Value::String(row.username.unwrap_or_default()));
        }
        entries.push(AuditEntry {
            status: row.usage.usage_type,
            timestamp: row.usage.timestamp.to_rfc3339(),
            data,
        });
    }

    entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(entries)
}

/// PDF materialization: a thin client call to the external audit renderer,
/// following the call-then-propagate idiom used for every out-of-process
/// collaborator here.
pub async fn document_audit_pdf(
    pool: &PgPool,
    renderer: &AuditRendererClient,
    document_id: Uuid,
) -> Result<bytes::Bytes, ApiError> {
    let entries = document_audit_json(pool, document_id).await?;
    let payload = serde_json::to_value(&entries).map_err(|e| ApiError::internal(e, None))?;
    renderer.render(&payload).await.map_err(|e| ApiError::internal(e, None))
}

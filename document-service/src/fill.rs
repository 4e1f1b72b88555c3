use std::collections::HashMap;

use bytes::Bytes;
use chrono_tz::Tz;
use common_http_errors::ApiError;
use common_jobs::{StampPdfPayload, TaskKind};
use common_observability::ServiceMetrics;
use common_storage::StorageGateway;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::events;
use crate::lifecycle::now_formatted_date;
use crate::repo;

pub enum FillValue {
    Signature(Bytes),
    Text(String),
}

/// Appends the dependent-cascade FieldUsage rows for every Field whose
/// `parent_field_id` points at `field_id`. Only `date`
/// dependents exist today; anything else is an internal assertion failure
/// since `lifecycle::create_document` never allows one to be created.
async fn cascade_dependents(
    pool: &PgPool,
    tz: &Tz,
    field_id: Uuid,
) -> Result<Vec<i64>, ApiError> {
    let dependents = repo::dependents_of(pool, field_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;

    let today = now_formatted_date(tz);
    let mut usage_ids = Vec::new();
    for dependent in dependents {
        if dependent.field_type != "date" {
            return Err(ApiError::internal(
                format!("unsupported dependent field type: {}", dependent.field_type),
                None,
            ));
        }
        let usage_id = repo::append_field_usage(
            pool,
            dependent.id,
            None,
            "filled",
            json!({ "value": today }),
        )
        .await
        .map_err(|e| ApiError::internal(e, None))?;
        usage_ids.push(usage_id);
    }
    Ok(usage_ids)
}

/// Counts Fields with `user != null` lacking a `filled` FieldUsage; cascade
/// dependents (`user = null`) never count.
async fn is_complete(pool: &PgPool, document_id: Uuid) -> Result<bool, ApiError> {
    let unfilled = repo::unfilled_user_fields(pool, document_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    Ok(unfilled.is_empty())
}

/// Emits `all-fields-filled` and its webhook on the transition to complete.
/// Duplicate emission under concurrent final fills is accepted; downstream
/// consumers are idempotent by usage-row id.
async fn maybe_emit_completion(pool: &PgPool, document_id: Uuid) -> Result<(), ApiError> {
    if is_complete(pool, document_id).await? {
        let usage_id = repo::append_file_usage(pool, document_id, None, "all-fields-filled", json!({}))
            .await
            .map_err(|e| ApiError::internal(e, None))?;
        events::enqueue_file_usage_webhook(pool, usage_id)
            .await
            .map_err(|e| ApiError::internal(e, None))?;
    }
    Ok(())
}

async fn enqueue_stamp(pool: &PgPool, document_id: Uuid) -> Result<(), ApiError> {
    common_jobs::enqueue(pool, TaskKind::StampPdf, &StampPdfPayload { document_id }, None)
        .await
        .map_err(|e| ApiError::internal(e, None))
        .map(|_| ())
}

/// `POST /field/{id}/fill`. `ip` feeds the usage row's `data.ip`.
pub async fn fill_signature(
    pool: &PgPool,
    storage: &dyn StorageGateway,
    metrics: &ServiceMetrics,
    tz: &Tz,
    caller_id: Uuid,
    field_id: Uuid,
    png_bytes: Bytes,
    ip: String,
) -> Result<(), ApiError> {
    let field = repo::find_field(pool, field_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .filter(|f| f.user_id == Some(caller_id))
        .ok_or_else(|| ApiError::NotFound { code: "field_not_found", trace_id: None })?;

    let file_id = Uuid::new_v4();
    let blob_name = file_id.to_string();
    repo::create_file(pool, file_id, &blob_name, None)
        .await
        .map_err(|e| ApiError::internal(e, None))?;

    let usage_id = repo::append_field_usage(pool, field.id, Some(file_id), "filled", json!({ "ip": ip }))
        .await
        .map_err(|e| ApiError::internal(e, None))?;

    let dependent_usage_ids = cascade_dependents(pool, tz, field.id).await?;

    storage
        .upload(&blob_name, "image/png", png_bytes)
        .await
        .map_err(|e| ApiError::internal(e, None))?;

    maybe_emit_completion(pool, field.document_id).await?;
    enqueue_stamp(pool, field.document_id).await?;

    events::enqueue_field_usage_webhook(pool, usage_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    for id in dependent_usage_ids {
        events::enqueue_field_usage_webhook(pool, id)
            .await
            .map_err(|e| ApiError::internal(e, None))?;
    }

    metrics.fields_filled_total.with_label_values(&["signature"]).inc();
    Ok(())
}

/// `POST /field/{id}/fill-text`: same flow minus the blob upload.
pub async fn fill_text(
    pool: &PgPool,
    metrics: &ServiceMetrics,
    tz: &Tz,
    caller_id: Uuid,
    field_id: Uuid,
    value: String,
) -> Result<(), ApiError> {
    let field = repo::find_field(pool, field_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .filter(|f| f.user_id == Some(caller_id))
        .ok_or_else(|| ApiError::NotFound { code: "field_not_found", trace_id: None })?;

    let usage_id = repo::append_field_usage(pool, field.id, None, "filled", json!({ "value": value }))
        .await
        .map_err(|e| ApiError::internal(e, None))?;

    let dependent_usage_ids = cascade_dependents(pool, tz, field.id).await?;

    maybe_emit_completion(pool, field.document_id).await?;
    enqueue_stamp(pool, field.document_id).await?;

    events::enqueue_field_usage_webhook(pool, usage_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    for id in dependent_usage_ids {
        events::enqueue_field_usage_webhook(pool, id)
            .await
            .map_err(|e| ApiError::internal(e, None))?;
    }

    metrics.fields_filled_total.with_label_values(&["text"]).inc();
    Ok(())
}

/// `POST /field/bulk-fill`: per-entry validation/cascade/upload, but
/// at most one `stamp_pdf` enqueue for the whole batch.
pub async fn bulk_fill(
    pool: &PgPool,
    storage: &dyn StorageGateway,
    metrics: &ServiceMetrics,
    tz: &Tz,
    caller_id: Uuid,
    entries: HashMap<Uuid, FillValue>,
    ip: String,
) -> Result<(), ApiError> {
    let mut touched_documents = std::collections::HashSet::new();

    for (field_id, value) in entries {
        let field = repo::find_field(pool, field_id)
            .await
            .map_err(|e| ApiError::internal(e, None))?
            .filter(|f| f.user_id == Some(caller_id))
            .ok_or_else(|| ApiError::NotFound { code: "field_not_found", trace_id: None })?;

        let (usage_id, dependent_ids) = match value {
            FillValue::Signature(png_bytes) => {
                let file_id = Uuid::new_v4();
                let blob_name = file_id.to_string();
                repo::create_file(pool, file_id, &blob_name, None)
                    .await
                    .map_err(|e| ApiError::internal(e, None))?;
                let usage_id =
                    repo::append_field_usage(pool, field.id, Some(file_id), "filled", json!({ "ip": ip }))
                        .await
                        .map_err(|e| ApiError::internal(e, None))?;
                let dependent_ids = cascade_dependents(pool, tz, field.id).await?;
                storage
                    .upload(&blob_name, "image/png", png_bytes)
                    .await
                    .map_err(|e| ApiError::internal(e, None))?;
                metrics.fields_filled_total.with_label_values(&["signature"]).inc();
                (usage_id, dependent_ids)
            }
            FillValue::Text(text) => {
                let usage_id =
                    repo::append_field_usage(pool, field.id, None, "filled", json!({ "value": text }))
                        .await
                        .map_err(|e| ApiError::internal(e, None))?;
                let dependent_ids = cascade_dependents(pool, tz, field.id).await?;
                metrics.fields_filled_total.with_label_values(&["text"]).inc();
                (usage_id, dependent_ids)
            }
        };

        events::enqueue_field_usage_webhook(pool, usage_id)
            .await
            .map_err(|e| ApiError::internal(e, None))?;
        for id in dependent_ids {
            events::enqueue_field_usage_webhook(pool, id)
                .await
                .map_err(|e| ApiError::internal(e, None))?;
        }

        touched_documents.insert(field.document_id);
    }

    for document_id in &touched_documents {
        maybe_emit_completion(pool, *document_id).await?;
    }
    for document_id in touched_documents {
        enqueue_stamp(pool, document_id).await?;
    }

    Ok(())
}

/// `POST /document/{id}/agree-tos`: requires the caller to have at
/// least one field on the document.
pub async fn agree_tos(
    pool: &PgPool,
    caller_id: Uuid,
    document_id: Uuid,
    ip: String,
) -> Result<(), ApiError> {
    let has_field = repo::has_field_on_document(pool, document_id, caller_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    if !has_field {
        return Err(ApiError::Forbidden { trace_id: None });
    }

    let caller = identity_service::repo::find_user_by_id(pool, caller_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .ok_or_else(|| ApiError::internal("caller vanished mid-request", None))?;

    let usage_id = repo::append_file_usage(
        pool,
        document_id,
        None,
        "agree-tos",
        json!({ "ip": ip, "user": caller.username, "uid": caller_id.simple().to_string() }),
    )
    .await
    .map_err(|e| ApiError::internal(e, None))?;

    events::enqueue_file_usage_webhook(pool, usage_id)
        .await
        .map_err(|e| ApiError::internal(e, None))
}

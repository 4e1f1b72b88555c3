use std::collections::HashMap;

use bytes::Bytes;
use chrono::Utc;
use common_http_errors::ApiError;
use common_jobs::{DeleteBlobsPayload, LocateFieldsPayload, StampPdfPayload, TaskKind};
use common_observability::ServiceMetrics;
use common_storage::StorageGateway;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::external::FieldLocatorClient;
use crate::fieldref::{self, FieldType};
use crate::repo;

const ALLOWED_CONTENT_TYPES: &[&str] = &["application/pdf", "application/octet-stream"];
/// Reference fields only support `date` dependents today.
const SUPPORTED_DEPENDENT_TYPE: FieldType = FieldType::Date;

pub struct CreateDocumentInput {
    pub title: String,
    pub signators: HashMap<String, Option<String>>,
    pub content_type: String,
    pub pdf_bytes: Bytes,
}

pub struct CreateDocumentOutcome {
    pub document_id: Uuid,
    pub warnings: Vec<String>,
}

fn is_valid_email(candidate: &str) -> bool {
    let Some((local, domain)) = candidate.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !candidate.contains(' ')
        && candidate.matches('@').count() == 1
}

fn validate_content_type(content_type: &str) -> Result<(), ApiError> {
    if ALLOWED_CONTENT_TYPES.contains(&content_type) {
        Ok(())
    } else {
        Err(ApiError::UnsupportedMedia { code: "unsupported_media_type", trace_id: None })
    }
}

fn validate_size(bytes: &Bytes, max_file_size_bytes: u64) -> Result<(), ApiError> {
    if (bytes.len() as u64) <= max_file_size_bytes {
        Ok(())
    } else {
        Err(ApiError::PayloadTooLarge { trace_id: None })
    }
}

/// Full create-document procedure. Takes the already-parsed
/// multipart parts; HTTP-level concerns (trace id, content negotiation) stay
/// in `handlers.rs`.
#[allow(clippy::too_many_arguments)]
pub async fn create_document(
    pool: &PgPool,
    storage: &dyn StorageGateway,
    locator: &FieldLocatorClient,
    metrics: &ServiceMetrics,
    max_file_size_bytes: u64,
    caller_id: Uuid,
    business_id: Uuid,
    input: CreateDocumentInput,
) -> Result<CreateDocumentOutcome, ApiError> {
    // 1. content-type / size
    validate_content_type(&input.content_type)?;
    validate_size(&input.pdf_bytes, max_file_size_bytes)?;

    // 2. email syntax
    for email in input.signators.values().flatten() {
        if !is_valid_email(email) {
            return Err(ApiError::bad_request("invalid_signator_email", None));
        }
    }

    // 3. external field extraction
    let located = locator
        .locate_fields(input.pdf_bytes.clone())
        .await
        .map_err(|e| ApiError::internal(e, None))?;

    // 4. grammar parse, trimming names/values
    let mut descriptors: HashMap<String, fieldref::FieldDescriptor> = HashMap::new();
    for field in &located.fields {
        let name = field.name.trim().to_string();
        let raw_value = field.value.trim();
        if let Some(descriptor) = fieldref::parse_field_reference(raw_value) {
            descriptors.insert(name, descriptor);
        }
    }

    // 5. signator declarations
    for (field_name, _email) in &input.signators {
        let descriptor = descriptors
            .get(field_name.trim())
            .ok_or_else(|| ApiError::bad_request("unknown_signator_field", None))?;
        let field_type = FieldType::parse(&descriptor.field_type)
            .ok_or_else(|| ApiError::bad_request("invalid_field_type", None))?;
        if descriptor.parent.is_some() && field_type != FieldType::Date {
            return Err(ApiError::bad_request("parent_only_valid_for_date", None));
        }
    }

    // 6. reference-field validation
    let mut warnings = Vec::new();
    for (name, descriptor) in &descriptors {
        let Some(parent_name) = &descriptor.parent else { continue };
        match descriptors.get(parent_name) {
            Some(parent_descriptor) => {
                let parent_type = FieldType::parse(&parent_descriptor.field_type);
                let valid = parent_type.map(fieldref::is_valid_parent_type).unwrap_or(false);
                if !valid {
                    return Err(ApiError::bad_request("invalid_parent_field_type", None));
                }
            }
            None => {
                warnings.push(format!("field '{name}' references undeclared parent '{parent_name}'"));
            }
        }
    }

    // 7. allocate ids, create Document/File/FileUsage(created), upload blob
    let document_id = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    let blob_name = file_id.to_string();

    let mut tx = pool.begin().await.map_err(|e| ApiError::internal(e, None))?;
    sqlx::query("INSERT INTO documents (id, title, owner_user) VALUES ($1, $2, $3)")
        .bind(document_id)
        .bind(&input.title)
        .bind(caller_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    sqlx::query("INSERT INTO files (id, filename) VALUES ($1, $2)")
        .bind(file_id)
        .bind(&blob_name)
        .execute(&mut *tx)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    let (created_file_usage_id,): (i64,) = sqlx::query_as(
        "INSERT INTO file_usages (document_id, file_id, usage_type, data) VALUES ($1, $2, 'created', $3) RETURNING id",
    )
    .bind(document_id)
    .bind(file_id)
    .bind(json!({}))
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| ApiError::internal(e, None))?;

    storage
        .upload(&blob_name, "application/pdf", input.pdf_bytes.clone())
        .await
        .map_err(|e| ApiError::internal(e, None))?;

    // 8. signator fields
    let mut field_ids: HashMap<String, Uuid> = HashMap::new();
    let mut empty_field_usage_ids: Vec<i64> = Vec::new();
    for (field_name, email) in &input.signators {
        let descriptor = &descriptors[field_name.trim()];
        let user_id = match email {
            Some(email) => Some(
                identity_service::repo::find_or_create_passwordless_user(pool, email, business_id)
                    .await
                    .map_err(|e| ApiError::internal(e, None))?,
            ),
            None => None,
        };

        let field_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO fields (id, document_id, user_id, field_type, field_name) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(field_id)
        .bind(document_id)
        .bind(user_id)
        .bind(&descriptor.field_type)
        .bind(field_name)
        .execute(&mut *tx)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
        let (field_usage_id,): (i64,) = sqlx::query_as(
            "INSERT INTO field_usages (field_id, usage_type, data) VALUES ($1, 'empty', $2) RETURNING id",
        )
        .bind(field_id)
        .bind(json!({}))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
        empty_field_usage_ids.push(field_usage_id);

        field_ids.insert(field_name.trim().to_string(), field_id);
    }

    // 9. dependent reference fields whose parent was declared in step 8
    for (name, descriptor) in &descriptors {
        let Some(parent_name) = &descriptor.parent else { continue };
        let Some(&parent_field_id) = field_ids.get(parent_name) else { continue };
        if input.signators.contains_key(name) {
            continue;
        }
        let field_type = FieldType::parse(&descriptor.field_type).unwrap_or(SUPPORTED_DEPENDENT_TYPE);
        let field_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO fields (id, document_id, user_id, field_type, field_name, parent_field_id)
             VALUES ($1, $2, NULL, $3, $4, $5)",
        )
        .bind(field_id)
        .bind(document_id)
        .bind(field_type.as_str())
        .bind(name)
        .bind(parent_field_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    }

    tx.commit().await.map_err(|e| ApiError::internal(e, None))?;

    // enqueue webhook fan-out for every usage row inserted above, plus the
    // pipeline kickoff. All enqueues happen only after commit.
    crate::events::enqueue_file_usage_webhook(pool, created_file_usage_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    for field_usage_id in empty_field_usage_ids {
        crate::events::enqueue_field_usage_webhook(pool, field_usage_id)
            .await
            .map_err(|e| ApiError::internal(e, None))?;
    }
    common_jobs::enqueue(pool, TaskKind::LocateFields, &LocateFieldsPayload { document_id }, None)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    common_jobs::enqueue(pool, TaskKind::StampPdf, &StampPdfPayload { document_id }, None)
        .await
        .map_err(|e| ApiError::internal(e, None))?;

    metrics.documents_created_total.inc();
    Ok(CreateDocumentOutcome { document_id, warnings })
}

/// Owner-only delete: gathers blob names, cascades the row deletes,
/// commits, then enqueues `delete_blobs`.
pub async fn delete_document(
    pool: &PgPool,
    metrics: &ServiceMetrics,
    caller_id: Uuid,
    document_id: Uuid,
) -> Result<(), ApiError> {
    let document = repo::find_document(pool, document_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .ok_or_else(|| ApiError::NotFound { code: "document_not_found", trace_id: None })?;

    if document.owner_user != caller_id {
        return Err(ApiError::Forbidden { trace_id: None });
    }

    let blob_names = repo::delete_document_cascade(pool, document_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;

    if !blob_names.is_empty() {
        common_jobs::enqueue(pool, TaskKind::DeleteBlobs, &DeleteBlobsPayload { blob_names }, None)
            .await
            .map_err(|e| ApiError::internal(e, None))?;
    }

    metrics.documents_deleted_total.inc();
    Ok(())
}

/// Used by `remind` to decide whether a reminder needs a
/// fresh AccessURI or can reuse an existing one.
/// Returns `(access_uris.id, raw token)`: the raw token is what goes in the
/// emailed link, the id is only useful for revocation bookkeeping.
pub async fn ensure_access_uri(pool: &PgPool, user_id: Uuid, document_id: Uuid) -> Result<(Uuid, String), ApiError> {
    if let Some(existing) = repo::find_active_access_uri_for(pool, user_id, document_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
    {
        return Ok(existing);
    }

    let token = common_crypto::generate_access_uri_token();
    let id = identity_service::repo::create_access_uri(pool, &token, user_id, document_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    Ok((id, token))
}

pub fn now_formatted_date(tz: &chrono_tz::Tz) -> String {
    Utc::now().with_timezone(tz).format("%Y-%m-%d").to_string()
}

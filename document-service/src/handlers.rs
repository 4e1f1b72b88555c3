use std::collections::{HashMap, HashSet};

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use common_auth::AuthContext;
use common_http_errors::{ApiError, ApiResult};
use common_security::RequestIp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppState;
use crate::audit;
use crate::fill::{self, FillValue};
use crate::lifecycle::{self, CreateDocumentInput};
use crate::repo;

/// Every document-scoped endpoint enforces this rule: an access-URI
/// token (`scoped_document = Some(d)`) may only be used against the document
/// it was minted for; a login token (`None`) carries no such restriction.
fn check_scope(auth: &AuthContext, document_id: Uuid) -> ApiResult<()> {
    match auth.scoped_document() {
        Some(scoped) if scoped != document_id => {
            Err(ApiError::unauthorized("document_scope_mismatch", None))
        }
        _ => Ok(()),
    }
}

/// Resolves the document a field belongs to, so field-level endpoints
/// (`/field/{id}/fill`, `/field/{id}/fill-text`, `/field/bulk-fill`) can
/// enforce `check_scope` the same as document-level endpoints do; an
/// access-URI token scoped to document D must not be usable to fill a
/// field on some other document.
async fn field_document_id(state: &AppState, field_id: Uuid) -> ApiResult<Uuid> {
    repo::find_field(&state.db, field_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .map(|f| f.document_id)
        .ok_or_else(|| ApiError::NotFound { code: "field_not_found", trace_id: None })
}

async fn check_document_access(
    state: &AppState,
    auth: &AuthContext,
    document_id: Uuid,
    signer_accessible: bool,
) -> ApiResult<repo::Document> {
    check_scope(auth, document_id)?;
    let document = repo::find_document(&state.db, document_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .ok_or_else(|| ApiError::NotFound { code: "document_not_found", trace_id: None })?;

    let has_field = repo::has_field_on_document(&state.db, document_id, auth.subject())
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    let permitted = identity_service::handlers::is_permitted(
        document.owner_user,
        auth.subject(),
        signer_accessible,
        has_field,
    );
    if !permitted {
        return Err(ApiError::NotFound { code: "document_not_found", trace_id: None });
    }
    Ok(document)
}

// --- POST /document ---

#[derive(Debug, Serialize)]
pub struct CreateDocumentResponse {
    #[serde(rename = "docId")]
    pub doc_id: Uuid,
    pub warnings: Vec<String>,
}

/// `POST /document` multipart `{docName, signators (JSON), file (PDF)}`.
pub async fn create_document(
    State(state): State<AppState>,
    auth: AuthContext,
    mut multipart: Multipart,
) -> ApiResult<Json<CreateDocumentResponse>> {
    let mut title: Option<String> = None;
    let mut signators: Option<HashMap<String, Option<String>>> = None;
    let mut content_type = String::new();
    let mut file_bytes: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request("invalid_multipart", None).tap_log(e))?
    {
        match field.name().unwrap_or_default() {
            "docName" => {
                title = Some(field.text().await.map_err(|e| ApiError::internal(e, None))?);
            }
            "signators" => {
                let raw = field.text().await.map_err(|e| ApiError::internal(e, None))?;
                signators = Some(
                    serde_json::from_str(&raw)
                        .map_err(|_| ApiError::bad_request("invalid_signators", None))?,
                );
            }
            "file" => {
                content_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                file_bytes = Some(field.bytes().await.map_err(|e| ApiError::internal(e, None))?);
            }
            _ => {}
        }
    }

    let title = title.ok_or_else(|| ApiError::bad_request("missing_doc_name", None))?;
    let signators = signators.ok_or_else(|| ApiError::bad_request("missing_signators", None))?;
    let pdf_bytes = file_bytes.ok_or_else(|| ApiError::bad_request("missing_file", None))?;

    let business_id = identity_service::repo::find_user_by_id(&state.db, auth.subject())
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .ok_or_else(|| ApiError::unauthorized("invalid_credentials", None))?
        .business_id;

    let outcome = lifecycle::create_document(
        &state.db,
        state.storage.as_ref(),
        &state.field_locator,
        &state.metrics,
        state.max_file_size_bytes,
        auth.subject(),
        business_id,
        CreateDocumentInput { title, signators, content_type, pdf_bytes },
    )
    .await?;

    Ok(Json(CreateDocumentResponse { doc_id: outcome.document_id, warnings: outcome.warnings }))
}

// --- GET /document/{id} ---

#[derive(Debug, Deserialize)]
pub struct DocumentQuery {
    pub page: Option<i32>,
}

/// `GET /document/{id}`: PDF by default, PNG when `?page=` is
/// given. 503 + `Retry-After: 30` when `describe-fields` hasn't landed yet.
pub async fn get_document(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(document_id): Path<Uuid>,
    Query(query): Query<DocumentQuery>,
) -> Response {
    match get_document_inner(&state, &auth, document_id, query).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn get_document_inner(
    state: &AppState,
    auth: &AuthContext,
    document_id: Uuid,
    query: DocumentQuery,
) -> ApiResult<Response> {
    check_document_access(state, auth, document_id, true).await?;

    if let Some(page) = query.page {
        let Some(rendered) = repo::find_rendered_page(&state.db, document_id, page)
            .await
            .map_err(|e| ApiError::internal(e, None))?
        else {
            return Ok(retry_later());
        };
        let file = repo::find_file(&state.db, rendered.file_id)
            .await
            .map_err(|e| ApiError::internal(e, None))?
            .ok_or_else(|| ApiError::NotFound { code: "page_not_found", trace_id: None })?;
        let bytes = state
            .storage
            .download(&file.filename)
            .await
            .map_err(|e| ApiError::internal(e, None))?;
        return Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response());
    }

    let Some((_, file)) =
        repo::latest_document_file(&state.db, document_id, &["created", "updated", "endstamp"])
            .await
            .map_err(|e| ApiError::internal(e, None))?
    else {
        return Ok(retry_later());
    };
    let bytes = state
        .storage
        .download(&file.filename)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    Ok(([(header::CONTENT_TYPE, "application/pdf")], bytes).into_response())
}

/// 503 + `Retry-After: 30` for a document whose pipeline hasn't produced the
/// requested artifact yet.
fn retry_later() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, [(header::RETRY_AFTER, "30")], "document not ready").into_response()
}

// --- DELETE /document/{id} ---

pub async fn delete_document(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(document_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    check_scope(&auth, document_id)?;
    lifecycle::delete_document(&state.db, &state.metrics, auth.subject(), document_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- GET /document/{id}/info ---

#[derive(Debug, Serialize)]
pub struct DocumentInfoResponse {
    pub title: String,
    pub pages: Vec<PageInfo>,
    pub fields: Vec<FieldInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PageInfo {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Serialize)]
pub struct FieldInfo {
    pub id: Uuid,
    pub name: String,
    pub field_type: String,
    pub user_id: Option<Uuid>,
}

pub async fn document_info(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(document_id): Path<Uuid>,
) -> Response {
    match document_info_inner(&state, &auth, document_id).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn document_info_inner(
    state: &AppState,
    auth: &AuthContext,
    document_id: Uuid,
) -> ApiResult<Response> {
    let document = check_document_access(state, auth, document_id, true).await?;

    let Some(describe_usage) = repo::latest_describe_fields(&state.db, document_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
    else {
        return Ok(retry_later());
    };

    let fields = repo::fields_for_document(&state.db, document_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .into_iter()
        .map(|f| FieldInfo { id: f.id, name: f.field_name, field_type: f.field_type, user_id: f.user_id })
        .collect();

    let pages = describe_usage
        .data
        .get("pages")
        .and_then(|v| serde_json::from_value::<Vec<PageInfo>>(v.clone()).ok())
        .unwrap_or_default();

    Ok(Json(DocumentInfoResponse { title: document.title, pages, fields }).into_response())
}

// --- GET /document/{id}/audit ---

pub async fn document_audit(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(document_id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    match document_audit_inner(&state, &auth, document_id, &headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn document_audit_inner(
    state: &AppState,
    auth: &AuthContext,
    document_id: Uuid,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    check_document_access(state, auth, document_id, true).await?;

    let wants_pdf = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("application/pdf"))
        .unwrap_or(false);

    if wants_pdf {
        let bytes = audit::document_audit_pdf(&state.db, &state.audit_renderer, document_id).await?;
        return Ok(([(header::CONTENT_TYPE, "application/pdf")], bytes).into_response());
    }

    let mut entries = audit::document_audit_json(&state.db, document_id).await?;
    entries.reverse();
    Ok(Json(entries).into_response())
}

// --- POST /document/{id}/agree-tos ---

pub async fn agree_tos(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(document_id): Path<Uuid>,
    ip: RequestIp,
) -> ApiResult<StatusCode> {
    check_scope(&auth, document_id)?;
    fill::agree_tos(&state.db, auth.subject(), document_id, ip.to_string()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- POST /document/{id}/remind ---

#[derive(Debug, Deserialize)]
pub struct RemindRequest {
    pub email: Option<String>,
}

pub async fn remind(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(document_id): Path<Uuid>,
    body: Option<Json<RemindRequest>>,
) -> ApiResult<StatusCode> {
    check_scope(&auth, document_id)?;
    let document = repo::find_document(&state.db, document_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .ok_or_else(|| ApiError::NotFound { code: "document_not_found", trace_id: None })?;
    if document.owner_user != auth.subject() {
        return Err(ApiError::Forbidden { trace_id: None });
    }

    let email = body.and_then(|Json(req)| req.email);
    if let Some(email) = &email {
        let signator = identity_service::repo::find_user_by_username(&state.db, email)
            .await
            .map_err(|e| ApiError::internal(e, None))?;
        let has_field = match signator {
            Some(user) => repo::has_field_on_document(&state.db, document_id, user.id)
                .await
                .map_err(|e| ApiError::internal(e, None))?,
            None => false,
        };
        if !has_field {
            return Err(ApiError::bad_request("user_not_on_document", None));
        }
    }

    common_jobs::enqueue(
        &state.db,
        common_jobs::TaskKind::SendEmail,
        &common_jobs::SendEmailPayload { document_id, email },
        None,
    )
    .await
    .map_err(|e| ApiError::internal(e, None))?;

    Ok(StatusCode::ACCEPTED)
}

// --- POST /field/{id}/fill ---

pub async fn fill_signature(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(field_id): Path<Uuid>,
    ip: RequestIp,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != "image/png" {
        return Err(ApiError::UnsupportedMedia { code: "unsupported_media_type", trace_id: None });
    }

    check_scope(&auth, field_document_id(&state, field_id).await?)?;

    fill::fill_signature(
        &state.db,
        state.storage.as_ref(),
        &state.metrics,
        &state.business_timezone,
        auth.subject(),
        field_id,
        body,
        ip.to_string(),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- POST /field/{id}/fill-text ---

#[derive(Debug, Deserialize)]
pub struct FillTextRequest {
    pub value: String,
}

pub async fn fill_text(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(field_id): Path<Uuid>,
    Json(req): Json<FillTextRequest>,
) -> ApiResult<StatusCode> {
    check_scope(&auth, field_document_id(&state, field_id).await?)?;

    fill::fill_text(&state.db, &state.metrics, &state.business_timezone, auth.subject(), field_id, req.value)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- POST /field/bulk-fill ---

pub async fn bulk_fill(
    State(state): State<AppState>,
    auth: AuthContext,
    ip: RequestIp,
    mut multipart: Multipart,
) -> ApiResult<StatusCode> {
    let mut entries: HashMap<Uuid, FillValue> = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request("invalid_multipart", None).tap_log(e))?
    {
        let Some(name) = field.name().map(str::to_string) else { continue };
        let Ok(field_id) = name.parse::<Uuid>() else { continue };

        let value = if field
            .content_type()
            .map(|ct| ct == "image/png")
            .unwrap_or(false)
        {
            FillValue::Signature(field.bytes().await.map_err(|e| ApiError::internal(e, None))?)
        } else {
            FillValue::Text(field.text().await.map_err(|e| ApiError::internal(e, None))?)
        };
        entries.insert(field_id, value);
    }

    let mut checked_documents: HashSet<Uuid> = HashSet::new();
    for field_id in entries.keys() {
        let document_id = field_document_id(&state, *field_id).await?;
        if checked_documents.insert(document_id) {
            check_scope(&auth, document_id)?;
        }
    }

    fill::bulk_fill(
        &state.db,
        state.storage.as_ref(),
        &state.metrics,
        &state.business_timezone,
        auth.subject(),
        entries,
        ip.to_string(),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- GET /account/documents ---

#[derive(Debug, Serialize)]
pub struct DocumentSummary {
    pub id: Uuid,
    pub title: String,
}

pub async fn account_documents(
    State(state): State<AppState>,
    auth: AuthContext,
) -> ApiResult<Json<Vec<DocumentSummary>>> {
    let documents = repo::documents_owned_by(&state.db, auth.subject())
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .into_iter()
        .map(|d| DocumentSummary { id: d.id, title: d.title })
        .collect();
    Ok(Json(documents))
}

// --- GET /account/fields ---

#[derive(Debug, Serialize)]
pub struct AccountFieldSummary {
    pub id: Uuid,
    pub status: String,
    pub title: String,
    pub timestamp: String,
}

pub async fn account_fields(
    State(state): State<AppState>,
    auth: AuthContext,
) -> ApiResult<Json<Vec<AccountFieldSummary>>> {
    let rows = repo::latest_field_usages_for_user(&state.db, auth.subject())
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .into_iter()
        .map(|(field, usage)| AccountFieldSummary {
            id: field.id,
            status: usage.usage_type,
            title: field.field_name,
            timestamp: usage.timestamp.to_rfc3339(),
        })
        .collect();
    Ok(Json(rows))
}

trait LogDiscard {
    fn tap_log<E: std::fmt::Display>(self, e: E) -> Self;
}

impl LogDiscard for ApiError {
    fn tap_log<E: std::fmt::Display>(self, e: E) -> Self {
        tracing::debug!(error = %e, "request rejected");
        self
    }
}

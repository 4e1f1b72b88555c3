use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub owner_user: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Field {
    pub id: Uuid,
    pub document_id: Uuid,
    pub user_id: Option<Uuid>,
    pub field_type: String,
    pub field_name: String,
    pub parent_field_id: Option<Uuid>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct File {
    pub id: Uuid,
    pub filename: String,
    pub request_uri: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileUsage {
    pub id: i64,
    pub document_id: Uuid,
    pub file_id: Option<Uuid>,
    pub usage_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FieldUsage {
    pub id: i64,
    pub field_id: Uuid,
    pub file_id: Option<Uuid>,
    pub usage_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RenderedPage {
    pub id: Uuid,
    pub file_id: Uuid,
    pub document_id: Uuid,
    pub page_number: i32,
}

/// A FieldUsage joined to the signer's username, for the merged audit view:
/// field events carry the signer's username in `data.user`.
#[derive(Debug, Clone)]
pub struct FieldUsageWithUser {
    pub usage: FieldUsage,
    pub username: Option<String>,
}

// --- Document ---

pub async fn create_document(
    pool: &PgPool,
    id: Uuid,
    title: &str,
    owner_user: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO documents (id, title, owner_user) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(title)
        .bind(owner_user)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_document(pool: &PgPool, id: Uuid) -> Result<Option<Document>, sqlx::Error> {
    sqlx::query_as::<_, Document>(
        "SELECT id, title, owner_user, created_at FROM documents WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn documents_owned_by(pool: &PgPool, owner_user: Uuid) -> Result<Vec<Document>, sqlx::Error> {
    sqlx::query_as::<_, Document>(
        "SELECT id, title, owner_user, created_at FROM documents WHERE owner_user = $1 ORDER BY created_at DESC",
    )
    .bind(owner_user)
    .fetch_all(pool)
    .await
}

/// Gathers blob names referenced by this document's FileUsages and
/// RenderedPages, then deletes the document's rows in the order required by
/// foreign keys, returning the names for the caller to enqueue `delete_blobs`
/// with.
pub async fn delete_document_cascade(pool: &PgPool, document_id: Uuid) -> Result<Vec<String>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let names: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT f.filename FROM files f
         WHERE f.id IN (SELECT file_id FROM file_usages WHERE document_id = $1 AND file_id IS NOT NULL)
            OR f.id IN (SELECT file_id FROM rendered_pages WHERE document_id = $1)",
    )
    .bind(document_id)
    .fetch_all(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM rendered_pages WHERE document_id = $1")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM field_usages WHERE field_id IN (SELECT id FROM fields WHERE document_id = $1)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM file_usages WHERE document_id = $1")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM files WHERE id IN (
            SELECT file_id FROM file_usages WHERE document_id = $1 AND file_id IS NOT NULL
         )",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM fields WHERE document_id = $1")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM access_uris WHERE document_id = $1")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM documents WHERE id = $1")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(names.into_iter().map(|(n,)| n).collect())
}

pub async fn document_owner_business(pool: &PgPool, document_id: Uuid) -> Result<Option<Uuid>, sqlx::Error> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT u.business_id FROM documents d JOIN users u ON u.id = d.owner_user WHERE d.id = $1",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id,)| id))
}

// --- Field ---

pub async fn find_field(pool: &PgPool, id: Uuid) -> Result<Option<Field>, sqlx::Error> {
    sqlx::query_as::<_, Field>(
        "SELECT id, document_id, user_id, field_type, field_name, parent_field_id
         FROM fields WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn fields_for_document(pool: &PgPool, document_id: Uuid) -> Result<Vec<Field>, sqlx::Error> {
    sqlx::query_as::<_, Field>(
        "SELECT id, document_id, user_id, field_type, field_name, parent_field_id
         FROM fields WHERE document_id = $1",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await
}

pub async fn dependents_of(pool: &PgPool, parent_field_id: Uuid) -> Result<Vec<Field>, sqlx::Error> {
    sqlx::query_as::<_, Field>(
        "SELECT id, document_id, user_id, field_type, field_name, parent_field_id
         FROM fields WHERE parent_field_id = $1",
    )
    .bind(parent_field_id)
    .fetch_all(pool)
    .await
}

/// The `has_field_on_document` predicate `identity_service::handlers::is_permitted`
/// needs but can't itself compute (it doesn't own the Field table).
pub async fn has_field_on_document(
    pool: &PgPool,
    document_id: Uuid,
    user_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM fields WHERE document_id = $1 AND user_id = $2 LIMIT 1",
    )
    .bind(document_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

// --- File ---

pub async fn create_file(
    pool: &PgPool,
    id: Uuid,
    filename: &str,
    request_uri: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO files (id, filename, request_uri) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(filename)
        .bind(request_uri)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_file(pool: &PgPool, id: Uuid) -> Result<Option<File>, sqlx::Error> {
    sqlx::query_as::<_, File>("SELECT id, filename, request_uri FROM files WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

// --- FileUsage ---

pub async fn append_file_usage(
    pool: &PgPool,
    document_id: Uuid,
    file_id: Option<Uuid>,
    usage_type: &str,
    data: Value,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO file_usages (document_id, file_id, usage_type, data)
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(document_id)
    .bind(file_id)
    .bind(usage_type)
    .bind(data)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

/// Newest FileUsage of one of `usage_types` carrying a non-null file
/// (`latest-document-file`).
pub async fn latest_document_file(
    pool: &PgPool,
    document_id: Uuid,
    usage_types: &[&str],
) -> Result<Option<(FileUsage, File)>, sqlx::Error> {
    let types: Vec<String> = usage_types.iter().map(|s| s.to_string()).collect();
    let row = sqlx::query_as::<_, (i64, Uuid, Option<Uuid>, String, Value, DateTime<Utc>, Uuid, String, Option<String>)>(
        "SELECT fu.id, fu.document_id, fu.file_id, fu.usage_type, fu.data, fu.timestamp, f.id, f.filename, f.request_uri
         FROM file_usages fu JOIN files f ON f.id = fu.file_id
         WHERE fu.document_id = $1 AND fu.usage_type = ANY($2) AND fu.file_id IS NOT NULL
         ORDER BY fu.timestamp DESC LIMIT 1",
    )
    .bind(document_id)
    .bind(&types)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id, document_id, file_id, usage_type, data, timestamp, fid, filename, request_uri)| {
        (
            FileUsage { id, document_id, file_id, usage_type, data, timestamp },
            File { id: fid, filename, request_uri },
        )
    }))
}

/// Earliest FileUsage among `created`/`updated` carrying a file: the
/// original uploaded PDF `stamp_pdf` always re-stamps from, as opposed to
/// `latest_document_file`'s newest-wins reader contract.
pub async fn source_document_file(pool: &PgPool, document_id: Uuid) -> Result<Option<(FileUsage, File)>, sqlx::Error> {
    let row = sqlx::query_as::<_, (i64, Uuid, Option<Uuid>, String, Value, DateTime<Utc>, Uuid, String, Option<String>)>(
        "SELECT fu.id, fu.document_id, fu.file_id, fu.usage_type, fu.data, fu.timestamp, f.id, f.filename, f.request_uri
         FROM file_usages fu JOIN files f ON f.id = fu.file_id
         WHERE fu.document_id = $1 AND fu.usage_type IN ('created', 'updated') AND fu.file_id IS NOT NULL
         ORDER BY fu.timestamp ASC LIMIT 1",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id, document_id, file_id, usage_type, data, timestamp, fid, filename, request_uri)| {
        (
            FileUsage { id, document_id, file_id, usage_type, data, timestamp },
            File { id: fid, filename, request_uri },
        )
    }))
}

pub async fn find_file_usage(pool: &PgPool, id: i64) -> Result<Option<FileUsage>, sqlx::Error> {
    sqlx::query_as::<_, FileUsage>(
        "SELECT id, document_id, file_id, usage_type, data, timestamp FROM file_usages WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Newest `describe-fields` FileUsage, carrying the parsed page geometry
/// `locate_fields` wrote. Excluded from the audit surface by
/// `file_usages_for_audit`, so `info` reads it separately.
pub async fn latest_describe_fields(pool: &PgPool, document_id: Uuid) -> Result<Option<FileUsage>, sqlx::Error> {
    sqlx::query_as::<_, FileUsage>(
        "SELECT id, document_id, file_id, usage_type, data, timestamp FROM file_usages
         WHERE document_id = $1 AND usage_type = 'describe-fields'
         ORDER BY timestamp DESC LIMIT 1",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await
}

pub async fn file_usages_for_audit(pool: &PgPool, document_id: Uuid) -> Result<Vec<FileUsage>, sqlx::Error> {
    sqlx::query_as::<_, FileUsage>(
        "SELECT id, document_id, file_id, usage_type, data, timestamp FROM file_usages
         WHERE document_id = $1 AND usage_type <> 'describe-fields'
         ORDER BY timestamp ASC",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await
}

// --- FieldUsage ---

pub async fn append_field_usage(
    pool: &PgPool,
    field_id: Uuid,
    file_id: Option<Uuid>,
    usage_type: &str,
    data: Value,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO field_usages (field_id, file_id, usage_type, data)
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(field_id)
    .bind(file_id)
    .bind(usage_type)
    .bind(data)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

/// A FieldUsage joined to its field's document and signer id, for webhook
/// fan-out where the payload needs `doc_id`/`user_id` the bare row
/// doesn't carry.
pub struct FieldUsageWithContext {
    pub usage: FieldUsage,
    pub document_id: Uuid,
    pub user_id: Option<Uuid>,
}

pub async fn find_field_usage(pool: &PgPool, id: i64) -> Result<Option<FieldUsageWithContext>, sqlx::Error> {
    let row = sqlx::query_as::<_, (i64, Uuid, Option<Uuid>, String, Value, DateTime<Utc>, Uuid, Option<Uuid>)>(
        "SELECT fu.id, fu.field_id, fu.file_id, fu.usage_type, fu.data, fu.timestamp, f.document_id, f.user_id
         FROM field_usages fu JOIN fields f ON f.id = fu.field_id
         WHERE fu.id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id, field_id, file_id, usage_type, data, timestamp, document_id, user_id)| {
        FieldUsageWithContext {
            usage: FieldUsage { id, field_id, file_id, usage_type, data, timestamp },
            document_id,
            user_id,
        }
    }))
}

pub async fn latest_field_usage(pool: &PgPool, field_id: Uuid) -> Result<Option<FieldUsage>, sqlx::Error> {
    sqlx::query_as::<_, FieldUsage>(
        "SELECT id, field_id, file_id, usage_type, data, timestamp FROM field_usages
         WHERE field_id = $1 ORDER BY timestamp DESC LIMIT 1",
    )
    .bind(field_id)
    .fetch_optional(pool)
    .await
}

/// `unfilled-user-fields(document)`: Fields with `user ≠ null` and no
/// `filled` row yet.
pub async fn unfilled_user_fields(pool: &PgPool, document_id: Uuid) -> Result<Vec<Field>, sqlx::Error> {
    sqlx::query_as::<_, Field>(
        "SELECT f.id, f.document_id, f.user_id, f.field_type, f.field_name, f.parent_field_id
         FROM fields f
         WHERE f.document_id = $1 AND f.user_id IS NOT NULL
           AND NOT EXISTS (
             SELECT 1 FROM field_usages fu WHERE fu.field_id = f.id AND fu.usage_type = 'filled'
           )",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await
}

pub async fn field_usages_for_document_with_user(
    pool: &PgPool,
    document_id: Uuid,
) -> Result<Vec<FieldUsageWithUser>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i64, Uuid, Option<Uuid>, String, Value, DateTime<Utc>, Option<String>)>(
        "SELECT fu.id, fu.field_id, fu.file_id, fu.usage_type, fu.data, fu.timestamp, u.username
         FROM field_usages fu
         JOIN fields f ON f.id = fu.field_id
         LEFT JOIN users u ON u.id = f.user_id
         WHERE f.document_id = $1
         ORDER BY fu.timestamp ASC",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, field_id, file_id, usage_type, data, timestamp, username)| FieldUsageWithUser {
            usage: FieldUsage { id, field_id, file_id, usage_type, data, timestamp },
            username,
        })
        .collect())
}

/// Feeds `GET /account/fields`: newest usage per field owned by `user_id`,
/// across every document.
pub async fn latest_field_usages_for_user(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<(Field, FieldUsage)>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (Uuid, Uuid, Option<Uuid>, String, String, Option<Uuid>, i64, Option<Uuid>, String, Value, DateTime<Utc>)>(
        "SELECT f.id, f.document_id, f.user_id, f.field_type, f.field_name, f.parent_field_id,
                fu.id, fu.file_id, fu.usage_type, fu.data, fu.timestamp
         FROM fields f
         JOIN LATERAL (
             SELECT * FROM field_usages WHERE field_id = f.id ORDER BY timestamp DESC LIMIT 1
         ) fu ON true
         WHERE f.user_id = $1
         ORDER BY fu.timestamp DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(fid, document_id, user_id, field_type, field_name, parent_field_id, uid, file_id, usage_type, data, timestamp)| {
            (
                Field { id: fid, document_id, user_id, field_type, field_name, parent_field_id },
                FieldUsage { id: uid, field_id: fid, file_id, usage_type, data, timestamp },
            )
        })
        .collect())
}

// --- RenderedPage ---

pub async fn create_rendered_page(
    pool: &PgPool,
    id: Uuid,
    file_id: Uuid,
    document_id: Uuid,
    page_number: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO rendered_pages (id, file_id, document_id, page_number) VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(file_id)
    .bind(document_id)
    .bind(page_number)
    .execute(pool)
    .await?;
    Ok(())
}

/// Newest RenderedPage row per page number (older rows for the same page are
/// ignored by readers, per `render_pages`'s overwrite contract).
pub async fn latest_rendered_pages(pool: &PgPool, document_id: Uuid) -> Result<Vec<RenderedPage>, sqlx::Error> {
    sqlx::query_as::<_, RenderedPage>(
        "SELECT DISTINCT ON (page_number) id, file_id, document_id, page_number
         FROM rendered_pages WHERE document_id = $1
         ORDER BY page_number, created_at DESC",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await
}

pub async fn find_rendered_page(
    pool: &PgPool,
    document_id: Uuid,
    page_number: i32,
) -> Result<Option<RenderedPage>, sqlx::Error> {
    sqlx::query_as::<_, RenderedPage>(
        "SELECT id, file_id, document_id, page_number FROM rendered_pages
         WHERE document_id = $1 AND page_number = $2
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(document_id)
    .bind(page_number)
    .fetch_optional(pool)
    .await
}

// --- BusinessConfig ---

/// `webhook` rows (one per configured URL) for the business owning a document.
pub async fn webhook_urls_for_business(pool: &PgPool, business_id: Uuid) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(Value,)> = sqlx::query_as(
        "SELECT values_json FROM business_config WHERE business_id = $1 AND key = 'webhook'",
    )
    .bind(business_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(json,)| json.get("url").and_then(|v| v.as_str()).map(str::to_string))
        .collect())
}

pub async fn email_template_for_business(pool: &PgPool, business_id: Uuid) -> Result<Option<Value>, sqlx::Error> {
    let row: Option<(Value,)> = sqlx::query_as(
        "SELECT values_json FROM business_config WHERE business_id = $1 AND key = 'email-template' LIMIT 1",
    )
    .bind(business_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(v,)| v))
}

/// Finds a non-revoked AccessURI already granting `user_id` access to
/// `document_id`, so `remind` doesn't mint a second one.
pub async fn find_active_access_uri_for(
    pool: &PgPool,
    user_id: Uuid,
    document_id: Uuid,
) -> Result<Option<(Uuid, String)>, sqlx::Error> {
    let row: Option<(Uuid, String)> = sqlx::query_as(
        "SELECT id, uri FROM access_uris WHERE user_id = $1 AND document_id = $2 AND revoked = false LIMIT 1",
    )
    .bind(user_id)
    .bind(document_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

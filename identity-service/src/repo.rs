use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: Option<String>,
    pub business_id: Uuid,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

pub async fn find_business(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM businesses WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

pub async fn create_business(pool: &PgPool, id: Uuid, name: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO businesses (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_user_by_username(
    pool: &PgPool,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, password_hash, business_id, deleted, created_at
         FROM users WHERE username = $1",
    )
    .bind(username)
    .fetch_optional(pool)
    .await
}

pub async fn find_user_by_id(pool: &PgPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT id, username, password_hash, business_id, deleted, created_at
         FROM users WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Creates a user attached to `business_id`. `password_hash = None` yields a
/// password-less user reachable only via an AccessURI.
pub async fn create_user(
    pool: &PgPool,
    id: Uuid,
    username: &str,
    password_hash: Option<&str>,
    business_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO users (id, username, password_hash, business_id)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(username)
    .bind(password_hash)
    .bind(business_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Looks up a user by username within a business, creating a password-less
/// one if none exists (document-create's per-signator lookup-or-create).
/// Exposed here since both identity-service and
/// document-service need it against the same `users` table.
pub async fn find_or_create_passwordless_user(
    pool: &PgPool,
    username: &str,
    business_id: Uuid,
) -> Result<Uuid, sqlx::Error> {
    if let Some(existing) = find_user_by_username(pool, username).await? {
        return Ok(existing.id);
    }
    let id = Uuid::new_v4();
    create_user(pool, id, username, None, business_id).await?;
    Ok(id)
}

pub async fn set_password_hash(
    pool: &PgPool,
    user_id: Uuid,
    password_hash: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
        .bind(user_id)
        .bind(password_hash)
        .execute(pool)
        .await?;
    Ok(())
}

/// Soft-delete: sets `deleted` and bulk-revokes the user's AccessURIs in the
/// same transaction.
pub async fn soft_delete_user(pool: &PgPool, user_id: Uuid) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE users SET deleted = true WHERE id = $1")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE access_uris SET revoked = true WHERE user_id = $1")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn resurrect_user(pool: &PgPool, user_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET deleted = false WHERE id = $1")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccessUriRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub document_id: Uuid,
    pub revoked: bool,
}

pub async fn find_access_uri(pool: &PgPool, uri: &str) -> Result<Option<AccessUriRow>, sqlx::Error> {
    sqlx::query_as::<_, AccessUriRow>(
        "SELECT id, user_id, document_id, revoked FROM access_uris WHERE uri = $1",
    )
    .bind(uri)
    .fetch_optional(pool)
    .await
}

pub async fn create_access_uri(
    pool: &PgPool,
    uri: &str,
    user_id: Uuid,
    document_id: Uuid,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO access_uris (id, uri, user_id, document_id) VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(uri)
    .bind(user_id)
    .bind(document_id)
    .execute(pool)
    .await?;
    Ok(id)
}

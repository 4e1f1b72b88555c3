mod support;

use std::sync::Arc;

use anyhow::Result;
use common_auth::{JwtCodec, JwtConfig};
use common_jobs::{DeleteBlobsPayload, InvokeWebhooksFileUsagePayload, LocateFieldsPayload};
use common_observability::ServiceMetrics;
use common_storage::{LocalDiskGateway, StorageGateway};
use document_service::app::AppState;
use document_service::external::{AuditRendererClient, ConcatClient, FieldLocatorClient, StampClient};
use job_worker::tasks;
use sqlx::PgPool;
use support::TestDatabase;
use tempfile::TempDir;
use uuid::Uuid;

struct Fixture {
    pool: PgPool,
    state: AppState,
    #[allow(dead_code)]
    storage_dir: TempDir,
}

async fn bootstrap(field_locator_url: String) -> Result<Option<Fixture>> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(None);
    };
    let pool = db.pool_clone();
    std::mem::forget(db);

    let storage_dir = tempfile::tempdir()?;
    let storage: Arc<dyn StorageGateway> = Arc::new(LocalDiskGateway::new(storage_dir.path()));
    let http_client = reqwest::Client::new();

    let state = AppState {
        db: pool.clone(),
        jwt_codec: Arc::new(JwtCodec::new(b"test-secret", JwtConfig::new())),
        metrics: Arc::new(ServiceMetrics::new("job-worker-test")),
        storage,
        field_locator: Arc::new(FieldLocatorClient::new(http_client.clone(), field_locator_url)),
        stamp_client: Arc::new(StampClient::new(http_client.clone(), "http://localhost:0".to_string())),
        audit_renderer: Arc::new(AuditRendererClient::new(http_client.clone(), "http://localhost:0".to_string())),
        concat_client: Arc::new(ConcatClient::new(http_client.clone(), "http://localhost:0".to_string())),
        email_provider: None,
        max_file_size_bytes: 10 * 1024 * 1024,
        business_timezone: std::str::FromStr::from_str("UTC").expect("UTC is always a valid timezone"),
    };

    Ok(Some(Fixture { pool, state, storage_dir }))
}

async fn seed_document(pool: &PgPool) -> Result<(Uuid, Uuid)> {
    let business_id = Uuid::new_v4();
    identity_service::repo::create_business(pool, business_id, "Acme Signing Co").await?;
    let owner = Uuid::new_v4();
    identity_service::repo::create_user(pool, owner, "owner@x.com", Some("hash"), business_id).await?;

    let document_id = Uuid::new_v4();
    document_service::repo::create_document(pool, document_id, "NDA", owner).await?;

    let file_id = Uuid::new_v4();
    document_service::repo::create_file(pool, file_id, &file_id.to_string(), None).await?;
    document_service::repo::append_file_usage(pool, document_id, Some(file_id), "created", serde_json::json!({})).await?;

    Ok((document_id, file_id))
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn locate_fields_persists_describe_fields_usage() -> Result<()> {
    let locator_url = support::spawn_field_locator_stub(support::default_locate_fields_response()).await?;
    let Some(fixture) = bootstrap(locator_url).await? else { return Ok(()) };
    let (document_id, file_id) = seed_document(&fixture.pool).await?;

    fixture
        .state
        .storage
        .upload(&file_id.to_string(), "application/pdf", bytes::Bytes::from_static(b"%PDF-1.4 fixture"))
        .await?;

    tasks::locate_fields(&fixture.state, LocateFieldsPayload { document_id }).await?;

    let usage = document_service::repo::latest_describe_fields(&fixture.pool, document_id)
        .await?
        .expect("describe-fields usage recorded");
    assert_eq!(usage.usage_type, "describe-fields");
    assert_eq!(
        usage.data.get("fields").and_then(|f| f.as_array()).map(|a| a.len()),
        Some(1)
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn locate_fields_errors_without_a_source_file() -> Result<()> {
    let locator_url = support::spawn_field_locator_stub(support::default_locate_fields_response()).await?;
    let Some(fixture) = bootstrap(locator_url).await? else { return Ok(()) };

    let business_id = Uuid::new_v4();
    identity_service::repo::create_business(&fixture.pool, business_id, "Acme Signing Co").await?;
    let owner = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, owner, "owner2@x.com", Some("hash"), business_id).await?;
    let document_id = Uuid::new_v4();
    document_service::repo::create_document(&fixture.pool, document_id, "Empty", owner).await?;

    let result = tasks::locate_fields(&fixture.state, LocateFieldsPayload { document_id }).await;
    assert!(result.is_err());

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn invoke_webhooks_fileusage_posts_configured_payload() -> Result<()> {
    let locator_url = support::spawn_field_locator_stub(support::default_locate_fields_response()).await?;
    let Some(fixture) = bootstrap(locator_url).await? else { return Ok(()) };
    let (document_id, _file_id) = seed_document(&fixture.pool).await?;

    let business_id = document_service::repo::document_owner_business(&fixture.pool, document_id)
        .await?
        .expect("document has an owning business");
    let (webhook_url, sink) = support::spawn_webhook_sink().await?;
    sqlx::query("INSERT INTO business_config (business_id, key, values_json) VALUES ($1, 'webhook', $2)")
        .bind(business_id)
        .bind(serde_json::json!({ "url": webhook_url }))
        .execute(&fixture.pool)
        .await?;

    let usage_id = document_service::repo::append_file_usage(
        &fixture.pool,
        document_id,
        None,
        "agree-tos",
        serde_json::json!({}),
    )
    .await?;

    let http_client = reqwest::Client::new();
    tasks::invoke_webhooks_fileusage(
        &fixture.state,
        &http_client,
        InvokeWebhooksFileUsagePayload { file_usage_id: usage_id },
    )
    .await?;

    // webhook delivery happens over a real HTTP round trip; give the sink a beat.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let received = sink.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["doc_id"], serde_json::json!(document_id));
    assert_eq!(received[0]["usage_type"], serde_json::json!("agree-tos"));
    assert_eq!(received[0]["type"], serde_json::json!("document"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn invoke_webhooks_fileusage_errors_on_missing_row() -> Result<()> {
    let locator_url = support::spawn_field_locator_stub(support::default_locate_fields_response()).await?;
    let Some(fixture) = bootstrap(locator_url).await? else { return Ok(()) };

    let http_client = reqwest::Client::new();
    let result = tasks::invoke_webhooks_fileusage(
        &fixture.state,
        &http_client,
        InvokeWebhooksFileUsagePayload { file_usage_id: 999_999 },
    )
    .await;

    assert!(matches!(result, Err(job_worker::error::TaskError::MissingRow(_))));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn delete_blobs_is_idempotent_for_missing_blobs() -> Result<()> {
    let locator_url = support::spawn_field_locator_stub(support::default_locate_fields_response()).await?;
    let Some(fixture) = bootstrap(locator_url).await? else { return Ok(()) };

    let present = Uuid::new_v4().to_string();
    fixture
        .state
        .storage
        .upload(&present, "application/octet-stream", bytes::Bytes::from_static(b"hello"))
        .await?;
    let missing = Uuid::new_v4().to_string();

    tasks::delete_blobs(
        &fixture.state,
        DeleteBlobsPayload { blob_names: vec![present.clone(), missing] },
    )
    .await?;

    assert!(fixture.state.storage.download(&present).await.is_err());

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn send_email_skips_without_a_configured_provider() -> Result<()> {
    let locator_url = support::spawn_field_locator_stub(support::default_locate_fields_response()).await?;
    let Some(fixture) = bootstrap(locator_url).await? else { return Ok(()) };
    let (document_id, _file_id) = seed_document(&fixture.pool).await?;

    // fixture.state.email_provider is None, so this must return Ok without
    // minting an AccessURI or recording a reminder-email-sent row.
    tasks::send_email(&fixture.state, common_jobs::SendEmailPayload { document_id, email: None }).await?;

    let usages = document_service::repo::file_usages_for_audit(&fixture.pool, document_id).await?;
    assert!(!usages.iter().any(|u| u.usage_type == "reminder-email-sent"));

    Ok(())
}

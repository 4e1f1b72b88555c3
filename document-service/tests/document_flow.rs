mod support;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use common_observability::ServiceMetrics;
use common_storage::LocalDiskGateway;
use document_service::external::FieldLocatorClient;
use document_service::fill::{self, FillValue};
use document_service::lifecycle::{self, CreateDocumentInput};
use document_service::{audit, repo};
use sqlx::PgPool;
use support::TestDatabase;
use tempfile::TempDir;
use uuid::Uuid;

struct Fixture {
    pool: PgPool,
    storage: LocalDiskGateway,
    metrics: ServiceMetrics,
    locator: FieldLocatorClient,
    business_id: Uuid,
    #[allow(dead_code)]
    storage_dir: TempDir,
}

async fn bootstrap() -> Result<Option<Fixture>> {
    let Some(db) = TestDatabase::setup().await? else {
        return Ok(None);
    };
    let pool = db.pool_clone();
    std::mem::forget(db);

    let business_id = Uuid::new_v4();
    identity_service::repo::create_business(&pool, business_id, "Acme Signing Co").await?;

    let storage_dir = tempfile::tempdir()?;
    let storage = LocalDiskGateway::new(storage_dir.path());
    let metrics = ServiceMetrics::new("document-service-test");

    let locator_url = support::spawn_field_locator_stub(support::default_locate_fields_response()).await?;
    let locator = FieldLocatorClient::new(reqwest::Client::new(), locator_url);

    Ok(Some(Fixture { pool, storage, metrics, locator, business_id, storage_dir }))
}

fn tz() -> chrono_tz::Tz {
    std::str::FromStr::from_str("UTC").expect("UTC is always a valid timezone")
}

async fn create_test_document(fixture: &Fixture, owner: Uuid, signators: HashMap<String, Option<String>>) -> Result<lifecycle::CreateDocumentOutcome> {
    let outcome = lifecycle::create_document(
        &fixture.pool,
        &fixture.storage,
        &fixture.locator,
        &fixture.metrics,
        10 * 1024 * 1024,
        owner,
        fixture.business_id,
        CreateDocumentInput {
            title: "NDA".to_string(),
            signators,
            content_type: "application/pdf".to_string(),
            pdf_bytes: Bytes::from_static(b"%PDF-1.4 fixture"),
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    Ok(outcome)
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn create_document_declares_signator_and_dependent_date_field() -> Result<()> {
    let Some(fixture) = bootstrap().await? else { return Ok(()) };

    let owner = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, owner, "owner@x.com", Some("hash"), fixture.business_id).await?;

    let mut signators = HashMap::new();
    signators.insert("sig".to_string(), Some("signer@x.com".to_string()));

    let outcome = create_test_document(&fixture, owner, signators).await?;
    assert!(outcome.warnings.is_empty());

    let fields = repo::fields_for_document(&fixture.pool, outcome.document_id).await?;
    assert_eq!(fields.len(), 2, "expected the declared signature field plus its cascaded date dependent");

    let sig = fields.iter().find(|f| f.field_name == "sig").expect("sig field present");
    assert_eq!(sig.field_type, "signature");
    assert!(sig.user_id.is_some());

    let stamp_date = fields.iter().find(|f| f.field_name == "stamp_date").expect("stamp_date field present");
    assert_eq!(stamp_date.field_type, "date");
    assert_eq!(stamp_date.parent_field_id, Some(sig.id));
    assert!(stamp_date.user_id.is_none(), "dependent fields are never assigned a signator");

    // one `empty` field_usage for the declared signator field
    let sig_usage = repo::latest_field_usage(&fixture.pool, sig.id).await?.expect("sig has a usage row");
    assert_eq!(sig_usage.usage_type, "empty");

    // webhook + pipeline tasks enqueued: created file_usage, empty field_usage, locate_fields, stamp_pdf
    let queued: Vec<(String,)> = sqlx::query_as("SELECT kind FROM scheduled_tasks ORDER BY kind")
        .fetch_all(&fixture.pool)
        .await?;
    let kinds: Vec<&str> = queued.iter().map(|(k,)| k.as_str()).collect();
    assert!(kinds.contains(&"locate_fields"));
    assert!(kinds.contains(&"stamp_pdf"));
    assert!(kinds.iter().filter(|k| **k == "invoke_webhooks_fileusage").count() >= 1);
    assert!(kinds.iter().filter(|k| **k == "invoke_webhooks_fieldusage").count() >= 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn create_document_rejects_malformed_signator_email() -> Result<()> {
    let Some(fixture) = bootstrap().await? else { return Ok(()) };

    let owner = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, owner, "owner2@x.com", Some("hash"), fixture.business_id).await?;

    let mut signators = HashMap::new();
    signators.insert("sig".to_string(), Some("not-an-email".to_string()));

    let err = create_test_document(&fixture, owner, signators).await.unwrap_err();
    assert!(err.to_string().contains("invalid_signator_email"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn create_document_rejects_oversized_upload() -> Result<()> {
    let Some(fixture) = bootstrap().await? else { return Ok(()) };

    let owner = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, owner, "owner3@x.com", Some("hash"), fixture.business_id).await?;

    let err = lifecycle::create_document(
        &fixture.pool,
        &fixture.storage,
        &fixture.locator,
        &fixture.metrics,
        4, // max_file_size_bytes smaller than the fixture body
        owner,
        fixture.business_id,
        CreateDocumentInput {
            title: "Big".to_string(),
            signators: HashMap::new(),
            content_type: "application/pdf".to_string(),
            pdf_bytes: Bytes::from_static(b"%PDF-1.4 fixture"),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, common_http_errors::ApiError::PayloadTooLarge { .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn filling_signature_cascades_dependent_date_and_completes_document() -> Result<()> {
    let Some(fixture) = bootstrap().await? else { return Ok(()) };

    let owner = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, owner, "owner4@x.com", Some("hash"), fixture.business_id).await?;
    let mut signators = HashMap::new();
    signators.insert("sig".to_string(), Some("signer4@x.com".to_string()));
    let outcome = create_test_document(&fixture, owner, signators).await?;

    let fields = repo::fields_for_document(&fixture.pool, outcome.document_id).await?;
    let sig = fields.iter().find(|f| f.field_name == "sig").unwrap();
    let stamp_date = fields.iter().find(|f| f.field_name == "stamp_date").unwrap();
    let signer_id = sig.user_id.unwrap();

    fill::fill_signature(
        &fixture.pool,
        &fixture.storage,
        &fixture.metrics,
        &tz(),
        signer_id,
        sig.id,
        Bytes::from_static(b"\x89PNG fixture"),
        "203.0.113.5".to_string(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let sig_usage = repo::latest_field_usage(&fixture.pool, sig.id).await?.unwrap();
    assert_eq!(sig_usage.usage_type, "filled");

    let dependent_usage = repo::latest_field_usage(&fixture.pool, stamp_date.id).await?.unwrap();
    assert_eq!(dependent_usage.usage_type, "filled");
    assert!(dependent_usage.data.get("value").and_then(|v| v.as_str()).is_some(), "dependent date cascade stamps today's date");

    // the only signator-owned field is now filled; the document is complete
    let file_usages = repo::file_usages_for_audit(&fixture.pool, outcome.document_id).await?;
    assert!(file_usages.iter().any(|u| u.usage_type == "all-fields-filled"));

    let queued: Vec<(String,)> = sqlx::query_as("SELECT kind FROM scheduled_tasks WHERE kind = 'stamp_pdf'")
        .fetch_all(&fixture.pool)
        .await?;
    assert!(!queued.is_empty(), "fill_signature re-enqueues stamp_pdf");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn bulk_fill_enqueues_at_most_one_stamp_per_document() -> Result<()> {
    let Some(fixture) = bootstrap().await? else { return Ok(()) };

    let owner = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, owner, "owner5@x.com", Some("hash"), fixture.business_id).await?;
    let mut signators = HashMap::new();
    signators.insert("sig".to_string(), Some("signer5@x.com".to_string()));
    let outcome = create_test_document(&fixture, owner, signators).await?;

    let fields = repo::fields_for_document(&fixture.pool, outcome.document_id).await?;
    let sig = fields.iter().find(|f| f.field_name == "sig").unwrap();
    let signer_id = sig.user_id.unwrap();

    let before: i64 = sqlx::query_scalar("SELECT count(*) FROM scheduled_tasks WHERE kind = 'stamp_pdf'")
        .fetch_one(&fixture.pool)
        .await?;

    let mut entries = HashMap::new();
    entries.insert(sig.id, FillValue::Signature(Bytes::from_static(b"\x89PNG fixture")));

    fill::bulk_fill(&fixture.pool, &fixture.storage, &fixture.metrics, &tz(), signer_id, entries, "203.0.113.9".to_string())
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let after: i64 = sqlx::query_scalar("SELECT count(*) FROM scheduled_tasks WHERE kind = 'stamp_pdf'")
        .fetch_one(&fixture.pool)
        .await?;
    assert_eq!(after, before + 1, "one document touched by the batch means exactly one additional stamp_pdf enqueue");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn agree_tos_requires_a_field_on_the_document() -> Result<()> {
    let Some(fixture) = bootstrap().await? else { return Ok(()) };

    let owner = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, owner, "owner6@x.com", Some("hash"), fixture.business_id).await?;
    let mut signators = HashMap::new();
    signators.insert("sig".to_string(), Some("signer6@x.com".to_string()));
    let outcome = create_test_document(&fixture, owner, signators).await?;

    let stranger = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, stranger, "stranger6@x.com", Some("hash"), fixture.business_id).await?;
    let err = fill::agree_tos(&fixture.pool, stranger, outcome.document_id, "203.0.113.1".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, common_http_errors::ApiError::Forbidden { .. }));

    let fields = repo::fields_for_document(&fixture.pool, outcome.document_id).await?;
    let signer_id = fields.iter().find(|f| f.field_name == "sig").unwrap().user_id.unwrap();
    fill::agree_tos(&fixture.pool, signer_id, outcome.document_id, "203.0.113.1".to_string())
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let entries = audit::document_audit_json(&fixture.pool, outcome.document_id).await.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let agree_entry = entries.iter().find(|e| e.status == "agree-tos").unwrap();
    assert_eq!(agree_entry.data["user"], "signer6@x.com");
    assert_eq!(agree_entry.data["uid"], signer_id.simple().to_string());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn audit_json_merges_file_and_field_usages_chronologically() -> Result<()> {
    let Some(fixture) = bootstrap().await? else { return Ok(()) };

    let owner = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, owner, "owner7@x.com", Some("hash"), fixture.business_id).await?;
    let mut signators = HashMap::new();
    signators.insert("sig".to_string(), Some("signer7@x.com".to_string()));
    let outcome = create_test_document(&fixture, owner, signators).await?;

    let fields = repo::fields_for_document(&fixture.pool, outcome.document_id).await?;
    let sig = fields.iter().find(|f| f.field_name == "sig").unwrap();
    let signer_id = sig.user_id.unwrap();

    fill::fill_signature(&fixture.pool, &fixture.storage, &fixture.metrics, &tz(), signer_id, sig.id, Bytes::from_static(b"\x89PNG"), "203.0.113.2".to_string())
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let entries = audit::document_audit_json(&fixture.pool, outcome.document_id).await.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    assert!(entries.len() >= 2, "expects at least the 'created' file_usage and the signature field_usage");
    assert!(entries.iter().any(|e| e.status == "created"));
    assert!(entries.iter().any(|e| e.status == "filled" && e.data.get("user").and_then(|v| v.as_str()) == Some("signer7@x.com")));
    for pair in entries.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp, "entries must be chronological");
    }
    // describe-fields rows never leak into the audit surface
    assert!(!entries.iter().any(|e| e.status == "describe-fields"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn delete_document_is_owner_only_and_cascades_rows() -> Result<()> {
    let Some(fixture) = bootstrap().await? else { return Ok(()) };

    let owner = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, owner, "owner8@x.com", Some("hash"), fixture.business_id).await?;
    let mut signators = HashMap::new();
    signators.insert("sig".to_string(), Some("signer8@x.com".to_string()));
    let outcome = create_test_document(&fixture, owner, signators).await?;

    let stranger = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, stranger, "stranger8@x.com", Some("hash"), fixture.business_id).await?;
    let err = lifecycle::delete_document(&fixture.pool, &fixture.metrics, stranger, outcome.document_id).await.unwrap_err();
    assert!(matches!(err, common_http_errors::ApiError::Forbidden { .. }));

    lifecycle::delete_document(&fixture.pool, &fixture.metrics, owner, outcome.document_id)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    assert!(repo::find_document(&fixture.pool, outcome.document_id).await?.is_none());
    assert!(repo::fields_for_document(&fixture.pool, outcome.document_id).await?.is_empty());

    let queued: i64 = sqlx::query_scalar("SELECT count(*) FROM scheduled_tasks WHERE kind = 'delete_blobs'")
        .fetch_one(&fixture.pool)
        .await?;
    assert!(queued >= 1, "deleting a document with an uploaded blob enqueues delete_blobs");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn remind_reuses_an_existing_access_uri() -> Result<()> {
    let Some(fixture) = bootstrap().await? else { return Ok(()) };

    let owner = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, owner, "owner9@x.com", Some("hash"), fixture.business_id).await?;
    let signer = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, signer, "signer9@x.com", None, fixture.business_id).await?;
    let document_id = Uuid::new_v4();
    repo::create_document(&fixture.pool, document_id, "Reminder doc", owner).await?;

    let first = lifecycle::ensure_access_uri(&fixture.pool, signer, document_id).await.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let second = lifecycle::ensure_access_uri(&fixture.pool, signer, document_id).await.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    assert_eq!(first, second, "a second reminder reuses the non-revoked AccessURI rather than minting a new one");

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(feature = "integration"), ignore = "enable with --features integration (requires Postgres)")]
async fn concurrent_fills_of_distinct_fields_both_land() -> Result<()> {
    let Some(fixture) = bootstrap().await? else { return Ok(()) };

    let owner = Uuid::new_v4();
    identity_service::repo::create_user(&fixture.pool, owner, "owner10@x.com", Some("hash"), fixture.business_id).await?;
    let mut signators = HashMap::new();
    signators.insert("sig".to_string(), Some("signer10@x.com".to_string()));
    let outcome = create_test_document(&fixture, owner, signators).await?;

    let fields = repo::fields_for_document(&fixture.pool, outcome.document_id).await?;
    let sig = fields.iter().find(|f| f.field_name == "sig").unwrap();
    let signer_id = sig.user_id.unwrap();

    // two concurrent fills of the same field: both requests race, but each
    // produces its own `filled` row and cascade; duplicate completion
    // emission is accepted, not deduplicated.
    let (r1, r2) = tokio::join!(
        fill::fill_signature(&fixture.pool, &fixture.storage, &fixture.metrics, &tz(), signer_id, sig.id, Bytes::from_static(b"\x89PNG A"), "203.0.113.10".to_string()),
        fill::fill_signature(&fixture.pool, &fixture.storage, &fixture.metrics, &tz(), signer_id, sig.id, Bytes::from_static(b"\x89PNG B"), "203.0.113.11".to_string()),
    );
    r1.map_err(|e| anyhow::anyhow!("{e:?}"))?;
    r2.map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let fills: Vec<(i64,)> = sqlx::query_as("SELECT id FROM field_usages WHERE field_id = $1 AND usage_type = 'filled'")
        .bind(sig.id)
        .fetch_all(&fixture.pool)
        .await?;
    assert_eq!(fills.len(), 2);

    // tolerate duplicate all-fields-filled emission rather than asserting exactly one
    let completions: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM file_usages WHERE document_id = $1 AND usage_type = 'all-fields-filled'",
    )
    .bind(outcome.document_id)
    .fetch_one(&fixture.pool)
    .await?;
    assert!(completions >= 1);

    // small grace window lets both connections' async tasks settle before teardown
    tokio::time::sleep(Duration::from_millis(10)).await;
    Ok(())
}

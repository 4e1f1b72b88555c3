use std::collections::HashMap;

use bytes::Bytes;
use common_jobs::{
    DeleteBlobsPayload, InvokeWebhooksFieldUsagePayload, InvokeWebhooksFileUsagePayload,
    LocateFieldsPayload, RenderPagesPayload, SendEmailPayload, StampPdfPayload, TaskKind,
};
use document_service::app::AppState;
use document_service::external::StampFieldValue;
use document_service::{audit, events, lifecycle, repo};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::error::TaskError;

/// FileUsage types that ever carry a non-null file;
/// `reminder-email-sent`/`describe-fields`/`agree-tos` never do, so they're
/// excluded from "current document file" reads.
const FILE_BEARING_USAGE_TYPES: &[&str] = &["created", "updated", "startstamp", "endstamp"];

static GS_PAGE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Page (\d+)").unwrap());

/// `locate_fields(doc)`: re-derives field geometry from the original
/// upload and persists it as the `describe-fields` FileUsage the `info`
/// endpoint waits on. A locator failure still leaves a row behind, an
/// empty one, so callers stop polling instead of retrying forever.
pub async fn locate_fields(state: &AppState, payload: LocateFieldsPayload) -> Result<(), TaskError> {
    let document_id = payload.document_id;
    let Some((_usage, file)) = repo::source_document_file(&state.db, document_id).await? else {
        return Err(TaskError::MissingRow(format!("no source file for document {document_id}")));
    };

    let pdf_bytes = state.storage.download(&file.filename).await?;

    let data = match state.field_locator.locate_fields(pdf_bytes).await {
        Ok(located) => serde_json::to_value(&located).unwrap_or_else(|_| json!({})),
        Err(err) => {
            tracing::warn!(%document_id, %err, "field locator failed, recording empty geometry");
            json!({})
        }
    };

    let usage_id = repo::append_file_usage(&state.db, document_id, None, "describe-fields", data).await?;
    events::enqueue_file_usage_webhook(&state.db, usage_id).await.map_err(Into::into)
}

/// Builds the stamp descriptor + image parts for one field, per the
/// original's classification: a signature field with a `filled` usage
/// stamps an image; anything else with a `filled` usage stamps its stored
/// text value; lacking a `filled` usage at all stamps blank.
async fn stamp_descriptor(
    state: &AppState,
    field: &repo::Field,
) -> Result<(serde_json::Value, Option<(String, Bytes)>), TaskError> {
    let Some(usage) = repo::latest_field_usage(&state.db, field.id).await? else {
        return Ok((serde_json::to_value(StampFieldValue::Blank).unwrap(), None));
    };
    if usage.usage_type != "filled" {
        return Ok((serde_json::to_value(StampFieldValue::Blank).unwrap(), None));
    }

    if field.field_type == "signature" {
        let Some(file_id) = usage.file_id else {
            return Ok((serde_json::to_value(StampFieldValue::Blank).unwrap(), None));
        };
        let Some(file) = repo::find_file(&state.db, file_id).await? else {
            return Err(TaskError::MissingRow(format!("signature file {file_id} missing")));
        };
        let bytes = state.storage.download(&file.filename).await?;
        Ok((
            serde_json::to_value(StampFieldValue::Image).unwrap(),
            Some((field.field_name.clone(), bytes)),
        ))
    } else {
        let value = usage.data.get("value").and_then(|v| v.as_str()).unwrap_or("").to_string();
        Ok((serde_json::to_value(StampFieldValue::Text { value }).unwrap(), None))
    }
}

async fn render_stamped_pdf(state: &AppState, document_id: Uuid) -> Result<Bytes, TaskError> {
    let Some((_usage, file)) = repo::source_document_file(&state.db, document_id).await? else {
        return Err(TaskError::MissingRow(format!("no source file for document {document_id}")));
    };
    let source_pdf = state.storage.download(&file.filename).await?;

    let fields_on_document = repo::fields_for_document(&state.db, document_id).await?;
    let mut fields = HashMap::new();
    let mut images = Vec::new();
    for field in &fields_on_document {
        let (descriptor, image) = stamp_descriptor(state, field).await?;
        fields.insert(field.field_name.clone(), descriptor);
        if let Some(part) = image {
            images.push(part);
        }
    }

    let stamped_pdf = state.stamp_client.stamp(source_pdf, &fields, images).await?;
    let audit_pdf = audit::document_audit_pdf(&state.db, &state.audit_renderer, document_id)
        .await
        .map_err(|e| TaskError::Render(format!("{e:?}")))?;

    Ok(state.concat_client.concat(vec![stamped_pdf, audit_pdf]).await?)
}

/// `stamp_pdf(doc)`: stamps the original upload against every
/// field's latest usage, appends the rendered audit log, concatenates the
/// two, and uploads the result as the document's new current file. Once the
/// new File row is committed, a failure no longer propagates: it's recorded
/// as a failed `endstamp` instead, since retrying past that point would
/// re-stamp from scratch for no benefit.
pub async fn stamp_pdf(state: &AppState, payload: StampPdfPayload) -> Result<(), TaskError> {
    let document_id = payload.document_id;

    // Before the checkpoint: any error here propagates so the orchestrator retries.
    let final_pdf = render_stamped_pdf(state, document_id).await?;

    let file_id = Uuid::new_v4();
    let blob_name = file_id.to_string();
    state.storage.upload(&blob_name, "application/pdf", final_pdf).await?;
    repo::create_file(&state.db, file_id, &blob_name, None).await?;

    // Past the checkpoint: swallow into a failed endstamp rather than retry.
    let outcome: Result<i64, TaskError> = async {
        let usage_id =
            repo::append_file_usage(&state.db, document_id, Some(file_id), "endstamp", json!({})).await?;
        Ok(usage_id)
    }
    .await;

    let usage_id = match outcome {
        Ok(usage_id) => {
            common_jobs::enqueue(
                &state.db,
                TaskKind::RenderPages,
                &RenderPagesPayload { document_id },
                None,
            )
            .await?;
            usage_id
        }
        Err(err) => {
            tracing::error!(%document_id, %err, "stamp_pdf failed after persisting the stamped file");
            repo::append_file_usage(
                &state.db,
                document_id,
                None,
                "endstamp",
                json!({ "error": err.to_string() }),
            )
            .await?
        }
    };

    events::enqueue_file_usage_webhook(&state.db, usage_id).await.map_err(Into::into)
}

/// `render_pages(doc)`: rasterizes the current document file to PNG
/// with GhostScript and records one File + RenderedPage row per page.
/// No HTTP rendering collaborator exists for this step, so it shells out
/// directly rather than calling one.
pub async fn render_pages(
    state: &AppState,
    ghostscript_bin: &str,
    payload: RenderPagesPayload,
) -> Result<(), TaskError> {
    let document_id = payload.document_id;
    let Some((_usage, file)) =
        repo::latest_document_file(&state.db, document_id, FILE_BEARING_USAGE_TYPES).await?
    else {
        return Err(TaskError::MissingRow(format!("no current file for document {document_id}")));
    };

    let pdf_bytes = state.storage.download(&file.filename).await?;

    let tmpdir = tempfile::tempdir().map_err(|e| TaskError::Render(e.to_string()))?;
    let pdf_path = tmpdir.path().join("source.pdf");
    {
        let mut f = tokio::fs::File::create(&pdf_path).await.map_err(|e| TaskError::Render(e.to_string()))?;
        f.write_all(&pdf_bytes).await.map_err(|e| TaskError::Render(e.to_string()))?;
    }

    let output_pattern = tmpdir.path().join("page-%d.png");
    let output = Command::new(ghostscript_bin)
        .arg("-r300")
        .arg("-dNOPAUSE")
        .arg("-dBATCH")
        .arg("-sDEVICE=png16m")
        .arg(format!("-sOutputFile={}", output_pattern.display()))
        .arg(&pdf_path)
        .output()
        .await
        .map_err(|e| TaskError::Render(format!("failed to spawn ghostscript: {e}")))?;

    if !output.status.success() {
        return Err(TaskError::Render(format!(
            "ghostscript exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        let Some(captures) = GS_PAGE_LINE.captures(line) else { continue };
        let page_number: i32 = captures[1].parse().unwrap_or_default();

        let page_path = tmpdir.path().join(format!("page-{page_number}.png"));
        let png_bytes = tokio::fs::read(&page_path).await.map_err(|e| TaskError::Render(e.to_string()))?;

        let page_file_id = Uuid::new_v4();
        let blob_name = page_file_id.to_string();
        state.storage.upload(&blob_name, "image/png", png_bytes.into()).await?;
        repo::create_file(&state.db, page_file_id, &blob_name, None).await?;
        repo::create_rendered_page(&state.db, Uuid::new_v4(), page_file_id, document_id, page_number).await?;
    }

    Ok(())
}

/// `send_email(doc, email?)`. `email` absent means every signatory
/// with an unfilled field; present means just that one
/// username, after confirming they actually have a field on the document.
pub async fn send_email(state: &AppState, payload: SendEmailPayload) -> Result<(), TaskError> {
    let document_id = payload.document_id;

    let recipients: Vec<(String, Uuid)> = match &payload.email {
        Some(email) => {
            let Some(user) = identity_service::repo::find_user_by_username(&state.db, email).await? else {
                return Ok(());
            };
            if !repo::has_field_on_document(&state.db, document_id, user.id).await? {
                return Ok(());
            }
            vec![(user.username, user.id)]
        }
        None => {
            let fields = repo::unfilled_user_fields(&state.db, document_id).await?;
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for field in fields {
                let Some(user_id) = field.user_id else { continue };
                if !seen.insert(user_id) {
                    continue;
                }
                if let Some(user) = identity_service::repo::find_user_by_id(&state.db, user_id).await? {
                    out.push((user.username, user.id));
                }
            }
            out
        }
    };

    let Some(business_id) = repo::document_owner_business(&state.db, document_id).await? else {
        return Err(TaskError::MissingRow(format!("document {document_id} has no owning business")));
    };

    let template = repo::email_template_for_business(&state.db, business_id).await?;
    let subject = template
        .as_ref()
        .and_then(|t| t.get("subject"))
        .and_then(|v| v.as_str())
        .unwrap_or("You have a document waiting to be signed")
        .to_string();
    let body_template = template
        .as_ref()
        .and_then(|t| t.get("body"))
        .and_then(|v| v.as_str())
        .unwrap_or("http://localhost:3000?{{params}}")
        .to_string();

    let Some(provider) = &state.email_provider else {
        tracing::error!(%document_id, "attempted to send reminder emails but no email provider is configured");
        return Ok(());
    };

    for (username, user_id) in recipients {
        let (_id, token) = lifecycle::ensure_access_uri(&state.db, user_id, document_id)
            .await
            .map_err(|e| TaskError::Render(format!("{e:?}")))?;

        let doc_hex = document_id.to_string();
        let params = serde_urlencoded::to_string([("auth", token.as_str()), ("doc", doc_hex.as_str())])
            .unwrap_or_default();
        let body = body_template.replace("{{params}}", &params);

        if provider.send(&username, &subject, &body).await.is_err() {
            tracing::error!(%document_id, email = %username, "reminder email delivery failed");
            continue;
        }

        let usage_id = repo::append_file_usage(
            &state.db,
            document_id,
            None,
            "reminder-email-sent",
            json!({ "target": username }),
        )
        .await?;
        events::enqueue_file_usage_webhook(&state.db, usage_id).await.map_err(Into::into)?;
    }

    Ok(())
}

/// `invoke_webhooks_fileusage(usage)`. Per `TaskKind::retries_on_any_error`,
/// this is the one task kind that only retries on a missing row (the
/// enqueue-before-commit race). A delivery failure to one subscriber URL is
/// logged and swallowed here, never propagated, since that always counts as
/// "handled" from the orchestrator's point of view.
pub async fn invoke_webhooks_fileusage(
    state: &AppState,
    http_client: &reqwest::Client,
    payload: InvokeWebhooksFileUsagePayload,
) -> Result<(), TaskError> {
    let Some(usage) = repo::find_file_usage(&state.db, payload.file_usage_id).await? else {
        return Err(TaskError::MissingRow(format!("file_usage {} missing", payload.file_usage_id)));
    };
    let Some(business_id) = repo::document_owner_business(&state.db, usage.document_id).await? else {
        return Ok(());
    };
    let urls = repo::webhook_urls_for_business(&state.db, business_id).await?;

    let body = json!({
        "doc_id": usage.document_id,
        "type": "document",
        "usage_type": usage.usage_type,
        "timestamp": usage.timestamp.to_rfc3339(),
        "data": usage.data,
    });

    dispatch_webhooks(state, http_client, &urls, &body).await;
    Ok(())
}

pub async fn invoke_webhooks_fieldusage(
    state: &AppState,
    http_client: &reqwest::Client,
    payload: InvokeWebhooksFieldUsagePayload,
) -> Result<(), TaskError> {
    let Some(ctx) = repo::find_field_usage(&state.db, payload.field_usage_id).await? else {
        return Err(TaskError::MissingRow(format!("field_usage {} missing", payload.field_usage_id)));
    };
    let Some(business_id) = repo::document_owner_business(&state.db, ctx.document_id).await? else {
        return Ok(());
    };
    let urls = repo::webhook_urls_for_business(&state.db, business_id).await?;

    let body = json!({
        "doc_id": ctx.document_id,
        "field_id": ctx.usage.field_id,
        "user_id": ctx.user_id,
        "type": "field",
        "usage_type": ctx.usage.usage_type,
        "timestamp": ctx.usage.timestamp.to_rfc3339(),
        "data": ctx.usage.data,
    });

    dispatch_webhooks(state, http_client, &urls, &body).await;
    Ok(())
}

/// Posts `body` to every `url`; a non-2xx response or connection failure is
/// logged and counted, never propagated, following the usual
/// status-check-then-log idiom for fire-and-forget notifications.
async fn dispatch_webhooks(state: &AppState, client: &reqwest::Client, urls: &[String], body: &serde_json::Value) {
    for url in urls {
        match client.post(url).json(body).send().await {
            Ok(response) if response.status().is_success() => {
                state.metrics.webhook_dispatch_total.with_label_values(&["success"]).inc();
            }
            Ok(response) => {
                tracing::warn!(%url, status = %response.status(), "webhook responded with failure status");
                state.metrics.webhook_dispatch_total.with_label_values(&["failure"]).inc();
            }
            Err(err) => {
                tracing::warn!(%url, %err, "webhook delivery failed");
                state.metrics.webhook_dispatch_total.with_label_values(&["failure"]).inc();
            }
        }
    }
}

/// `delete_blobs(names)`: best-effort per name. `StorageGateway::delete`
/// already treats a missing blob as success, so only a genuine upstream
/// error gets logged here rather than failing the whole task.
pub async fn delete_blobs(state: &AppState, payload: DeleteBlobsPayload) -> Result<(), TaskError> {
    for name in payload.blob_names {
        if let Err(err) = state.storage.delete(&name).await {
            tracing::warn!(blob_name = %name, %err, "failed to delete blob");
        }
    }
    Ok(())
}

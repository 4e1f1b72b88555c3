use crate::error::JobsError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The seven task contracts from the job orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    LocateFields,
    StampPdf,
    RenderPages,
    SendEmail,
    InvokeWebhooksFileUsage,
    InvokeWebhooksFieldUsage,
    DeleteBlobs,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::LocateFields => "locate_fields",
            TaskKind::StampPdf => "stamp_pdf",
            TaskKind::RenderPages => "render_pages",
            TaskKind::SendEmail => "send_email",
            TaskKind::InvokeWebhooksFileUsage => "invoke_webhooks_fileusage",
            TaskKind::InvokeWebhooksFieldUsage => "invoke_webhooks_fieldusage",
            TaskKind::DeleteBlobs => "delete_blobs",
        }
    }

    /// `render_pages` and `invoke_webhooks_fieldusage` retry on any error;
    /// `invoke_webhooks_fileusage` retries only on a missing row (the
    /// enqueue-before-commit race). Callers check this before deciding
    /// whether a task body's error should count toward `max_attempts` or be
    /// treated as permanent.
    pub fn retries_on_any_error(&self) -> bool {
        !matches!(self, TaskKind::InvokeWebhooksFileUsage)
    }
}

impl std::str::FromStr for TaskKind {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "locate_fields" => Ok(TaskKind::LocateFields),
            "stamp_pdf" => Ok(TaskKind::StampPdf),
            "render_pages" => Ok(TaskKind::RenderPages),
            "send_email" => Ok(TaskKind::SendEmail),
            "invoke_webhooks_fileusage" => Ok(TaskKind::InvokeWebhooksFileUsage),
            "invoke_webhooks_fieldusage" => Ok(TaskKind::InvokeWebhooksFieldUsage),
            "delete_blobs" => Ok(TaskKind::DeleteBlobs),
            other => Err(JobsError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocateFieldsPayload {
    pub document_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampPdfPayload {
    pub document_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderPagesPayload {
    pub document_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmailPayload {
    pub document_id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeWebhooksFileUsagePayload {
    pub file_usage_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeWebhooksFieldUsagePayload {
    pub field_usage_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteBlobsPayload {
    pub blob_names: Vec<String>,
}

/// Row as read back off a claim. `payload` stays untyped JSON here; callers
/// deserialize it into the shape matching `kind` (see the `*Payload` structs
/// above).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub run_after: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub status: String,
}

impl ClaimedTask {
    pub fn task_kind(&self) -> Result<TaskKind, JobsError> {
        self.kind.parse()
    }
}

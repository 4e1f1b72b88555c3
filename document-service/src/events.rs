use common_jobs::{InvokeWebhooksFieldUsagePayload, InvokeWebhooksFileUsagePayload, JobsError, TaskKind};
use sqlx::PgPool;

/// Every FileUsage/FieldUsage insertion fans out a webhook task, called once
/// the row's transaction has committed, never before: enqueues only happen
/// after commit.
pub async fn enqueue_file_usage_webhook(pool: &PgPool, file_usage_id: i64) -> Result<(), JobsError> {
    common_jobs::enqueue(
        pool,
        TaskKind::InvokeWebhooksFileUsage,
        &InvokeWebhooksFileUsagePayload { file_usage_id },
        None,
    )
    .await
    .map(|_| ())
}

pub async fn enqueue_field_usage_webhook(pool: &PgPool, field_usage_id: i64) -> Result<(), JobsError> {
    common_jobs::enqueue(
        pool,
        TaskKind::InvokeWebhooksFieldUsage,
        &InvokeWebhooksFieldUsagePayload { field_usage_id },
        None,
    )
    .await
    .map(|_| ())
}

pub mod error;
pub mod model;
pub mod queue;

pub use error::JobsError;
pub use model::{
    ClaimedTask, DeleteBlobsPayload, InvokeWebhooksFieldUsagePayload, InvokeWebhooksFileUsagePayload,
    LocateFieldsPayload, RenderPagesPayload, SendEmailPayload, StampPdfPayload, TaskKind,
};
pub use queue::{backoff_duration, claim_next, complete, enqueue, enqueue_with_retries, fail_and_reschedule};

/// Hard time limit per task execution.
pub const TASK_TIME_LIMIT: std::time::Duration = std::time::Duration::from_secs(180);

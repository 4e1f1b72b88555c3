use thiserror::Error;

/// A task body's failure. Whether it counts against `max_attempts` or is
/// treated as a permanent skip is decided by `TaskKind::retries_on_any_error`
/// in the claim loop, not here; a task body just reports what went wrong.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Jobs(#[from] common_jobs::JobsError),
    #[error(transparent)]
    Storage(#[from] common_storage::StorageError),
    #[error(transparent)]
    External(#[from] document_service::external::ExternalError),
    #[error("referenced row is missing: {0}")]
    MissingRow(String),
    #[error("ghostscript render failed: {0}")]
    Render(String),
    #[error("task payload was malformed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("task exceeded its time limit")]
    TimedOut,
}

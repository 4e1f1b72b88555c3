use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobsError {
    #[error("task database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unrecognized task kind: {0}")]
    UnknownKind(String),
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Upstream(String),
    #[error("local disk i/o error: {0}")]
    Io(#[from] std::io::Error),
}

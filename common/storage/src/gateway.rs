use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::StorageError;

/// Blob storage abstraction. Every operation is idempotent by
/// `blob_name`: a second `upload` to the same name overwrites, and
/// `delete` of a name that's already gone is success, not `NotFound`.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn upload(
        &self,
        blob_name: &str,
        content_type: &str,
        bytes: Bytes,
    ) -> Result<(), StorageError>;

    async fn download(&self, blob_name: &str) -> Result<Bytes, StorageError>;

    async fn signed_download_url(
        &self,
        blob_name: &str,
        ttl: Duration,
    ) -> Result<String, StorageError>;

    /// Treats a missing blob as success. The `delete_blobs` task relies on
    /// this to be safely retriable after a partial prior run.
    async fn delete(&self, blob_name: &str) -> Result<(), StorageError>;
}

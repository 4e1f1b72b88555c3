use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;
use crate::gateway::StorageGateway;

/// Filesystem-backed gateway rooted at a configured directory. No network
/// dependency, same blob-name contract as the HTTP-backed implementation.
#[derive(Clone)]
pub struct LocalDiskGateway {
    root: PathBuf,
}

impl LocalDiskGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, blob_name: &str) -> PathBuf {
        self.root.join(blob_name)
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageGateway for LocalDiskGateway {
    async fn upload(&self, blob_name: &str, _content_type: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.path_for(blob_name);
        Self::ensure_parent(&path).await?;
        let mut file = fs::File::create(&path).await?;
        file.write_all(&bytes).await?;
        Ok(())
    }

    async fn download(&self, blob_name: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(blob_name);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(blob_name.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn signed_download_url(&self, blob_name: &str, ttl: Duration) -> Result<String, StorageError> {
        let path = self.path_for(blob_name);
        if fs::metadata(&path).await.is_err() {
            return Err(StorageError::NotFound(blob_name.to_string()));
        }
        let expires_at = chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        Ok(format!("file://{}?expires={}", path.display(), expires_at.timestamp()))
    }

    async fn delete(&self, blob_name: &str) -> Result<(), StorageError> {
        let path = self.path_for(blob_name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_blob() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = LocalDiskGateway::new(dir.path());
        gateway.upload("abc.pdf", "application/pdf", Bytes::from_static(b"hello")).await.unwrap();
        let data = gateway.download("abc.pdf").await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = LocalDiskGateway::new(dir.path());
        let err = gateway.download("missing.pdf").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_of_missing_blob_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = LocalDiskGateway::new(dir.path());
        gateway.delete("never-uploaded.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn signed_url_rejects_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = LocalDiskGateway::new(dir.path());
        let err = gateway
            .signed_download_url("missing.pdf", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}

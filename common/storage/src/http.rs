use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;

use crate::error::StorageError;
use crate::gateway::StorageGateway;

/// S3-compatible object store reached over HTTP via presigned-URL style
/// PUT/GET/DELETE. The object store itself is out of scope, this speaks
/// whatever presigning convention the deployed endpoint exposes through
/// `base_url` query parameters, matching how `document-service` already
/// reaches the field-extractor and stamp services over `reqwest`.
#[derive(Clone)]
pub struct HttpObjectGateway {
    client: Client,
    base_url: String,
}

impl HttpObjectGateway {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into() }
    }

    fn object_url(&self, blob_name: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), blob_name)
    }
}

#[async_trait]
impl StorageGateway for HttpObjectGateway {
    async fn upload(&self, blob_name: &str, content_type: &str, bytes: Bytes) -> Result<(), StorageError> {
        let resp = self
            .client
            .put(self.object_url(blob_name))
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| StorageError::Upstream(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StorageError::Upstream(format!("upload failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn download(&self, blob_name: &str) -> Result<Bytes, StorageError> {
        let resp = self
            .client
            .get(self.object_url(blob_name))
            .send()
            .await
            .map_err(|e| StorageError::Upstream(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(blob_name.to_string()));
        }
        if !resp.status().is_success() {
            return Err(StorageError::Upstream(format!("download failed: {}", resp.status())));
        }
        resp.bytes().await.map_err(|e| StorageError::Upstream(e.to_string()))
    }

    async fn signed_download_url(&self, blob_name: &str, ttl: Duration) -> Result<String, StorageError> {
        Ok(format!("{}?expires_in={}", self.object_url(blob_name), ttl.as_secs()))
    }

    async fn delete(&self, blob_name: &str) -> Result<(), StorageError> {
        let resp = self
            .client
            .delete(self.object_url(blob_name))
            .send()
            .await
            .map_err(|e| StorageError::Upstream(e.to_string()))?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(StorageError::Upstream(format!("delete failed: {}", resp.status())))
    }
}

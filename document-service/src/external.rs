use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Thin `reqwest`-client-call-then-propagate idiom for every out-of-scope
/// collaborator: field locator, stamper, audit renderer, concat. One
/// `Client`, one base URL per collaborator, no retry here (retry belongs to
/// the job orchestrator that calls these from inside a task body).
#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    #[error("request to {0} failed: {1}")]
    Request(String, reqwest::Error),
    #[error("{0} responded with status {1}")]
    Status(String, reqwest::StatusCode),
    #[error("failed to decode response from {0}: {1}")]
    Decode(String, reqwest::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatedPage {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatedField {
    pub name: String,
    pub rect: LocatedRect,
    pub page: u32,
    /// The PDF form field's raw default value, e.g. `"{signature}"` or
    /// `"{date:sig}"`, parsed against the reference grammar in
    /// `fieldref::parse_field_reference`. Not itself a display value; an
    /// absent or non-matching raw value just means the field isn't fillable.
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatedRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocateFieldsResponse {
    pub pages: Vec<LocatedPage>,
    pub fields: Vec<LocatedField>,
}

pub struct FieldLocatorClient {
    client: Client,
    base_url: String,
}

impl FieldLocatorClient {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    pub async fn locate_fields(&self, pdf_bytes: Bytes) -> Result<LocateFieldsResponse, ExternalError> {
        let url = format!("{}/locate-fields", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/pdf")
            .body(pdf_bytes)
            .send()
            .await
            .map_err(|e| ExternalError::Request(url.clone(), e))?;

        if !response.status().is_success() {
            return Err(ExternalError::Status(url, response.status()));
        }

        response
            .json()
            .await
            .map_err(|e| ExternalError::Decode(url, e))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StampFieldValue {
    Image,
    Text { value: String },
    Blank,
}

pub struct StampClient {
    client: Client,
    base_url: String,
}

impl StampClient {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    /// `fields` maps field name to its stamp descriptor; `images` maps the
    /// multipart part name referenced by an image descriptor to PNG bytes.
    pub async fn stamp(
        &self,
        pdf_bytes: Bytes,
        fields: &HashMap<String, Value>,
        images: Vec<(String, Bytes)>,
    ) -> Result<Bytes, ExternalError> {
        let url = format!("{}/stamp", self.base_url);
        let fields_json = serde_json::to_string(fields).unwrap_or_else(|_| "{}".to_string());

        let mut form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(pdf_bytes.to_vec()).file_name("source.pdf"))
            .text("fields", fields_json);

        for (name, bytes) in images {
            form = form.part(
                name.clone(),
                reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(name),
            );
        }

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ExternalError::Request(url.clone(), e))?;

        if !response.status().is_success() {
            return Err(ExternalError::Status(url, response.status()));
        }

        response
            .bytes()
            .await
            .map_err(|e| ExternalError::Decode(url, e))
    }
}

pub struct AuditRendererClient {
    client: Client,
    base_url: String,
}

impl AuditRendererClient {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    pub async fn render(&self, entries: &Value) -> Result<Bytes, ExternalError> {
        let url = self.base_url.clone();
        let response = self
            .client
            .post(&url)
            .json(entries)
            .send()
            .await
            .map_err(|e| ExternalError::Request(url.clone(), e))?;

        if !response.status().is_success() {
            return Err(ExternalError::Status(url, response.status()));
        }

        response
            .bytes()
            .await
            .map_err(|e| ExternalError::Decode(url, e))
    }
}

pub struct ConcatClient {
    client: Client,
    base_url: String,
}

impl ConcatClient {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    pub async fn concat(&self, pdfs: Vec<Bytes>) -> Result<Bytes, ExternalError> {
        let url = format!("{}/concat", self.base_url);
        let mut form = reqwest::multipart::Form::new();
        for (i, pdf) in pdfs.into_iter().enumerate() {
            form = form.part(
                format!("part{i}"),
                reqwest::multipart::Part::bytes(pdf.to_vec()).file_name(format!("part{i}.pdf")),
            );
        }

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ExternalError::Request(url.clone(), e))?;

        if !response.status().is_success() {
            return Err(ExternalError::Status(url, response.status()));
        }

        response
            .bytes()
            .await
            .map_err(|e| ExternalError::Decode(url, e))
    }
}

/// Mailgun-style MIME submission, modeled as a trait so job-worker's
/// `send_email` task body doesn't depend on a concrete provider.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<(), ExternalError>;
}

pub struct MailgunEmailProvider {
    client: Client,
    base_url: String,
    api_key: String,
    from: String,
}

impl MailgunEmailProvider {
    pub fn new(client: Client, base_url: String, api_key: String, from: String) -> Self {
        Self { client, base_url, api_key, from }
    }
}

#[async_trait]
impl EmailProvider for MailgunEmailProvider {
    async fn send(&self, to: &str, subject: &str, body_html: &str) -> Result<(), ExternalError> {
        let url = format!("{}/messages", self.base_url);
        let form = [
            ("from", self.from.as_str()),
            ("to", to),
            ("subject", subject),
            ("html", body_html),
        ];

        let response = self
            .client
            .post(&url)
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .send()
            .await
            .map_err(|e| ExternalError::Request(url.clone(), e))?;

        if !response.status().is_success() {
            return Err(ExternalError::Status(url, response.status()));
        }
        Ok(())
    }
}

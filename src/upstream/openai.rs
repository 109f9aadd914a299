use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::http::HttpTransport;
use super::Upstream;
use crate::types::{ApiError, BatchObject};
use crate::{BatchgateError, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiUpstream {
    transport: HttpTransport,
    base_url: String,
}

impl Default for OpenAiUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiUpstream {
    pub fn new() -> Self {
        Self {
            transport: HttpTransport::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn apply_auth(
        &self,
        req: reqwest::RequestBuilder,
        credential: &str,
    ) -> reqwest::RequestBuilder {
        if credential.is_empty() {
            req
        } else {
            req.header(AUTHORIZATION, credential)
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileUploadObject {
    #[serde(default)]
    id: String,
    #[serde(default)]
    error: Option<ApiError>,
}

#[async_trait]
impl Upstream for OpenAiUpstream {
    async fn upload_file(&self, credential: &str, payload: Vec<u8>) -> Result<String> {
        let url = self.endpoint("files");
        let bytes = self
            .transport
            .execute(|http| {
                let form = Form::new().text("purpose", "batch").part(
                    "file",
                    Part::bytes(payload.clone()).file_name("data.jsonl"),
                );
                self.apply_auth(http.post(&url), credential).multipart(form)
            })
            .await?;

        let parsed: FileUploadObject = serde_json::from_slice(&bytes)?;
        if let Some(error) = parsed.error {
            return Err(BatchgateError::Upstream(error.message));
        }
        debug!(file_id = %parsed.id, "uploaded batch input file");
        Ok(parsed.id)
    }

    async fn create_batch(
        &self,
        credential: &str,
        input_file_id: &str,
        endpoint: &str,
    ) -> Result<String> {
        let url = self.endpoint("batches");
        let body = json!({
            "input_file_id": input_file_id,
            "endpoint": endpoint,
            "completion_window": "24h",
        });
        let bytes = self
            .transport
            .execute(|http| self.apply_auth(http.post(&url), credential).json(&body))
            .await?;

        let parsed: BatchObject = serde_json::from_slice(&bytes)?;
        if let Some(error) = parsed.error {
            return Err(BatchgateError::Upstream(error.message));
        }
        debug!(batch_id = %parsed.id, endpoint, "created batch");
        Ok(parsed.id)
    }

    async fn batch_status(&self, credential: &str, batch_id: &str) -> Result<BatchObject> {
        let url = self.endpoint(&format!("batches/{batch_id}"));
        let bytes = self
            .transport
            .execute(|http| self.apply_auth(http.get(&url), credential))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn cancel_batch(&self, credential: &str, batch_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("batches/{batch_id}/cancel"));
        self.transport
            .execute(|http| self.apply_auth(http.post(&url), credential))
            .await?;
        Ok(())
    }

    async fn file_content(&self, credential: &str, file_id: &str) -> Result<Bytes> {
        let url = self.endpoint(&format!("files/{file_id}/content"));
        self.transport
            .execute(|http| self.apply_auth(http.get(&url), credential))
            .await
    }

    async fn delete_file(&self, credential: &str, file_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("files/{file_id}"));
        self.transport
            .execute(|http| self.apply_auth(http.delete(&url), credential))
            .await?;
        Ok(())
    }
}

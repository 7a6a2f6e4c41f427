//! HTTP client for the proctoring backend
//!
//! Two endpoints matter to the queue: batch ingestion of logs and the
//! signed-upload credential used for direct-to-storage image uploads.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::config::BackendConfig;
use crate::error::{Error, Result};

use super::batch::LogBatch;
use super::uploader::UploadCredential;

/// Receives log batches. Any error means the whole batch was not accepted.
#[async_trait]
pub trait IngestApi: Send + Sync {
    async fn submit_batch(&self, batch: &LogBatch) -> Result<()>;
}

/// HTTP client for the backend API
#[derive(Clone)]
pub struct BackendClient {
    config: BackendConfig,
    http_client: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    /// Create a new backend client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("backend.base_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST a batch of logs
    pub async fn send_batch(&self, batch: &LogBatch) -> Result<()> {
        let url = self.endpoint(&self.config.ingest_path);

        let response = self
            .http_client
            .post(&url)
            .json(batch)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// GET a fresh signed-upload credential
    pub async fn fetch_upload_credential(&self) -> Result<UploadCredential> {
        let url = self.endpoint(&self.config.upload_auth_path);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Upload(format!("failed to parse credential: {}", e)))
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl IngestApi for BackendClient {
    async fn submit_batch(&self, batch: &LogBatch) -> Result<()> {
        self.send_batch(batch).await
    }
}

//! Direct-to-storage image uploads.
//!
//! Images are never sent through the ingestion endpoint. The backend hands
//! out a short-lived signed credential and the bytes go straight to object
//! storage, which answers with a stable file id and public URL.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::types::InlineImage;

use super::client::BackendClient;

/// Server-issued authorization for one or more direct uploads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCredential {
    pub signature: String,
    /// Expiry as unix seconds
    pub expire: i64,
    pub token: String,
    pub public_key: String,
    pub url_endpoint: String,
}

impl UploadCredential {
    pub fn is_expired(&self) -> bool {
        self.expire <= Utc::now().timestamp()
    }
}

/// Where an uploaded image ended up
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoredAsset {
    #[serde(rename = "fileId")]
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait AssetUploader: Send + Sync {
    async fn fetch_credential(&self) -> Result<UploadCredential>;

    async fn upload(
        &self,
        credential: &UploadCredential,
        image: &InlineImage,
    ) -> Result<StoredAsset>;
}

/// [`AssetUploader`] backed by the proctoring backend and its object store
#[derive(Clone)]
pub struct RemoteAssetUploader {
    backend: BackendClient,
    // Storage endpoints reject the backend's bearer token, so uploads use
    // a separate client without default headers.
    storage: reqwest::Client,
}

impl RemoteAssetUploader {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let storage = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            backend: BackendClient::new(config)?,
            storage,
        })
    }

    pub fn from_client(backend: BackendClient, timeout: Duration) -> Result<Self> {
        let storage = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { backend, storage })
    }
}

#[async_trait]
impl AssetUploader for RemoteAssetUploader {
    async fn fetch_credential(&self) -> Result<UploadCredential> {
        self.backend.fetch_upload_credential().await
    }

    async fn upload(
        &self,
        credential: &UploadCredential,
        image: &InlineImage,
    ) -> Result<StoredAsset> {
        let decoded = decode_inline_image(&image.inline_image_data)?;
        let file_name = format!(
            "{}.{}",
            uuid::Uuid::new_v4(),
            extension_for(&decoded.mime_type)
        );

        let file = Part::bytes(decoded.bytes)
            .file_name(file_name.clone())
            .mime_str(&decoded.mime_type)
            .map_err(|e| Error::Upload(format!("invalid mime type: {}", e)))?;

        let form = Form::new()
            .part("file", file)
            .text("fileName", file_name)
            .text("publicKey", credential.public_key.clone())
            .text("signature", credential.signature.clone())
            .text("expire", credential.expire.to_string())
            .text("token", credential.token.clone());

        let response = self
            .storage
            .post(&credential.url_endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("upload request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(Error::Upload(format!(
                "storage returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Upload(format!("failed to parse upload response: {}", e)))
    }
}

/// Raw bytes of an inline image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Decode a `data:<mime>;base64,<data>` URL or bare base64 (assumed JPEG).
pub fn decode_inline_image(data: &str) -> Result<DecodedImage> {
    let (mime_type, encoded) = match data.strip_prefix("data:") {
        Some(rest) => {
            let (header, body) = rest
                .split_once(',')
                .ok_or_else(|| Error::Upload("data URL has no payload".to_string()))?;
            let mime = header
                .strip_suffix(";base64")
                .ok_or_else(|| Error::Upload("data URL is not base64 encoded".to_string()))?;
            let mime = if mime.is_empty() { "image/jpeg" } else { mime };
            (mime.to_string(), body)
        }
        None => ("image/jpeg".to_string(), data),
    };

    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Upload(format!("image is not valid base64: {}", e)))?;

    if bytes.is_empty() {
        return Err(Error::Upload("image is empty".to_string()));
    }

    Ok(DecodedImage { mime_type, bytes })
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    }
}

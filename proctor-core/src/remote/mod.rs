//! Backend integration
//!
//! - [`batch`]: request body of the ingestion endpoint
//! - [`client`]: [`BackendClient`] and the [`IngestApi`] seam
//! - [`uploader`]: signed direct uploads behind the [`AssetUploader`] seam

pub mod batch;
pub mod client;
pub mod uploader;

pub use batch::{logs_for_entry, BatchLog, LogBatch, LogMeta};
pub use client::{BackendClient, IngestApi};
pub use uploader::{
    decode_inline_image, AssetUploader, RemoteAssetUploader, StoredAsset, UploadCredential,
};

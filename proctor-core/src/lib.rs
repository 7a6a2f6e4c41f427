//! # proctor-core
//!
//! Offline-first event queue and sync engine for exam proctoring.
//!
//! This library provides:
//! - Encrypted, durable local storage of proctoring events (SQLite)
//! - A per-session sync engine that drains the queue to the backend in batches
//! - Direct-to-storage upload of screenshots and webcam photos
//! - Connectivity tracking, configuration and logging
//!
//! ## Data flow
//!
//! Capture hooks append through a [`LogProducer`]. Payloads are encrypted
//! with a key derived from the submission id before they touch disk. The
//! [`SyncEngine`] decrypts, uploads images, submits one batch and reconciles
//! the queue with the outcome.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use proctor_core::{
//!     BackendClient, Config, ConnectivityMonitor, LogQueue, PayloadCodec,
//!     RemoteAssetUploader, SyncEngine,
//! };
//!
//! # async fn demo() -> proctor_core::Result<()> {
//! let config = Config::load()?;
//! let queue = LogQueue::open(
//!     &Config::database_path(),
//!     PayloadCodec::new(config.codec.secret.clone()),
//! )?;
//!
//! let engine = SyncEngine::new(
//!     "submission-42",
//!     queue,
//!     Arc::new(BackendClient::new(config.backend.clone())?),
//!     Arc::new(RemoteAssetUploader::new(config.backend.clone())?),
//!     ConnectivityMonitor::default(),
//!     config.sync.clone(),
//! );
//! engine.trigger_sync().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use connectivity::{probe_client, ConnectivityMonitor, ReconnectListener};
pub use crypto::PayloadCodec;
pub use db::Database;
pub use error::{Error, Result};
pub use queue::{LogProducer, LogQueue};
pub use remote::{
    AssetUploader, BackendClient, IngestApi, LogBatch, RemoteAssetUploader, StoredAsset,
    UploadCredential,
};
pub use sync::{CycleReport, SyncEngine, SyncEvent, SyncPhase, SyncStatus, MAX_UPLOAD_ATTEMPTS};
pub use types::*;

// Public modules
pub mod config;
pub mod connectivity;
pub mod crypto;
pub mod db;
pub mod error;
pub mod logging;
pub mod queue;
pub mod remote;
pub mod sync;
pub mod types;

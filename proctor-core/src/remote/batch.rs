//! Wire format for the batch ingestion endpoint.
//!
//! ```json
//! { "logs": [ { "logType": "KEYSTROKE", "submissionId": "…",
//!               "meta": { "key": "a", "loggedAt": "…" },
//!               "idempotencyKey": "…" } ] }
//! ```
//!
//! Image entries expand to one log per stored image; the meta then carries
//! `{ fileId, image, takenAt }` and never any inline bytes.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::{
    FocusChangeEvent, ImageItem, KeystrokeEvent, LogEntry, LogPayload, LogType, MouseClickEvent,
    StoredImage,
};

/// Type-specific `meta` object of one log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogMeta {
    Image(StoredImage),
    Keystroke(KeystrokeEvent),
    MouseClick(MouseClickEvent),
    FocusChange(FocusChangeEvent),
}

/// One element of the `logs` array
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLog {
    pub log_type: LogType,
    pub submission_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<LogMeta>,
    /// Stable per log across retries, so the server can drop duplicates
    pub idempotency_key: String,
    /// Queue row this log came from; not sent
    #[serde(skip)]
    pub entry_id: i64,
}

/// Request body for the batch ingestion endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogBatch {
    pub logs: Vec<BatchLog>,
}

impl LogBatch {
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }
}

/// Build the wire logs for one processed entry.
///
/// Fails if an image item is still inline; uploads must have replaced every
/// inline image with a stored reference first.
pub fn logs_for_entry(entry: &LogEntry, payload: LogPayload) -> Result<Vec<BatchLog>> {
    let log = |meta: LogMeta, key: String| BatchLog {
        log_type: entry.log_type,
        submission_id: entry.submission_id.clone(),
        meta: Some(meta),
        idempotency_key: key,
        entry_id: entry.id,
    };

    let logs = match payload {
        LogPayload::Screenshot(items) | LogPayload::WebcamPhoto(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                ImageItem::Stored(stored) => Ok(log(
                    LogMeta::Image(stored),
                    format!("{}:{}", entry.idempotency_key, i),
                )),
                ImageItem::Inline(_) => Err(Error::Upload(format!(
                    "entry {} still has an inline image at index {}",
                    entry.id, i
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        LogPayload::Keystroke(k) => vec![log(LogMeta::Keystroke(k), entry.idempotency_key.clone())],
        LogPayload::Mouseclick(m) => {
            vec![log(LogMeta::MouseClick(m), entry.idempotency_key.clone())]
        }
        LogPayload::FocusChange(f) => {
            vec![log(LogMeta::FocusChange(f), entry.idempotency_key.clone())]
        }
    };

    Ok(logs)
}

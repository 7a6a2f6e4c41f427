//! Core domain types for proctor-sync
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Submission** | One student's attempt at one test; the unit of key derivation and queue partitioning |
//! | **LogEntry** | One persisted, encrypted proctoring event awaiting upload |
//! | **LogPayload** | The cleartext of a LogEntry; only ever held in memory |
//! | **Batch** | The entries processed together in one sync cycle |
//!
//! Cleartext payloads are never written to disk. The queue stores
//! [`LogEntry::encrypted_payload`] and decrypts only inside a sync cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Log types
// ============================================

/// Kind of proctoring event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    Screenshot,
    WebcamPhoto,
    FocusChange,
    Mouseclick,
    Keystroke,
}

impl LogType {
    pub const ALL: [LogType; 5] = [
        LogType::Screenshot,
        LogType::WebcamPhoto,
        LogType::FocusChange,
        LogType::Mouseclick,
        LogType::Keystroke,
    ];

    /// Returns the identifier used in storage and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Screenshot => "SCREENSHOT",
            LogType::WebcamPhoto => "WEBCAM_PHOTO",
            LogType::FocusChange => "FOCUS_CHANGE",
            LogType::Mouseclick => "MOUSECLICK",
            LogType::Keystroke => "KEYSTROKE",
        }
    }
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "SCREENSHOT" => Ok(LogType::Screenshot),
            "WEBCAM_PHOTO" => Ok(LogType::WebcamPhoto),
            "FOCUS_CHANGE" => Ok(LogType::FocusChange),
            "MOUSECLICK" => Ok(LogType::Mouseclick),
            "KEYSTROKE" => Ok(LogType::Keystroke),
            _ => Err(format!("unknown log type: {}", s)),
        }
    }
}

// ============================================
// Persisted entry
// ============================================

/// A queued, encrypted proctoring event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Local autoincrement id (creation order)
    pub id: i64,
    /// Submission this event belongs to
    pub submission_id: String,
    /// Event kind, stored in the clear so drains can be typed without decrypting
    pub log_type: LogType,
    /// Base64 `nonce || ciphertext || tag`
    pub encrypted_payload: String,
    /// When the entry was appended
    pub created_at: DateTime<Utc>,
    /// Failed upload attempts so far
    pub upload_attempts: u32,
    /// Sent with every log so the server can drop duplicates
    pub idempotency_key: String,
}

/// Audit row written when an entry is dropped after exhausting its attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardedEntry {
    pub entry_id: i64,
    pub submission_id: String,
    pub log_type: LogType,
    pub upload_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub discarded_at: DateTime<Utc>,
}

// ============================================
// Cleartext payloads
// ============================================

/// Image captured on the device, not yet uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineImage {
    /// `data:` URL or bare base64 of the encoded image
    pub inline_image_data: String,
    pub taken_at: DateTime<Utc>,
}

/// Image that has been uploaded to object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredImage {
    pub file_id: String,
    /// Public URL of the stored image
    pub image: String,
    pub taken_at: DateTime<Utc>,
}

/// One image within a screenshot or webcam payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageItem {
    Stored(StoredImage),
    Inline(InlineImage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MouseButton {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystrokeEvent {
    pub key: String,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MouseClickEvent {
    #[serde(rename = "type")]
    pub button: MouseButton,
    /// Viewport coordinates `[x, y]`
    pub position: [i32; 2],
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusChangeEvent {
    /// Milliseconds spent away from the exam window
    pub duration: u64,
    pub logged_at: DateTime<Utc>,
}

/// Cleartext of a [`LogEntry`], shaped by its log type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "logType", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogPayload {
    Screenshot(Vec<ImageItem>),
    WebcamPhoto(Vec<ImageItem>),
    FocusChange(FocusChangeEvent),
    Mouseclick(MouseClickEvent),
    Keystroke(KeystrokeEvent),
}

impl LogPayload {
    pub fn log_type(&self) -> LogType {
        match self {
            LogPayload::Screenshot(_) => LogType::Screenshot,
            LogPayload::WebcamPhoto(_) => LogType::WebcamPhoto,
            LogPayload::FocusChange(_) => LogType::FocusChange,
            LogPayload::Mouseclick(_) => LogType::Mouseclick,
            LogPayload::Keystroke(_) => LogType::Keystroke,
        }
    }

    /// Image items, for image-bearing payloads
    pub fn images(&self) -> Option<&[ImageItem]> {
        match self {
            LogPayload::Screenshot(items) | LogPayload::WebcamPhoto(items) => Some(items),
            _ => None,
        }
    }

    pub fn images_mut(&mut self) -> Option<&mut Vec<ImageItem>> {
        match self {
            LogPayload::Screenshot(items) | LogPayload::WebcamPhoto(items) => Some(items),
            _ => None,
        }
    }

    /// True if any image still carries inline bytes
    pub fn has_inline_images(&self) -> bool {
        self.images()
            .map(|items| items.iter().any(|i| matches!(i, ImageItem::Inline(_))))
            .unwrap_or(false)
    }
}

// ============================================
// Upload counters
// ============================================

/// Logs acknowledged by the server, per type, since the engine started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadedCounts {
    pub screenshots: u64,
    pub webcam_photos: u64,
    pub focus_changes: u64,
    pub mouse_clicks: u64,
    pub keystrokes: u64,
}

impl UploadedCounts {
    pub fn record(&mut self, log_type: LogType, n: u64) {
        match log_type {
            LogType::Screenshot => self.screenshots += n,
            LogType::WebcamPhoto => self.webcam_photos += n,
            LogType::FocusChange => self.focus_changes += n,
            LogType::Mouseclick => self.mouse_clicks += n,
            LogType::Keystroke => self.keystrokes += n,
        }
    }

    pub fn get(&self, log_type: LogType) -> u64 {
        match log_type {
            LogType::Screenshot => self.screenshots,
            LogType::WebcamPhoto => self.webcam_photos,
            LogType::FocusChange => self.focus_changes,
            LogType::Mouseclick => self.mouse_clicks,
            LogType::Keystroke => self.keystrokes,
        }
    }

    pub fn total(&self) -> u64 {
        LogType::ALL.iter().map(|t| self.get(*t)).sum()
    }
}

//! Durable, encrypted, per-submission event queue.
//!
//! [`LogQueue`] is the async face of [`Database`]: every call runs on tokio's
//! blocking pool so capture hooks and the sync engine never stall the runtime
//! on SQLite or key derivation. Payloads are encrypted before they reach the
//! database and are never written in the clear.
//!
//! Producers get a [`LogProducer`], which can only append. Reading, deleting
//! and bumping attempt counters is reserved for the sync engine.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use crate::crypto::PayloadCodec;
use crate::db::{Database, SubmissionBacklog};
use crate::error::Result;
use crate::types::{DiscardedEntry, LogEntry, LogPayload};

/// Shared handle to the local queue. Cloning is cheap.
#[derive(Clone)]
pub struct LogQueue {
    db: Arc<Database>,
    codec: PayloadCodec,
}

impl LogQueue {
    /// Wrap an already-migrated database
    pub fn new(db: Arc<Database>, codec: PayloadCodec) -> Self {
        Self { db, codec }
    }

    /// Open (or create) the queue file and run migrations
    pub fn open(path: &Path, codec: PayloadCodec) -> Result<Self> {
        let db = Database::open(path)?;
        db.migrate()?;
        Ok(Self::new(Arc::new(db), codec))
    }

    /// In-memory queue (for testing)
    pub fn open_in_memory(codec: PayloadCodec) -> Result<Self> {
        let db = Database::open_in_memory()?;
        db.migrate()?;
        Ok(Self::new(Arc::new(db), codec))
    }

    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Append-only handle bound to one submission
    pub fn producer(&self, submission_id: impl Into<String>) -> LogProducer {
        LogProducer {
            queue: self.clone(),
            submission_id: Arc::from(submission_id.into()),
        }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    /// Encrypt `payload` for `submission_id` and persist it. Returns the new id.
    pub async fn append(&self, submission_id: &str, payload: LogPayload) -> Result<i64> {
        let codec = self.codec.clone();
        let submission_id = submission_id.to_string();

        let id = self
            .blocking(move |db| {
                let log_type = payload.log_type();
                let sealed = codec.encrypt(&payload, &submission_id)?;
                let key = uuid::Uuid::new_v4().to_string();
                db.insert_entry(&submission_id, log_type, &sealed, Utc::now(), &key)
            })
            .await?;

        tracing::trace!(entry_id = id, "Queued log entry");
        Ok(id)
    }

    /// Re-encrypt an entry's payload in place. The id, attempt counter and
    /// idempotency key are kept. Returns false if the entry is gone.
    pub async fn reseal(&self, id: i64, submission_id: &str, payload: LogPayload) -> Result<bool> {
        let codec = self.codec.clone();
        let submission_id = submission_id.to_string();

        self.blocking(move |db| {
            let sealed = codec.encrypt(&payload, &submission_id)?;
            db.update_payload(id, &sealed)
        })
        .await
    }

    /// Queued entries for a submission in creation order
    pub async fn list_pending(&self, submission_id: &str) -> Result<Vec<LogEntry>> {
        let submission_id = submission_id.to_string();
        self.blocking(move |db| db.pending_entries(&submission_id))
            .await
    }

    pub async fn remove(&self, id: i64) -> Result<bool> {
        self.blocking(move |db| db.delete_entry(id)).await
    }

    /// Remove several entries atomically
    pub async fn remove_many(&self, ids: Vec<i64>) -> Result<usize> {
        self.blocking(move |db| db.delete_entries(&ids)).await
    }

    pub async fn increment_attempts(&self, id: i64) -> Result<bool> {
        self.blocking(move |db| db.increment_attempts(id)).await
    }

    /// Bump attempts for several entries atomically
    pub async fn increment_attempts_many(&self, ids: Vec<i64>) -> Result<usize> {
        self.blocking(move |db| db.increment_attempts_many(&ids))
            .await
    }

    pub async fn count(&self, submission_id: &str) -> Result<usize> {
        let submission_id = submission_id.to_string();
        self.blocking(move |db| db.count_pending(&submission_id))
            .await
    }

    /// Drop an exhausted entry and keep an audit record of it
    pub async fn discard(&self, entry: LogEntry) -> Result<bool> {
        self.blocking(move |db| db.discard_entry(&entry, Utc::now()))
            .await
    }

    pub async fn discarded(&self, submission_id: &str) -> Result<Vec<DiscardedEntry>> {
        let submission_id = submission_id.to_string();
        self.blocking(move |db| db.discarded_entries(&submission_id))
            .await
    }

    pub async fn backlog(&self) -> Result<Vec<SubmissionBacklog>> {
        self.blocking(|db| db.backlog()).await
    }
}

/// Append-only access to the queue for one submission.
///
/// Handed to capture hooks (screenshot timer, key listener, ...). It cannot
/// read, delete or modify queued entries.
#[derive(Clone)]
pub struct LogProducer {
    queue: LogQueue,
    submission_id: Arc<str>,
}

impl LogProducer {
    pub fn submission_id(&self) -> &str {
        &self.submission_id
    }

    pub async fn append(&self, payload: LogPayload) -> Result<i64> {
        self.queue.append(&self.submission_id, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FocusChangeEvent, KeystrokeEvent, LogType};

    fn test_queue() -> LogQueue {
        LogQueue::open_in_memory(PayloadCodec::with_iterations("test-secret", 1_000)).unwrap()
    }

    fn keystroke(key: &str) -> LogPayload {
        LogPayload::Keystroke(KeystrokeEvent {
            key: key.to_string(),
            logged_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_append_increments_count() {
        let queue = test_queue();
        assert_eq!(queue.count("sub-1").await.unwrap(), 0);

        queue.append("sub-1", keystroke("a")).await.unwrap();
        assert_eq!(queue.count("sub-1").await.unwrap(), 1);

        queue.append("sub-1", keystroke("b")).await.unwrap();
        assert_eq!(queue.count("sub-1").await.unwrap(), 2);
        assert_eq!(queue.count("sub-2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_decrements_count_and_hides_entry() {
        let queue = test_queue();
        let a = queue.append("sub-1", keystroke("a")).await.unwrap();
        let b = queue.append("sub-1", keystroke("b")).await.unwrap();

        assert!(queue.remove(a).await.unwrap());
        assert_eq!(queue.count("sub-1").await.unwrap(), 1);

        let pending = queue.list_pending("sub-1").await.unwrap();
        assert!(pending.iter().all(|e| e.id != a));
        assert_eq!(pending[0].id, b);
    }

    #[tokio::test]
    async fn test_cleartext_never_stored() {
        let queue = test_queue();
        queue
            .append("sub-1", keystroke("very-secret-key-press"))
            .await
            .unwrap();

        let entry = queue.list_pending("sub-1").await.unwrap().remove(0);
        assert_eq!(entry.log_type, LogType::Keystroke);
        assert!(!entry.encrypted_payload.contains("very-secret-key-press"));

        let opened: LogPayload = queue
            .codec()
            .decrypt(&entry.encrypted_payload, "sub-1")
            .unwrap();
        match opened {
            LogPayload::Keystroke(k) => assert_eq!(k.key, "very-secret-key-press"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_entries_get_distinct_idempotency_keys() {
        let queue = test_queue();
        queue.append("sub-1", keystroke("a")).await.unwrap();
        queue.append("sub-1", keystroke("a")).await.unwrap();

        let pending = queue.list_pending("sub-1").await.unwrap();
        assert_ne!(pending[0].idempotency_key, pending[1].idempotency_key);
    }

    #[tokio::test]
    async fn test_concurrent_producers() {
        let queue = test_queue();
        let mut handles = Vec::new();

        for i in 0..8 {
            let producer = queue.producer("sub-1");
            handles.push(tokio::spawn(async move {
                producer
                    .append(LogPayload::FocusChange(FocusChangeEvent {
                        duration: i * 100,
                        logged_at: Utc::now(),
                    }))
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(queue.count("sub-1").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_increment_attempts() {
        let queue = test_queue();
        let id = queue.append("sub-1", keystroke("a")).await.unwrap();

        queue.increment_attempts(id).await.unwrap();
        queue.increment_attempts_many(vec![id]).await.unwrap();

        let entry = queue.list_pending("sub-1").await.unwrap().remove(0);
        assert_eq!(entry.upload_attempts, 2);
    }

    #[tokio::test]
    async fn test_reseal_keeps_identity_and_attempts() {
        let queue = test_queue();
        let id = queue.append("sub-1", keystroke("a")).await.unwrap();
        queue.increment_attempts(id).await.unwrap();
        let before = queue.list_pending("sub-1").await.unwrap().remove(0);

        assert!(queue.reseal(id, "sub-1", keystroke("b")).await.unwrap());

        let after = queue.list_pending("sub-1").await.unwrap().remove(0);
        assert_eq!(after.id, before.id);
        assert_eq!(after.upload_attempts, 1);
        assert_eq!(after.idempotency_key, before.idempotency_key);
        assert_ne!(after.encrypted_payload, before.encrypted_payload);

        let payload: LogPayload = queue
            .codec()
            .decrypt(&after.encrypted_payload, "sub-1")
            .unwrap();
        assert!(matches!(payload, LogPayload::Keystroke(ref k) if k.key == "b"));

        queue.remove(id).await.unwrap();
        assert!(!queue.reseal(id, "sub-1", keystroke("c")).await.unwrap());
    }
}

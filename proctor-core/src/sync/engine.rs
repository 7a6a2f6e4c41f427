//! Batch sync engine for one proctoring session.
//!
//! A cycle drains the submission's queue into a single ingestion request:
//!
//! 1. Entries that already failed [`MAX_UPLOAD_ATTEMPTS`] times are discarded
//!    (with an audit row and a [`SyncEvent::EntryDiscarded`]).
//! 2. Every other entry is decrypted and its inline images are uploaded to
//!    object storage. An entry that fails here gets one more attempt on its
//!    counter and sits this cycle out; its siblings carry on.
//! 3. The remaining logs go out as one batch. The server accepts or rejects
//!    the whole batch: on success every entry in it is deleted, on failure
//!    every entry in it gets one more attempt.
//!
//! No error escapes a cycle. Failures are logged, counted in the
//! [`CycleReport`], and retried on the next trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, Result};
use crate::queue::LogQueue;
use crate::remote::{
    logs_for_entry, AssetUploader, BatchLog, IngestApi, LogBatch, StoredAsset, UploadCredential,
};
use crate::types::{
    ImageItem, InlineImage, LogEntry, LogPayload, LogType, StoredImage, UploadedCounts,
};

use super::state::{SharedState, SyncState, SyncStatus};

/// Failed attempts after which an entry is dropped instead of retried
pub const MAX_UPLOAD_ATTEMPTS: u32 = 5;

const EVENT_CAPACITY: usize = 64;

/// Notifications for UIs and audit sinks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// An entry exhausted its attempts and was deleted without being sent
    EntryDiscarded {
        entry_id: i64,
        log_type: LogType,
        attempts: u32,
    },
    /// An entry could not be prepared this cycle
    EntryFailed {
        entry_id: i64,
        log_type: LogType,
        attempts: u32,
    },
    CycleCompleted(CycleReport),
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Entries deleted after too many failed attempts
    pub discarded: usize,
    /// Entries that failed to decrypt or upload and were left for later
    pub failed: usize,
    /// Entries included in the submitted batch
    pub submitted: usize,
    /// Logs the server accepted, by type
    pub uploaded: UploadedCounts,
    /// The batch was sent and not accepted
    pub batch_rejected: bool,
    pub pending_after: usize,
}

/// Upload credential, fetched on first need and reused for the cycle
enum CredentialSlot {
    Empty,
    Ready(UploadCredential),
    Failed(String),
}

struct Inner {
    submission_id: String,
    queue: LogQueue,
    ingest: Arc<dyn IngestApi>,
    uploader: Arc<dyn AssetUploader>,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    state: SharedState,
    events: broadcast::Sender<SyncEvent>,
    exam_active: AtomicBool,
}

/// Sync engine bound to one submission. Cloning shares the session.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        submission_id: impl Into<String>,
        queue: LogQueue,
        ingest: Arc<dyn IngestApi>,
        uploader: Arc<dyn AssetUploader>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                submission_id: submission_id.into(),
                queue,
                ingest,
                uploader,
                connectivity,
                config,
                state: SharedState::default(),
                events,
                exam_active: AtomicBool::new(true),
            }),
        }
    }

    pub fn submission_id(&self) -> &str {
        &self.inner.submission_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Periodic syncing only runs while the exam is active
    pub fn set_exam_active(&self, active: bool) {
        self.inner.exam_active.store(active, Ordering::SeqCst);
    }

    pub fn is_exam_active(&self) -> bool {
        self.inner.exam_active.load(Ordering::SeqCst)
    }

    /// Pending count as of the last refresh
    pub fn get_pending_count(&self) -> usize {
        self.inner.state.status().pending_count
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.state.status()
    }

    pub fn state(&self) -> SyncState {
        self.inner.state.snapshot()
    }

    /// Re-read the pending count from the queue
    pub async fn refresh_pending_count(&self) -> usize {
        match self.inner.queue.count(&self.inner.submission_id).await {
            Ok(count) => {
                self.inner.state.set_pending_count(count);
                count
            }
            Err(e) => {
                tracing::warn!(
                    submission_id = %self.inner.submission_id,
                    error = %e,
                    "Failed to refresh pending count"
                );
                self.get_pending_count()
            }
        }
    }

    /// Run one sync cycle.
    ///
    /// Returns `None` without doing anything when offline or when a cycle is
    /// already running for this session.
    pub async fn trigger_sync(&self) -> Option<CycleReport> {
        if !self.inner.connectivity.is_online() {
            tracing::debug!(submission_id = %self.inner.submission_id, "Offline, skipping sync");
            return None;
        }

        let Some(_guard) = self.inner.state.begin_cycle() else {
            tracing::debug!(
                submission_id = %self.inner.submission_id,
                "Sync already in progress"
            );
            return None;
        };

        let mut report = self.run_cycle().await;
        report.pending_after = self.refresh_pending_count().await;

        tracing::info!(
            submission_id = %self.inner.submission_id,
            submitted = report.submitted,
            uploaded = report.uploaded.total(),
            failed = report.failed,
            discarded = report.discarded,
            rejected = report.batch_rejected,
            pending = report.pending_after,
            "Sync cycle complete"
        );

        self.emit(SyncEvent::CycleCompleted(report.clone()));
        Some(report)
    }

    /// Drive syncing until `shutdown` changes or its sender is dropped.
    ///
    /// Triggers: the periodic interval (online and exam active only), every
    /// offline-to-online edge after the settle delay, and a separate
    /// pending-count refresh tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.inner.config;
        let mut sync_tick = tokio::time::interval(config.interval());
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut refresh_tick = tokio::time::interval(config.pending_refresh());
        refresh_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut online_rx = self.inner.connectivity.subscribe();

        tracing::info!(submission_id = %self.inner.submission_id, "Sync engine started");

        loop {
            tokio::select! {
                _ = sync_tick.tick() => {
                    if self.is_exam_active() && self.inner.connectivity.is_online() {
                        self.trigger_sync().await;
                    }
                }
                _ = refresh_tick.tick() => {
                    self.refresh_pending_count().await;
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online {
                        tokio::select! {
                            _ = tokio::time::sleep(config.settle_delay()) => {
                                self.trigger_sync().await;
                            }
                            _ = shutdown.changed() => break,
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!(submission_id = %self.inner.submission_id, "Sync engine stopped");
    }

    async fn run_cycle(&self) -> CycleReport {
        let inner = &self.inner;
        let mut report = CycleReport::default();

        let entries = match inner.queue.list_pending(&inner.submission_id).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    submission_id = %inner.submission_id,
                    error = %e,
                    "Failed to read pending entries"
                );
                return report;
            }
        };

        let mut credential = CredentialSlot::Empty;
        let mut logs: Vec<BatchLog> = Vec::new();
        let mut batch_ids: Vec<i64> = Vec::new();
        let mut empty_ids: Vec<i64> = Vec::new();

        for entry in entries {
            if entry.upload_attempts >= MAX_UPLOAD_ATTEMPTS {
                if self.discard(entry).await {
                    report.discarded += 1;
                }
                continue;
            }

            match self.prepare(&entry, &mut credential).await {
                Ok(entry_logs) if entry_logs.is_empty() => empty_ids.push(entry.id),
                Ok(entry_logs) => {
                    batch_ids.push(entry.id);
                    logs.extend(entry_logs);
                }
                Err(e) => {
                    report.failed += 1;
                    self.record_failure(&entry, &e).await;
                }
            }
        }

        // Image entries with no images have nothing to send.
        if !empty_ids.is_empty() {
            if let Err(e) = inner.queue.remove_many(empty_ids).await {
                tracing::warn!(error = %e, "Failed to remove empty entries");
            }
        }

        if logs.is_empty() {
            return report;
        }

        let batch = LogBatch { logs };
        report.submitted = batch_ids.len();

        match inner.ingest.submit_batch(&batch).await {
            Ok(()) => {
                if let Err(e) = inner.queue.remove_many(batch_ids).await {
                    tracing::error!(
                        submission_id = %inner.submission_id,
                        error = %e,
                        "Batch accepted but entries could not be removed"
                    );
                }

                let mut counts = UploadedCounts::default();
                for log in &batch.logs {
                    counts.record(log.log_type, 1);
                }
                inner.state.record_uploaded(&counts);
                report.uploaded = counts;
            }
            Err(e) => {
                report.batch_rejected = true;
                tracing::warn!(
                    submission_id = %inner.submission_id,
                    entries = batch_ids.len(),
                    logs = batch.len(),
                    error = %e,
                    "Batch submission failed"
                );
                if let Err(e) = inner.queue.increment_attempts_many(batch_ids).await {
                    tracing::error!(error = %e, "Failed to record batch failure");
                }
            }
        }

        report
    }

    /// Decrypt an entry, upload its inline images and build its wire logs.
    async fn prepare(
        &self,
        entry: &LogEntry,
        slot: &mut CredentialSlot,
    ) -> Result<Vec<BatchLog>> {
        let mut payload: LogPayload = self
            .inner
            .queue
            .codec()
            .decrypt_async(entry.encrypted_payload.clone(), entry.submission_id.clone())
            .await?;

        if payload.log_type() != entry.log_type {
            return Err(Error::Decryption(format!(
                "payload is {} but entry is {}",
                payload.log_type(),
                entry.log_type
            )));
        }

        if payload.has_inline_images() {
            let (uploaded, result) = self.upload_images(&mut payload, slot).await;
            if let Err(e) = result {
                if uploaded > 0 {
                    self.keep_uploaded(entry, payload).await;
                }
                return Err(e);
            }
        }

        logs_for_entry(entry, payload)
    }

    /// Replace inline images with stored references, stopping at the first
    /// failure. Returns how many were uploaded along with the outcome.
    async fn upload_images(
        &self,
        payload: &mut LogPayload,
        slot: &mut CredentialSlot,
    ) -> (usize, Result<()>) {
        let Some(items) = payload.images_mut() else {
            return (0, Ok(()));
        };

        let mut uploaded = 0;
        for item in items.iter_mut() {
            let ImageItem::Inline(image) = item else {
                continue;
            };
            let taken_at = image.taken_at;
            let asset = match self.upload_one(image, slot).await {
                Ok(asset) => asset,
                Err(e) => return (uploaded, Err(e)),
            };
            *item = ImageItem::Stored(StoredImage {
                file_id: asset.id,
                image: asset.url,
                taken_at,
            });
            uploaded += 1;
        }
        (uploaded, Ok(()))
    }

    async fn upload_one(
        &self,
        image: &InlineImage,
        slot: &mut CredentialSlot,
    ) -> Result<StoredAsset> {
        let credential = self.credential(slot).await?;
        self.inner.uploader.upload(credential, image).await
    }

    /// Persist a partly uploaded payload so the retry skips stored images.
    async fn keep_uploaded(&self, entry: &LogEntry, payload: LogPayload) {
        match self
            .inner
            .queue
            .reseal(entry.id, &entry.submission_id, payload)
            .await
        {
            Ok(_) => tracing::debug!(entry_id = entry.id, "Kept partially uploaded images"),
            Err(e) => tracing::warn!(
                entry_id = entry.id,
                error = %e,
                "Failed to keep partially uploaded images"
            ),
        }
    }

    async fn credential<'a>(&self, slot: &'a mut CredentialSlot) -> Result<&'a UploadCredential> {
        if let CredentialSlot::Empty = slot {
            *slot = match self.inner.uploader.fetch_credential().await {
                Ok(credential) => CredentialSlot::Ready(credential),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to fetch upload credential");
                    CredentialSlot::Failed(e.to_string())
                }
            };
        }

        match slot {
            // One credential per cycle; a long cycle leaves the rest for the next one.
            CredentialSlot::Ready(credential) if credential.is_expired() => {
                Err(Error::Upload("upload credential expired".to_string()))
            }
            CredentialSlot::Ready(credential) => Ok(credential),
            CredentialSlot::Failed(reason) => Err(Error::Upload(format!(
                "no upload credential: {}",
                reason
            ))),
            CredentialSlot::Empty => Err(Error::Upload("no upload credential".to_string())),
        }
    }

    async fn record_failure(&self, entry: &LogEntry, error: &Error) {
        let attempts = entry.upload_attempts + 1;
        tracing::warn!(
            entry_id = entry.id,
            log_type = %entry.log_type,
            attempts,
            error = %error,
            "Entry failed, will retry"
        );

        if let Err(e) = self.inner.queue.increment_attempts(entry.id).await {
            tracing::error!(entry_id = entry.id, error = %e, "Failed to record attempt");
            return;
        }

        self.emit(SyncEvent::EntryFailed {
            entry_id: entry.id,
            log_type: entry.log_type,
            attempts,
        });
    }

    async fn discard(&self, entry: LogEntry) -> bool {
        let (entry_id, log_type, attempts) = (entry.id, entry.log_type, entry.upload_attempts);

        match self.inner.queue.discard(entry).await {
            Ok(true) => {
                tracing::warn!(entry_id, log_type = %log_type, attempts, "Discarded log entry");
                self.emit(SyncEvent::EntryDiscarded {
                    entry_id,
                    log_type,
                    attempts,
                });
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!(entry_id, error = %e, "Failed to discard entry");
                false
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

//! Per-session sync state.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::types::UploadedCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
}

#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub pending_count: usize,
    pub phase: SyncPhase,
    /// Logs accepted by the server since the engine started
    pub last_uploaded: UploadedCounts,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Point-in-time view for UIs and the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub pending_count: usize,
    pub is_syncing: bool,
    pub last_uploaded: UploadedCounts,
}

/// Shared state cell. The lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct SharedState(Arc<Mutex<SyncState>>);

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.lock();
        SyncStatus {
            pending_count: state.pending_count,
            is_syncing: state.phase == SyncPhase::Syncing,
            last_uploaded: state.last_uploaded,
        }
    }

    pub fn snapshot(&self) -> SyncState {
        self.lock().clone()
    }

    pub fn set_pending_count(&self, count: usize) {
        self.lock().pending_count = count;
    }

    pub fn record_uploaded(&self, counts: &UploadedCounts) {
        let mut state = self.lock();
        for log_type in crate::types::LogType::ALL {
            state.last_uploaded.record(log_type, counts.get(log_type));
        }
    }

    /// Move Idle to Syncing. `None` if a cycle is already running.
    pub fn begin_cycle(&self) -> Option<CycleGuard> {
        let mut state = self.lock();
        if state.phase == SyncPhase::Syncing {
            return None;
        }
        state.phase = SyncPhase::Syncing;
        Some(CycleGuard {
            state: self.clone(),
        })
    }
}

/// Holds the Syncing phase. Dropping it returns the session to Idle, even
/// when the cycle future is cancelled.
#[must_use]
pub struct CycleGuard {
    state: SharedState,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.phase = SyncPhase::Idle;
        state.last_cycle_at = Some(Utc::now());
    }
}

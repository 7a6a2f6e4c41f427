//! Draining the local queue to the backend
//!
//! One [`SyncEngine`] per proctoring session. Each engine tracks its own
//! [`SyncPhase`], so several sessions can sync independently in one process.

pub mod engine;
pub mod state;

pub use engine::{CycleReport, SyncEngine, SyncEvent, MAX_UPLOAD_ATTEMPTS};
pub use state::{SyncPhase, SyncState, SyncStatus};

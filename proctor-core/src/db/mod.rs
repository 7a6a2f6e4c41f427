//! Database layer for proctor-sync
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for queue rows and the discard audit trail

pub mod repo;
pub mod schema;

pub use repo::{Database, SubmissionBacklog};

//! vidtrackr-sync: offline-first sync for a shared pipeline board.
//!
//! Several processes on one device (tabs, windows, CLI sessions) edit one
//! remote document that has no locking, no conditional writes and no push
//! notifications. Each process keeps a durable local snapshot; one elected
//! leader per device talks to the remote, polls it and relays confirmed
//! revisions to its followers. Concurrent edits surface as an explicit
//! conflict instead of a silent overwrite.

pub mod auth;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod leader;
pub mod local_store;
pub mod remote;
pub mod snapshot;
pub mod sync;

pub use error::{Result, SyncError};
pub use snapshot::{DomainSnapshot, Stage};
pub use sync::{EngineConfig, EngineParts, Resolution, SyncEngine, SyncState, SyncStatus};

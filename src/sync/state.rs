//! Sync state machine types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InitError;
use crate::leader::Role;
use crate::remote::Envelope;

/// Externally visible sync state. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Disconnected,
    Connecting,
    Syncing,
    Synced,
    Conflict,
    Unauthorized,
    Error,
    InitMissingScripts,
    InitTimeout,
    InitFailed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Disconnected => "disconnected",
            SyncState::Connecting => "connecting",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Conflict => "conflict",
            SyncState::Unauthorized => "unauthorized",
            SyncState::Error => "error",
            SyncState::InitMissingScripts => "init_missing_scripts",
            SyncState::InitTimeout => "init_timeout",
            SyncState::InitFailed => "init_failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal phase. The pending remote revision exists only inside `Conflict`,
/// and diagnostic text only inside the failure phases.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Phase {
    Disconnected,
    Connecting,
    Syncing,
    Synced,
    Conflict(Box<Envelope>),
    Unauthorized,
    Error(String),
    Init(InitError),
}

impl Phase {
    pub(crate) fn state(&self) -> SyncState {
        match self {
            Phase::Disconnected => SyncState::Disconnected,
            Phase::Connecting => SyncState::Connecting,
            Phase::Syncing => SyncState::Syncing,
            Phase::Synced => SyncState::Synced,
            Phase::Conflict(_) => SyncState::Conflict,
            Phase::Unauthorized => SyncState::Unauthorized,
            Phase::Error(_) => SyncState::Error,
            Phase::Init(InitError::MissingLibraries(_)) => SyncState::InitMissingScripts,
            Phase::Init(InitError::Timeout(_)) => SyncState::InitTimeout,
            Phase::Init(InitError::Failed(_)) => SyncState::InitFailed,
        }
    }

    pub(crate) fn pending(&self) -> Option<&Envelope> {
        match self {
            Phase::Conflict(pending) => Some(pending.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn is_conflict(&self) -> bool {
        matches!(self, Phase::Conflict(_))
    }
}

/// Read-only status for the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub role: Role,
    pub has_conflict: bool,
    pub dirty: bool,
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub(crate) fn initial(role: Role, dirty: bool) -> Self {
        Self {
            state: SyncState::Disconnected,
            last_synced_at: None,
            role,
            has_conflict: false,
            dirty,
            last_error: None,
        }
    }
}

/// User's answer to a pending conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Discard local edits and apply the pending remote revision.
    LoadRemote,
    /// Discard the pending revision and push the local snapshot.
    Overwrite,
}

/// Guard for actions allowed once per process lifetime.
#[derive(Debug, Default)]
pub(crate) struct OnceLatch {
    fired: bool,
}

impl OnceLatch {
    /// True on the first call only.
    pub(crate) fn fire(&mut self) -> bool {
        !std::mem::replace(&mut self.fired, true)
    }
}

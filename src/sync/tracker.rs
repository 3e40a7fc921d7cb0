//! Version/Conflict Tracker
//!
//! Holds the last remote version this process treats as authoritative and
//! the dirty flag. `revision` counts local mutations so a finished write can
//! tell whether newer edits arrived while it was in flight; `epoch` counts
//! baseline changes so a pull launched against an older baseline can be
//! recognized as stale.

use crate::local_store::SyncMeta;
use crate::remote::VersionStamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    /// Remote matches the baseline.
    Unchanged,
    /// Remote is newer and nothing local is unsaved.
    Apply,
    /// Remote is newer and local edits are unsaved.
    Conflict,
}

#[derive(Debug, Default)]
pub struct VersionTracker {
    last_version: Option<VersionStamp>,
    dirty: bool,
    revision: u64,
    epoch: u64,
}

impl VersionTracker {
    pub fn restore(meta: &SyncMeta) -> Self {
        Self {
            last_version: meta.last_version.clone(),
            dirty: meta.dirty,
            revision: 0,
            epoch: 0,
        }
    }

    pub fn meta(&self) -> SyncMeta {
        SyncMeta {
            last_version: self.last_version.clone(),
            dirty: self.dirty,
        }
    }

    pub fn last_version(&self) -> Option<&VersionStamp> {
        self.last_version.as_ref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Record a local mutation; returns the new revision.
    pub fn mark_dirty(&mut self) -> u64 {
        self.dirty = true;
        self.revision += 1;
        self.revision
    }

    pub fn decide(&self, remote: &VersionStamp) -> PullDecision {
        if self.last_version.as_ref() == Some(remote) {
            PullDecision::Unchanged
        } else if self.dirty {
            PullDecision::Conflict
        } else {
            PullDecision::Apply
        }
    }

    /// A remote snapshot replaced local state.
    pub fn record_applied(&mut self, version: &VersionStamp) {
        self.last_version = Some(version.clone());
        self.dirty = false;
        self.epoch += 1;
    }

    /// A write carrying local `revision` landed as `version`. Clears dirty
    /// only if nothing was mutated since; returns whether it did.
    pub fn record_pushed(&mut self, version: &VersionStamp, revision: u64) -> bool {
        self.last_version = Some(version.clone());
        self.epoch += 1;
        if self.revision == revision {
            self.dirty = false;
        }
        !self.dirty
    }

    /// Adopt `version` as the baseline without touching local state.
    pub fn observe_version(&mut self, version: &VersionStamp) {
        self.last_version = Some(version.clone());
        self.epoch += 1;
    }
}

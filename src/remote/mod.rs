//! Remote document store adapter
//!
//! The remote side is a single document made of two cells:
//! - a payload cell holding the serialized domain snapshot
//! - a version cell holding the stamp of the last write
//!
//! There is no conditional write. `write` replaces both cells and mints a new
//! version as part of the same call; correctness against concurrent writers is
//! the coordinator's job (version comparison plus leader gating).

pub mod file;
pub mod http;
pub mod memory;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::snapshot::{DomainSnapshot, Stage};

pub use file::FileRemote;
pub use http::{HttpRemote, HttpRemoteConfig};
pub use memory::{MemoryDocument, MemoryRemote};

/// Payload schema written by this crate.
pub const PAYLOAD_SCHEMA: u8 = 2;

/// Opaque identifier of one remote revision.
///
/// Only equality is meaningful to the sync core: a stamp that differs from the
/// last observed one means the document changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionStamp(String);

impl VersionStamp {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn minted(at_ms: i64, writer: &str, seq: u64) -> Self {
        Self(format!("{:013}-{}-{}", at_ms, writer, seq))
    }

    fn legacy(updated_at: i64, updated_by: &str) -> Self {
        Self(format!("{:013}-{}", updated_at, updated_by))
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote revision: decoded snapshot plus its stamp and writer metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub snapshot: DomainSnapshot,
    pub version: VersionStamp,
    pub updated_at: i64,
    pub updated_by: String,
}

/// Payload cell format.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PayloadV2<'a> {
    version: u8,
    updated_at: i64,
    updated_by: &'a str,
    cards: &'a [Value],
    stages: &'a [Stage],
}

/// Tolerant view of the payload cell; older clients wrote only cards and stages.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadCompat {
    version: Option<u64>,
    updated_at: Option<i64>,
    updated_by: Option<String>,
    cards: Option<Vec<Value>>,
    stages: Option<Vec<Stage>>,
}

/// Decoded payload cell, before a version stamp is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub snapshot: DomainSnapshot,
    pub updated_at: i64,
    pub updated_by: String,
}

pub fn encode_payload(snapshot: &DomainSnapshot, updated_at: i64, updated_by: &str) -> Result<String> {
    let payload = PayloadV2 {
        version: PAYLOAD_SCHEMA,
        updated_at,
        updated_by,
        cards: &snapshot.items,
        stages: &snapshot.stages,
    };
    Ok(serde_json::to_string(&payload)?)
}

pub fn decode_payload(raw: &str) -> Result<Payload> {
    let compat: PayloadCompat = serde_json::from_str(raw)
        .map_err(|e| SyncError::Parse(format!("payload is not valid JSON: {}", e)))?;

    let (cards, stages) = match (compat.cards, compat.stages) {
        (Some(cards), Some(stages)) => (cards, stages),
        _ => return Err(SyncError::Parse("payload lacks cards or stages".to_string())),
    };

    let current = compat.version == Some(PAYLOAD_SCHEMA as u64);
    let (updated_at, updated_by) = if current {
        (
            compat.updated_at.unwrap_or(0),
            compat.updated_by.unwrap_or_else(|| "unknown".to_string()),
        )
    } else {
        (0, "legacy".to_string())
    };

    Ok(Payload {
        snapshot: DomainSnapshot::new(cards, stages),
        updated_at,
        updated_by,
    })
}

/// Assemble an envelope from the two raw cells.
///
/// Returns `None` when the payload cell is empty. An empty version cell next
/// to a populated payload falls back to a stamp derived from the payload.
pub fn envelope_from_cells(payload: Option<&str>, version: Option<&str>) -> Result<Option<Envelope>> {
    let raw = match payload.map(str::trim) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(None),
    };
    let decoded = decode_payload(raw)?;
    let version = match version.map(str::trim) {
        Some(v) if !v.is_empty() => VersionStamp::new(v),
        _ => VersionStamp::legacy(decoded.updated_at, &decoded.updated_by),
    };
    Ok(Some(Envelope {
        snapshot: decoded.snapshot,
        version,
        updated_at: decoded.updated_at,
        updated_by: decoded.updated_by,
    }))
}

/// Mints strictly distinct version stamps for one writer.
///
/// `writer` is the per-process id baked into the stamp; `updated_by` is the
/// installation's client id recorded in the payload for display.
pub struct StampMinter {
    writer: String,
    updated_by: String,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl StampMinter {
    pub fn new(
        writer: impl Into<String>,
        updated_by: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            writer: writer.into(),
            updated_by: updated_by.into(),
            seq: AtomicU64::new(0),
            clock,
        }
    }

    pub fn writer(&self) -> &str {
        &self.writer
    }

    /// Returns `(updated_at, stamp)` for the next write.
    pub fn next(&self) -> (i64, VersionStamp) {
        let now = self.clock.now_ms();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        (now, VersionStamp::minted(now, &self.writer, seq))
    }

    /// Encode `snapshot` and mint its stamp.
    pub fn prepare(&self, snapshot: &DomainSnapshot) -> Result<(String, Envelope)> {
        let (updated_at, version) = self.next();
        let raw = encode_payload(snapshot, updated_at, &self.updated_by)?;
        Ok((
            raw,
            Envelope {
                snapshot: snapshot.clone(),
                version,
                updated_at,
                updated_by: self.updated_by.clone(),
            },
        ))
    }
}

/// Whole-document remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read both cells. `Ok(None)` means the document exists but is empty.
    /// A missing document or cell is `SyncError::NotFound`.
    async fn fetch(&self) -> Result<Option<Envelope>>;

    /// Replace the document with `snapshot` under a freshly minted version.
    async fn write(&self, snapshot: &DomainSnapshot) -> Result<Envelope>;

    /// Create the document/cells so that a following `write` can succeed.
    async fn provision(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::snapshot::default_stages;
    use serde_json::json;

    #[test]
    fn test_legacy_payload_without_metadata() {
        let raw = r#"{"cards":[{"id":"a"}],"stages":[{"id":"backlog","label":"Idea Backlog","isDeletable":false}]}"#;
        let decoded = decode_payload(raw).unwrap();
        assert_eq!(decoded.updated_at, 0);
        assert_eq!(decoded.updated_by, "legacy");
        assert_eq!(decoded.snapshot.items, vec![json!({"id": "a"})]);
    }

    #[test]
    fn test_payload_missing_stages_is_parse_error() {
        let err = decode_payload(r#"{"version":2,"cards":[]}"#).unwrap_err();
        assert!(matches!(err, SyncError::Parse(_)));
        let err = decode_payload("not json").unwrap_err();
        assert!(matches!(err, SyncError::Parse(_)));
    }

    #[test]
    fn test_empty_version_cell_derives_stamp_from_payload() {
        let snapshot = DomainSnapshot::new(vec![], default_stages());
        let raw = encode_payload(&snapshot, 1_700_000_000_000, "client_ab12cd34").unwrap();

        let envelope = envelope_from_cells(Some(&raw), Some("")).unwrap().unwrap();
        assert_eq!(envelope.version.as_str(), "1700000000000-client_ab12cd34");
        assert_eq!(envelope.snapshot, snapshot);

        assert!(envelope_from_cells(Some("  "), Some("v1")).unwrap().is_none());
        assert!(envelope_from_cells(None, None).unwrap().is_none());
    }

    #[test]
    fn test_minter_stamps_are_distinct_within_one_millisecond() {
        let minter = StampMinter::new("p1", "client_ab12cd34", Arc::new(SystemClock));
        let (_, a) = minter.next();
        let (_, b) = minter.next();
        assert_ne!(a, b);
    }
}

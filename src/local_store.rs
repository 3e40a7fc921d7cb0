//! Local Snapshot Store
//!
//! Durable on-device copy of the domain snapshot and the tracker metadata.
//! Every mutation is saved here before any remote interaction happens, so the
//! application stays usable offline.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::remote::VersionStamp;
use crate::snapshot::DomainSnapshot;

const SNAPSHOT_KEY: &str = "snapshot";
const META_KEY: &str = "sync_meta";
const CLIENT_ID_KEY: &str = "client_id";

/// Tracker state that must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub last_version: Option<VersionStamp>,
    pub dirty: bool,
}

pub trait SnapshotStore: Send + Sync {
    /// Last saved snapshot, `None` if nothing usable is stored.
    fn load(&self) -> Result<Option<DomainSnapshot>>;

    fn save(&self, snapshot: &DomainSnapshot) -> Result<()>;

    fn load_meta(&self) -> Result<SyncMeta>;

    fn save_meta(&self, meta: &SyncMeta) -> Result<()>;

    /// Stable id of this installation, created on first use.
    fn client_id(&self) -> Result<String>;
}

fn new_client_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("client_{}", &raw[..8])
}

/// SQLite-backed store shared by every process of one installation.
pub struct SqliteSnapshotStore {
    db: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("state.db");
        let db = Connection::open(&db_path)?;

        db.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS local_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
             );",
        )?;

        info!(path = %db_path.display(), "Local snapshot store opened");
        Ok(Self { db: Mutex::new(db) })
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock();
        let value = db
            .query_row(
                "SELECT value FROM local_state WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO local_state (key, value, updated_at)
             VALUES (?1, ?2, strftime('%s', 'now'))
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = strftime('%s', 'now')",
            params![key, value],
        )?;
        Ok(())
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self) -> Result<Option<DomainSnapshot>> {
        let Some(raw) = self.get(SNAPSHOT_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(error = %e, "Stored snapshot is unreadable, ignoring it");
                Ok(None)
            }
        }
    }

    fn save(&self, snapshot: &DomainSnapshot) -> Result<()> {
        self.put(SNAPSHOT_KEY, &serde_json::to_string(snapshot)?)
    }

    fn load_meta(&self) -> Result<SyncMeta> {
        match self.get(META_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(SyncMeta::default()),
        }
    }

    fn save_meta(&self, meta: &SyncMeta) -> Result<()> {
        self.put(META_KEY, &serde_json::to_string(meta)?)
    }

    fn client_id(&self) -> Result<String> {
        let db = self.db.lock();
        db.execute(
            "INSERT OR IGNORE INTO local_state (key, value) VALUES (?1, ?2)",
            params![CLIENT_ID_KEY, new_client_id()],
        )?;
        let id = db.query_row(
            "SELECT value FROM local_state WHERE key = ?1",
            [CLIENT_ID_KEY],
            |row| row.get(0),
        )?;
        Ok(id)
    }
}

/// Volatile store for tests and embedding.
#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<&'static str, String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<DomainSnapshot>> {
        match self.entries.lock().get(SNAPSHOT_KEY) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, snapshot: &DomainSnapshot) -> Result<()> {
        let raw = serde_json::to_string(snapshot)?;
        self.entries.lock().insert(SNAPSHOT_KEY, raw);
        Ok(())
    }

    fn load_meta(&self) -> Result<SyncMeta> {
        match self.entries.lock().get(META_KEY) {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(SyncMeta::default()),
        }
    }

    fn save_meta(&self, meta: &SyncMeta) -> Result<()> {
        let raw = serde_json::to_string(meta)?;
        self.entries.lock().insert(META_KEY, raw);
        Ok(())
    }

    fn client_id(&self) -> Result<String> {
        Ok(self
            .entries
            .lock()
            .entry(CLIENT_ID_KEY)
            .or_insert_with(new_client_id)
            .clone())
    }
}

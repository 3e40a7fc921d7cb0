//! Shared leadership lock record and its storage.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub owner_id: String,
    /// Epoch milliseconds after which any process may take over.
    pub expires_at: i64,
}

impl LeaseRecord {
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

/// Storage for the single lease record of one device.
///
/// Writes are plain replaces; concurrent writers resolve last-write-wins.
pub trait LeaseStore: Send + Sync {
    fn read(&self) -> Result<Option<LeaseRecord>>;

    fn write(&self, record: &LeaseRecord) -> Result<()>;

    /// Delete the record if `owner_id` still holds it.
    fn release(&self, owner_id: &str) -> Result<()>;

    /// Change notifications, if the medium provides them.
    fn watch(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

/// Lease row in the installation's SQLite file.
pub struct SqliteLeaseStore {
    db: Mutex<Connection>,
}

impl SqliteLeaseStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db = Connection::open(data_dir.join("state.db"))?;
        db.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS leader_lease (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                owner_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL
             );",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }
}

impl LeaseStore for SqliteLeaseStore {
    fn read(&self) -> Result<Option<LeaseRecord>> {
        let record = self
            .db
            .lock()
            .query_row(
                "SELECT owner_id, expires_at FROM leader_lease WHERE id = 1",
                [],
                |row| {
                    Ok(LeaseRecord {
                        owner_id: row.get(0)?,
                        expires_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn write(&self, record: &LeaseRecord) -> Result<()> {
        self.db.lock().execute(
            "INSERT INTO leader_lease (id, owner_id, expires_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET owner_id = ?1, expires_at = ?2",
            params![record.owner_id, record.expires_at],
        )?;
        Ok(())
    }

    fn release(&self, owner_id: &str) -> Result<()> {
        self.db.lock().execute(
            "DELETE FROM leader_lease WHERE id = 1 AND owner_id = ?1",
            [owner_id],
        )?;
        Ok(())
    }
}

/// In-process lease shared by cloned handles; notifies watchers on change.
#[derive(Clone)]
pub struct MemoryLeaseStore {
    record: Arc<Mutex<Option<LeaseRecord>>>,
    changes: broadcast::Sender<()>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            record: Arc::new(Mutex::new(None)),
            changes,
        }
    }

    fn notify(&self) {
        // No watchers is fine.
        let _ = self.changes.send(());
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn read(&self) -> Result<Option<LeaseRecord>> {
        Ok(self.record.lock().clone())
    }

    fn write(&self, record: &LeaseRecord) -> Result<()> {
        let changed = {
            let mut current = self.record.lock();
            let changed = current.as_ref().map(|r| &r.owner_id) != Some(&record.owner_id);
            *current = Some(record.clone());
            changed
        };
        if changed {
            self.notify();
        }
        Ok(())
    }

    fn release(&self, owner_id: &str) -> Result<()> {
        let released = {
            let mut current = self.record.lock();
            if current.as_ref().is_some_and(|r| r.owner_id == owner_id) {
                *current = None;
                true
            } else {
                false
            }
        };
        if released {
            self.notify();
        }
        Ok(())
    }

    fn watch(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sqlite_release_only_by_owner() {
        let dir = TempDir::new().unwrap();
        let store = SqliteLeaseStore::open(dir.path()).unwrap();
        assert!(store.read().unwrap().is_none());

        let record = LeaseRecord {
            owner_id: "a".to_string(),
            expires_at: 10_000,
        };
        store.write(&record).unwrap();

        store.release("b").unwrap();
        assert_eq!(store.read().unwrap(), Some(record));

        store.release("a").unwrap();
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_memory_store_notifies_on_owner_change_only() {
        let store = MemoryLeaseStore::new();
        let mut rx = store.watch().unwrap();

        let mut record = LeaseRecord {
            owner_id: "a".to_string(),
            expires_at: 1,
        };
        store.write(&record).unwrap();
        assert!(rx.try_recv().is_ok());

        record.expires_at = 2;
        store.write(&record).unwrap();
        assert!(rx.try_recv().is_err());

        store.release("a").unwrap();
        assert!(rx.try_recv().is_ok());
    }
}

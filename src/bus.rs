//! Best-effort broadcast channel between processes of one device.
//!
//! Delivery is at-most-once and unordered across senders. Every subscriber,
//! including the publisher's own, sees each message; receivers filter by
//! sender id.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::sync::protocol::BusMessage;

const CHANNEL_CAPACITY: usize = 256;
/// Rows older than this are deleted on publish.
const RETENTION_MS: i64 = 60_000;

pub trait SyncBus: Send + Sync {
    fn publish(&self, message: &BusMessage) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;
}

/// Bus for engines hosted in the same process.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncBus for LocalBus {
    fn publish(&self, message: &BusMessage) -> Result<()> {
        // Zero subscribers is not an error for a best-effort channel.
        let _ = self.tx.send(message.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

/// Bus over the installation's SQLite file.
///
/// Publish appends a row; a background task polls for rows newer than the
/// last one it forwarded and fans them out to local subscribers.
pub struct SqliteBus {
    db: Arc<Mutex<Connection>>,
    tx: broadcast::Sender<BusMessage>,
    poller: JoinHandle<()>,
}

impl SqliteBus {
    /// Must be called from within a tokio runtime.
    pub fn open(data_dir: &Path, poll_interval: Duration) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db = Connection::open(data_dir.join("state.db"))?;
        db.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS bus_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL
             );",
        )?;
        let last_seen: i64 =
            db.query_row("SELECT COALESCE(MAX(id), 0) FROM bus_messages", [], |row| {
                row.get(0)
            })?;

        let db = Arc::new(Mutex::new(db));
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let poller = tokio::spawn(poll_loop(db.clone(), tx.clone(), last_seen, poll_interval));

        Ok(Self { db, tx, poller })
    }
}

impl Drop for SqliteBus {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

impl SyncBus for SqliteBus {
    fn publish(&self, message: &BusMessage) -> Result<()> {
        let body = serde_json::to_string(message)?;
        let now = chrono::Utc::now().timestamp_millis();
        let db = self.db.lock();
        db.execute(
            "INSERT INTO bus_messages (body, created_at) VALUES (?1, ?2)",
            params![body, now],
        )
        .map_err(|e| SyncError::Broadcast(e.to_string()))?;
        db.execute(
            "DELETE FROM bus_messages WHERE created_at < ?1",
            [now - RETENTION_MS],
        )?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

async fn poll_loop(
    db: Arc<Mutex<Connection>>,
    tx: broadcast::Sender<BusMessage>,
    mut last_seen: i64,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        ticker.tick().await;
        let rows = match fetch_since(&db, last_seen) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Bus poll failed");
                continue;
            }
        };
        for (id, body) in rows {
            last_seen = id;
            match serde_json::from_str::<BusMessage>(&body) {
                Ok(message) => {
                    debug!(id, kind = message.kind(), "Bus message received");
                    let _ = tx.send(message);
                }
                Err(e) => warn!(id, error = %e, "Skipping unreadable bus message"),
            }
        }
    }
}

fn fetch_since(db: &Mutex<Connection>, last_seen: i64) -> Result<Vec<(i64, String)>> {
    let db = db.lock();
    let mut stmt =
        db.prepare_cached("SELECT id, body FROM bus_messages WHERE id > ?1 ORDER BY id")?;
    let rows = stmt
        .query_map([last_seen], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sync_request(from: &str) -> BusMessage {
        BusMessage::SyncRequest {
            from: from.to_string(),
        }
    }

    #[tokio::test]
    async fn test_local_bus_delivers_to_every_subscriber() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(&sync_request("p1")).unwrap();
        assert_eq!(a.recv().await.unwrap(), sync_request("p1"));
        assert_eq!(b.recv().await.unwrap(), sync_request("p1"));
    }

    #[tokio::test]
    async fn test_sqlite_bus_crosses_connections() {
        let dir = TempDir::new().unwrap();
        let a = SqliteBus::open(dir.path(), Duration::from_millis(20)).unwrap();
        let b = SqliteBus::open(dir.path(), Duration::from_millis(20)).unwrap();
        let mut rx = b.subscribe();

        a.publish(&sync_request("p1")).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, sync_request("p1"));
    }

    #[tokio::test]
    async fn test_sqlite_bus_skips_history() {
        let dir = TempDir::new().unwrap();
        let a = SqliteBus::open(dir.path(), Duration::from_millis(20)).unwrap();
        a.publish(&sync_request("old")).unwrap();

        let b = SqliteBus::open(dir.path(), Duration::from_millis(20)).unwrap();
        let mut rx = b.subscribe();
        a.publish(&sync_request("new")).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, sync_request("new"));
    }
}

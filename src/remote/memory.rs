//! In-memory remote document shared by any number of clients.
//!
//! Each process gets its own `MemoryRemote` view (its own stamp minter and
//! request counters) over one `MemoryDocument`. Faults and latency can be
//! injected to exercise the coordinator's error and overlap handling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{envelope_from_cells, Envelope, RemoteStore, StampMinter};
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::snapshot::DomainSnapshot;

/// Failure to return from the next remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unauthorized,
    NotFound,
    Transient,
}

impl Fault {
    fn into_error(self) -> SyncError {
        match self {
            Fault::Unauthorized => SyncError::Unauthorized("injected 401".to_string()),
            Fault::NotFound => SyncError::NotFound("injected 404".to_string()),
            Fault::Transient => SyncError::Transient("injected 503".to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct DocumentState {
    provisioned: bool,
    payload: Option<String>,
    version: Option<String>,
    faults: VecDeque<Fault>,
    latency: Option<Duration>,
    offline: bool,
    total_writes: usize,
}

#[derive(Debug, Clone)]
pub struct MemoryDocument {
    inner: Arc<Mutex<DocumentState>>,
}

impl MemoryDocument {
    /// An existing, empty document.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DocumentState {
                provisioned: true,
                ..Default::default()
            })),
        }
    }

    /// A document whose cells do not exist yet.
    pub fn unprovisioned() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DocumentState::default())),
        }
    }

    pub fn client(
        &self,
        writer: impl Into<String>,
        updated_by: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> MemoryRemote {
        MemoryRemote {
            doc: self.clone(),
            minter: StampMinter::new(writer, updated_by, clock),
            fetches: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Decoded current contents.
    pub fn current(&self) -> Option<Envelope> {
        let state = self.inner.lock();
        envelope_from_cells(state.payload.as_deref(), state.version.as_deref())
            .ok()
            .flatten()
    }

    pub fn is_provisioned(&self) -> bool {
        self.inner.lock().provisioned
    }

    /// Writes from every client since creation.
    pub fn total_writes(&self) -> usize {
        self.inner.lock().total_writes
    }

    /// Overwrite the raw cells, as a client outside this device would.
    pub fn put_raw(&self, payload: &str, version: Option<&str>) {
        let mut state = self.inner.lock();
        state.provisioned = true;
        state.payload = Some(payload.to_string());
        state.version = version.map(str::to_string);
    }

    pub fn fail_next(&self, fault: Fault) {
        self.inner.lock().faults.push_back(fault);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().latency = latency;
    }

    /// While offline every call fails as transient, without consuming faults.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    fn take_fault(&self) -> Option<SyncError> {
        let mut state = self.inner.lock();
        if state.offline {
            return Some(SyncError::Transient("network unreachable".to_string()));
        }
        state.faults.pop_front().map(Fault::into_error)
    }

    fn latency(&self) -> Option<Duration> {
        self.inner.lock().latency
    }
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryRemote {
    doc: MemoryDocument,
    minter: StampMinter,
    fetches: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryRemote {
    /// Fetches issued through this client.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Writes issued through this client.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.doc.latency() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(&self) -> Result<Option<Envelope>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(err) = self.doc.take_fault() {
            return Err(err);
        }

        let state = self.doc.inner.lock();
        if !state.provisioned {
            return Err(SyncError::NotFound("document cells do not exist".to_string()));
        }
        envelope_from_cells(state.payload.as_deref(), state.version.as_deref())
    }

    async fn write(&self, snapshot: &DomainSnapshot) -> Result<Envelope> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(err) = self.doc.take_fault() {
            return Err(err);
        }

        let (raw, envelope) = self.minter.prepare(snapshot)?;
        let mut state = self.doc.inner.lock();
        if !state.provisioned {
            return Err(SyncError::NotFound("document cells do not exist".to_string()));
        }
        state.payload = Some(raw);
        state.version = Some(envelope.version.as_str().to_string());
        state.total_writes += 1;
        Ok(envelope)
    }

    async fn provision(&self) -> Result<()> {
        if let Some(err) = self.doc.take_fault() {
            return Err(err);
        }
        self.doc.inner.lock().provisioned = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::snapshot::default_stages;

    #[tokio::test]
    async fn test_write_then_fetch_from_another_client() {
        let doc = MemoryDocument::new();
        let a = doc.client("proc-a", "client_a", Arc::new(SystemClock));
        let b = doc.client("proc-b", "client_b", Arc::new(SystemClock));

        assert!(b.fetch().await.unwrap().is_none());

        let snapshot = DomainSnapshot::new(vec![serde_json::json!({"id": "1"})], default_stages());
        let written = a.write(&snapshot).await.unwrap();
        let fetched = b.fetch().await.unwrap().unwrap();

        assert_eq!(fetched.version, written.version);
        assert_eq!(fetched.snapshot, snapshot);
        assert_eq!(fetched.updated_by, "client_a");
        assert_eq!(a.write_count(), 1);
        assert_eq!(b.write_count(), 0);
        assert_eq!(doc.total_writes(), 1);
    }

    #[tokio::test]
    async fn test_unprovisioned_document_is_not_found_until_provisioned() {
        let doc = MemoryDocument::unprovisioned();
        let client = doc.client("proc-a", "client_a", Arc::new(SystemClock));

        assert!(client.fetch().await.unwrap_err().is_not_found());
        client.provision().await.unwrap();
        assert!(client.fetch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_fault_applies_once() {
        let doc = MemoryDocument::new();
        let client = doc.client("proc-a", "client_a", Arc::new(SystemClock));
        doc.fail_next(Fault::Unauthorized);

        assert!(client.fetch().await.unwrap_err().is_unauthorized());
        assert!(client.fetch().await.is_ok());
    }

    #[tokio::test]
    async fn test_offline_rejects_every_call() {
        let doc = MemoryDocument::new();
        let client = doc.client("proc-a", "client_a", Arc::new(SystemClock));
        doc.set_offline(true);

        let snapshot = DomainSnapshot::new(vec![], default_stages());
        assert!(matches!(client.write(&snapshot).await, Err(SyncError::Transient(_))));
        assert!(matches!(client.fetch().await, Err(SyncError::Transient(_))));
        assert_eq!(doc.total_writes(), 0);

        doc.set_offline(false);
        assert!(client.write(&snapshot).await.is_ok());
    }
}

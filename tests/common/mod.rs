//! Shared fixtures: in-memory engines driven under paused tokio time.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use vidtrackr_sync::auth::StaticCredentials;
use vidtrackr_sync::bus::{LocalBus, SyncBus};
use vidtrackr_sync::clock::{Clock, TokioClock};
use vidtrackr_sync::leader::{LeaseStore, MemoryLeaseStore};
use vidtrackr_sync::local_store::MemorySnapshotStore;
use vidtrackr_sync::remote::{MemoryDocument, MemoryRemote};
use vidtrackr_sync::sync::BusMessage;
use vidtrackr_sync::{DomainSnapshot, EngineConfig, EngineParts, SyncEngine, SyncState, SyncStatus};

const WAIT_LIMIT: Duration = Duration::from_secs(120);

/// Lease and bus shared by every tab of one device.
#[derive(Clone, Default)]
pub struct Device {
    pub lease: MemoryLeaseStore,
    pub bus: LocalBus,
}

pub struct Tab {
    pub engine: SyncEngine,
    pub local: Arc<MemorySnapshotStore>,
    pub remote: Arc<MemoryRemote>,
    pub credentials: Arc<StaticCredentials>,
}

pub fn clock() -> Arc<dyn Clock> {
    Arc::new(TokioClock::new())
}

pub fn config(process_id: &str) -> EngineConfig {
    EngineConfig {
        process_id: process_id.to_string(),
        ..EngineConfig::default()
    }
}

pub struct TabBuilder<'a> {
    process_id: String,
    config: EngineConfig,
    doc: &'a MemoryDocument,
    channel: (Option<Arc<dyn LeaseStore>>, Option<Arc<dyn SyncBus>>),
    local: Arc<MemorySnapshotStore>,
    credentials: StaticCredentials,
}

impl<'a> TabBuilder<'a> {
    pub fn new(process_id: &str, doc: &'a MemoryDocument) -> Self {
        Self {
            process_id: process_id.to_string(),
            config: config(process_id),
            doc,
            channel: (None, None),
            local: Arc::new(MemorySnapshotStore::new()),
            credentials: StaticCredentials::anonymous(),
        }
    }

    pub fn device(self, device: &Device) -> Self {
        self.channel(Arc::new(device.lease.clone()), Arc::new(device.bus.clone()))
    }

    /// Any lease and bus, e.g. the SQLite ones a separate process would open.
    pub fn channel(mut self, lease: Arc<dyn LeaseStore>, bus: Arc<dyn SyncBus>) -> Self {
        self.channel = (Some(lease), Some(bus));
        self
    }

    pub fn configure(mut self, adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        adjust(&mut self.config);
        self
    }

    pub fn local(mut self, local: Arc<MemorySnapshotStore>) -> Self {
        self.local = local;
        self
    }

    pub fn credentials(mut self, credentials: StaticCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn start(self) -> Tab {
        let clock = clock();
        let remote = Arc::new(self.doc.client(
            self.process_id.clone(),
            format!("client_{}", self.process_id),
            clock.clone(),
        ));
        let credentials = Arc::new(self.credentials);
        let (lease, bus) = self.channel;

        let engine = SyncEngine::start(
            self.config,
            EngineParts {
                local: self.local.clone(),
                remote: remote.clone(),
                credentials: credentials.clone(),
                lease,
                bus,
                clock,
            },
        )
        .expect("engine starts");

        Tab {
            engine,
            local: self.local,
            remote,
            credentials,
        }
    }
}

/// A client on another device writing straight to the shared document.
pub fn outsider(doc: &MemoryDocument) -> MemoryRemote {
    doc.client("outsider", "client_outsider", clock())
}

/// `base` with one more item titled `title`.
pub fn with_item(base: &DomainSnapshot, title: &str) -> DomainSnapshot {
    let mut next = base.clone();
    next.items.push(json!({
        "id": format!("item-{}", title),
        "title": title,
        "status": "Idea Backlog",
    }));
    next
}

pub async fn wait_for_status(
    engine: &SyncEngine,
    pred: impl Fn(&SyncStatus) -> bool,
) -> SyncStatus {
    let mut rx = engine.subscribe_status();
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            let status = rx.borrow_and_update().clone();
            if pred(&status) {
                return status;
            }
            rx.changed().await.expect("engine stopped while waiting");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("status never matched; last: {:?}", engine.status()))
}

pub async fn wait_for_snapshot(engine: &SyncEngine, expected: &DomainSnapshot) {
    let mut rx = engine.subscribe_snapshot();
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            if *rx.borrow_and_update() == *expected {
                return;
            }
            rx.changed().await.expect("engine stopped while waiting");
        }
    })
    .await
    .expect("snapshot never matched");
}

/// Synced with nothing unsaved.
pub async fn wait_until_clean(engine: &SyncEngine) -> SyncStatus {
    wait_for_status(engine, |s| {
        s.state == SyncState::Synced && !s.dirty && s.last_synced_at.is_some()
    })
    .await
}

pub async fn wait_for_state(engine: &SyncEngine, state: SyncState) -> SyncStatus {
    wait_for_status(engine, |s| s.state == state).await
}

/// Let timers and spawned remote calls run for `ms` of paused time.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Messages already delivered to `rx`.
pub fn drain(rx: &mut broadcast::Receiver<BusMessage>) -> Vec<BusMessage> {
    let mut seen = Vec::new();
    while let Ok(message) = rx.try_recv() {
        seen.push(message);
    }
    seen
}

/// Next message on `rx` matching `pred`, skipping the rest.
pub async fn next_message(
    rx: &mut broadcast::Receiver<BusMessage>,
    pred: impl Fn(&BusMessage) -> bool,
) -> BusMessage {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            let message = rx.recv().await.expect("bus closed while waiting");
            if pred(&message) {
                return message;
            }
        }
    })
    .await
    .expect("message never arrived")
}

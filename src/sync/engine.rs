//! `SyncEngine`: the per-process handle the application talks to.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::coordinator::{Command, Coordinator};
use super::state::{Resolution, SyncStatus};
use crate::auth::CredentialProvider;
use crate::bus::SyncBus;
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::leader::{LeaderElection, LeaseStore, Role};
use crate::local_store::SnapshotStore;
use crate::remote::RemoteStore;
use crate::snapshot::DomainSnapshot;

/// Timing and identity of one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease owner and bus sender id; unique per running process
    pub process_id: String,
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub renew_interval: Duration,
    /// Bound on every remote call
    pub remote_timeout: Duration,
    /// Bound on credential subsystem start-up
    pub init_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            process_id: uuid::Uuid::new_v4().to_string(),
            debounce: Duration::from_millis(3000),
            poll_interval: Duration::from_millis(7000),
            lease_ttl: Duration::from_millis(8000),
            renew_interval: Duration::from_millis(2500),
            remote_timeout: Duration::from_millis(15000),
            init_timeout: Duration::from_millis(13000),
        }
    }
}

/// Collaborators an engine is built from.
///
/// Leadership needs both `lease` and `bus`; with either missing the engine
/// runs as the sole writer.
pub struct EngineParts {
    pub local: Arc<dyn SnapshotStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub lease: Option<Arc<dyn LeaseStore>>,
    pub bus: Option<Arc<dyn SyncBus>>,
    pub clock: Arc<dyn Clock>,
}

pub struct SyncEngine {
    process_id: String,
    commands: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<DomainSnapshot>,
    status_rx: watch::Receiver<SyncStatus>,
    task: JoinHandle<()>,
}

impl SyncEngine {
    /// Load local state, take part in the first leader election and spawn
    /// the coordination task. Must be called inside a tokio runtime.
    pub fn start(config: EngineConfig, parts: EngineParts) -> Result<Self> {
        let EngineParts {
            local,
            remote,
            credentials,
            lease,
            bus,
            clock,
        } = parts;

        let snapshot = match local.load()? {
            Some(snapshot) => snapshot,
            None => {
                let seeded = DomainSnapshot::seeded(clock.now_utc());
                local.save(&seeded)?;
                info!("No local snapshot, seeded default");
                seeded
            }
        };
        let meta = local.load_meta()?;

        let (election, bus, role) = match (lease, bus) {
            (Some(lease), Some(bus)) => {
                let mut election = LeaderElection::new(
                    config.process_id.clone(),
                    lease,
                    clock.clone(),
                    config.lease_ttl,
                );
                let role = election.evaluate()?;
                (Some(election), Some(bus), role)
            }
            _ => (None, None, Role::Solo),
        };

        info!(
            process_id = %config.process_id,
            role = %role,
            items = snapshot.item_count(),
            dirty = meta.dirty,
            "Starting sync engine"
        );

        let (command_tx, command_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());
        let (status_tx, status_rx) = watch::channel(SyncStatus::initial(role.clone(), meta.dirty));

        let coordinator = Coordinator::new(
            config.clone(),
            local,
            remote,
            credentials,
            election,
            bus,
            clock,
            role,
            snapshot,
            &meta,
            snapshot_tx,
            status_tx,
        );
        let task = tokio::spawn(coordinator.run(command_rx));

        Ok(Self {
            process_id: config.process_id,
            commands: command_tx,
            snapshot_rx,
            status_rx,
            task,
        })
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Stop the coordination task and release the lease if held.
    pub async fn stop(self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Stop { ack }).await.is_ok() {
            let _ = done.await;
        }
        if let Err(err) = self.task.await {
            warn!(process_id = %self.process_id, error = %err, "Coordination task ended abnormally");
        }
        info!(process_id = %self.process_id, "Sync engine stopped");
        Ok(())
    }

    pub fn snapshot(&self) -> DomainSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receives every snapshot the engine adopts, local or remote.
    pub fn subscribe_snapshot(&self) -> watch::Receiver<DomainSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Persist `snapshot` locally, mark dirty and schedule a debounced push.
    /// Returns once the local save is done; never waits on the remote.
    pub async fn apply_local_mutation(&self, snapshot: DomainSnapshot) -> Result<()> {
        self.request(|ack| Command::Mutate { snapshot, ack }).await
    }

    pub async fn resolve_conflict(&self, resolution: Resolution) -> Result<()> {
        self.request(|ack| Command::Resolve { resolution, ack }).await
    }

    /// Manual pull. Followers never read the remote; for them this is a no-op.
    pub async fn pull(&self) -> Result<()> {
        self.request(|ack| Command::Pull { ack }).await
    }

    /// Interactive consent. Resolves once the provider answers.
    pub async fn authorize(&self) -> Result<()> {
        self.request(|ack| Command::Authorize { ack }).await
    }

    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        let (ack, reply) = oneshot::channel();
        self.commands
            .send(build(ack))
            .await
            .map_err(|_| SyncError::Stopped)?;
        reply.await.map_err(|_| SyncError::Stopped)?
    }
}

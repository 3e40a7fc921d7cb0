//! Coordination task: the pull/push state machine of one process.
//!
//! Everything that changes sync state happens on this task. Remote calls run
//! on spawned tasks and report back as `Outcome`s, so the loop never waits on
//! the network and a poll, a write and a user edit can overlap safely.
//! Writes are single-flight: while one is in flight the next request is
//! parked (latest wins) and launched when the first completes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::engine::EngineConfig;
use super::protocol::{BusMessage, RelayOrigin};
use super::state::{OnceLatch, Phase, Resolution, SyncStatus};
use super::tracker::{PullDecision, VersionTracker};
use crate::auth::CredentialProvider;
use crate::bus::SyncBus;
use crate::clock::Clock;
use crate::error::{ErrorClass, InitError, Result, SyncError};
use crate::leader::{LeaderElection, Role};
use crate::local_store::{SnapshotStore, SyncMeta};
use crate::remote::{Envelope, RemoteStore, VersionStamp};
use crate::snapshot::DomainSnapshot;

pub(crate) enum Command {
    Mutate {
        snapshot: DomainSnapshot,
        ack: oneshot::Sender<Result<()>>,
    },
    Resolve {
        resolution: Resolution,
        ack: oneshot::Sender<Result<()>>,
    },
    Pull {
        ack: oneshot::Sender<Result<()>>,
    },
    Authorize {
        ack: oneshot::Sender<Result<()>>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// Result of work spawned off the coordination task.
enum Outcome {
    Initialized(std::result::Result<(), InitError>),
    Authorized {
        result: Result<bool>,
        /// Present for interactive consent
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Pulled {
        epoch: u64,
        mode: PullMode,
        result: Result<Option<Envelope>>,
    },
    Provisioned(Result<()>),
    Written {
        origin: RelayOrigin,
        result: Result<Envelope>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullMode {
    Connect,
    Manual,
    Poll,
}

enum WriteJob {
    /// This process's snapshot, taken at launch time.
    Local,
    /// A follower's snapshot.
    Relayed {
        origin: RelayOrigin,
        snapshot: DomainSnapshot,
        base: Option<VersionStamp>,
    },
}

impl WriteJob {
    fn relayed_from(&self) -> Option<&str> {
        match self {
            WriteJob::Local => None,
            WriteJob::Relayed { origin, .. } => Some(&origin.process_id),
        }
    }
}

pub(crate) struct Coordinator {
    process_id: String,
    config: EngineConfig,
    local: Arc<dyn SnapshotStore>,
    remote: Arc<dyn RemoteStore>,
    credentials: Arc<dyn CredentialProvider>,
    election: Option<LeaderElection>,
    bus: Option<Arc<dyn SyncBus>>,
    clock: Arc<dyn Clock>,

    role: Role,
    phase: Phase,
    tracker: VersionTracker,
    snapshot: DomainSnapshot,
    /// Last snapshot applied from remote; an identical local write is its echo.
    reconciled: Option<DomainSnapshot>,
    last_envelope: Option<Envelope>,
    last_synced_at: Option<DateTime<Utc>>,
    last_error: Option<String>,

    initialized: bool,
    authorized: bool,
    silent_attempt: OnceLatch,
    provisioning: OnceLatch,

    debounce_at: Option<Instant>,
    relay_deadline: Option<Instant>,
    pull_in_flight: bool,
    write_in_flight: bool,
    next_write: Option<WriteJob>,

    outcome_tx: mpsc::UnboundedSender<Outcome>,
    outcome_rx: Option<mpsc::UnboundedReceiver<Outcome>>,
    snapshot_tx: watch::Sender<DomainSnapshot>,
    status_tx: watch::Sender<SyncStatus>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: EngineConfig,
        local: Arc<dyn SnapshotStore>,
        remote: Arc<dyn RemoteStore>,
        credentials: Arc<dyn CredentialProvider>,
        election: Option<LeaderElection>,
        bus: Option<Arc<dyn SyncBus>>,
        clock: Arc<dyn Clock>,
        role: Role,
        snapshot: DomainSnapshot,
        meta: &SyncMeta,
        snapshot_tx: watch::Sender<DomainSnapshot>,
        status_tx: watch::Sender<SyncStatus>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            process_id: config.process_id.clone(),
            config,
            local,
            remote,
            credentials,
            election,
            bus,
            clock,
            role,
            phase: Phase::Disconnected,
            tracker: VersionTracker::restore(meta),
            snapshot,
            reconciled: None,
            last_envelope: None,
            last_synced_at: None,
            last_error: None,
            initialized: false,
            authorized: false,
            silent_attempt: OnceLatch::default(),
            provisioning: OnceLatch::default(),
            debounce_at: None,
            relay_deadline: None,
            pull_in_flight: false,
            write_in_flight: false,
            next_write: None,
            outcome_tx,
            outcome_rx: Some(outcome_rx),
            snapshot_tx,
            status_tx,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let Some(mut outcomes) = self.outcome_rx.take() else {
            return;
        };
        let mut bus_rx = self.bus.as_ref().map(|bus| bus.subscribe());
        let mut lease_rx = self.election.as_ref().and_then(|e| e.watch());

        let renew = self.config.renew_interval;
        let mut heartbeat = time::interval_at(Instant::now() + renew, renew);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let poll_every = self.config.poll_interval;
        let mut poll = time::interval_at(Instant::now() + poll_every, poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.begin_init();
        self.publish_status();

        loop {
            let debounce_at = self.debounce_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop { ack }) => {
                        self.shutdown();
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(outcome) = outcomes.recv() => self.handle_outcome(outcome),
                message = next_message(&mut bus_rx) => {
                    if let Some(message) = message {
                        self.handle_message(message);
                    }
                }
                _ = next_signal(&mut lease_rx) => self.heartbeat("lease changed"),
                _ = heartbeat.tick(), if self.election.is_some() => self.heartbeat("heartbeat"),
                _ = poll.tick() => {
                    if self.can_poll() {
                        self.start_pull(PullMode::Poll);
                    }
                }
                _ = debounce_elapsed(debounce_at) => {
                    self.debounce_at = None;
                    self.flush();
                }
            }
            self.publish_status();
            if self.bus.is_none() {
                bus_rx = None;
            }
            if self.election.is_none() {
                lease_rx = None;
            }
        }
    }

    // ==================== Commands ====================

    /// Status is published before the reply, so a caller that awaited a
    /// command observes its effect.
    fn handle_command(&mut self, command: Command) {
        let (reply, ack) = match command {
            Command::Mutate { snapshot, ack } => (self.apply_mutation(snapshot), ack),
            Command::Resolve { resolution, ack } => (self.resolve(resolution), ack),
            Command::Pull { ack } => (self.manual_pull(), ack),
            Command::Authorize { ack } => return self.request_consent(ack),
            Command::Stop { ack } => {
                let _ = ack.send(());
                return;
            }
        };
        self.publish_status();
        let _ = ack.send(reply);
    }

    fn apply_mutation(&mut self, snapshot: DomainSnapshot) -> Result<()> {
        if let Some(reconciled) = self.reconciled.take() {
            if reconciled == snapshot {
                debug!("Local write echoes the applied remote snapshot");
                return Ok(());
            }
        }

        self.local.save(&snapshot)?;
        self.snapshot = snapshot.clone();
        self.snapshot_tx.send_replace(snapshot);
        let revision = self.tracker.mark_dirty();
        self.persist_meta();

        if self.phase.is_conflict() {
            debug!(revision, "Conflict pending, push suppressed");
        } else {
            self.debounce_at = Some(Instant::now() + self.config.debounce);
        }
        Ok(())
    }

    fn resolve(&mut self, resolution: Resolution) -> Result<()> {
        let pending = self.phase.pending().cloned().ok_or(SyncError::NoConflict)?;
        info!(?resolution, version = %pending.version, "Resolving conflict");

        match resolution {
            Resolution::LoadRemote => {
                self.set_phase(Phase::Synced, "conflict resolved by loading remote");
                self.apply_remote(pending, "conflict resolved by loading remote");
            }
            Resolution::Overwrite => {
                self.tracker.observe_version(&pending.version);
                self.last_envelope = Some(pending);
                self.persist_meta();
                self.set_phase(Phase::Synced, "conflict resolved by overwriting remote");
                if self.authorized {
                    self.push_local();
                }
            }
        }

        if !self.authorized {
            self.set_phase(Phase::Unauthorized, "credential required to continue");
        }
        Ok(())
    }

    fn manual_pull(&mut self) -> Result<()> {
        if let Phase::Init(err) = &self.phase {
            return Err(err.clone().into());
        }
        if !self.authorized {
            return Err(SyncError::Unauthorized("not authorized".to_string()));
        }
        if !self.role.is_writer() {
            debug!("Manual pull ignored, leader polls for this device");
            return Ok(());
        }
        self.start_pull(PullMode::Manual);
        Ok(())
    }

    fn request_consent(&mut self, ack: oneshot::Sender<Result<()>>) {
        if let Phase::Init(err) = &self.phase {
            let _ = ack.send(Err(err.clone().into()));
            return;
        }
        let credentials = self.credentials.clone();
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = credentials.request_consent().await;
            let _ = tx.send(Outcome::Authorized {
                result,
                ack: Some(ack),
            });
        });
    }

    // ==================== Outcomes ====================

    fn begin_init(&mut self) {
        let credentials = self.credentials.clone();
        let limit = self.config.init_timeout;
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = match time::timeout(limit, credentials.initialize()).await {
                Ok(result) => result,
                Err(_) => Err(InitError::Timeout(limit.as_millis() as u64)),
            };
            let _ = tx.send(Outcome::Initialized(result));
        });
    }

    fn handle_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Initialized(Ok(())) => {
                self.initialized = true;
                info!("Credential subsystem ready");
                if self.authorized {
                    self.connect();
                } else if self.silent_attempt.fire() {
                    let credentials = self.credentials.clone();
                    let tx = self.outcome_tx.clone();
                    tokio::spawn(async move {
                        let result = credentials.try_silent().await;
                        let _ = tx.send(Outcome::Authorized { result, ack: None });
                    });
                }
            }
            Outcome::Initialized(Err(err)) => {
                error!(error = %err, "Credential subsystem failed to initialize");
                self.last_error = Some(err.to_string());
                let reason = err.to_string();
                self.set_phase(Phase::Init(err), &reason);
            }
            Outcome::Authorized { result, ack } => self.on_authorized(result, ack),
            Outcome::Pulled {
                epoch,
                mode,
                result,
            } => self.on_pulled(epoch, mode, result),
            Outcome::Provisioned(result) => self.on_provisioned(result),
            Outcome::Written { origin, result } => self.on_written(origin, result),
        }
    }

    fn on_authorized(&mut self, result: Result<bool>, ack: Option<oneshot::Sender<Result<()>>>) {
        let interactive = ack.is_some();
        let reply = match result {
            Ok(true) => {
                info!(interactive, "Authorized");
                self.authorized = true;
                self.last_error = None;
                if self.initialized {
                    self.connect();
                }
                Ok(())
            }
            Ok(false) => {
                info!(interactive, "Not authorized, waiting for user consent");
                Err(SyncError::Unauthorized("consent not granted".to_string()))
            }
            Err(err) => {
                warn!(interactive, error = %err, "Authorization failed");
                self.last_error = Some(err.to_string());
                if interactive {
                    self.set_phase(Phase::Unauthorized, "authorization failed");
                }
                Err(err)
            }
        };
        if let Some(ack) = ack {
            self.publish_status();
            let _ = ack.send(reply);
        }
    }

    fn connect(&mut self) {
        if self.phase.is_conflict() {
            return;
        }
        if self.role.is_writer() {
            self.start_pull(PullMode::Connect);
            return;
        }

        self.set_phase(Phase::Synced, "following leader");
        let request = BusMessage::SyncRequest {
            from: self.process_id.clone(),
        };
        if self.send_to_leader(&request) && self.tracker.is_dirty() {
            self.relay();
        }
    }

    // ==================== Pull ====================

    fn can_poll(&self) -> bool {
        self.role.is_writer()
            && self.authorized
            && matches!(self.phase, Phase::Synced)
            && !self.pull_in_flight
            && !self.write_in_flight
    }

    fn start_pull(&mut self, mode: PullMode) {
        if !self.role.is_writer() || !self.authorized {
            return;
        }
        if self.pull_in_flight || self.write_in_flight {
            debug!(?mode, "Remote call in flight, pull skipped");
            return;
        }

        self.pull_in_flight = true;
        let epoch = self.tracker.epoch();
        match mode {
            PullMode::Connect => self.set_phase(Phase::Connecting, "connecting to remote"),
            PullMode::Manual if !self.phase.is_conflict() => {
                self.set_phase(Phase::Syncing, "manual pull")
            }
            _ => debug!(?mode, "Polling remote"),
        }

        let remote = self.remote.clone();
        let limit = self.config.remote_timeout;
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = bounded(limit, "fetch", remote.fetch()).await;
            let _ = tx.send(Outcome::Pulled {
                epoch,
                mode,
                result,
            });
        });
    }

    fn on_pulled(&mut self, epoch: u64, mode: PullMode, result: Result<Option<Envelope>>) {
        self.pull_in_flight = false;

        // The write's confirmation moves the baseline; until then the read
        // cannot be compared against it.
        if self.write_in_flight {
            debug!(?mode, "Write in flight, pull result discarded");
            return;
        }

        if epoch != self.tracker.epoch() || !self.role.is_writer() {
            debug!(?mode, "Discarding pull result taken against an older baseline");
            self.settle("pull superseded");
            return;
        }

        match result {
            Ok(Some(envelope)) => self.reconcile(envelope),
            Ok(None) if self.phase.is_conflict() => {}
            Ok(None) => {
                info!("Remote document is empty, writing local snapshot");
                self.enqueue_write(WriteJob::Local);
            }
            Err(err) if err.is_not_found() => {
                if self.provisioning.fire() {
                    info!(error = %err, "Remote document missing, provisioning");
                    self.start_provision();
                } else {
                    self.fail(err, "fetch after provisioning");
                }
            }
            Err(err) => self.fail(err, "fetch"),
        }
    }

    fn reconcile(&mut self, envelope: Envelope) {
        match self.tracker.decide(&envelope.version) {
            PullDecision::Unchanged => {
                self.last_envelope = Some(envelope);
                if self.phase.is_conflict() {
                    return;
                }
                self.set_phase(Phase::Synced, "remote unchanged");
                if self.tracker.is_dirty() && self.debounce_at.is_none() {
                    self.push_local();
                }
            }
            PullDecision::Apply => {
                self.apply_remote(envelope.clone(), "newer remote revision");
                self.publish(BusMessage::Confirmed {
                    from: self.process_id.clone(),
                    origin: None,
                    envelope,
                });
            }
            PullDecision::Conflict => self.enter_conflict(envelope),
        }
    }

    fn start_provision(&mut self) {
        let remote = self.remote.clone();
        let limit = self.config.remote_timeout;
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = bounded(limit, "provision", remote.provision()).await;
            let _ = tx.send(Outcome::Provisioned(result));
        });
    }

    fn on_provisioned(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {
                info!("Remote document provisioned");
                self.enqueue_write(WriteJob::Local);
            }
            Err(err) => self.fail(err, "provision"),
        }
    }

    // ==================== Push ====================

    fn can_autosave(&self) -> bool {
        self.authorized && matches!(self.phase, Phase::Synced | Phase::Syncing | Phase::Error(_))
    }

    fn flush(&mut self) {
        if !self.tracker.is_dirty() {
            return;
        }
        if !self.can_autosave() {
            debug!(state = %self.phase.state(), "Push deferred");
            return;
        }
        self.push_local();
    }

    fn push_local(&mut self) {
        if self.role.is_writer() {
            self.enqueue_write(WriteJob::Local);
        } else {
            self.relay();
        }
    }

    fn relay(&mut self) {
        let revision = self.tracker.revision();
        let message = BusMessage::PushRequest {
            from: self.process_id.clone(),
            snapshot: self.snapshot.clone(),
            revision,
            base: self.tracker.last_version().cloned(),
        };
        if !self.send_to_leader(&message) {
            return;
        }
        debug!(revision, "Relayed snapshot to leader");
        self.relay_deadline =
            Some(Instant::now() + self.config.remote_timeout + self.config.renew_interval);
        self.set_phase(Phase::Syncing, "relayed to leader");
    }

    fn enqueue_write(&mut self, job: WriteJob) {
        if !self.write_in_flight {
            self.launch_write(job);
            return;
        }
        debug!("Write in flight, request parked as next");
        let incoming = job.relayed_from().map(str::to_string);
        if let Some(WriteJob::Relayed { origin, .. }) = self.next_write.replace(job) {
            // A follower's newer relay replaces its own older one silently.
            if incoming.as_deref() != Some(origin.process_id.as_str()) {
                self.reject_relay(origin.process_id, "superseded by a newer write");
            }
        }
    }

    fn launch_write(&mut self, job: WriteJob) {
        if !self.confirm_leadership() {
            match job {
                WriteJob::Local => debug!("Lease lost before write"),
                WriteJob::Relayed { origin, .. } => {
                    self.reject_relay(origin.process_id, "leadership lost")
                }
            }
            return;
        }

        let (origin, snapshot) = match job {
            WriteJob::Local => {
                if self.phase.is_conflict() {
                    debug!("Conflict pending, local write dropped");
                    return;
                }
                let origin = RelayOrigin {
                    process_id: self.process_id.clone(),
                    revision: self.tracker.revision(),
                };
                (origin, self.snapshot.clone())
            }
            WriteJob::Relayed {
                origin,
                snapshot,
                base,
            } => {
                if base.as_ref() != self.expected_base() {
                    self.answer_stale_relay(origin.process_id);
                    return;
                }
                (origin, snapshot)
            }
        };

        self.write_in_flight = true;
        if !self.phase.is_conflict() {
            self.set_phase(Phase::Syncing, "writing remote");
        }

        let remote = self.remote.clone();
        let limit = self.config.remote_timeout;
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = bounded(limit, "write", remote.write(&snapshot)).await;
            let _ = tx.send(Outcome::Written { origin, result });
        });
    }

    /// Re-read the lease right before a write. Solo engines always pass.
    fn confirm_leadership(&mut self) -> bool {
        let Some(election) = &self.election else {
            return true;
        };
        match election.holds_lease() {
            Ok(true) => return true,
            Ok(false) => warn!("Lease no longer held before write"),
            Err(err) => warn!(error = %err, "Could not verify lease before write"),
        }
        self.heartbeat("lease check before write");
        self.role == Role::Leader
    }

    fn on_written(&mut self, origin: RelayOrigin, result: Result<Envelope>) {
        self.write_in_flight = false;
        let own = origin.process_id == self.process_id;

        match result {
            Ok(envelope) => {
                info!(
                    version = %envelope.version,
                    origin = %origin.process_id,
                    "Remote write confirmed"
                );
                if own {
                    self.record_own_write(&envelope, origin.revision);
                } else if self.tracker.is_dirty() || self.phase.is_conflict() {
                    self.enter_conflict(envelope.clone());
                } else {
                    self.apply_remote(envelope.clone(), "relayed write confirmed");
                }
                self.publish(BusMessage::Confirmed {
                    from: self.process_id.clone(),
                    origin: Some(origin),
                    envelope,
                });
            }
            Err(err) => {
                if !own {
                    self.reject_relay(origin.process_id, &err.to_string());
                }
                self.fail(err, "write");
            }
        }

        if let Some(job) = self.next_write.take() {
            self.launch_write(job);
        }
    }

    /// A write carrying this process's `revision` landed.
    fn record_own_write(&mut self, envelope: &Envelope, revision: u64) {
        let clean = self.tracker.record_pushed(&envelope.version, revision);
        self.last_envelope = Some(envelope.clone());
        self.last_synced_at = Some(self.clock.now_utc());
        self.relay_deadline = None;
        self.persist_meta();
        if self.phase.is_conflict() {
            return;
        }
        self.last_error = None;
        let reason = if clean {
            "write confirmed"
        } else {
            "write confirmed, newer edits pending"
        };
        self.set_phase(Phase::Synced, reason);
    }

    // ==================== Bus ====================

    fn handle_message(&mut self, message: BusMessage) {
        if message.sender() == self.process_id {
            return;
        }
        debug!(kind = message.kind(), from = message.sender(), "Bus message");

        match message {
            BusMessage::PushRequest {
                from,
                snapshot,
                revision,
                base,
            } => {
                if self.role != Role::Leader {
                    return;
                }
                if !self.authorized {
                    self.reject_relay(from, "leader is not authorized");
                    return;
                }
                self.enqueue_write(WriteJob::Relayed {
                    origin: RelayOrigin {
                        process_id: from,
                        revision,
                    },
                    snapshot,
                    base,
                });
            }
            BusMessage::Confirmed {
                origin, envelope, ..
            } => self.on_confirmed(origin, envelope),
            BusMessage::SyncRequest { from } => {
                if self.role != Role::Leader {
                    return;
                }
                if let Some(envelope) = self.current_remote().cloned() {
                    debug!(to = %from, version = %envelope.version, "Answering baseline request");
                    self.publish(BusMessage::Confirmed {
                        from: self.process_id.clone(),
                        origin: None,
                        envelope,
                    });
                }
            }
            BusMessage::WriteFailed { origin, reason, .. } => {
                if origin == self.process_id {
                    self.relay_deadline = None;
                    self.fail(SyncError::Transient(reason), "relayed write");
                }
            }
        }
    }

    fn on_confirmed(&mut self, origin: Option<RelayOrigin>, envelope: Envelope) {
        if self.tracker.last_version() == Some(&envelope.version) {
            return;
        }
        if let Some(origin) = origin.filter(|o| o.process_id == self.process_id) {
            self.record_own_write(&envelope, origin.revision);
            return;
        }
        if self.tracker.is_dirty() || self.phase.is_conflict() {
            self.enter_conflict(envelope);
        } else {
            self.apply_remote(envelope, "confirmed by leader");
        }
    }

    fn reject_relay(&self, origin: String, reason: &str) {
        warn!(%origin, reason, "Rejecting relayed write");
        self.publish(BusMessage::WriteFailed {
            from: self.process_id.clone(),
            origin,
            reason: reason.to_string(),
        });
    }

    /// The follower edited an older revision; send it the current one so it
    /// can apply or raise a conflict.
    fn answer_stale_relay(&self, origin: String) {
        match self.current_remote() {
            Some(envelope) => {
                warn!(
                    %origin,
                    version = %envelope.version,
                    conflict = self.phase.is_conflict(),
                    "Relayed snapshot is not based on the current remote revision"
                );
                self.publish(BusMessage::Confirmed {
                    from: self.process_id.clone(),
                    origin: None,
                    envelope: envelope.clone(),
                });
            }
            None => self.reject_relay(origin, "leader baseline not loaded"),
        }
    }

    /// Latest remote revision this leader has read: the pending one during a
    /// conflict, the baseline otherwise.
    fn current_remote(&self) -> Option<&Envelope> {
        match self.phase.pending() {
            Some(pending) => Some(pending),
            None => self
                .last_envelope
                .as_ref()
                .filter(|e| Some(&e.version) == self.tracker.last_version()),
        }
    }

    /// Version a relayed snapshot must have been edited from to be written.
    fn expected_base(&self) -> Option<&VersionStamp> {
        match self.phase.pending() {
            Some(pending) => Some(&pending.version),
            None => self.tracker.last_version(),
        }
    }

    /// Publish to the leader. A bus that cannot carry it leaves no route to
    /// any writer, so this process continues as the sole writer.
    fn send_to_leader(&mut self, message: &BusMessage) -> bool {
        let sent = match &self.bus {
            Some(bus) => bus.publish(message),
            None => Err(SyncError::Broadcast("no bus configured".to_string())),
        };
        match sent {
            Ok(()) => true,
            Err(err) => {
                self.fall_back_to_solo(&err);
                false
            }
        }
    }

    fn fall_back_to_solo(&mut self, err: &SyncError) {
        warn!(process_id = %self.process_id, error = %err, "Broadcast unavailable, continuing as sole writer");
        self.election = None;
        self.bus = None;
        self.relay_deadline = None;
        let previous = std::mem::replace(&mut self.role, Role::Solo);
        info!(from = %previous, to = %self.role, trigger = "broadcast failure", "Role changed");
        if self.authorized && self.initialized {
            self.connect();
        }
    }

    fn publish(&self, message: BusMessage) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(&message) {
                warn!(kind = message.kind(), error = %err, "Bus publish failed");
            }
        }
    }

    // ==================== Leadership ====================

    fn heartbeat(&mut self, trigger: &str) {
        let Some(election) = self.election.as_mut() else {
            return;
        };
        let role = match election.evaluate() {
            Ok(role) => role,
            Err(err) => {
                warn!(trigger, error = %err, "Leader evaluation failed");
                return;
            }
        };

        if role != self.role {
            let previous = std::mem::replace(&mut self.role, role);
            info!(from = %previous, to = %self.role, trigger, "Role changed");
            self.on_role_change();
            return;
        }

        if let Some(deadline) = self.relay_deadline {
            if Instant::now() >= deadline && self.tracker.is_dirty() && !self.role.is_writer() {
                warn!("No confirmation from leader, relaying again");
                self.relay();
            }
        }
    }

    fn on_role_change(&mut self) {
        self.relay_deadline = None;
        if !self.role.is_writer() {
            if let Some(WriteJob::Relayed { origin, .. }) = self.next_write.take() {
                self.reject_relay(origin.process_id, "leadership lost");
            }
        }
        if self.authorized && self.initialized {
            self.connect();
        }
    }

    // ==================== State ====================

    fn apply_remote(&mut self, envelope: Envelope, reason: &str) {
        if let Err(err) = self.local.save(&envelope.snapshot) {
            error!(error = %err, "Failed to persist applied snapshot");
        }
        info!(
            version = %envelope.version,
            updated_by = %envelope.updated_by,
            items = envelope.snapshot.item_count(),
            reason,
            "Applying remote snapshot"
        );
        self.snapshot = envelope.snapshot.clone();
        self.reconciled = Some(envelope.snapshot.clone());
        self.snapshot_tx.send_replace(envelope.snapshot.clone());
        self.tracker.record_applied(&envelope.version);
        self.persist_meta();
        self.debounce_at = None;
        self.relay_deadline = None;
        self.last_synced_at = Some(self.clock.now_utc());
        self.last_envelope = Some(envelope);
        self.settle(reason);
    }

    fn enter_conflict(&mut self, envelope: Envelope) {
        warn!(
            version = %envelope.version,
            updated_by = %envelope.updated_by,
            superseded = self.phase.is_conflict(),
            "Remote changed while local edits are unsaved"
        );
        self.debounce_at = None;
        self.relay_deadline = None;
        self.set_phase(Phase::Conflict(Box::new(envelope)), "remote changed while dirty");
    }

    fn fail(&mut self, err: SyncError, context: &str) {
        let reason = format!("{}: {}", context, err);
        self.last_error = Some(reason.clone());
        match err.class() {
            ErrorClass::Unauthorized => {
                warn!(%reason, "Remote rejected credential");
                self.authorized = false;
                self.credentials.invalidate();
                self.debounce_at = None;
                if !self.phase.is_conflict() {
                    self.set_phase(Phase::Unauthorized, &reason);
                }
            }
            class => {
                warn!(?class, %reason, "Sync operation failed");
                if !self.phase.is_conflict() {
                    self.set_phase(Phase::Error(reason.clone()), &reason);
                }
            }
        }
    }

    /// Return to `synced` from transient phases; leaves blocking phases alone.
    fn settle(&mut self, reason: &str) {
        if matches!(
            self.phase,
            Phase::Connecting | Phase::Syncing | Phase::Synced | Phase::Error(_)
        ) {
            self.set_phase(Phase::Synced, reason);
        }
    }

    fn set_phase(&mut self, next: Phase, reason: &str) {
        let from = self.phase.state();
        let to = next.state();
        if from != to {
            info!(process_id = %self.process_id, %from, %to, reason, "Sync state changed");
        }
        self.phase = next;
    }

    fn persist_meta(&self) {
        if let Err(err) = self.local.save_meta(&self.tracker.meta()) {
            error!(error = %err, "Failed to persist sync metadata");
        }
    }

    fn publish_status(&self) {
        let status = SyncStatus {
            state: self.phase.state(),
            last_synced_at: self.last_synced_at,
            role: self.role.clone(),
            has_conflict: self.phase.is_conflict(),
            dirty: self.tracker.is_dirty(),
            last_error: self.last_error.clone(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn shutdown(&mut self) {
        self.persist_meta();
        if self.role == Role::Leader {
            if let Some(election) = self.election.as_mut() {
                if let Err(err) = election.resign() {
                    warn!(error = %err, "Failed to release lease");
                }
            }
        }
        info!(process_id = %self.process_id, dirty = self.tracker.is_dirty(), "Coordinator stopping");
    }
}

async fn bounded<T>(
    limit: Duration,
    operation: &'static str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(format!(
            "{} exceeded {}ms",
            operation,
            limit.as_millis()
        ))),
    }
}

async fn debounce_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_message(rx: &mut Option<broadcast::Receiver<BusMessage>>) -> Option<BusMessage> {
    let Some(inner) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match inner.recv().await {
            Ok(message) => return Some(message),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Bus receiver lagged, messages dropped")
            }
            Err(RecvError::Closed) => break,
        }
    }
    *rx = None;
    None
}

async fn next_signal(rx: &mut Option<broadcast::Receiver<()>>) {
    let Some(inner) = rx.as_mut() else {
        return std::future::pending().await;
    };
    if let Err(RecvError::Closed) = inner.recv().await {
        *rx = None;
    }
}

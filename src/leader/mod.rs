//! Leader election among processes sharing one device's storage.
//!
//! One lease record `{ownerId, expiresAt}` lives in shared storage. On each
//! evaluation a process either renews its own lease, takes over an absent or
//! expired one, or follows the valid owner. There is no external coordinator;
//! a crashed leader is replaced once its lease expires.

mod lease;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::Result;

pub use lease::{LeaseRecord, LeaseStore, MemoryLeaseStore, SqliteLeaseStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Role {
    Leader,
    Follower { leader_id: String },
    /// No cross-process channel; this process is the only writer.
    Solo,
}

impl Role {
    /// Whether this process may talk to the remote store.
    pub fn is_writer(&self) -> bool {
        matches!(self, Role::Leader | Role::Solo)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => f.write_str("leader"),
            Role::Follower { leader_id } => write!(f, "follower of {}", leader_id),
            Role::Solo => f.write_str("solo"),
        }
    }
}

pub struct LeaderElection {
    process_id: String,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    role: Option<Role>,
}

impl LeaderElection {
    pub fn new(
        process_id: impl Into<String>,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            store,
            clock,
            ttl,
            role: None,
        }
    }

    pub fn watch(&self) -> Option<tokio::sync::broadcast::Receiver<()>> {
        self.store.watch()
    }

    /// Renew, take over or follow. Run on start, every heartbeat and on
    /// every lease change notification.
    pub fn evaluate(&mut self) -> Result<Role> {
        let now = self.clock.now_ms();
        let role = match self.store.read()? {
            Some(current) if current.owner_id != self.process_id && current.is_valid_at(now) => {
                Role::Follower {
                    leader_id: current.owner_id,
                }
            }
            _ => {
                self.store.write(&LeaseRecord {
                    owner_id: self.process_id.clone(),
                    expires_at: now + self.ttl.as_millis() as i64,
                })?;
                // Another process may have written in between; the record
                // that landed decides.
                match self.store.read()? {
                    Some(landed) if landed.owner_id != self.process_id => Role::Follower {
                        leader_id: landed.owner_id,
                    },
                    _ => Role::Leader,
                }
            }
        };

        if self.role.as_ref() != Some(&role) {
            info!(process_id = %self.process_id, role = %role, "Leadership changed");
        } else {
            debug!(process_id = %self.process_id, role = %role, "Leadership evaluated");
        }
        self.role = Some(role.clone());
        Ok(role)
    }

    /// Re-read the lease; true only if it is ours and unexpired.
    pub fn holds_lease(&self) -> Result<bool> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .read()?
            .is_some_and(|r| r.owner_id == self.process_id && r.is_valid_at(now)))
    }

    /// Give up the lease so a follower can take over without waiting for expiry.
    pub fn resign(&mut self) -> Result<()> {
        self.store.release(&self.process_id)?;
        self.role = None;
        info!(process_id = %self.process_id, "Resigned leadership");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    const TTL: Duration = Duration::from_millis(8000);
    const TICK: Duration = Duration::from_millis(2500);

    fn election(id: &str, store: &MemoryLeaseStore, clock: &TokioClock) -> LeaderElection {
        LeaderElection::new(id, Arc::new(store.clone()), Arc::new(*clock), TTL)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_process_leads_others_follow() {
        let store = MemoryLeaseStore::new();
        let clock = TokioClock::new();
        let mut a = election("a", &store, &clock);
        let mut b = election("b", &store, &clock);

        assert_eq!(a.evaluate().unwrap(), Role::Leader);
        assert_eq!(
            b.evaluate().unwrap(),
            Role::Follower {
                leader_id: "a".to_string()
            }
        );
        assert!(a.holds_lease().unwrap());
        assert!(!b.holds_lease().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_holder_while_renewing() {
        let store = MemoryLeaseStore::new();
        let clock = TokioClock::new();
        let mut elections: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|id| election(id, &store, &clock))
            .collect();

        for _ in 0..10 {
            for e in elections.iter_mut() {
                e.evaluate().unwrap();
            }
            let holders = elections
                .iter()
                .filter(|e| e.holds_lease().unwrap())
                .count();
            assert_eq!(holders, 1);
            tokio::time::sleep(TICK).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_within_one_ttl_plus_tick() {
        let store = MemoryLeaseStore::new();
        let clock = TokioClock::new();
        let mut a = election("a", &store, &clock);
        let mut b = election("b", &store, &clock);

        a.evaluate().unwrap();
        b.evaluate().unwrap();
        // a stops renewing here.

        let mut elapsed = Duration::ZERO;
        loop {
            tokio::time::sleep(TICK).await;
            elapsed += TICK;
            if b.evaluate().unwrap() == Role::Leader {
                break;
            }
            assert!(elapsed <= TTL + TICK, "no failover after {:?}", elapsed);
        }
        assert!(elapsed <= TTL + TICK);
        assert!(!a.holds_lease().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resign_hands_over_immediately() {
        let store = MemoryLeaseStore::new();
        let clock = TokioClock::new();
        let mut a = election("a", &store, &clock);
        let mut b = election("b", &store, &clock);

        a.evaluate().unwrap();
        a.resign().unwrap();
        assert_eq!(b.evaluate().unwrap(), Role::Leader);
    }
}

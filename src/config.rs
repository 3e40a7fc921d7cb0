//! Sync node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::bus::{SqliteBus, SyncBus};
use crate::error::{Result, SyncError};
use crate::leader::{LeaseStore, SqliteLeaseStore};
use crate::sync::EngineConfig;

/// Lease and bus for leader election; both present or both absent.
pub type DeviceChannel = (Option<Arc<dyn LeaseStore>>, Option<Arc<dyn SyncBus>>);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub leader: LeaderConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the local SQLite state shared by all processes
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fixed process id (a fresh one is generated per run when unset)
    #[serde(default)]
    pub process_id: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            process_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Idle time after the last edit before a push
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Leader poll cadence
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Bound on every remote call
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_ms: u64,

    /// Bound on credential start-up
    #[serde(default = "default_init_timeout")]
    pub init_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            poll_interval_ms: default_poll_interval(),
            remote_timeout_ms: default_remote_timeout(),
            init_timeout_ms: default_init_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastKind {
    /// Bus and lease in the local SQLite file
    Sqlite,
    /// No cross-process channel; run as sole writer
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_ms: u64,

    #[serde(default = "default_renew_interval")]
    pub renew_interval_ms: u64,

    #[serde(default = "default_broadcast")]
    pub broadcast: BroadcastKind,

    /// How often the SQLite bus checks for new messages
    #[serde(default = "default_bus_poll")]
    pub bus_poll_ms: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: default_lease_ttl(),
            renew_interval_ms: default_renew_interval(),
            broadcast: default_broadcast(),
            bus_poll_ms: default_bus_poll(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    File,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_kind")]
    pub kind: RemoteKind,

    /// Shared document path for the file remote
    #[serde(default = "default_remote_path")]
    pub path: PathBuf,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_document_id")]
    pub document_id: String,

    /// Bearer token for the HTTP remote
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            kind: default_remote_kind(),
            path: default_remote_path(),
            base_url: default_base_url(),
            document_id: default_document_id(),
            api_token: None,
        }
    }
}

// Defaults
fn default_data_dir() -> PathBuf { PathBuf::from(".vidtrackr") }
fn default_debounce() -> u64 { 3000 }
fn default_poll_interval() -> u64 { 7000 }
fn default_remote_timeout() -> u64 { 15000 }
fn default_init_timeout() -> u64 { 13000 }
fn default_lease_ttl() -> u64 { 8000 }
fn default_renew_interval() -> u64 { 2500 }
fn default_broadcast() -> BroadcastKind { BroadcastKind::Sqlite }
fn default_bus_poll() -> u64 { 250 }
fn default_remote_kind() -> RemoteKind { RemoteKind::File }
fn default_remote_path() -> PathBuf { PathBuf::from("pipeline-remote.json") }
fn default_base_url() -> String { "http://localhost:8080".to_string() }
fn default_document_id() -> String { "pipeline".to_string() }

impl Config {
    /// Read `path`, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("sync.debounce_ms", self.sync.debounce_ms),
            ("sync.poll_interval_ms", self.sync.poll_interval_ms),
            ("sync.remote_timeout_ms", self.sync.remote_timeout_ms),
            ("sync.init_timeout_ms", self.sync.init_timeout_ms),
            ("leader.lease_ttl_ms", self.leader.lease_ttl_ms),
            ("leader.renew_interval_ms", self.leader.renew_interval_ms),
            ("leader.bus_poll_ms", self.leader.bus_poll_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(SyncError::Config(format!("{} must be greater than zero", name)));
        }
        if self.leader.renew_interval_ms >= self.leader.lease_ttl_ms {
            return Err(SyncError::Config(format!(
                "leader.renew_interval_ms ({}) must be shorter than leader.lease_ttl_ms ({})",
                self.leader.renew_interval_ms, self.leader.lease_ttl_ms
            )));
        }
        if self.remote.kind == RemoteKind::Http && self.remote.base_url.trim().is_empty() {
            return Err(SyncError::Config("remote.base_url is required for the http remote".to_string()));
        }
        Ok(())
    }

    /// Open the cross-process lease and bus. If either cannot be opened the
    /// process runs as the sole writer instead of failing to start. Must be
    /// called from within a tokio runtime.
    pub fn device_channel(&self) -> DeviceChannel {
        if self.leader.broadcast == BroadcastKind::None {
            return (None, None);
        }
        let data_dir = &self.node.data_dir;
        let opened = SqliteLeaseStore::open(data_dir).and_then(|lease| {
            let bus = SqliteBus::open(data_dir, Duration::from_millis(self.leader.bus_poll_ms))?;
            Ok((lease, bus))
        });
        match opened {
            Ok((lease, bus)) => (Some(Arc::new(lease)), Some(Arc::new(bus))),
            Err(err) => {
                warn!(
                    data_dir = %data_dir.display(),
                    error = %err,
                    "Cross-process broadcast unavailable, running as sole writer"
                );
                (None, None)
            }
        }
    }

    /// Engine timing for a process with the given id.
    pub fn engine_config(&self, process_id: String) -> EngineConfig {
        EngineConfig {
            process_id,
            debounce: Duration::from_millis(self.sync.debounce_ms),
            poll_interval: Duration::from_millis(self.sync.poll_interval_ms),
            lease_ttl: Duration::from_millis(self.leader.lease_ttl_ms),
            renew_interval: Duration::from_millis(self.leader.renew_interval_ms),
            remote_timeout: Duration::from_millis(self.sync.remote_timeout_ms),
            init_timeout: Duration::from_millis(self.sync.init_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sync.debounce_ms, 3000);
        assert_eq!(config.sync.poll_interval_ms, 7000);
        assert_eq!(config.leader.lease_ttl_ms, 8000);
        assert_eq!(config.leader.renew_interval_ms, 2500);
        assert_eq!(config.leader.broadcast, BroadcastKind::Sqlite);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [node]
            data_dir = "/tmp/board"

            [remote]
            kind = "http"
            base_url = "https://docs.example.com"
            document_id = "team-board"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.data_dir, PathBuf::from("/tmp/board"));
        assert_eq!(config.remote.kind, RemoteKind::Http);
        assert_eq!(config.remote.document_id, "team-board");
        assert_eq!(config.sync.debounce_ms, 3000);
        assert!(config.remote.api_token.is_none());
    }

    #[test]
    fn test_renew_must_be_shorter_than_ttl() {
        let mut config = Config::default();
        config.leader.renew_interval_ms = 8000;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        config.leader.renew_interval_ms = 2500;
        config.sync.poll_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sync.poll_interval_ms"));
    }

    #[test]
    fn test_engine_config_carries_timings() {
        let engine = Config::default().engine_config("p1".to_string());
        assert_eq!(engine.process_id, "p1");
        assert_eq!(engine.debounce, Duration::from_secs(3));
        assert_eq!(engine.renew_interval, Duration::from_millis(2500));
    }
}

//! Sync core: version tracking, the coordination task and the engine handle.
//!
//! One `SyncEngine` runs per process. It owns a single coordination task that
//! consumes commands from the application, results of remote calls, bus
//! messages from sibling processes and its own timers (debounce, poll,
//! lease heartbeat). All sync state lives inside that task.

mod coordinator;
pub mod engine;
pub mod protocol;
pub mod state;
pub mod tracker;

pub use engine::{EngineConfig, EngineParts, SyncEngine};
pub use protocol::{BusMessage, RelayOrigin};
pub use state::{Resolution, SyncState, SyncStatus};
pub use tracker::{PullDecision, VersionTracker};

//! Courier broker core.
//!
//! Dashboards enqueue opaque command payloads addressed to a player
//! (`Namespace::User`) or to a game server process (`Namespace::Job`).
//! Game servers poll with their current roster and report back once a
//! command ran. Two clocks bound the lifetime of every message: the
//! fallback clock drops commands nobody executed, the grace clock drops
//! executed commands after the outcome had a chance to be observed.

pub mod broker;
pub mod config;
pub mod error;
pub mod janitor;
pub mod message;
pub mod persistence;
pub mod poll;
pub mod registry;
pub mod store;
pub mod tracker;

pub use broker::{BackgroundTasks, Broker, BrokerStatus};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use janitor::{JanitorSweep, SweepReport};
pub use message::{Message, MessageId, MessageStatus, Namespace};
pub use persistence::{JsonFileStore, NoPersistence, PersistenceAdapter, Snapshot, SnapshotWriter};
pub use poll::{PollCoordinator, PollResult};
pub use registry::{Ping, ServerRecord, ServerRegistry};
pub use store::{MessageStore, QueueDump};
pub use tracker::{ClockPhase, ClockTicket, ExecutionTracker};

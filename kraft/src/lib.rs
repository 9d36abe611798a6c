//! An async implementation of the Raft consensus protocol.
//!
//! A `Raft` node is a single tokio task which owns all protocol state. Applications talk to it
//! through the cloneable [`Raft`](crate::raft::Raft) handle, and supply two collaborators: a
//! [`RaftNetwork`](crate::network::RaftNetwork) used to send RPCs to peers, and a
//! [`RaftStorage`](crate::storage::RaftStorage) which persists the log, the hard state and the
//! application state machine.

pub mod config;
mod core;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod network;
pub mod raft;
mod raft_types;
mod replication;
pub mod storage;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::config::{Config, ConfigBuilder, SnapshotPolicy};
pub use crate::core::State;
pub use crate::error::{ChangeConfigError, ClientReadError, ClientWriteError, ConfigError, InitializeError, RaftError};
pub use crate::membership::{Endpoint, GroupMode, MembershipConfig};
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::raft_types::LogId;
pub use crate::storage::RaftStorage;
pub use async_trait;

/// A Raft node's ID.
pub type NodeId = u64;

/// A trait defining application specific data.
///
/// Applications present their own data types to Raft as-is. Raft replicates them inside log
/// entries and hands them back to the application's `RaftStorage` once they are committed, so
/// that the storage layer can apply them without a preliminary deserialization step.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// This is what the state machine returns when it applies a client entry. It is delivered back
/// to the client that proposed the entry, and only after the entry has been applied.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A short, human readable rendering of a message, used in log output where printing the full
/// payload would be too noisy.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

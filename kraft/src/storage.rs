//! The Raft storage interface and data types.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

use crate::membership::MembershipConfig;
use crate::raft::Entry;
use crate::{AppData, AppDataResponse, LogId, MessageSummary, NodeId};

/// Metadata describing a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Log entries up to and including this one are covered by the snapshot.
    pub last_log_id: LogId,
    /// The latest membership configuration covered by the snapshot.
    pub membership: MembershipConfig,
    /// To identify a snapshot when transferring it. Chunks of different snapshots are never
    /// mixed on the receiving side.
    pub snapshot_id: String,
}

impl MessageSummary for SnapshotMeta {
    fn summary(&self) -> String {
        format!("id={} last_log_id={}", self.snapshot_id, self.last_log_id)
    }
}

/// The data associated with the current snapshot.
pub struct Snapshot<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    pub meta: SnapshotMeta,
    /// A read handle to the associated snapshot.
    pub snapshot: Box<S>,
}

impl<S> fmt::Debug for Snapshot<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("meta", &self.meta).finish()
    }
}

/// A record holding the hard state of a Raft node.
///
/// This is the state which must be durable before the node replies to any RPC which changed it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A group config together with the index of the log entry which introduced it.
///
/// `log_index` is 0 when the config came from bootstrap and was never written to the log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveMembership {
    pub log_index: u64,
    pub membership: MembershipConfig,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitialState {
    /// The id of the last entry, or of the last snapshot if the log is empty.
    pub last_log_id: LogId,
    /// The id of the last entry applied to the state machine.
    pub last_applied: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The latest group config found in the log or the snapshot.
    pub membership: EffectiveMembership,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    ///
    /// A pristine node has an empty group config, and waits either to be initialized or to be
    /// contacted by a leader.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId::default(),
            last_applied: LogId::default(),
            hard_state: HardState::default(),
            membership: EffectiveMembership::default(),
        }
    }
}

/// A trait defining the interface for a Raft storage system.
///
/// One implementation backs one node: the durable log, the hard state, the application state
/// machine and its snapshots. Any error returned from this interface is treated as fatal, the
/// node logs it and shuts down, since continuing on top of corrupted or unwritable state could
/// violate safety.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// The storage engine's associated type used for exposing a snapshot for reading & writing.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Sync + Unpin + 'static;

    /// Get the latest membership config found in the log, falling back to the one in the
    /// current snapshot, and finally to an empty config.
    ///
    /// This is called after the log has been truncated, so that a follower can revert to the
    /// config which survived the truncation.
    async fn get_membership_config(&self) -> Result<EffectiveMembership>;

    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface to fetch the last known
    /// state from stable storage. If no such state exists due to being the first time the node
    /// has come online, then `InitialState::new_initial` should be used.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard state. This must be durable when the call returns.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive and the stop value is non-inclusive: `[start, stop)`. Entries
    /// which have been compacted away are simply absent from the result.
    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<D>>>;

    /// Try to get a single log entry. `None` if it does not exist or has been compacted.
    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry<D>>>;

    /// Delete all log entries with index `>= start`.
    ///
    /// Only ever called with uncommitted entries, when they conflict with the leader's log.
    async fn delete_logs_from(&self, start: u64) -> Result<()>;

    /// Append a payload of entries to the log. Each entry's index determines its slot, an
    /// existing entry at the same index is overwritten. Durable when the call returns.
    async fn append_to_log(&self, entries: &[Entry<D>]) -> Result<()>;

    /// Apply the given payload of committed entries to the state machine, in order.
    ///
    /// One response must be returned per entry. Entries which carry no application data (blank
    /// and group config entries) still advance the state machine's last applied id. An entry
    /// may be presented again after a restart if the state machine's progress was not durable,
    /// so application must be idempotent per index.
    async fn apply_to_state_machine(&self, entries: &[Entry<D>]) -> Result<Vec<R>>;

    /// Build a snapshot of the state machine as of its last applied entry, then discard log
    /// entries covered by it.
    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>>;

    /// Create a new, empty snapshot buffer to receive a snapshot streamed from the leader.
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>>;

    /// Finalize the installation of a snapshot which has finished streaming from the leader.
    ///
    /// The state machine is replaced with the snapshot's content. If the log contains an entry
    /// with the same id as `meta.last_log_id`, the entries following it are retained; otherwise
    /// the whole log is discarded. Entries covered by the snapshot are removed either way.
    async fn finalize_snapshot_installation(&self, meta: &SnapshotMeta, snapshot: Box<Self::SnapshotData>) -> Result<()>;

    /// Get a readable handle to the current snapshot, along with its metadata.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>>;
}

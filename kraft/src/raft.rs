//! Public Raft interface and data types.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::{ChangeConfigError, ClientReadError, ClientWriteError, InitializeError, RaftError, RaftResult};
use crate::membership::{Endpoint, MembershipConfig};
use crate::metrics::{RaftMetrics, Wait};
use crate::storage::SnapshotMeta;
use crate::{AppData, AppDataResponse, LogId, MessageSummary, NodeId, RaftNetwork, RaftStorage};

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    tx_api: mpsc::UnboundedSender<RaftMsg<D, R>>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// The Raft API.
///
/// This type is the interface to a running Raft node. Creating it spawns the node's task, every
/// method sends a message into that task and waits for its reply, so all protocol state is only
/// ever touched by one task.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very cheap
/// and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, this indicates that the Raft node
/// is shutting down (potentially for data safety reasons due to a storage error), and the `shutdown`
/// method should be called on this type to await the shutdown of the node.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within the cluster.
    /// Applications must guarantee that the ID provided to this function is stable across
    /// restarts, since votes and group configs refer to it.
    ///
    /// ### `config`
    /// Raft's runtime config. See the docs on the `Config` object for more details.
    ///
    /// ### `network`
    /// An implementation of the `RaftNetwork` trait which will be used by Raft for sending RPCs to
    /// peer nodes within the cluster.
    ///
    /// ### `storage`
    /// An implementation of the `RaftStorage` trait which will be used by Raft for data storage.
    #[tracing::instrument(level="debug", skip(config, network, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3), and are also
    /// used as heartbeats (§5.2).
    #[tracing::instrument(level = "trace", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a VoteRequest (RequestVote in the Raft paper) RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting to gather votes (§5.2).
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::RequestVote { rpc, tx }, rx).await
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader in order to bring a new node or a slow node
    /// up-to-speed with the leader (§7).
    #[tracing::instrument(level = "trace", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::InstallSnapshot { rpc, tx }, rx).await
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This is based on the metrics channel, which is good enough for routing client requests;
    /// `client_read` must still be used to guard against stale reads.
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Check to ensure this node is still the cluster leader, in order to guard against stale reads (§8).
    ///
    /// The leader confirms that a quorum still recognizes it before this resolves. The actual
    /// read operation itself is up to the application.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn client_read(&self) -> Result<(), ClientReadError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ClientRead { tx }, rx).await
    }

    /// Submit a mutating client request to Raft to update the state of the system (§5.1).
    ///
    /// It will be appended to the log, committed to the cluster, and then applied to the
    /// application state machine. The result of applying the request to the state machine will
    /// be returned as the response from this method.
    ///
    /// If the leader crashes after committing an entry but before responding, the client may
    /// retry with a new leader and the command would be executed twice. Clients should therefore
    /// tag commands with unique serial numbers which the state machine can use to deduplicate
    /// them (§8).
    #[tracing::instrument(level = "trace", skip(self, rpc))]
    pub async fn client_write(&self, rpc: ClientWriteRequest<D>) -> Result<ClientWriteResponse<R>, ClientWriteError<D>> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ClientWrite { rpc, tx }, rx).await
    }

    /// Initialize a pristine Raft node with the given group config.
    ///
    /// This must be called on a pristine node: one whose log is empty and whose term is 0.
    /// Otherwise `InitializeError::NotAllowed` is returned, which is safe to ignore as it means
    /// the cluster is already formed.
    ///
    /// If the group is this node alone, the node becomes leader right away. Otherwise it starts
    /// an election. The first leader of a freshly initialized cluster writes the group config as
    /// its first log entry, so the initial membership becomes durable through normal
    /// replication. Calling this on several nodes with the same members is safe, only one of
    /// them can win the first term.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeMap<NodeId, Endpoint>) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Initialize { members, tx }, rx).await
    }

    /// Add a new voting member to the cluster.
    ///
    /// The leader first catches the new node up through a dedicated replication stream, then
    /// appends a group config entry with the node added. This resolves once that entry is
    /// committed. If another change is in progress the request waits behind it, for at most
    /// `previous_group_config_change_timeout` milliseconds when that is non-zero.
    #[tracing::instrument(level = "debug", skip(self, endpoint), fields(endpoint=%endpoint))]
    pub async fn add_voter(&self, id: NodeId, endpoint: Endpoint) -> Result<(), ChangeConfigError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::AddVoter { id, endpoint, tx }, rx).await
    }

    /// Remove a voting member from the cluster.
    ///
    /// This resolves once the group config entry without the node is committed. Removing the
    /// leader itself is allowed, it keeps leading until the change commits and then steps down.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove_voter(&self, id: NodeId) -> Result<(), ChangeConfigError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::RemoveVoter { id, tx }, rx).await
    }

    /// Send a message to the Raft task and wait for its reply.
    async fn call_core<T, E>(&self, msg: RaftMsg<D, R>, rx: RaftRespRx<T, E>) -> Result<T, E>
    where E: From<RaftError> {
        if self.inner.tx_api.send(msg).is_err() {
            return Err(RaftError::ShuttingDown.into());
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(RaftError::ShuttingDown.into()),
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use kraft::{State, Raft};
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for log 3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log 3 applied").await?;
    ///
    /// // wait for the node's current leader to become 2:
    /// r.wait(None).current_leader(2, "leader elected").await?;
    ///
    /// // wait for the node to become a follower
    /// r.wait(None).state(State::Follower, "stepped down").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node, waiting for its task to finish.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type RaftRespTx<T, E> = oneshot::Sender<Result<T, E>>;
pub(crate) type RaftRespRx<T, E> = oneshot::Receiver<Result<T, E>>;
pub(crate) type ChangeMembershipTx = RaftRespTx<(), ChangeConfigError>;
pub(crate) type ClientWriteResponseTx<D, R> = RaftRespTx<ClientWriteResponse<R>, ClientWriteError<D>>;
pub(crate) type ClientReadResponseTx = RaftRespTx<(), ClientReadError>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: RaftRespTx<AppendEntriesResponse, RaftError>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: RaftRespTx<VoteResponse, RaftError>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: RaftRespTx<InstallSnapshotResponse, RaftError>,
    },
    ClientWrite {
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    },
    ClientRead {
        tx: ClientReadResponseTx,
    },
    Initialize {
        members: BTreeMap<NodeId, Endpoint>,
        tx: RaftRespTx<(), InitializeError>,
    },
    AddVoter {
        id: NodeId,
        endpoint: Endpoint,
        tx: ChangeMembershipTx,
    },
    RemoveVoter {
        id: NodeId,
        tx: ChangeMembershipTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////
//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,
    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "leader={}-{}, prev_log_id={}, leader_commit={}, n={}",
            self.leader_id,
            self.term,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// Will be true if follower contained entry matching `prev_log_id`.
    pub success: bool,
    /// A hint for the leader on where to resume replication, set when `success` is false
    /// because of a log mismatch.
    pub conflict: Option<ConflictOpt>,
}

/// A hint sent back by a follower whose log did not match the leader's `prev_log_id`.
///
/// The follower's log is known to agree with the leader's up to `index`: either because `index`
/// is the follower's last entry (its log is too short), or because entries up to `index` are
/// committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictOpt {
    pub index: u64,
}

/// A Raft log entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,
    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    pub fn kind(&self) -> EntryKind {
        match self.payload {
            EntryPayload::Blank => EntryKind::NoOp,
            EntryPayload::Normal(_) => EntryKind::Normal,
            EntryPayload::ConfigChange(_) => EntryKind::GroupConfig,
        }
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{:?}", self.log_id, self.kind())
    }
}

impl<'a, D: AppData> MessageSummary for &'a [Entry<D>] {
    fn summary(&self) -> String {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => format!("{}..={} (n={})", first.log_id, last.log_id, self.len()),
            _ => "{}".to_string(),
        }
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A normal log entry.
    #[serde(bound = "D: AppData")]
    Normal(D),
    /// A config change log entry. It takes effect as soon as it is appended to a log.
    ConfigChange(MembershipConfig),
}

/// The kind of a log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Normal,
    NoOp,
    GroupConfig,
}

//////////////////////////////////////////////////////////////////////////////////////////////////
//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The id of the candidate’s last log entry (§5.4).
    pub last_log_id: LogId,
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: NodeId, last_log_id: LogId) -> Self {
        Self {
            term,
            candidate_id,
            last_log_id,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////
//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to send chunks of a snapshot to a follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// Metadata of the snapshot being sent.
    pub meta: SnapshotMeta,
    /// The byte offset where this chunk of data is positioned in the snapshot file.
    pub offset: u64,
    /// The raw bytes of the snapshot chunk, starting at `offset`.
    pub data: Vec<u8>,
    /// Will be `true` if this is the last chunk in the snapshot.
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, meta={}, offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.meta.summary(),
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for leader to update itself.
    pub term: u64,
    /// Set when the chunk could not be accepted at its offset: the offset the follower expects
    /// next for this snapshot, 0 to restart the transfer.
    pub resume_from: Option<u64>,
}

//////////////////////////////////////////////////////////////////////////////////////////////////
//////////////////////////////////////////////////////////////////////////////////////////////////

/// An application specific client request to update the state of the system (§5.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    /// The application specific contents of this client request.
    #[serde(bound = "D: AppData")]
    pub(crate) entry: D,
}

impl<D: AppData> ClientWriteRequest<D> {
    /// Create a new client payload instance with a normal entry type.
    pub fn new(entry: D) -> Self {
        Self { entry }
    }
}

/// The response to a `ClientWriteRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    /// The log index of the successfully processed client request.
    pub index: u64,
    /// Application specific response data.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}

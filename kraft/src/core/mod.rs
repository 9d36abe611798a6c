//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod apply;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use futures::future::{AbortHandle, Abortable};
use futures::stream::{FuturesOrdered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Duration, Instant, Interval, MissedTickBehavior};
use tracing_futures::Instrument;

use crate::config::{Config, SnapshotPolicy};
use crate::core::apply::ApplyResult;
use crate::error::{ChangeConfigError, ClientReadError, ClientWriteError, InitializeError, RaftError, RaftResult};
use crate::membership::{Endpoint, GroupMode, MembershipConfig};
use crate::metrics::RaftMetrics;
use crate::network::RpcPermits;
use crate::raft::{ChangeMembershipTx, ClientReadResponseTx, ClientWriteRequest, ClientWriteResponseTx, RaftMsg};
use crate::replication::{RaftEvent, ReplicaEvent, ReplicationStream};
use crate::storage::HardState;
use crate::{AppData, AppDataResponse, LogId, NodeId, RaftNetwork, RaftStorage};

/// The core type implementing the Raft protocol.
///
/// It is owned by a single task; every RPC, client request, timer and replication event is
/// handled by that task one at a time.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's current membership configuration.
    membership: MembershipConfig,
    /// The index of the log entry which introduced `membership`, 0 if it never came from the log.
    membership_index: u64,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,
    /// Bound on in-flight outbound RPCs, shared by vote requests and replication streams.
    permits: RpcPermits,

    /// The target state of the system.
    target_state: State,
    /// Whether a membership change is in progress. Maintained by the leader.
    group_mode: GroupMode,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// Initialized to the last applied index, since only committed entries are ever applied, and
    /// increases monotonically.
    commit_index: u64,
    /// The id of the highest log entry which has been applied to the local state machine.
    last_applied: LogId,
    /// The current term.
    ///
    /// Is initialized to 0 on first boot, and increases monotonically.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the current term.
    ///
    /// Each server will vote for at most one candidate in a given term, on a
    /// first-come-first-served basis. See §5.4.1 for additional restriction on votes.
    voted_for: Option<NodeId>,

    /// The id of the last entry appended to the log.
    last_log_id: LogId,

    /// The node's current snapshot state.
    snapshot_state: Option<SnapshotState<S::SnapshotData>>,
    /// The last log id covered by the current snapshot.
    ///
    /// This is primarily used in making a determination on when a compaction job needs to be triggered.
    snapshot_last_log_id: LogId,

    /// Join handles of tasks applying committed entries to the state machine. There is at most
    /// one element at a time, so entries are applied strictly in order.
    apply_handle: FuturesOrdered<JoinHandle<anyhow::Result<ApplyResult<R>>>>,

    /// The last time a heartbeat was received from a leader.
    last_heartbeat: Option<Instant>,
    /// The instant of the next election timeout.
    next_election_timeout: Option<Instant>,

    tx_compaction: mpsc::Sender<SnapshotUpdate>,
    rx_compaction: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_compaction, rx_compaction) = mpsc::channel(1);
        let permits = RpcPermits::new(config.worker_threads);
        let this = Self {
            id,
            config,
            membership: MembershipConfig::default(), // This is updated from storage in the main loop.
            membership_index: 0,
            network,
            storage,
            permits,
            target_state: State::NonVoter,
            group_mode: GroupMode::Stable,
            commit_index: 0,
            last_applied: LogId::default(),
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            snapshot_state: None,
            snapshot_last_log_id: LogId::default(),
            apply_handle: FuturesOrdered::new(),
            last_heartbeat: None,
            next_election_timeout: None,
            tx_compaction,
            rx_compaction,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::trace!("raft node is initializing");
        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.membership = state.membership.membership;
        self.membership_index = state.membership.log_index;
        self.last_applied = state.last_applied;
        // Anything which reached the state machine was committed. Beyond that the commit index
        // must be learned from a leader, or established by becoming one.
        self.commit_index = state.last_applied.index;

        if let Some(snapshot) =
            self.storage.get_current_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?
        {
            self.snapshot_last_log_id = snapshot.meta.last_log_id;
        }

        let is_only_configured_member = self.membership.len() == 1 && self.membership.contains(&self.id);
        if is_only_configured_member && self.last_log_id.index > 0 {
            // A restarted single-node cluster. Campaigning wins immediately and moves to a fresh term.
            self.target_state = State::Candidate;
        } else if self.membership.contains(&self.id) {
            self.target_state = State::Follower;
        } else {
            self.target_state = State::NonVoter;
        }
        tracing::debug!(state=?self.target_state, last_log_id=%self.last_log_id, term=self.current_term, "raft node initialized");

        // The core assumes a different role based on cluster state, delegating control to the
        // role's loop until a state change is required.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::NonVoter => NonVoterState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            commit_index: self.commit_index,
            current_leader: self.current_leader,
            membership_config: self.membership.clone(),
            group_mode: self.group_mode,
            snapshot: self.snapshot_last_log_id,
        });
        if let Err(err) = res {
            tracing::error!({error=%err, id=self.id}, "error reporting metrics");
        }
    }

    /// Save the Raft node's current hard state to disk.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update core's target state, ensuring all invariants are upheld.
    ///
    /// A node outside of the group config never campaigns nor times out.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        let needs_membership = target_state == State::Follower || target_state == State::Candidate;
        if needs_membership && !self.membership.contains(&self.id) {
            self.target_state = State::NonVoter;
        } else {
            self.target_state = target_state;
        }
    }

    /// Get the next election timeout, generating a new value if not set.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the value of the `current_leader` property.
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id);
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Encapsulate the process of updating the current term, as updating the `voted_for` state must also be updated.
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the storage layer.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=%err, id=self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::RaftStorage(err)
    }

    /// Update the node's current membership config.
    ///
    /// A follower which finds itself outside of the new config becomes a non-voter, and a
    /// non-voter which finds itself inside becomes a follower. The leader's own role is driven
    /// by the membership change workflow instead.
    #[tracing::instrument(level = "trace", skip(self, cfg), fields(members=?cfg.members.keys()))]
    fn update_membership(&mut self, log_index: u64, cfg: MembershipConfig) {
        self.membership = cfg;
        self.membership_index = log_index;
        match self.target_state {
            State::Follower | State::Candidate if !self.membership.contains(&self.id) => {
                self.set_target_state(State::NonVoter);
            }
            State::NonVoter if self.membership.contains(&self.id) => {
                self.update_next_election_timeout(false);
                self.set_target_state(State::Follower);
            }
            _ => {}
        }
    }

    /// Update the system's snapshot state based on the given data.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        if let SnapshotUpdate::SnapshotComplete(log_id) = update {
            if log_id > self.snapshot_last_log_id {
                self.snapshot_last_log_id = log_id;
            }
            self.report_metrics();
        }
        // If snapshot state is anything other than streaming, then drop it.
        if let Some(state @ SnapshotState::Streaming { .. }) = self.snapshot_state.take() {
            self.snapshot_state = Some(state)
        }
    }

    /// Trigger a log compaction (snapshot) job if needed.
    ///
    /// With `force` the policy threshold is ignored, as long as something was applied since the
    /// last snapshot.
    #[tracing::instrument(level = "trace", skip(self))]
    fn trigger_log_compaction_if_needed(&mut self, force: bool) {
        if self.snapshot_state.is_some() {
            return;
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        if self.last_applied.index == 0 || self.last_applied.index <= self.snapshot_last_log_id.index {
            return;
        }
        if !force && self.last_applied.index - self.snapshot_last_log_id.index < *threshold {
            return;
        }

        // At this point, we are clear to begin a new compaction process.
        let storage = self.storage.clone();
        let (handle, reg) = AbortHandle::new_pair();
        let (chan_tx, _) = broadcast::channel(1);
        let tx_compaction = self.tx_compaction.clone();
        self.snapshot_state = Some(SnapshotState::Snapshotting {
            handle,
            sender: chan_tx.clone(),
        });
        tokio::spawn(
            async move {
                let res = Abortable::new(storage.do_log_compaction(), reg).await;
                match res {
                    Ok(Ok(snapshot)) => {
                        let log_id = snapshot.meta.last_log_id;
                        tracing::debug!(%log_id, "log compaction complete");
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotComplete(log_id));
                        let _ = chan_tx.send(log_id.index);
                    }
                    Ok(Err(err)) => {
                        tracing::error!({error=%err}, "error while generating snapshot");
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                    Err(_aborted) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                }
            }
            .instrument(tracing::debug_span!("beginning new log compaction process")),
        );
    }

    /// Reject an init config request due to the Raft node being in a state which prohibits the request.
    fn reject_init_with_config(&self, tx: oneshot::Sender<Result<(), InitializeError>>) {
        let _ = tx.send(Err(InitializeError::NotAllowed));
    }

    /// Reject a proposed config change request due to the Raft node being in a state which prohibits the request.
    fn reject_config_change_not_leader(&self, tx: ChangeMembershipTx) {
        let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(self.current_leader)));
    }

    /// Forward the given client write request to the leader.
    fn forward_client_write_request(&self, req: ClientWriteRequest<D>, tx: ClientWriteResponseTx<D, R>) {
        let _ = tx.send(Err(ClientWriteError::ForwardToLeader(req.entry, self.current_leader)));
    }

    /// Forward the given client read request to the leader.
    fn forward_client_read_request(&self, tx: ClientReadResponseTx) {
        let _ = tx.send(Err(ClientReadError::ForwardToLeader(self.current_leader)));
    }

    /// Handle the messages every non-leader role answers the same way.
    ///
    /// `Initialize` is handed back to the caller since only a pristine non-voter accepts it.
    async fn handle_follower_msg(&mut self, msg: RaftMsg<D, R>) -> Option<RaftMsg<D, R>> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.handle_append_entries_request(rpc).await);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let _ = tx.send(self.handle_vote_request(rpc).await);
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.handle_install_snapshot_request(rpc).await);
            }
            RaftMsg::ClientRead { tx } => {
                self.forward_client_read_request(tx);
            }
            RaftMsg::ClientWrite { rpc, tx } => {
                self.forward_client_write_request(rpc, tx);
            }
            msg @ RaftMsg::Initialize { .. } => return Some(msg),
            RaftMsg::AddVoter { tx, .. } => {
                self.reject_config_change_not_leader(tx);
            }
            RaftMsg::RemoveVoter { tx, .. } => {
                self.reject_config_change_not_leader(tx);
            }
        }
        None
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// The current snapshot state of the Raft node.
pub(self) enum SnapshotState<S> {
    /// The Raft node is compacting itself.
    Snapshotting {
        /// A handle to abort the compaction process early if needed.
        handle: AbortHandle,
        /// A sender for notifying any other tasks of the completion of this compaction.
        sender: broadcast::Sender<u64>,
    },
    /// The Raft node is streaming in a snapshot from the leader.
    Streaming {
        /// The offset of the next byte expected.
        offset: u64,
        /// The ID of the snapshot being written.
        id: String,
        /// A handle to the snapshot writer.
        snapshot: Box<S>,
    },
}

/// An update on a snapshot creation process.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    /// Snapshot creation has finished successfully and covers the given log id.
    SnapshotComplete(LogId),
    /// Snapshot creation failed.
    SnapshotFailed,
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is completely passive; replicating entries, but neither campaigning nor timing
    /// out. Pristine nodes and nodes outside of the group config are non-voters.
    NonVoter,
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The Raft node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in non-voter state.
    pub fn is_non_voter(&self) -> bool {
        matches!(self, Self::NonVoter)
    }

    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(super) core: &'a mut RaftCore<D, R, N, S>,
    /// Replication progress of every other voting member.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState>,
    /// Replication progress of a node which is being caught up before it joins.
    pub(super) non_voters: BTreeMap<NodeId, ReplicationState>,
    /// The index of the first entry of this leader's term. Entries from this index on may be
    /// committed by counting replicas.
    pub(super) initial_index: u64,
    /// A bool indicating if this node will be stepping down after committing the current config change.
    pub(super) is_stepping_down: bool,

    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<ReplicaEvent<S::SnapshotData>>,
    /// The clonable sender channel for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<ReplicaEvent<S::SnapshotData>>,
    /// Client requests which have been appended locally, keyed by log index, awaiting to be applied.
    pub(super) awaiting_applied: BTreeMap<u64, ClientWriteResponseTx<D, R>>,
    /// Read requests waiting for the first entry of this term to commit.
    pub(super) pending_reads: Vec<ClientReadResponseTx>,
    /// A field tracking the cluster's current membership change workflow.
    pub(super) consensus_state: ConsensusState,
    /// Membership change requests waiting for the current change to finish, in arrival order.
    pub(super) deferred_changes: VecDeque<DeferredChange>,

    /// The last time each peer responded within this term.
    pub(super) last_acks: BTreeMap<NodeId, Instant>,
    /// When a quorum of recent responses must next be present.
    pub(super) next_quorum_check: Instant,
    /// Periodic tick driving quorum checks and catch-up deadlines.
    pub(super) tick: Interval,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        let period = Duration::from_millis(core.config.replication_interval);
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let next_quorum_check = Instant::now() + Duration::from_millis(core.config.election_timeout_max);
        Self {
            core,
            nodes: BTreeMap::new(),
            non_voters: BTreeMap::new(),
            initial_index: 0,
            is_stepping_down: false,
            replication_tx,
            replication_rx,
            awaiting_applied: BTreeMap::new(),
            pending_reads: Vec::new(),
            consensus_state: ConsensusState::Uniform,
            deferred_changes: VecDeque::new(),
            last_acks: BTreeMap::new(),
            next_quorum_check,
            tick,
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn replication streams.
        let targets = self.core.membership.ids().filter(|elem| elem != &self.core.id).collect::<Vec<_>>();
        let now = Instant::now();
        for target in targets {
            let state = self.spawn_replication_stream(target, false);
            self.nodes.insert(target, state);
            self.last_acks.insert(target, now);
        }

        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        // A group config entry which is not committed yet is still an in-flight change.
        if self.core.membership_index > self.core.commit_index {
            self.consensus_state = ConsensusState::ConfigChange {
                index: self.core.membership_index,
                removing: None,
                tx: None,
            };
        }
        self.core.group_mode = self.consensus_state.group_mode();
        self.core.report_metrics();

        // Per §8, commit an initial entry as part of becoming the cluster leader.
        self.commit_initial_leader_entry().await?;

        loop {
            if self.core.target_state.is_leader() {
                self.finalize_committed_config_change().await;
            }
            if !self.core.target_state.is_leader() {
                self.step_down();
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => match msg {
                    RaftMsg::AppendEntries{rpc, tx} => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    RaftMsg::RequestVote{rpc, tx} => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    RaftMsg::InstallSnapshot{rpc, tx} => {
                        let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                    }
                    RaftMsg::ClientRead{tx} => {
                        self.handle_client_read_request(tx);
                    }
                    RaftMsg::ClientWrite{rpc, tx} => {
                        self.handle_client_write_request(rpc, tx).await;
                    }
                    RaftMsg::Initialize{tx, ..} => {
                        self.core.reject_init_with_config(tx);
                    }
                    RaftMsg::AddVoter{id, endpoint, tx} => {
                        self.add_voter(id, endpoint, tx);
                    }
                    RaftMsg::RemoveVoter{id, tx} => {
                        self.remove_voter(id, tx).await;
                    }
                },
                Some(event) = self.replication_rx.recv() => self.handle_replica_event(event).await,
                Some(res) = self.core.apply_handle.next() => {
                    // Errors herein trigger shutdown, so no need to process them further.
                    if let Ok(applied) = self.core.handle_apply_result(res) {
                        self.respond_applied(applied);
                    }
                }
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                _ = self.tick.tick() => self.handle_tick().await,
                _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }

    /// Tear down leader state: stop replication and fail everything still waiting on this
    /// leadership.
    fn step_down(&mut self) {
        tracing::debug!(id = self.core.id, state=?self.core.target_state, "leaving leader state");
        // A stream may be parked in a backoff or an RPC; abort it rather than wait for it to
        // read its channel.
        for node in self.nodes.values().chain(self.non_voters.values()) {
            let _ = node.repl_stream.repl_tx.send(RaftEvent::Terminate);
            node.repl_stream.handle.abort();
        }
        for (_, tx) in std::mem::take(&mut self.awaiting_applied) {
            let _ = tx.send(Err(ClientWriteError::Unavailable));
        }
        for tx in self.pending_reads.drain(..) {
            let _ = tx.send(Err(ClientReadError::ForwardToLeader(self.core.current_leader)));
        }
        let leader = self.core.current_leader;
        match std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform) {
            ConsensusState::CatchingUp { tx, .. } => {
                let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(leader)));
            }
            ConsensusState::ConfigChange { tx: Some(tx), .. } => {
                let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(leader)));
            }
            _ => {}
        }
        for change in self.deferred_changes.drain(..) {
            let _ = change.tx.send(Err(ChangeConfigError::NodeNotLeader(leader)));
        }
        if self.core.current_leader == Some(self.core.id) {
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
        }
        self.core.group_mode = GroupMode::Stable;
        self.core.report_metrics();
    }

    /// Periodic leader housekeeping.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_tick(&mut self) {
        self.check_catch_up_deadline().await;
        self.expire_deferred_changes();

        let now = Instant::now();
        if now < self.next_quorum_check {
            return;
        }
        let window = Duration::from_millis(self.core.config.election_timeout_max);
        let mut responsive: BTreeSet<NodeId> = self
            .last_acks
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) <= window)
            .map(|(id, _)| *id)
            .collect();
        responsive.insert(self.core.id);
        if !self.core.membership.is_majority(&responsive) {
            tracing::warn!(id = self.core.id, term = self.core.current_term, ?responsive, "lost contact with a quorum, stepping down");
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.update_next_election_timeout(false);
            self.core.set_target_state(State::Follower);
            return;
        }
        self.next_quorum_check = now + window;
    }
}

/// A struct tracking the state of a replication stream from the perspective of the Raft actor.
///
/// The stream task itself owns the next index to send; the leader mirrors the matched id.
struct ReplicationState {
    pub matched: LogId,
    /// Stop replicating to this node once it has the entry at this index, used for nodes which
    /// were removed from the group config.
    pub remove_after_commit: Option<u64>,
    pub repl_stream: ReplicationStream,
}

/// A state enum used by Raft leaders to navigate single-server membership changes.
pub(self) enum ConsensusState {
    /// No change is in progress.
    Uniform,
    /// A new node is being brought up to speed before the config entry adding it is written.
    CatchingUp {
        target: NodeId,
        endpoint: Endpoint,
        /// The number of replication rounds in which the node advanced.
        rounds: u64,
        /// The last time the node's matched index advanced.
        last_advance: Instant,
        tx: ChangeMembershipTx,
    },
    /// A group config entry has been appended and is awaiting commitment.
    ConfigChange {
        index: u64,
        /// The node being removed by this change, if any.
        removing: Option<NodeId>,
        /// `None` when the change was inherited from a previous leader.
        tx: Option<ChangeMembershipTx>,
    },
}

impl ConsensusState {
    pub(self) fn group_mode(&self) -> GroupMode {
        match self {
            ConsensusState::Uniform => GroupMode::Stable,
            _ => GroupMode::Changing,
        }
    }
}

/// The kind of a queued membership change.
#[derive(Debug)]
pub(self) enum ChangeOp {
    Add { id: NodeId, endpoint: Endpoint },
    Remove { id: NodeId },
}

/// A membership change waiting for the in-progress one to finish.
pub(self) struct DeferredChange {
    pub op: ChangeOp,
    pub queued_at: Instant,
    pub tx: ChangeMembershipTx,
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
    /// The nodes which granted their vote in the current term, including this node.
    granted: BTreeSet<NodeId>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self {
            core,
            granted: BTreeSet::new(),
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Setup new term.
            self.core.update_next_election_timeout(false); // Generates a new rand value within range.
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics();
            tracing::debug!(id = self.core.id, term = self.core.current_term, "starting election");

            // We must vote for ourselves per §5.2.
            self.granted.clear();
            self.granted.insert(self.core.id);
            if self.core.membership.is_majority(&self.granted) {
                self.core.set_target_state(State::Leader);
                return Ok(());
            }

            // Send RPCs to all members in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());
                tokio::select! {
                    _ = timeout_fut => break, // This election has timed-out. Break to outer loop, which starts a new term.
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    Some(msg) = self.core.rx_api.recv() => {
                        if let Some(RaftMsg::Initialize{tx, ..}) = self.core.handle_follower_msg(msg).await {
                            self.core.reject_init_with_config(tx);
                        }
                    }
                    Some(res) = self.core.apply_handle.next() => {
                        let _ = self.core.handle_apply_result(res);
                    }
                    Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                    _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub struct FollowerState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> FollowerState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }

            let election_timeout = sleep_until(self.core.get_next_election_timeout()); // Value is updated as heartbeats are received.
            tokio::select! {
                // If an election timeout is hit, then we need to transition to candidate.
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some(msg) = self.core.rx_api.recv() => {
                    if let Some(RaftMsg::Initialize{tx, ..}) = self.core.handle_follower_msg(msg).await {
                        self.core.reject_init_with_config(tx);
                    }
                }
                Some(res) = self.core.apply_handle.next() => {
                    let _ = self.core.handle_apply_result(res);
                }
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in non-voter state.
pub struct NonVoterState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> NonVoterState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the non-voter loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="non-voter"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_non_voter() {
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => {
                    if let Some(RaftMsg::Initialize{members, tx}) = self.core.handle_follower_msg(msg).await {
                        let _ = tx.send(self.handle_init_with_config(members).await);
                    }
                }
                Some(res) = self.core.apply_handle.next() => {
                    let _ = self.core.handle_apply_result(res);
                }
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

//! Replication stream.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Duration, Instant, Interval, MissedTickBehavior};
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::RaftResult;
use crate::network::RpcPermits;
use crate::raft::{AppendEntriesRequest, AppendEntriesResponse, Entry, InstallSnapshotRequest};
use crate::storage::Snapshot;
use crate::{AppData, AppDataResponse, LogId, MessageSummary, NodeId, RaftNetwork, RaftStorage};

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The spawn handle the `ReplicationCore` task.
    pub handle: JoinHandle<()>,
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<RaftEvent>,
}

impl ReplicationStream {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log_index: u64,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        permits: RpcPermits,
        replication_tx: mpsc::UnboundedSender<ReplicaEvent<S::SnapshotData>>,
        is_new_node: bool,
    ) -> Self {
        ReplicationCore::spawn(
            id,
            target,
            term,
            config,
            last_log_index,
            commit_index,
            network,
            storage,
            permits,
            replication_tx,
            is_new_node,
        )
    }
}

/// A task responsible for sending replication events to a target follower in the Raft cluster.
///
/// NOTE: we do not stack replication requests to targets because this could result in
/// out-of-order delivery. One request is in flight at a time, the next is built from its
/// response.
struct ReplicationCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target Raft node which replication events are to be sent to.
    target: NodeId,
    /// The current term, which will never change during the lifetime of this task.
    term: u64,
    /// A channel for sending events to the Raft node.
    raft_core_tx: mpsc::UnboundedSender<ReplicaEvent<S::SnapshotData>>,
    /// A channel for receiving events from the Raft node.
    repl_rx: mpsc::UnboundedReceiver<RaftEvent>,
    /// The `RaftNetwork` interface.
    network: Arc<N>,
    /// The `RaftStorage` interface.
    storage: Arc<S>,
    /// The Raft's runtime config.
    config: Arc<Config>,
    permits: RpcPermits,
    marker_d: std::marker::PhantomData<D>,
    marker_r: std::marker::PhantomData<R>,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The target state of this replication stream.
    target_state: TargetReplState,
    /// The index of the log entry most recently appended to the leader's log.
    last_log_index: u64,
    /// The index of the highest log entry which is known to be committed in the cluster.
    commit_index: u64,
    /// The index of the next log entry to send to the target.
    ///
    /// Initialized to the leader's last log index + 1, and walked back on log mismatches using
    /// the follower's conflict hint (§5.3).
    next_index: u64,
    /// The id of the last entry known to be replicated on the target.
    matched: LogId,
    /// Set after a transport failure; the stream then waits for the next heartbeat tick before
    /// trying again instead of retrying in a loop.
    backoff: bool,
    /// Whether the target is a joining node still being caught up.
    is_new_node: bool,
    /// The heartbeat interval for ensuring that heartbeats are always delivered in a timely fashion.
    heartbeat: Interval,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    /// Spawn a new replication task for the target node.
    #[allow(clippy::too_many_arguments)]
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log_index: u64,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        permits: RpcPermits,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent<S::SnapshotData>>,
        is_new_node: bool,
    ) -> ReplicationStream {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let period = Duration::from_millis(config.replication_interval);
        let first_tick = Instant::now() + Duration::from_millis(config.replication_delay) + period;
        let mut heartbeat = interval_at(first_tick, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let this = Self {
            id,
            target,
            term,
            raft_core_tx,
            repl_rx,
            network,
            storage,
            config,
            permits,
            marker_d: std::marker::PhantomData,
            marker_r: std::marker::PhantomData,
            target_state: TargetReplState::LineRate,
            last_log_index,
            commit_index,
            next_index: last_log_index + 1,
            matched: LogId::default(),
            backoff: false,
            is_new_node,
            heartbeat,
        };
        let handle = tokio::spawn(this.main().instrument(tracing::debug_span!("replication", target)));
        ReplicationStream { handle, repl_tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        if self.config.replication_delay > 0 {
            sleep(Duration::from_millis(self.config.replication_delay)).await;
        }

        // Perform an initial heartbeat.
        self.send_append_entries().await;

        // Proceed to the replication stream's inner loop.
        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Snapshotting => self.replicate_snapshot().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// The timeout of a single RPC to the target.
    fn rpc_timeout(&self) -> Duration {
        if self.is_new_node {
            Duration::from_millis(self.config.new_node_read_timeout)
        } else {
            Duration::from_millis(self.config.replication_read_timeout)
        }
    }

    /// The maximum number of entries per AppendEntries request.
    fn batch_limit(&self) -> u64 {
        if self.is_new_node {
            self.config.new_node_batch_limit()
        } else {
            self.config.batch_limit()
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            if self.next_index <= self.last_log_index && !self.backoff {
                self.drain_raft_rx();
                if self.target_state != TargetReplState::LineRate {
                    return;
                }
                self.send_append_entries().await;
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.backoff = false;
                    self.send_append_entries().await;
                }
                event = self.repl_rx.recv() => match event {
                    Some(event) => {
                        self.process_raft_event(event);
                        self.drain_raft_rx();
                    }
                    None => self.target_state = TargetReplState::Shutdown,
                },
            }
        }
    }

    /// Send an AppendEntries RPC to the target, carrying entries from `next_index` on, or none
    /// when the target is up to date.
    #[tracing::instrument(level = "trace", skip(self), fields(next_index=self.next_index))]
    async fn send_append_entries(&mut self) {
        let prev_index = self.next_index - 1;
        let prev_log_id = match self.prev_log_id(prev_index).await {
            Ok(Some(log_id)) => log_id,
            Ok(None) => {
                tracing::debug!(prev_index, "entry preceding the next one to send is compacted, switching to snapshot replication");
                self.target_state = TargetReplState::Snapshotting;
                return;
            }
            Err(err) => return self.fatal(err),
        };

        let entries = if self.next_index <= self.last_log_index {
            let stop = std::cmp::min(self.last_log_index, prev_index.saturating_add(self.batch_limit())) + 1;
            match self.load_log_entries(self.next_index, stop).await {
                Ok(Some(entries)) => entries,
                Ok(None) => {
                    self.target_state = TargetReplState::Snapshotting;
                    return;
                }
                Err(err) => return self.fatal(err),
            }
        } else {
            vec![]
        };
        let last_sent = entries.last().map(|entry| entry.log_id).unwrap_or(prev_log_id);

        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id,
            entries,
            leader_commit: self.commit_index,
        };
        tracing::trace!(rpc=%rpc.summary(), "sending append_entries");

        let res = match self.send_with_timeout(rpc).await {
            Some(res) => res,
            None => return,
        };

        // Replication was not successful, if a newer term has been returned, revert to follower.
        if res.term > self.term {
            self.revert_to_follower(res.term);
            return;
        }

        if res.success {
            if last_sent.index > self.matched.index {
                self.matched = last_sent;
            }
            self.next_index = self.matched.index.max(last_sent.index) + 1;
            self.update_matched();
            return;
        }

        // The target rejected prev_log_id: walk next_index back using its hint, never below
        // what is known to be matched.
        let mut next = self.next_index.saturating_sub(1);
        if let Some(conflict) = &res.conflict {
            next = std::cmp::min(next, conflict.index + 1);
        }
        self.next_index = next.max(self.matched.index + 1).max(1);
        tracing::debug!(?res.conflict, next_index = self.next_index, "append entries rejected, walking back");
        // The target answered in this term, which still counts as an acknowledgement.
        self.update_matched();
    }

    /// Send a bare heartbeat built on the known matched entry. Used while a snapshot is being
    /// prepared, so the target does not time out.
    async fn send_heartbeat(&mut self) {
        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.matched,
            entries: vec![],
            leader_commit: std::cmp::min(self.commit_index, self.matched.index),
        };
        if let Some(res) = self.send_with_timeout(rpc).await {
            if res.term > self.term {
                self.revert_to_follower(res.term);
            } else {
                self.update_matched();
            }
        }
    }

    async fn send_with_timeout(&mut self, rpc: AppendEntriesRequest<D>) -> Option<AppendEntriesResponse> {
        let _permit = self.permits.acquire().await;
        let res = timeout(self.rpc_timeout(), self.network.append_entries(self.target, rpc)).await;
        match res {
            Ok(Ok(res)) => {
                self.backoff = false;
                Some(res)
            }
            Ok(Err(err)) => {
                tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                self.backoff = true;
                None
            }
            Err(_) => {
                tracing::warn!(timeout=?self.rpc_timeout(), "timeout while sending AppendEntries RPC to target");
                self.backoff = true;
                None
            }
        }
    }

    /// The id of the entry at `index` in the leader's log, `None` if it is compacted and not the
    /// last entry of the snapshot either.
    async fn prev_log_id(&self, index: u64) -> anyhow::Result<Option<LogId>> {
        if index == 0 {
            return Ok(Some(LogId::default()));
        }
        if index == self.matched.index {
            return Ok(Some(self.matched));
        }
        if let Some(entry) = self.storage.try_get_log_entry(index).await? {
            return Ok(Some(entry.log_id));
        }
        match self.storage.get_current_snapshot().await? {
            Some(snapshot) if snapshot.meta.last_log_id.index == index => Ok(Some(snapshot.meta.last_log_id)),
            _ => Ok(None),
        }
    }

    /// Load the entries in `[start, stop)`, `None` if some of them are compacted.
    async fn load_log_entries(&self, start: u64, stop: u64) -> anyhow::Result<Option<Vec<Entry<D>>>> {
        let entries = self.storage.get_log_entries(start, stop).await?;
        let first = entries.first().map(|entry| entry.log_id.index);
        if first != Some(start) || entries.len() as u64 != stop - start {
            tracing::debug!(start, stop, ?first, n = entries.len(), "entries to replicate not found");
            return Ok(None);
        }
        Ok(Some(entries))
    }

    fn update_matched(&mut self) {
        tracing::trace!(target=%self.target, matched=%self.matched, "update_matched");
        let _ = self.raft_core_tx.send(ReplicaEvent::UpdateMatchIndex {
            target: self.target,
            matched: self.matched,
            term: self.term,
        });
    }

    fn revert_to_follower(&mut self, term: u64) {
        tracing::debug!({ term }, "target has a newer term, reverting to follower");
        let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower {
            target: self.target,
            term,
        });
        self.target_state = TargetReplState::Shutdown;
    }

    fn fatal(&mut self, err: anyhow::Error) {
        tracing::error!(error=%err, "storage error in replication stream");
        self.target_state = TargetReplState::Shutdown;
        let _ = self.raft_core_tx.send(ReplicaEvent::Shutdown);
    }

    fn process_raft_event(&mut self, event: RaftEvent) {
        match event {
            RaftEvent::Replicate {
                last_log_index,
                commit_index,
            } => {
                self.last_log_index = std::cmp::max(self.last_log_index, last_log_index);
                self.commit_index = commit_index;
            }
            RaftEvent::UpdateCommitIndex { commit_index } => {
                self.commit_index = commit_index;
            }
            RaftEvent::Promote => {
                self.is_new_node = false;
            }
            RaftEvent::Terminate => {
                self.target_state = TargetReplState::Shutdown;
            }
        }
    }

    /// Fully drain the channel coming in from the Raft node.
    fn drain_raft_rx(&mut self) {
        while let Some(event) = self.repl_rx.recv().now_or_never() {
            match event {
                Some(event) => self.process_raft_event(event),
                None => self.target_state = TargetReplState::Shutdown,
            }
            if self.target_state == TargetReplState::Shutdown {
                return;
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshotting"))]
    async fn replicate_snapshot(&mut self) {
        let snapshot = match self.wait_for_snapshot().await {
            Some(snapshot) => snapshot,
            None => return,
        };
        if let Err(err) = self.stream_snapshot(snapshot).await {
            tracing::warn!(error=%err, "error streaming snapshot to target");
        }
    }

    /// Wait for a response from the storage layer for the current snapshot.
    ///
    /// The Raft node either answers right away, or drops the channel once the compaction it
    /// started or was already running is over; in that case the request is sent again.
    async fn wait_for_snapshot(&mut self) -> Option<Snapshot<S::SnapshotData>> {
        loop {
            let (tx, mut rx) = oneshot::channel();
            let _ = self.raft_core_tx.send(ReplicaEvent::NeedsSnapshot {
                target: self.target,
                tx,
                term: self.term,
            });

            loop {
                if self.target_state == TargetReplState::Shutdown {
                    return None;
                }
                tokio::select! {
                    _ = self.heartbeat.tick() => self.send_heartbeat().await,
                    event = self.repl_rx.recv() => match event {
                        Some(event) => self.process_raft_event(event),
                        None => self.target_state = TargetReplState::Shutdown,
                    },
                    res = &mut rx => match res {
                        Ok(snapshot) => return Some(snapshot),
                        Err(_) => {
                            tracing::debug!("snapshot not ready yet, asking again");
                            break;
                        }
                    },
                }
            }
            // Pace the next request.
            self.heartbeat.tick().await;
        }
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot), fields(snapshot=%snapshot.meta.summary()))]
    async fn stream_snapshot(&mut self, mut snapshot: Snapshot<S::SnapshotData>) -> RaftResult<()> {
        let end = snapshot.snapshot.seek(SeekFrom::End(0)).await?;
        let chunk_size = self.config.snapshot_data_length;
        let mut offset = 0;

        loop {
            self.drain_raft_rx();
            if self.target_state == TargetReplState::Shutdown {
                return Ok(());
            }

            // Build the RPC.
            snapshot.snapshot.seek(SeekFrom::Start(offset)).await?;
            let mut data = Vec::with_capacity(chunk_size as usize);
            let n_read = (&mut *snapshot.snapshot).take(chunk_size).read_to_end(&mut data).await?;
            let done = offset + n_read as u64 >= end;
            let req = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                meta: snapshot.meta.clone(),
                offset,
                data,
                done,
            };
            tracing::debug!(snapshot_size = req.data.len(), req.offset, end, req.done, "sending snapshot chunk");

            let res = {
                let _permit = self.permits.acquire().await;
                timeout(self.rpc_timeout(), self.network.install_snapshot(self.target, req)).await
            };
            let res = match res {
                Ok(Ok(res)) => res,
                Ok(Err(err)) => {
                    tracing::warn!(error=%err, "error sending InstallSnapshot RPC to target");
                    self.heartbeat.tick().await;
                    continue;
                }
                Err(_) => {
                    tracing::warn!("timeout while sending InstallSnapshot RPC to target");
                    self.heartbeat.tick().await;
                    continue;
                }
            };

            // Handle response conditions.
            if res.term > self.term {
                self.revert_to_follower(res.term);
                return Ok(());
            }
            self.update_matched();

            if let Some(resume_from) = res.resume_from {
                tracing::debug!(resume_from, "target asked to resume the snapshot transfer");
                offset = std::cmp::min(resume_from, end);
                continue;
            }

            // If we just sent the final chunk of the snapshot, then transition to line rate.
            if done {
                tracing::debug!(snapshot=%snapshot.meta.last_log_id, matched=%self.matched, "snapshot installed on target");
                if snapshot.meta.last_log_id.index > self.matched.index {
                    self.matched = snapshot.meta.last_log_id;
                }
                self.next_index = self.matched.index + 1;
                self.target_state = TargetReplState::LineRate;
                self.update_matched();
                return Ok(());
            }

            offset += n_read as u64;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of the replication stream.
#[derive(Debug, Eq, PartialEq)]
enum TargetReplState {
    /// The replication stream is running at line rate.
    LineRate,
    /// The replication stream is streaming a snapshot over to the target node.
    Snapshotting,
    /// The replication stream is shutting down.
    Shutdown,
}

/// An event from the Raft node.
#[derive(Clone, Debug)]
pub(crate) enum RaftEvent {
    /// New entries were appended to the leader's log.
    Replicate {
        /// The index of the last entry in the leader's log.
        last_log_index: u64,
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    /// A message from Raft indicating a new commit index value.
    UpdateCommitIndex {
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    /// The target finished catching up and is now a voter.
    Promote,
    Terminate,
}

/// An event coming from a replication stream.
///
/// Events carry the term of the stream which sent them, so the Raft node can drop those from an
/// earlier term.
pub(crate) enum ReplicaEvent<S>
where S: AsyncRead + AsyncSeek + Send + Unpin + 'static
{
    /// An event from a replication stream which updates the target node's match index. It is
    /// also sent on every response of the target within the stream's term.
    UpdateMatchIndex {
        /// The ID of the target node for which the match index is to be updated.
        target: NodeId,
        /// The id of the most recent log known to have been successfully replicated on the target.
        matched: LogId,
        term: u64,
    },
    /// An event indicating that the Raft node needs to revert to follower state.
    RevertToFollower {
        /// The ID of the target node from which the new term was observed.
        target: NodeId,
        /// The new term observed.
        term: u64,
    },
    /// An event from a replication stream requesting snapshot info.
    NeedsSnapshot {
        /// The ID of the target node from which the event was sent.
        target: NodeId,
        /// The response channel for delivering the snapshot data.
        tx: oneshot::Sender<Snapshot<S>>,
        term: u64,
    },
    /// Some critical error has taken place, and Raft needs to shutdown.
    Shutdown,
}

impl<S: AsyncRead + AsyncSeek + Send + Unpin + 'static> MessageSummary for ReplicaEvent<S> {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::UpdateMatchIndex { target, matched, term } => {
                format!("UpdateMatchIndex: target: {}, matched: {}, term: {}", target, matched, term)
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            ReplicaEvent::NeedsSnapshot { target, term, .. } => {
                format!("NeedsSnapshot: target: {}, term: {}", target, term)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}

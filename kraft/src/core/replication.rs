use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::core::{ConsensusState, LeaderState, ReplicationState, SnapshotState, State, UpdateCurrentLeader};
use crate::error::RaftResult;
use crate::replication::{RaftEvent, ReplicaEvent, ReplicationStream};
use crate::storage::Snapshot;
use crate::{AppData, AppDataResponse, LogId, NodeId, RaftNetwork, RaftStorage};

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a new replication stream returning its replication state handle.
    ///
    /// Streams to joining nodes use the new node timeouts and batch limit until they are promoted.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&self, target: NodeId, is_new_node: bool) -> ReplicationState {
        let repl_stream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id.index,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.core.permits.clone(),
            self.replication_tx.clone(),
            is_new_node,
        );
        ReplicationState {
            matched: LogId::default(),
            remove_after_commit: None,
            repl_stream,
        }
    }

    /// Handle a replication event coming from one of the replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent<S::SnapshotData>) {
        let res = match event {
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::UpdateMatchIndex { target, matched, term } => {
                // Events from streams of an earlier term are stale.
                if term != self.core.current_term {
                    return;
                }
                self.handle_update_match_index(target, matched).await
            }
            ReplicaEvent::NeedsSnapshot { target, tx, term } => {
                if term != self.core.current_term {
                    return;
                }
                self.handle_needs_snapshot(target, tx).await
            }
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                return;
            }
        };
        if let Err(err) = res {
            tracing::error!({error=%err}, "error while processing event from replication stream");
        }
    }

    /// Handle events from replication streams for when this node needs to revert to follower state.
    #[tracing::instrument(level = "trace", skip(self, term))]
    async fn handle_revert_to_follower(&mut self, _: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.update_next_election_timeout(false);
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Handle events from a replication stream which updates the target node's match index.
    ///
    /// Every such event is also proof that the target still accepts this leader.
    #[tracing::instrument(level = "trace", skip(self, target, matched))]
    async fn handle_update_match_index(&mut self, target: NodeId, matched: LogId) -> RaftResult<()> {
        self.last_acks.insert(target, Instant::now());

        // If this is a node being caught up, then update and return.
        if self.non_voters.contains_key(&target) {
            self.handle_catch_up_progress(target, matched).await;
            return Ok(());
        }

        // Update target's match index & check if it is awaiting removal.
        let mut needs_removal = false;
        match self.nodes.get_mut(&target) {
            Some(state) => {
                if matched.index > state.matched.index {
                    state.matched = matched;
                }
                if let Some(threshold) = &state.remove_after_commit {
                    if &state.matched.index >= threshold {
                        needs_removal = true;
                    }
                }
            }
            _ => return Ok(()), // Node not found.
        }

        // Drop replication stream if needed.
        if needs_removal {
            if let Some(node) = self.nodes.remove(&target) {
                tracing::debug!(target, "removed node received its last group config, stopping replication");
                let _ = node.repl_stream.repl_tx.send(RaftEvent::Terminate);
            }
            self.last_acks.remove(&target);
        }

        self.update_commit_index();
        Ok(())
    }

    /// Recompute the commit index from the match indices of the current voters (§5.3, §5.4).
    ///
    /// Only an entry of the leader's own term may be committed by counting replicas; earlier
    /// entries are committed along with it.
    pub(super) fn update_commit_index(&mut self) {
        let indices = self
            .core
            .membership
            .ids()
            .map(|id| {
                if id == self.core.id {
                    self.core.last_log_id.index
                } else {
                    self.nodes.get(&id).map(|node| node.matched.index).unwrap_or(0)
                }
            })
            .collect::<Vec<_>>();
        let new_commit_index = calculate_new_commit_index(indices, self.core.commit_index);
        if new_commit_index <= self.core.commit_index || new_commit_index < self.initial_index {
            return;
        }

        self.core.commit_index = new_commit_index;
        tracing::trace!(commit_index = new_commit_index, "commit index advanced");

        // Update all replication streams based on new commit index.
        let event = RaftEvent::UpdateCommitIndex {
            commit_index: new_commit_index,
        };
        for node in self.nodes.values().chain(self.non_voters.values()) {
            let _ = node.repl_stream.repl_tx.send(event.clone());
        }

        self.flush_pending_reads();
        self.core.spawn_apply_if_needed();
        self.core.report_metrics();
    }

    /// Whether the in-flight group config entry has been committed.
    pub(super) fn is_config_change_committed(&self) -> bool {
        match &self.consensus_state {
            ConsensusState::ConfigChange { index, .. } => *index <= self.core.commit_index,
            _ => false,
        }
    }

    /// Handle events from replication streams requesting for snapshot info.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(
        &mut self,
        _: NodeId,
        tx: oneshot::Sender<Snapshot<S::SnapshotData>>,
    ) -> RaftResult<()> {
        // Check if snapshot creation is already in progress. If so, we spawn a task to await its
        // completion (or cancellation), and respond to the replication stream with whatever is
        // current by then.
        if let Some(SnapshotState::Snapshotting { sender, .. }) = &self.core.snapshot_state {
            let mut chan = sender.subscribe();
            let storage = self.core.storage.clone();
            tokio::spawn(async move {
                let _ = chan.recv().await;
                if let Ok(Some(snapshot)) = storage.get_current_snapshot().await {
                    let _ = tx.send(snapshot);
                }
            });
            return Ok(());
        }

        let current_snapshot_opt = self
            .core
            .storage
            .get_current_snapshot()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        match current_snapshot_opt {
            Some(snapshot) => {
                let _ = tx.send(snapshot);
            }
            None => {
                // The stream asks again shortly, and by then waits on the compaction started here.
                self.core.trigger_log_compaction_if_needed(true);
            }
        }
        Ok(())
    }
}

/// Determine the value for `current_commit` based on all known indices of the cluster members.
///
/// - `entries`: is a vector of all of the highest known indices to be replicated on a target node,
/// one per voting member of the cluster, including the leader if it is a member.
/// - `current_commit`: is the Raft node's `current_commit` value before invoking this function.
/// The output of this function will never be less than this value.
fn calculate_new_commit_index(mut entries: Vec<u64>, current_commit: u64) -> u64 {
    if entries.is_empty() {
        return current_commit;
    }

    // The element at this offset of the ascending sort is held by a majority.
    entries.sort_unstable();
    let offset = (entries.len() - 1) / 2;
    let new_val = entries[offset];
    if new_val < current_commit {
        current_commit
    } else {
        new_val
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
//////////////////////////////////////////////////////////////////////////////////////////////////

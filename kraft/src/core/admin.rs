use std::collections::{BTreeMap, VecDeque};

use tokio::time::{Duration, Instant};

use crate::core::{ChangeOp, ConsensusState, DeferredChange, LeaderState, NonVoterState, State, UpdateCurrentLeader};
use crate::error::{ChangeConfigError, InitializeError};
use crate::membership::{Endpoint, MembershipConfig};
use crate::raft::{ChangeMembershipTx, EntryPayload};
use crate::replication::RaftEvent;
use crate::{AppData, AppDataResponse, LogId, NodeId, RaftNetwork, RaftStorage};

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> NonVoterState<'a, D, R, N, S> {
    /// Handle the admin `init_with_config` command.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_init_with_config(
        &mut self,
        members: BTreeMap<NodeId, Endpoint>,
    ) -> Result<(), InitializeError> {
        if self.core.last_log_id.index != 0 || self.core.current_term != 0 {
            tracing::error!({self.core.last_log_id.index, self.core.current_term}, "rejecting init_with_config request as last_log_index or current_term is not 0");
            return Err(InitializeError::NotAllowed);
        }
        if !members.contains_key(&self.core.id) {
            tracing::error!(members=?members.keys(), "rejecting init_with_config request which does not include this node");
            return Err(InitializeError::NotAllowed);
        }

        // The config stays in memory until the first leader writes it to the log.
        self.core.membership = MembershipConfig::new(members);
        self.core.membership_index = 0;

        // A group of one wins its election right away.
        self.core.set_target_state(State::Candidate);
        Ok(())
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Add a new voting member, catching it up before the config entry is written.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) fn add_voter(&mut self, id: NodeId, endpoint: Endpoint, tx: ChangeMembershipTx) {
        if self.core.membership.contains(&id) {
            tracing::debug!(target = id, "node is already a member");
            let _ = tx.send(Err(ChangeConfigError::Noop));
            return;
        }
        if self.is_change_in_progress() {
            self.defer_change(ChangeOp::Add { id, endpoint }, tx);
            return;
        }
        self.start_catch_up(id, endpoint, tx);
    }

    /// Remove a voting member. Removing this node itself makes it step down once the change commits.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn remove_voter(&mut self, id: NodeId, tx: ChangeMembershipTx) {
        if self.is_change_in_progress() {
            self.defer_change(ChangeOp::Remove { id }, tx);
            return;
        }
        self.begin_remove_voter(id, tx).await;
    }

    /// Check the in-flight catch-up against its advance timeout.
    pub(super) async fn check_catch_up_deadline(&mut self) {
        let timeout = Duration::from_millis(self.core.config.new_node_advance_timeout);
        let stalled = match &self.consensus_state {
            ConsensusState::CatchingUp {
                target, last_advance, ..
            } if last_advance.elapsed() > timeout => Some(*target),
            _ => None,
        };
        if let Some(node) = stalled {
            tracing::warn!(target = node, ?timeout, "new node made no progress, giving up on adding it");
            self.fail_catch_up(ChangeConfigError::CatchUpTimeout { node }).await;
        }
    }

    /// Reject queued changes which waited longer than the configured timeout.
    pub(super) fn expire_deferred_changes(&mut self) {
        let timeout = self.core.config.previous_group_config_change_timeout;
        if timeout == 0 || self.deferred_changes.is_empty() {
            return;
        }
        let timeout = Duration::from_millis(timeout);
        let mut kept = VecDeque::with_capacity(self.deferred_changes.len());
        for change in self.deferred_changes.drain(..) {
            if change.queued_at.elapsed() > timeout {
                tracing::debug!(op=?change.op, "deferred membership change timed out");
                let _ = change.tx.send(Err(ChangeConfigError::ConfigChangeInProgress));
            } else {
                kept.push_back(change);
            }
        }
        self.deferred_changes = kept;
    }

    /// Record replication progress of the node being caught up.
    pub(super) async fn handle_catch_up_progress(&mut self, target: NodeId, matched: LogId) {
        let last_log_index = self.core.last_log_id.index;
        let max_rounds = self.core.config.new_node_max_round;
        let (caught_up, exhausted) = match (&mut self.consensus_state, self.non_voters.get_mut(&target)) {
            (
                ConsensusState::CatchingUp {
                    target: catching_up,
                    rounds,
                    last_advance,
                    ..
                },
                Some(state),
            ) if *catching_up == target => {
                if matched.index > state.matched.index {
                    state.matched = matched;
                    *rounds += 1;
                    *last_advance = Instant::now();
                    tracing::debug!(target, %matched, rounds = *rounds, "new node advanced");
                }
                let caught_up = state.matched.index >= last_log_index;
                (caught_up, !caught_up && *rounds >= max_rounds)
            }
            _ => return,
        };

        if caught_up {
            self.finish_catch_up().await;
        } else if exhausted {
            tracing::warn!(target, rounds = max_rounds, "new node did not catch up, giving up on adding it");
            self.fail_catch_up(ChangeConfigError::CatchUpRoundsExhausted {
                node: target,
                rounds: max_rounds,
            })
            .await;
        }
    }

    /// Complete any membership change whose config entry is committed.
    ///
    /// Committing one change may start the next queued one, which in a single voter cluster
    /// commits right away; hence the loop.
    pub(super) async fn finalize_committed_config_change(&mut self) {
        while self.is_config_change_committed() {
            let (index, removing, tx) = match std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform) {
                ConsensusState::ConfigChange { index, removing, tx } => (index, removing, tx),
                other => {
                    self.consensus_state = other;
                    return;
                }
            };
            tracing::debug!(index, ?removing, "group config change committed");
            if let Some(tx) = tx {
                let _ = tx.send(Ok(()));
            }
            if let Some(target) = removing {
                self.retire_removed_node(target, index);
            }

            if self.is_stepping_down || !self.core.membership.contains(&self.core.id) {
                tracing::info!(id = self.core.id, "leader is no longer a member, stepping down");
                self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                self.core.set_target_state(State::NonVoter);
                return;
            }

            self.sync_group_mode();
            self.process_deferred_changes().await;
        }
    }

    fn is_change_in_progress(&self) -> bool {
        !matches!(self.consensus_state, ConsensusState::Uniform) || !self.deferred_changes.is_empty()
    }

    fn defer_change(&mut self, op: ChangeOp, tx: ChangeMembershipTx) {
        tracing::debug!(?op, queued = self.deferred_changes.len(), "membership change in progress, deferring request");
        self.deferred_changes.push_back(DeferredChange {
            op,
            queued_at: Instant::now(),
            tx,
        });
    }

    /// Start queued changes, in arrival order, until one is in flight.
    async fn process_deferred_changes(&mut self) {
        let timeout = self.core.config.previous_group_config_change_timeout;
        while let ConsensusState::Uniform = self.consensus_state {
            let change = match self.deferred_changes.pop_front() {
                Some(change) => change,
                None => return,
            };
            if timeout > 0 && change.queued_at.elapsed() > Duration::from_millis(timeout) {
                let _ = change.tx.send(Err(ChangeConfigError::ConfigChangeInProgress));
                continue;
            }
            match change.op {
                ChangeOp::Add { id, endpoint } => {
                    if self.core.membership.contains(&id) {
                        let _ = change.tx.send(Err(ChangeConfigError::Noop));
                        continue;
                    }
                    self.start_catch_up(id, endpoint, change.tx);
                }
                ChangeOp::Remove { id } => self.begin_remove_voter(id, change.tx).await,
            }
        }
    }

    fn start_catch_up(&mut self, id: NodeId, endpoint: Endpoint, tx: ChangeMembershipTx) {
        tracing::info!(target = id, %endpoint, "catching up new node before adding it");
        let state = self.spawn_replication_stream(id, true);
        self.non_voters.insert(id, state);
        self.consensus_state = ConsensusState::CatchingUp {
            target: id,
            endpoint,
            rounds: 0,
            last_advance: Instant::now(),
            tx,
        };
        self.sync_group_mode();
    }

    async fn finish_catch_up(&mut self) {
        let (target, endpoint, tx) = match std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform) {
            ConsensusState::CatchingUp { target, endpoint, tx, .. } => (target, endpoint, tx),
            other => {
                self.consensus_state = other;
                return;
            }
        };
        if let Some(state) = self.non_voters.remove(&target) {
            let _ = state.repl_stream.repl_tx.send(RaftEvent::Promote);
            self.nodes.insert(target, state);
            self.last_acks.insert(target, Instant::now());
        }
        tracing::info!(target, "new node caught up, appending group config");
        let cfg = self.core.membership.with_member(target, endpoint);
        self.propose_config_change(cfg, None, tx).await;
    }

    async fn fail_catch_up(&mut self, err: ChangeConfigError) {
        if let ConsensusState::CatchingUp { target, tx, .. } =
            std::mem::replace(&mut self.consensus_state, ConsensusState::Uniform)
        {
            if let Some(state) = self.non_voters.remove(&target) {
                let _ = state.repl_stream.repl_tx.send(RaftEvent::Terminate);
            }
            let _ = tx.send(Err(err));
        }
        self.sync_group_mode();
        self.process_deferred_changes().await;
    }

    async fn begin_remove_voter(&mut self, id: NodeId, tx: ChangeMembershipTx) {
        if !self.core.membership.contains(&id) {
            let _ = tx.send(Err(ChangeConfigError::Noop));
            return;
        }
        if self.core.membership.len() == 1 {
            let _ = tx.send(Err(ChangeConfigError::InoperableConfig));
            return;
        }
        if id == self.core.id {
            self.is_stepping_down = true;
        }
        let cfg = self.core.membership.without_member(id);
        self.propose_config_change(cfg, Some(id), tx).await;
    }

    /// Append a group config entry. It takes effect on this node right away.
    async fn propose_config_change(&mut self, cfg: MembershipConfig, removing: Option<NodeId>, tx: ChangeMembershipTx) {
        let entry = match self.append_payload_to_log(EntryPayload::ConfigChange(cfg.clone())).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return;
            }
        };
        self.core.update_membership(entry.log_id.index, cfg);
        self.consensus_state = ConsensusState::ConfigChange {
            index: entry.log_id.index,
            removing,
            tx: Some(tx),
        };
        self.sync_group_mode();
        self.replicate_to_followers();
    }

    /// Stop replicating to a removed node once it holds the entry removing it.
    fn retire_removed_node(&mut self, target: NodeId, index: u64) {
        if target == self.core.id {
            return;
        }
        let done = match self.nodes.get_mut(&target) {
            Some(state) if state.matched.index >= index => true,
            Some(state) => {
                state.remove_after_commit = Some(index);
                false
            }
            None => false,
        };
        if done {
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.repl_stream.repl_tx.send(RaftEvent::Terminate);
            }
            self.last_acks.remove(&target);
        }
    }

    fn sync_group_mode(&mut self) {
        self.core.group_mode = self.consensus_state.group_mode();
        self.core.report_metrics();
    }
}

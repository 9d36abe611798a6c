use crate::core::{RaftCore, State, UpdateCurrentLeader};
use crate::error::RaftResult;
use crate::raft::{AppendEntriesRequest, AppendEntriesResponse, ConflictOpt, Entry, EntryPayload};
use crate::{AppData, AppDataResponse, LogId, MessageSummary, RaftNetwork, RaftStorage};

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(level="debug", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict: None,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);

        // Update current term if needed.
        let mut report_metrics = false;
        if self.current_term != msg.term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader != Some(msg.leader_id) {
            if self.target_state.is_leader() {
                tracing::error!(other = msg.leader_id, term = msg.term, "observed another leader in the same term");
            }
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id));
            report_metrics = true;
        }

        // Transition to follower state if needed. A node outside of the group config stays a
        // non-voter.
        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower);
        }

        let res = self.append_checked(msg).await;
        if report_metrics || res.is_ok() {
            self.report_metrics();
        }
        res
    }

    /// The log consistency check, followed by appending the new entries and advancing the
    /// commit index.
    async fn append_checked(&mut self, msg: AppendEntriesRequest<D>) -> RaftResult<AppendEntriesResponse> {
        let prev = msg.prev_log_id;
        if let Err(hint) = self.check_prev_log_id(prev).await? {
            tracing::debug!(%prev, hint, last_log_id=%self.last_log_id, "rejecting AppendEntries, log does not match");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict: Some(ConflictOpt { index: hint }),
            });
        }

        let last_new_index = msg.entries.last().map(|entry| entry.log_id.index).unwrap_or(prev.index);
        self.append_new_entries(prev, msg.entries).await?;

        // Only entries known to match the leader's log may be committed through this request.
        let new_commit = std::cmp::min(msg.leader_commit, last_new_index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.spawn_apply_if_needed();
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict: None,
        })
    }

    /// Check that this node's log holds `prev`. On mismatch, returns the highest index at which
    /// this node's log is known to agree with the leader's.
    async fn check_prev_log_id(&mut self, prev: LogId) -> RaftResult<Result<(), u64>> {
        // Committed entries agree everywhere, whether or not they are still in the log.
        if prev.index == 0 || prev.index <= self.commit_index {
            return Ok(Ok(()));
        }
        if prev.index > self.last_log_id.index {
            return Ok(Err(self.last_log_id.index));
        }

        let term = if prev.index == self.last_log_id.index {
            Some(self.last_log_id.term)
        } else {
            self.storage
                .try_get_log_entry(prev.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?
                .map(|entry| entry.log_id.term)
        };
        if term == Some(prev.term) {
            return Ok(Ok(()));
        }

        // Everything below the conflicting entry may be in conflict as well, except what is
        // committed or applied.
        let floor = std::cmp::max(self.commit_index, self.last_applied.index);
        Ok(Err(std::cmp::min(prev.index - 1, floor)))
    }

    /// Append the entries following `prev`, truncating any conflicting suffix of the local log
    /// first (§5.3).
    async fn append_new_entries(&mut self, prev: LogId, entries: Vec<Entry<D>>) -> RaftResult<()> {
        // Committed entries are already present, or compacted into the snapshot.
        let commit_index = self.commit_index;
        let skip = entries.iter().take_while(|entry| entry.log_id.index <= commit_index).count();
        if skip == entries.len() {
            return Ok(());
        }

        // Find the first entry which the local log lacks or holds with a different term.
        let first_index = entries[skip].log_id.index;
        let mut split = skip;
        if first_index <= self.last_log_id.index {
            let stop = std::cmp::min(entries[entries.len() - 1].log_id.index, self.last_log_id.index) + 1;
            let local = self
                .storage
                .get_log_entries(first_index, stop)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            for (entry, existing) in entries[skip..].iter().zip(local.iter()) {
                if entry.log_id != existing.log_id {
                    break;
                }
                split += 1;
            }
        }
        if split == entries.len() {
            tracing::trace!("all entries already present in the log");
            return Ok(());
        }

        let first_new = entries[split].log_id.index;
        if first_new <= self.last_log_id.index {
            tracing::debug!(from = first_new, last_log_id=%self.last_log_id, "deleting conflicting log entries");
            self.storage.delete_logs_from(first_new).await.map_err(|err| self.map_fatal_storage_error(err))?;
            self.last_log_id = if split == 0 {
                prev
            } else {
                entries[split - 1].log_id
            };
            // The config may have come from a removed entry.
            let membership =
                self.storage.get_membership_config().await.map_err(|err| self.map_fatal_storage_error(err))?;
            if membership.log_index != self.membership_index {
                self.update_membership(membership.log_index, membership.membership);
            }
        }

        let new_entries = &entries[split..];
        tracing::debug!(entries=%new_entries.summary(), "appending entries to log");
        self.storage.append_to_log(new_entries).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = new_entries[new_entries.len() - 1].log_id;

        // A group config takes effect as soon as it is in the log.
        let last_config = new_entries.iter().rev().find_map(|entry| match &entry.payload {
            EntryPayload::ConfigChange(cfg) => Some((entry.log_id.index, cfg.clone())),
            _ => None,
        });
        if let Some((index, cfg)) = last_config {
            self.update_membership(index, cfg);
        }
        Ok(())
    }
}

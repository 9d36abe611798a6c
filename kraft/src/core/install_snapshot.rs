use std::io::SeekFrom;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::core::{RaftCore, SnapshotState, State, UpdateCurrentLeader};
use crate::error::RaftResult;
use crate::raft::{InstallSnapshotRequest, InstallSnapshotResponse};
use crate::storage::SnapshotMeta;
use crate::{AppData, AppDataResponse, MessageSummary, RaftNetwork, RaftStorage};

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Invoked by leader to send chunks of a snapshot to a follower (§7).
    ///
    /// Leaders always send chunks in order. A chunk which does not continue the snapshot being
    /// received is answered with the offset this node expects instead, so the leader can resume.
    #[tracing::instrument(level="debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                resume_from: None,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);

        // Update current term if needed.
        let mut report_metrics = false;
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }

        // If not follower, become follower.
        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower);
        }

        if report_metrics {
            self.report_metrics();
        }

        // Compare current snapshot state with received RPC and handle as needed.
        match self.snapshot_state.take() {
            None => self.begin_installing_snapshot(req).await,
            Some(SnapshotState::Snapshotting { handle, .. }) => {
                handle.abort(); // Abort the current compaction in favor of installation from leader.
                self.begin_installing_snapshot(req).await
            }
            Some(SnapshotState::Streaming { snapshot, id, offset }) => {
                if req.meta.snapshot_id == id {
                    self.continue_installing_snapshot(req, offset, snapshot).await
                } else {
                    tracing::debug!(old = %id, new = %req.meta.snapshot_id, "discarding partially received snapshot");
                    self.begin_installing_snapshot(req).await
                }
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, req))]
    async fn begin_installing_snapshot(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        // A transfer can only start at the beginning.
        if req.offset > 0 {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                resume_from: Some(0),
            });
        }

        // Create a new snapshot and begin writing its contents.
        let mut snapshot =
            self.storage.begin_receiving_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?;
        snapshot.as_mut().write_all(&req.data).await?;

        // If this was a small snapshot, and it is already done, then finish up.
        if req.done {
            self.finalize_snapshot_installation(req.meta, snapshot).await?;
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                resume_from: None,
            });
        }

        // Else, retain snapshot components for later segments & respond.
        self.snapshot_state = Some(SnapshotState::Streaming {
            offset: req.data.len() as u64,
            id: req.meta.snapshot_id.clone(),
            snapshot,
        });
        Ok(InstallSnapshotResponse {
            term: self.current_term,
            resume_from: None,
        })
    }

    #[tracing::instrument(level = "trace", skip(self, req, snapshot))]
    async fn continue_installing_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        mut offset: u64,
        mut snapshot: Box<S::SnapshotData>,
    ) -> RaftResult<InstallSnapshotResponse> {
        let id = req.meta.snapshot_id.clone();

        // Out of order chunk, tell the leader where to continue from.
        if req.offset != offset {
            tracing::debug!(expected = offset, got = req.offset, "snapshot chunk out of order");
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                resume_from: Some(offset),
            });
        }

        if let Err(err) = snapshot.as_mut().seek(SeekFrom::Start(offset)).await {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
            return Err(err.into());
        }
        if let Err(err) = snapshot.as_mut().write_all(&req.data).await {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
            return Err(err.into());
        }
        offset += req.data.len() as u64;

        // If the snapshot stream is done, then finalize.
        if req.done {
            self.finalize_snapshot_installation(req.meta, snapshot).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id, snapshot });
        }
        Ok(InstallSnapshotResponse {
            term: self.current_term,
            resume_from: None,
        })
    }

    /// Finalize the installation of a new snapshot.
    ///
    /// Any errors which come up from this routine will cause the Raft node to go into shutdown.
    #[tracing::instrument(level = "trace", skip(self, meta, snapshot), fields(meta=%meta.summary()))]
    async fn finalize_snapshot_installation(
        &mut self,
        meta: SnapshotMeta,
        mut snapshot: Box<S::SnapshotData>,
    ) -> RaftResult<()> {
        snapshot.as_mut().shutdown().await.map_err(|err| self.map_fatal_storage_error(err.into()))?;

        let last = meta.last_log_id;
        if last.index <= self.last_applied.index {
            tracing::debug!(snapshot=%last, last_applied=%self.last_applied, "snapshot is not newer than the state machine, ignoring it");
            return Ok(());
        }

        // The state machine is about to be replaced, nothing may be applied concurrently.
        self.drain_apply().await?;

        // Whether the log continues past the snapshot on the same history.
        let log_retained = if last.index == self.last_log_id.index {
            last.term == self.last_log_id.term
        } else if last.index < self.last_log_id.index {
            let entry = self.storage.try_get_log_entry(last.index).await.map_err(|err| self.map_fatal_storage_error(err))?;
            entry.map(|entry| entry.log_id == last).unwrap_or(false)
        } else {
            false
        };

        self.storage
            .finalize_snapshot_installation(&meta, snapshot)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        if !log_retained {
            self.last_log_id = last;
        }
        self.last_applied = last;
        if last.index > self.commit_index {
            self.commit_index = last.index;
        }
        if last > self.snapshot_last_log_id {
            self.snapshot_last_log_id = last;
        }

        let membership = self.storage.get_membership_config().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.update_membership(membership.log_index, membership.membership);
        tracing::debug!(snapshot=%last, last_log_id=%self.last_log_id, log_retained, "snapshot installed");

        self.report_metrics();
        self.spawn_apply_if_needed();
        Ok(())
    }
}

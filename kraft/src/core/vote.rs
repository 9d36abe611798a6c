use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tracing_futures::Instrument;

use crate::core::{CandidateState, RaftCore, State, UpdateCurrentLeader};
use crate::error::RaftResult;
use crate::raft::{VoteRequest, VoteResponse};
use crate::{AppData, AppDataResponse, NodeId, RaftNetwork, RaftStorage};

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        // If candidate's current term is less than this nodes current term, reject.
        if msg.term < self.current_term {
            tracing::debug!({candidate=msg.candidate_id, self.current_term, rpc_term=msg.term}, "RequestVote RPC term is less than current term");
            return Ok(self.reject_vote());
        }

        // A node which heard from a live leader within the election timeout minimum does not
        // help depose it, and does not adopt the candidate's term either.
        if let Some(inst) = &self.last_heartbeat {
            let delta = Instant::now().duration_since(*inst);
            if delta < Duration::from_millis(self.config.election_timeout_min) {
                tracing::debug!(
                    { candidate = msg.candidate_id },
                    "rejecting vote request received within election timeout minimum"
                );
                return Ok(self.reject_vote());
            }
        }

        // Per §5.1, if we observe a term greater than our own outside of the election timeout
        // minimum, then we must update term & immediately become follower. We still need to
        // do vote checking after this.
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.update_next_election_timeout(false);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
        }

        // Check if candidate's log is at least as up-to-date as this node's.
        if msg.last_log_id < self.last_log_id {
            tracing::debug!(
                { candidate = msg.candidate_id, candidate_log=%msg.last_log_id, log=%self.last_log_id },
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(self.reject_vote());
        }

        match &self.voted_for {
            // Granting again is idempotent.
            Some(candidate_id) if candidate_id == &msg.candidate_id => {
                self.update_next_election_timeout(false);
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
            // This node has already voted for a different candidate.
            Some(_) => Ok(self.reject_vote()),
            None => {
                self.voted_for = Some(msg.candidate_id);
                self.update_next_election_timeout(false);
                self.save_hard_state().await?;
                tracing::debug!({candidate=msg.candidate_id, msg.term}, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }

    fn reject_vote(&self) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            vote_granted: false,
        }
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Handle response from a vote request sent to a peer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // If peer's term is greater than current term, revert to follower state.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            tracing::debug!("reverting to follower state due to greater term observed in RequestVote RPC response");
            return Ok(());
        }

        // A grant always carries the term it was given in; anything else is left over from an
        // earlier round.
        if res.vote_granted && res.term == self.core.current_term {
            self.granted.insert(target);
            if self.core.membership.is_majority(&self.granted) {
                tracing::debug!(granted=?self.granted, "transitioning to leader state as minimum number of votes have been received");
                self.core.set_target_state(State::Leader);
            }
        }

        // Otherwise, we just return and let the candidate loop wait for more votes to come in.
        Ok(())
    }

    /// Spawn parallel vote requests to all cluster members.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let peers = self.core.membership.ids().filter(|member| member != &self.core.id).collect::<Vec<_>>();
        let (tx, rx) = mpsc::channel(peers.len().max(1));
        let ttl = Duration::from_millis(self.core.config.election_timeout_min);
        for member in peers {
            let rpc = VoteRequest::new(self.core.current_term, self.core.id, self.core.last_log_id);
            let (network, permits, tx_inner) = (self.core.network.clone(), self.core.permits.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    let _permit = permits.acquire().await;
                    match timeout(ttl, network.vote(member, rpc)).await {
                        Ok(Ok(res)) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Ok(Err(err)) => tracing::warn!({error=%err, peer=member}, "error while requesting vote from peer"),
                        Err(_) => tracing::warn!({ peer = member }, "timeout while requesting vote from peer"),
                    }
                }
                .instrument(tracing::debug_span!("requesting vote from peer", target = member)),
            );
        }
        rx
    }
}

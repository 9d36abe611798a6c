use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::{timeout, Duration};
use tracing_futures::Instrument;

use crate::core::LeaderState;
use crate::error::{ClientReadError, RaftResult};
use crate::raft::{
    AppendEntriesRequest, ClientReadResponseTx, ClientWriteRequest, ClientWriteResponse, ClientWriteResponseTx, Entry,
    EntryPayload,
};
use crate::replication::{RaftEvent, ReplicaEvent};
use crate::{AppData, AppDataResponse, LogId, NodeId, RaftNetwork, RaftStorage};

/// The outcome of a leadership confirmation round for reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadOutcome {
    /// A quorum acknowledged this leader in its current term.
    Confirmed,
    /// A peer reported a newer term.
    Deposed,
    /// Not enough peers answered in time.
    Unconfirmed,
}

impl ReadOutcome {
    fn into_result(self) -> Result<(), ClientReadError> {
        match self {
            ReadOutcome::Confirmed => Ok(()),
            ReadOutcome::Deposed => Err(ClientReadError::ForwardToLeader(None)),
            ReadOutcome::Unconfirmed => Err(ClientReadError::Unavailable),
        }
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to power, per §8.
    ///
    /// The first leader of a fresh cluster writes its group config instead of a blank entry, so
    /// the bootstrap membership becomes durable through the log like any other change.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let payload = if self.core.last_log_id.index == 0 {
            EntryPayload::ConfigChange(self.core.membership.clone())
        } else {
            EntryPayload::Blank
        };
        let entry = self.append_payload_to_log(payload).await?;
        self.initial_index = entry.log_id.index;
        if let EntryPayload::ConfigChange(_) = &entry.payload {
            self.core.membership_index = entry.log_id.index;
        }
        tracing::debug!(id = self.core.id, term = self.core.current_term, initial_index = self.initial_index, "leader appended initial entry");
        self.replicate_to_followers();
        Ok(())
    }

    /// Handle client read requests.
    ///
    /// Reads are answered only after the first entry of this term is committed, so the leader
    /// knows the latest commit index, and after a quorum has confirmed it is still the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) fn handle_client_read_request(&mut self, tx: ClientReadResponseTx) {
        if self.core.commit_index < self.initial_index {
            self.pending_reads.push(tx);
            return;
        }
        self.spawn_read_quorum_check(vec![tx]);
    }

    /// Release the reads which were waiting for the initial entry to commit.
    pub(super) fn flush_pending_reads(&mut self) {
        if self.pending_reads.is_empty() || self.core.commit_index < self.initial_index {
            return;
        }
        let txs = std::mem::take(&mut self.pending_reads);
        self.spawn_read_quorum_check(txs);
    }

    /// Run one round of heartbeats to every voter, answering the given reads with its outcome.
    fn spawn_read_quorum_check(&self, txs: Vec<ClientReadResponseTx>) {
        let mut needed = self.core.membership.majority();
        if self.core.membership.contains(&self.core.id) {
            needed -= 1;
        }
        if needed == 0 {
            for tx in txs {
                let _ = tx.send(Ok(()));
            }
            return;
        }

        let peers: Vec<(NodeId, LogId)> = self
            .core
            .membership
            .ids()
            .filter(|id| id != &self.core.id)
            .map(|id| (id, self.nodes.get(&id).map(|node| node.matched).unwrap_or_default()))
            .collect();
        let (term, leader_id, leader_commit) = (self.core.current_term, self.core.id, self.core.commit_index);
        let (network, permits) = (self.core.network.clone(), self.core.permits.clone());
        let replication_tx = self.replication_tx.clone();
        let ttl = Duration::from_millis(self.core.config.replication_read_timeout);

        tokio::spawn(
            async move {
                let mut pending = peers
                    .into_iter()
                    .map(|(target, matched)| {
                        let rpc = AppendEntriesRequest {
                            term,
                            leader_id,
                            prev_log_id: matched,
                            entries: vec![],
                            leader_commit,
                        };
                        let (network, permits) = (network.clone(), permits.clone());
                        async move {
                            let _permit = permits.acquire().await;
                            (target, network.append_entries(target, rpc).await)
                        }
                    })
                    .collect::<FuturesUnordered<_>>();

                let confirm = async {
                    let mut acks = 0;
                    while let Some((target, res)) = pending.next().await {
                        match res {
                            Ok(res) if res.term > term => {
                                let _ = replication_tx.send(ReplicaEvent::RevertToFollower { target, term: res.term });
                                return ReadOutcome::Deposed;
                            }
                            Ok(_) => {
                                acks += 1;
                                if acks >= needed {
                                    return ReadOutcome::Confirmed;
                                }
                            }
                            Err(err) => tracing::debug!({error=%err, target}, "peer did not confirm leadership"),
                        }
                    }
                    ReadOutcome::Unconfirmed
                };
                let outcome = timeout(ttl, confirm).await.unwrap_or(ReadOutcome::Unconfirmed);
                tracing::debug!(?outcome, "read quorum round finished");
                for tx in txs {
                    let _ = tx.send(outcome.into_result());
                }
            }
            .instrument(tracing::debug_span!("confirming leadership for reads", term)),
        );
    }

    /// Handle client write requests.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(
        &mut self,
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    ) {
        let entry = match self.append_payload_to_log(EntryPayload::Normal(rpc.entry)).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return;
            }
        };
        self.awaiting_applied.insert(entry.log_id.index, tx);
        self.replicate_to_followers();
    }

    /// Transform the given payload into an entry, assign an index and term, and append the entry to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId::new(self.core.current_term, self.core.last_log_id.index + 1),
            payload,
        };
        self.core
            .storage
            .append_to_log(std::slice::from_ref(&entry))
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = entry.log_id;
        self.core.report_metrics();
        Ok(entry)
    }

    /// Let every replication stream know about the new end of the log.
    ///
    /// The commit index is re-evaluated right away, which is what commits entries in a single
    /// voter cluster.
    pub(super) fn replicate_to_followers(&mut self) {
        let event = RaftEvent::Replicate {
            last_log_index: self.core.last_log_id.index,
            commit_index: self.core.commit_index,
        };
        for node in self.nodes.values().chain(self.non_voters.values()) {
            let _ = node.repl_stream.repl_tx.send(event.clone());
        }
        self.update_commit_index();
    }

    /// Deliver state machine responses to the clients waiting for them.
    pub(super) fn respond_applied(&mut self, applied: Vec<(u64, R)>) {
        for (index, data) in applied {
            if let Some(tx) = self.awaiting_applied.remove(&index) {
                let _ = tx.send(Ok(ClientWriteResponse { index, data }));
            }
        }
    }
}

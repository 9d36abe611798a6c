//! The Raft network interface.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::raft::{AppendEntriesRequest, AppendEntriesResponse};
use crate::raft::{InstallSnapshotRequest, InstallSnapshotResponse};
use crate::raft::{VoteRequest, VoteResponse};
use crate::{AppData, NodeId};

/// A trait defining the interface for a Raft network between cluster members.
///
/// Each call is one request/response exchange with the target node. Implementations decide how
/// requests are encoded and transported; the peer's address can be looked up in the current
/// group config. Any transport failure should be returned as an error, the engine treats it as
/// a lost message and retries on its own schedule.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where
    D: AppData,
{
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;
}

/// A shared bound on the number of outbound RPCs a node has in flight.
#[derive(Clone, Debug)]
pub(crate) struct RpcPermits(Option<Arc<Semaphore>>);

impl RpcPermits {
    /// A limit of zero means no bound.
    pub(crate) fn new(limit: usize) -> Self {
        if limit == 0 {
            Self(None)
        } else {
            Self(Some(Arc::new(Semaphore::new(limit))))
        }
    }

    /// Wait for a free slot. The slot is released when the returned permit is dropped.
    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.0 {
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        }
    }
}

//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use kraft::async_trait::async_trait;
use kraft::error::{ChangeConfigError, ClientReadError, ClientWriteError};
use kraft::metrics::{RaftMetrics, Wait};
use kraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteRequest, ClientWriteResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use kraft::{Config, Endpoint, NodeId, Raft, RaftNetwork, RaftStorage, State};
use memstore::{ClientRequest, ClientResponse, MemStore};
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<ClientRequest, ClientResponse, RaftRouter, MemStore>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_target(false)
        .try_init();
}

/// A Raft config with timings suited to tests: fast elections and heartbeats.
pub fn test_config() -> Config {
    test_config_builder().validate().expect("failed to build Raft config")
}

pub fn test_config_builder() -> kraft::ConfigBuilder {
    Config::build("test".into())
        .election_timeout_min(300)
        .election_timeout_max(600)
        .replication_interval(50)
        .replication_read_timeout(200)
        .new_node_read_timeout(500)
        .new_node_advance_timeout(2000)
}

/// The endpoint a test node is reachable at. The router never dials it.
pub fn endpoint(id: NodeId) -> Endpoint {
    Endpoint::new("127.0.0.1", 7000 + id as u16)
}

pub async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (MemRaft, Arc<MemStore>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
    /// The number of AppendEntries RPCs each node has attempted to send.
    append_entries_sent: RwLock<BTreeMap<NodeId, u64>>,
    /// The most entries any single AppendEntries RPC has carried.
    largest_append_batch: RwLock<usize>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
            append_entries_sent: Default::default(),
            largest_append_batch: Default::default(),
        }
    }

    /// Create and register a new Raft node bearing the given ID.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) {
        let memstore = Arc::new(MemStore::new(id));
        self.new_raft_node_with_sto(id, memstore).await
    }

    /// Create and register a Raft node on top of the given storage, such as the storage of a
    /// node which was shut down.
    pub async fn new_raft_node_with_sto(self: &Arc<Self>, id: NodeId, sto: Arc<MemStore>) {
        let node = Raft::new(id, self.config.clone(), self.clone(), sto.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, sto));
    }

    /// Remove the target node from the routing table & isolation.
    pub async fn remove_node(&self, id: NodeId) -> Option<(MemRaft, Arc<MemStore>)> {
        let opt_handles = {
            let mut rt = self.routing_table.write().await;
            rt.remove(&id)
        };
        self.isolated_nodes.write().await.remove(&id);
        opt_handles
    }

    /// Shut the node down and hand back its storage.
    pub async fn shutdown_node(&self, id: NodeId) -> Result<Arc<MemStore>> {
        let (node, sto) = self.remove_node(id).await.ok_or_else(|| anyhow!("node {} not found", id))?;
        node.shutdown().await?;
        Ok(sto)
    }

    /// Initialize all nodes based on the config in the routing table.
    pub async fn initialize_from_single_node(&self, node: NodeId) -> Result<()> {
        tracing::info!({ node }, "initializing cluster from single node");
        let members = {
            let rt = self.routing_table.read().await;
            rt.keys().map(|id| (*id, endpoint(*id))).collect::<BTreeMap<_, _>>()
        };
        self.initialize_with(node, members.keys().copied().collect()).await
    }

    /// Initialize the given node with a group config of the given members.
    pub async fn initialize_with(&self, node: NodeId, members: BTreeSet<NodeId>) -> Result<()> {
        let raft = self.get_raft_handle(node).await?;
        raft.initialize(members.into_iter().map(|id| (id, endpoint(id))).collect()).await?;
        Ok(())
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: NodeId) {
        let mut nodes = self.isolated_nodes.write().await;
        nodes.remove(&id);
    }

    /// The number of AppendEntries RPCs the given node has attempted to send, isolated or not.
    pub async fn append_entries_sent(&self, id: NodeId) -> u64 {
        self.append_entries_sent.read().await.get(&id).copied().unwrap_or_default()
    }

    /// The most entries any single AppendEntries RPC routed so far has carried.
    pub async fn largest_append_batch(&self) -> usize {
        *self.largest_append_batch.read().await
    }

    pub async fn get_raft_handle(&self, id: NodeId) -> Result<MemRaft> {
        let rt = self.routing_table.read().await;
        let (raft, _) = rt.get(&id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?;
        Ok(raft.clone())
    }

    /// Get the storage of the target node.
    pub async fn get_storage_handle(&self, id: NodeId) -> Result<Arc<MemStore>> {
        let rt = self.routing_table.read().await;
        let (_, sto) = rt.get(&id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?;
        Ok(sto.clone())
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        let mut metrics = vec![];
        for node in rt.values() {
            metrics.push(node.0.metrics().borrow().clone());
        }
        metrics
    }

    /// Get a handle to wait for the metrics of the target node to satisfy some condition.
    pub async fn wait(&self, node_id: NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let node = self.get_raft_handle(node_id).await?;
        Ok(node.wait(timeout))
    }

    /// Wait for the given nodes to have appended and applied exactly `want_log` entries.
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(*id, timeout).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to reach the given state.
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(*id, timeout).await?.state(want_state, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to see exactly `members` as the voting members.
    pub async fn wait_for_members(
        &self,
        node_ids: &BTreeSet<NodeId>,
        members: BTreeSet<NodeId>,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(*id, timeout).await?.members(members.clone(), msg).await?;
        }
        Ok(())
    }

    /// Wait for one of the reachable nodes to be leader, returning its ID.
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("timeout after {:?} waiting for a leader: {}", timeout, msg));
            }
            sleep_ms(50).await;
        }
    }

    /// Get the ID of the current leader, ignoring isolated nodes.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.current_leader == Some(node.id) && node.state == State::Leader {
                if isolated.contains(&node.id) {
                    None
                } else {
                    Some(node.id)
                }
            } else {
                None
            }
        })
    }

    /// Request the current leader from the target node.
    pub async fn current_leader(&self, target: NodeId) -> Option<NodeId> {
        let node = self.get_raft_handle(target).await.ok()?;
        node.current_leader().await
    }

    /// Send a read request to the target node.
    pub async fn client_read(&self, target: NodeId) -> Result<(), ClientReadError> {
        let node = self.get_raft_handle(target).await.map_err(|_| ClientReadError::ForwardToLeader(None))?;
        node.client_read().await
    }

    /// Send a client request to the target node, causing test failure on error.
    pub async fn client_request(&self, target: NodeId, client_id: &str, serial: u64) -> ClientResponse {
        match self.send_client_request(target, client_request(client_id, serial)).await {
            Ok(res) => res.data,
            Err(err) => panic!("client request {}:{} to node {} failed: {:?}", client_id, serial, target, err),
        }
    }

    /// Request the target node to apply the given request, returning the raw outcome.
    pub async fn send_client_request(
        &self,
        target: NodeId,
        req: ClientRequest,
    ) -> Result<ClientWriteResponse<ClientResponse>, ClientWriteError<ClientRequest>> {
        let node = self
            .get_raft_handle(target)
            .await
            .unwrap_or_else(|err| panic!("node {} not found: {}", target, err));
        node.client_write(ClientWriteRequest::new(req)).await
    }

    /// Send multiple client requests to the target node, causing test failure on error.
    pub async fn client_request_many(&self, target: NodeId, client_id: &str, count: usize) {
        for idx in 0..count {
            self.client_request(target, client_id, idx as u64).await;
        }
    }

    /// Add the target node as a voter, through the given leader.
    pub async fn add_voter(&self, leader: NodeId, target: NodeId) -> Result<(), ChangeConfigError> {
        let node = self.get_raft_handle(leader).await.map_err(|_| ChangeConfigError::NodeNotLeader(None))?;
        node.add_voter(target, endpoint(target)).await
    }

    /// Remove the target node from the voters, through the given leader.
    pub async fn remove_voter(&self, leader: NodeId, target: NodeId) -> Result<(), ChangeConfigError> {
        let node = self.get_raft_handle(leader).await.map_err(|_| ChangeConfigError::NodeNotLeader(None))?;
        node.remove_voter(target).await
    }

    //////////////////////////////////////////////////////////////////////////////////////////////

    /// Assert that the cluster is in a pristine state, with all nodes as non-voters.
    pub async fn assert_pristine_cluster(&self) {
        let nodes = self.latest_metrics().await;
        for node in nodes.iter() {
            assert!(
                node.current_leader.is_none(),
                "node {} has a current leader, expected none",
                node.id
            );
            assert_eq!(node.state, State::NonVoter, "node is in state {:?}, expected NonVoter", node.state);
            assert_eq!(node.current_term, 0, "node {} has term {}, expected 0", node.id, node.current_term);
            assert_eq!(node.last_applied, 0, "node {} has last_applied {}, expected 0", node.id, node.last_applied);
            assert_eq!(node.last_log_index, 0, "node {} has last_log_index {}, expected 0", node.id, node.last_log_index);
            assert!(node.membership_config.is_empty(), "node {} has a group config, expected none", node.id);
        }
    }

    /// Assert that the cluster has an elected leader, and is in a stable state with all nodes uniform.
    ///
    /// If `expected_term` is `Some`, then all nodes will be tested to ensure that they are in the
    /// given term. Else, the leader's current term will be used for the assertion.
    ///
    /// If `expected_last_log` is `Some`, then all nodes will be tested to ensure that their last
    /// log index and last applied log match the given value. Else, the leader's last_log_index
    /// will be used for the assertion.
    pub async fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.read().await.clone();
        let nodes = self.latest_metrics().await;

        let non_isolated_nodes: Vec<_> = nodes.iter().filter(|node| !isolated.contains(&node.id)).collect();
        let leader = nodes
            .iter()
            .filter(|node| !isolated.contains(&node.id))
            .find(|node| node.state == State::Leader)
            .expect("expected to find a cluster leader");
        let followers: Vec<_> = nodes
            .iter()
            .filter(|node| !isolated.contains(&node.id))
            .filter(|node| node.state == State::Follower)
            .collect();

        assert_eq!(
            followers.len() + 1,
            non_isolated_nodes.len(),
            "expected all nodes to be followers with one leader, got 1 leader and {} followers, expected {} followers",
            followers.len(),
            non_isolated_nodes.len() - 1,
        );
        let expected_term = expected_term.unwrap_or(leader.current_term);
        let expected_last_log = expected_last_log.unwrap_or(leader.last_log_index);
        let all_nodes = nodes.iter().map(|node| node.id).collect::<BTreeSet<_>>();
        for node in non_isolated_nodes.iter() {
            assert_eq!(
                node.current_leader,
                Some(leader.id),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader.id
            );
            assert_eq!(
                node.current_term, expected_term,
                "node {} has term {}, expected {}",
                node.id, node.current_term, expected_term
            );
            assert_eq!(
                node.last_log_index, expected_last_log,
                "node {} has last_log_index {}, expected {}",
                node.id, node.last_log_index, expected_last_log
            );
            assert_eq!(
                node.last_applied, expected_last_log,
                "node {} has last_applied {}, expected {}",
                node.id, node.last_applied, expected_last_log
            );
            let members = node.membership_config.ids().collect::<BTreeSet<_>>();
            assert_eq!(
                members, all_nodes,
                "node {} has membership {:?}, expected {:?}",
                node.id, members, all_nodes
            );
        }
    }

    /// Assert against the state of the storage system per node in the cluster.
    pub async fn assert_storage_state(&self, expect_term: u64, expect_last_log: u64, expect_voted_for: Option<NodeId>) {
        let rt = self.routing_table.read().await;
        for (id, (_node, storage)) in rt.iter() {
            let last_log = storage.get_log().await.keys().last().copied().unwrap_or(0);
            let snapshot_index = storage
                .get_current_snapshot()
                .await
                .expect("failed to read snapshot")
                .map(|snap| snap.meta.last_log_id.index)
                .unwrap_or(0);
            assert_eq!(
                std::cmp::max(last_log, snapshot_index),
                expect_last_log,
                "expected node {} to have last log {}, got {}",
                id,
                expect_last_log,
                last_log
            );

            let hs = storage.read_hard_state().await.clone().expect("expected hard state to be present");
            assert_eq!(
                hs.current_term, expect_term,
                "expected node {} to have term {}, got {}",
                id, expect_term, hs.current_term
            );
            if let Some(voted_for) = expect_voted_for {
                assert_eq!(
                    hs.voted_for,
                    Some(voted_for),
                    "expected node {} to have voted for {}, got {:?}",
                    id,
                    voted_for,
                    hs.voted_for
                );
            }

            let sm = storage.get_state_machine().await;
            assert_eq!(
                sm.last_applied_log.index, expect_last_log,
                "expected node {} to have state machine last_applied_log {}, got {}",
                id, expect_last_log, sm.last_applied_log.index
            );
        }
    }
}

/// Build a client request for the memstore state machine.
pub fn client_request(client_id: &str, serial: u64) -> ClientRequest {
    ClientRequest {
        client: client_id.into(),
        serial,
        status: format!("request-{}", serial),
    }
}

#[async_trait]
impl RaftNetwork<ClientRequest> for RaftRouter {
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn append_entries(
        &self,
        target: u64,
        rpc: AppendEntriesRequest<ClientRequest>,
    ) -> Result<AppendEntriesResponse> {
        *self.append_entries_sent.write().await.entry(rpc.leader_id).or_default() += 1;
        {
            let mut largest = self.largest_append_batch.write().await;
            *largest = (*largest).max(rpc.entries.len());
        }
        let node = self.reachable(rpc.leader_id, target).await?;
        Ok(node.append_entries(rpc).await?)
    }

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn install_snapshot(&self, target: u64, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        let node = self.reachable(rpc.leader_id, target).await?;
        Ok(node.install_snapshot(rpc).await?)
    }

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn vote(&self, target: u64, rpc: VoteRequest) -> Result<VoteResponse> {
        let node = self.reachable(rpc.candidate_id, target).await?;
        Ok(node.vote(rpc).await?)
    }
}

impl RaftRouter {
    /// The handle of the target node, or an error if either end of the link is isolated.
    async fn reachable(&self, source: NodeId, target: NodeId) -> Result<MemRaft> {
        {
            let isolated = self.isolated_nodes.read().await;
            if isolated.contains(&target) || isolated.contains(&source) {
                return Err(anyhow!("target node {} is isolated", target));
            }
        }
        self.get_raft_handle(target).await
    }
}

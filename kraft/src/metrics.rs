//! Raft metrics for observability.
//!
//! Metrics are observed on a running Raft node via the `Raft::metrics()` method, which returns a
//! watch channel always holding the latest value. Applications may export them, or use them to
//! drive higher level decisions such as routing client requests to the leader.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::State;
use crate::membership::{GroupMode, MembershipConfig};
use crate::{LogId, MessageSummary, NodeId};

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to be appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index to be applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The highest log index known to be committed.
    pub commit_index: u64,
    /// The current cluster leader.
    pub current_leader: Option<NodeId>,
    /// The current membership config of the cluster.
    pub membership_config: MembershipConfig,
    /// Whether a membership change is in progress. Only a leader ever reports `Changing`.
    pub group_mode: GroupMode,
    /// The last log id covered by this node's current snapshot.
    pub snapshot: LogId,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::NonVoter,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            commit_index: 0,
            current_leader: None,
            membership_config: MembershipConfig::default(),
            group_mode: GroupMode::Stable,
            snapshot: LogId::default(),
        }
    }
}

impl MessageSummary for RaftMetrics {
    fn summary(&self) -> String {
        format!(
            "id:{}, {:?}, term:{}, last_log:{}, last_applied:{}, commit:{}, leader:{:?}, members:{:?}, {:?}, snapshot:{}",
            self.id,
            self.state,
            self.current_term,
            self.last_log_index,
            self.last_applied,
            self.commit_index,
            self.current_leader,
            self.membership_config.members.keys().collect::<Vec<_>>(),
            self.group_mode,
            self.snapshot,
        )
    }
}

// Error variants related to metrics.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("raft is shutting down")]
    ShuttingDown,
}

/// Wait is a wrapper of the RaftMetrics channel with utilities to wait for the metrics to
/// satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy some condition or timeout.
    #[tracing::instrument(level = "trace", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let timeout_at = Instant::now() + self.timeout;

        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();

            tracing::debug!("id={} wait {} latest: {}", latest.id, msg.to_string(), latest.summary());

            if func(&latest) {
                return Ok(latest);
            }

            let now = Instant::now();
            if now >= timeout_at {
                return Err(WaitError::Timeout(
                    self.timeout,
                    format!("{} latest: {}", msg.to_string(), latest.summary()),
                ));
            }

            tokio::select! {
                _ = tokio::time::sleep_until(timeout_at) => {
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {}", msg.to_string(), latest.summary())));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::ShuttingDown);
                    }
                }
            };
        }
    }

    /// Wait for `current_leader` to become `Some(leader_id)` until timeout.
    pub async fn current_leader(&self, leader_id: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.current_leader == Some(leader_id),
            &format!("{} .current_leader -> {}", msg.to_string(), leader_id),
        )
        .await
    }

    /// Wait until exactly `want_log` logs are appended and applied, or timeout.
    pub async fn log(&self, want_log: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index == want_log && x.last_applied == want_log,
            &format!("{} .last_log_index & .last_applied -> {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait until at least `want_log` logs are appended and applied, or timeout.
    pub async fn log_at_least(&self, want_log: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index >= want_log && x.last_applied >= want_log,
            &format!("{} .last_applied >= {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait for `state` to become `want_state` or timeout.
    pub async fn state(&self, want_state: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.state == want_state,
            &format!("{} .state -> {:?}", msg.to_string(), want_state),
        )
        .await
    }

    /// Wait for the voting members to become exactly `want_members` or timeout.
    pub async fn members(&self, want_members: BTreeSet<NodeId>, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.membership_config.ids().collect::<BTreeSet<_>>() == want_members,
            &format!("{} .membership_config.members -> {:?}", msg.to_string(), want_members),
        )
        .await
    }

    /// Wait for `snapshot` to become `want_snapshot` or timeout.
    pub async fn snapshot(&self, want_snapshot: LogId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.snapshot == want_snapshot,
            &format!("{} .snapshot -> {}", msg.to_string(), want_snapshot),
        )
        .await
    }
}

//! Error types exposed by this crate.

use std::fmt;

use thiserror::Error;

use crate::{AppData, NodeId};

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    ///
    /// Storage errors are fatal: the node shuts down after reporting one.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An internal Raft error indicating that Raft is shutting down.
    #[error("Raft is shutting down")]
    ShuttingDown,
}

impl From<tokio::io::Error> for RaftError {
    fn from(src: tokio::io::Error) -> Self {
        RaftError::RaftStorage(src.into())
    }
}

/// An error related to a client read request.
#[derive(Debug, Error)]
pub enum ClientReadError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client read request must be forwarded to the cluster leader, if one is known.
    #[error("the client read request must be forwarded to the cluster leader")]
    ForwardToLeader(Option<NodeId>),
    /// The leader could not confirm its leadership with a quorum within the read timeout.
    #[error("leadership could not be confirmed by a quorum of the cluster")]
    Unavailable,
}

/// An error related to a client write request.
#[derive(Error)]
pub enum ClientWriteError<D: AppData> {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    ///
    /// The original payload is handed back along with the ID of the leader, if known.
    #[error("the client write request must be forwarded to the cluster leader")]
    ForwardToLeader(D, Option<NodeId>),
    /// Leadership was lost before the request was applied. The entry may or may not be
    /// committed by a later leader.
    #[error("leadership was lost before the client write request was applied")]
    Unavailable,
}

impl<D: AppData> fmt::Debug for ClientWriteError<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientWriteError::RaftError(err) => f.debug_tuple("RaftError").field(err).finish(),
            ClientWriteError::ForwardToLeader(_req, node_id) => f.debug_tuple("ForwardToLeader").field(node_id).finish(),
            ClientWriteError::Unavailable => f.write_str("Unavailable"),
        }
    }
}

/// Error variants related to configuration.
#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The given values for election timeout min & max are invalid: max must be greater than min.
    #[error("given values for election timeout min & max are invalid: max must be greater than min")]
    InvalidElectionTimeoutMinMax,
    /// The replication interval must be non-zero and below the minimum election timeout.
    #[error("the replication interval must be non-zero and less than the minimum election timeout")]
    InvalidReplicationInterval,
    /// A replication batch limit of zero would never make progress.
    #[error("the given value for a replication entries limit is too small, must be > 0")]
    MaxReplicationEntriesTooSmall,
    #[error("the given value for snapshot_data_length is too small, must be > 0")]
    SnapshotDataLengthTooSmall,
    #[error("the given value for new_node_max_round is too small, must be > 0")]
    NewNodeMaxRoundTooSmall,
}

/// The set of errors which may take place when initializing a pristine Raft node.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InitializeError {
    /// An internal error has taken place.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the Raft node's current state.
    #[error("the requested action is not allowed due to the Raft node's current state")]
    NotAllowed,
}

/// The set of errors which may take place when requesting a membership change.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChangeConfigError {
    /// An error related to the processing of the config change request.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// Another change was still in progress when this one timed out waiting for it.
    #[error("the cluster is already undergoing a configuration change")]
    ConfigChangeInProgress,
    /// The given config would leave the cluster in an inoperable state, such as removing the
    /// last member.
    #[error("the given config would leave the cluster in an inoperable state")]
    InoperableConfig,
    /// The node the config change proposal was sent to was not the leader of the cluster, or lost
    /// leadership while processing it. The ID of the current leader is returned if known.
    #[error("this node is not the Raft leader")]
    NodeNotLeader(Option<NodeId>),
    /// The proposed config change would make no difference to the current config.
    #[error("the proposed config change would have no effect, this is a no-op")]
    Noop,
    /// The joining node did not advance its log within the configured advance timeout.
    #[error("node {node} made no replication progress within the advance timeout")]
    CatchUpTimeout { node: NodeId },
    /// The joining node did not catch up with the leader's log within the allowed rounds.
    #[error("node {node} did not catch up within {rounds} replication rounds")]
    CatchUpRoundsExhausted { node: NodeId, rounds: u64 },
}

impl<D: AppData> From<ClientWriteError<D>> for ChangeConfigError {
    fn from(src: ClientWriteError<D>) -> Self {
        match src {
            ClientWriteError::RaftError(err) => Self::RaftError(err),
            ClientWriteError::ForwardToLeader(_, id) => Self::NodeNotLeader(id),
            ClientWriteError::Unavailable => Self::NodeNotLeader(None),
        }
    }
}

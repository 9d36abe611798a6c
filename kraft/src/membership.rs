//! Cluster membership: the group of voting nodes and the arithmetic of quorums over it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// The network address of a cluster member.
///
/// The engine never dials an endpoint itself; it is carried in the replicated group config so
/// that every member, and the `RaftNetwork` implementation, agrees on where peers live.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Whether a membership change is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMode {
    /// No change is in progress.
    Stable,
    /// A joining node is being caught up, or a group config entry is not yet committed.
    Changing,
}

impl Default for GroupMode {
    fn default() -> Self {
        GroupMode::Stable
    }
}

/// The set of voting members of the cluster.
///
/// Membership changes one server at a time: any two consecutive configs differ by exactly one
/// member, so any majority of the old config intersects any majority of the new one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    pub members: BTreeMap<NodeId, Endpoint>,
}

impl MembershipConfig {
    pub fn new(members: BTreeMap<NodeId, Endpoint>) -> Self {
        Self { members }
    }

    /// Check if the given NodeId is a voting member.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains_key(id)
    }

    pub fn endpoint(&self, id: &NodeId) -> Option<&Endpoint> {
        self.members.get(id)
    }

    /// IDs of all voting members, in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The number of members which constitutes a majority of this config.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Check whether the given set of nodes contains a majority of this config. Nodes outside of
    /// the config are not counted.
    pub fn is_majority(&self, granted: &BTreeSet<NodeId>) -> bool {
        !self.members.is_empty() && granted.iter().filter(|id| self.contains(id)).count() >= self.majority()
    }

    /// A copy of this config with the given member added.
    pub fn with_member(&self, id: NodeId, endpoint: Endpoint) -> Self {
        let mut members = self.members.clone();
        members.insert(id, endpoint);
        Self { members }
    }

    /// A copy of this config with the given member removed.
    pub fn without_member(&self, id: NodeId) -> Self {
        let mut members = self.members.clone();
        members.remove(&id);
        Self { members }
    }
}

//! Raft runtime configuration.

use std::borrow::Borrow;
use std::fmt::Display;
use std::str::FromStr;

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 3000;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 4000;
/// Default delay before a replication stream sends its first request, in milliseconds.
pub const DEFAULT_REPLICATION_DELAY: u64 = 0;
/// Default replication (heartbeat) interval, in milliseconds.
pub const DEFAULT_REPLICATION_INTERVAL: u64 = 1000;
/// Default timeout for a single replication request, in milliseconds.
pub const DEFAULT_REPLICATION_READ_TIMEOUT: u64 = 900;
/// Default snapshot chunk length, in bytes.
pub const DEFAULT_SNAPSHOT_DATA_LENGTH: u64 = 1024;
/// Default threshold for when to trigger a snapshot.
pub const DEFAULT_LOGS_SINCE_LAST: u64 = 5000;
/// Default maximum number of catch-up rounds for a joining node.
pub const DEFAULT_NEW_NODE_MAX_ROUND: u64 = 10;
/// Default timeout for a single replication request to a joining node, in milliseconds.
pub const DEFAULT_NEW_NODE_READ_TIMEOUT: u64 = 3000;
/// Default time a joining node may go without making progress, in milliseconds.
pub const DEFAULT_NEW_NODE_ADVANCE_TIMEOUT: u64 = 3000;
/// Default time a queued membership change may wait for the previous one. Zero waits forever.
pub const DEFAULT_PREVIOUS_GROUP_CONFIG_CHANGE_TIMEOUT: u64 = 0;
/// Default bound on concurrent outbound RPCs. Zero means unbounded.
pub const DEFAULT_WORKER_THREADS: usize = 0;

/// Property keys understood by `ConfigBuilder::from_properties`.
pub mod keys {
    pub const ELECTION_TIMEOUT_MIN: &str = "election.timeout.min";
    pub const ELECTION_TIMEOUT_MAX: &str = "election.timeout.max";
    pub const REPLICATION_DELAY: &str = "replication.delay";
    pub const REPLICATION_INTERVAL: &str = "replication.interval";
    pub const REPLICATION_READ_TIMEOUT: &str = "replication.timeout.read";
    pub const MAX_REPLICATION_ENTRIES: &str = "replication.entries.max";
    pub const SNAPSHOT_DATA_LENGTH: &str = "snapshot.data.length";
    pub const SNAPSHOT_LOGS_SINCE_LAST: &str = "snapshot.logs-since-last";
    pub const NEW_NODE_MAX_REPLICATION_ENTRIES: &str = "new-node.replication.entries.max";
    pub const NEW_NODE_MAX_ROUND: &str = "new-node.round.max";
    pub const NEW_NODE_READ_TIMEOUT: &str = "new-node.timeout.read";
    pub const NEW_NODE_ADVANCE_TIMEOUT: &str = "new-node.timeout.advance";
    pub const PREVIOUS_GROUP_CONFIG_CHANGE_TIMEOUT: &str = "group.config.change.timeout";
    pub const WORKER_THREADS: &str = "connector.workers";
}

/// Property value meaning "no limit" for the entry batch limits.
pub const ALL_ENTRIES: i64 = -1;

/// Log compaction and snapshot policy.
///
/// This governs when periodic snapshots will be taken. A leader always ships the current snapshot
/// to a follower whose next needed entry has already been compacted away.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST)
    }
}

/// The runtime configuration for a Raft node.
///
/// When building the configuration, keep `broadcastTime ≪ electionTimeout ≪ MTBF` in mind: the
/// replication interval must be well below the minimum election timeout so that followers keep
/// hearing from a healthy leader, and the election timeout should be short compared to the time
/// between real failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    ///
    /// This does not influence the Raft protocol in any way, but is useful for observability.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// Delay in milliseconds before a new replication stream sends its first request.
    pub replication_delay: u64,
    /// The interval in milliseconds at which a leader replicates to (or heartbeats) each peer.
    pub replication_interval: u64,
    /// Timeout in milliseconds for a single replication request, and for the quorum round which
    /// confirms leadership before a read.
    pub replication_read_timeout: u64,
    /// The maximum number of entries sent in one `AppendEntries` request. `None` is unbounded.
    pub max_replication_entries: Option<u64>,
    /// The length in bytes of each `InstallSnapshot` chunk.
    pub snapshot_data_length: u64,
    /// The snapshot policy to use for a Raft node.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum number of entries per request while catching up a joining node. `None` is
    /// unbounded.
    pub max_replication_entries_for_new_node: Option<u64>,
    /// The number of catch-up rounds a joining node may take before the change is abandoned.
    pub new_node_max_round: u64,
    /// Timeout in milliseconds for a single replication request to a joining node.
    pub new_node_read_timeout: u64,
    /// Time in milliseconds a joining node may go without advancing before the change is
    /// abandoned.
    pub new_node_advance_timeout: u64,
    /// Time in milliseconds a membership change may wait behind an in-progress one before it is
    /// rejected. Zero waits indefinitely.
    pub previous_group_config_change_timeout: u64,
    /// Upper bound on concurrently outstanding outbound RPCs. Zero means no bound.
    pub worker_threads: usize,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            replication_delay: None,
            replication_interval: None,
            replication_read_timeout: None,
            max_replication_entries: None,
            snapshot_data_length: None,
            snapshot_policy: None,
            max_replication_entries_for_new_node: None,
            new_node_max_round: None,
            new_node_read_timeout: None,
            new_node_advance_timeout: None,
            previous_group_config_change_timeout: None,
            worker_threads: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }

    /// The batch limit for a regular replication stream.
    pub(crate) fn batch_limit(&self) -> u64 {
        self.max_replication_entries.unwrap_or(u64::MAX)
    }

    /// The batch limit for a stream catching up a joining node.
    pub(crate) fn new_node_batch_limit(&self) -> u64 {
        self.max_replication_entries_for_new_node.unwrap_or(u64::MAX)
    }
}

/// A configuration builder to ensure that runtime config is valid.
///
/// Unset values fall back to their defaults when `validate` is called.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigBuilder {
    pub cluster_name: String,
    pub election_timeout_min: Option<u64>,
    pub election_timeout_max: Option<u64>,
    pub replication_delay: Option<u64>,
    pub replication_interval: Option<u64>,
    pub replication_read_timeout: Option<u64>,
    /// `Some(None)` explicitly selects unbounded batches.
    pub max_replication_entries: Option<Option<u64>>,
    pub snapshot_data_length: Option<u64>,
    pub snapshot_policy: Option<SnapshotPolicy>,
    pub max_replication_entries_for_new_node: Option<Option<u64>>,
    pub new_node_max_round: Option<u64>,
    pub new_node_read_timeout: Option<u64>,
    pub new_node_advance_timeout: Option<u64>,
    pub previous_group_config_change_timeout: Option<u64>,
    pub worker_threads: Option<usize>,
}

impl ConfigBuilder {
    /// Start a builder from a set of key/value properties, such as the contents of a properties
    /// file.
    ///
    /// Keys are those in [`keys`], optionally preceded by `prefix` (joined with a `.`). A value
    /// which cannot be parsed is reported and replaced by the default. Unknown keys are ignored.
    pub fn from_properties<I, K, V>(cluster_name: String, prefix: Option<&str>, props: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Borrow<str>,
        V: Borrow<str>,
    {
        let mut builder = Config::build(cluster_name);
        for (key, value) in props {
            let key = key.borrow();
            let key = match prefix {
                Some(prefix) => match key.strip_prefix(prefix).and_then(|k| k.strip_prefix('.')) {
                    Some(k) => k,
                    None => continue,
                },
                None => key,
            };
            let value = value.borrow().trim();
            match key {
                keys::ELECTION_TIMEOUT_MIN => builder.election_timeout_min = parse_or_default(key, value),
                keys::ELECTION_TIMEOUT_MAX => builder.election_timeout_max = parse_or_default(key, value),
                keys::REPLICATION_DELAY => builder.replication_delay = parse_or_default(key, value),
                keys::REPLICATION_INTERVAL => builder.replication_interval = parse_or_default(key, value),
                keys::REPLICATION_READ_TIMEOUT => builder.replication_read_timeout = parse_or_default(key, value),
                keys::MAX_REPLICATION_ENTRIES => builder.max_replication_entries = parse_entries_limit(key, value),
                keys::SNAPSHOT_DATA_LENGTH => builder.snapshot_data_length = parse_or_default(key, value),
                keys::SNAPSHOT_LOGS_SINCE_LAST => {
                    builder.snapshot_policy = parse_or_default(key, value).map(SnapshotPolicy::LogsSinceLast)
                }
                keys::NEW_NODE_MAX_REPLICATION_ENTRIES => {
                    builder.max_replication_entries_for_new_node = parse_entries_limit(key, value)
                }
                keys::NEW_NODE_MAX_ROUND => builder.new_node_max_round = parse_or_default(key, value),
                keys::NEW_NODE_READ_TIMEOUT => builder.new_node_read_timeout = parse_or_default(key, value),
                keys::NEW_NODE_ADVANCE_TIMEOUT => builder.new_node_advance_timeout = parse_or_default(key, value),
                keys::PREVIOUS_GROUP_CONFIG_CHANGE_TIMEOUT => {
                    builder.previous_group_config_change_timeout = parse_or_default(key, value)
                }
                keys::WORKER_THREADS => builder.worker_threads = parse_or_default(key, value),
                _ => tracing::trace!(key, "ignoring unknown config property"),
            }
        }
        builder
    }

    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `replication_delay`.
    pub fn replication_delay(mut self, val: u64) -> Self {
        self.replication_delay = Some(val);
        self
    }

    /// Set the desired value for `replication_interval`.
    pub fn replication_interval(mut self, val: u64) -> Self {
        self.replication_interval = Some(val);
        self
    }

    /// Set the desired value for `replication_read_timeout`.
    pub fn replication_read_timeout(mut self, val: u64) -> Self {
        self.replication_read_timeout = Some(val);
        self
    }

    /// Set the desired value for `max_replication_entries`. `None` is unbounded.
    pub fn max_replication_entries(mut self, val: Option<u64>) -> Self {
        self.max_replication_entries = Some(val);
        self
    }

    /// Set the desired value for `snapshot_data_length`.
    pub fn snapshot_data_length(mut self, val: u64) -> Self {
        self.snapshot_data_length = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the desired value for `max_replication_entries_for_new_node`. `None` is unbounded.
    pub fn max_replication_entries_for_new_node(mut self, val: Option<u64>) -> Self {
        self.max_replication_entries_for_new_node = Some(val);
        self
    }

    /// Set the desired value for `new_node_max_round`.
    pub fn new_node_max_round(mut self, val: u64) -> Self {
        self.new_node_max_round = Some(val);
        self
    }

    /// Set the desired value for `new_node_read_timeout`.
    pub fn new_node_read_timeout(mut self, val: u64) -> Self {
        self.new_node_read_timeout = Some(val);
        self
    }

    /// Set the desired value for `new_node_advance_timeout`.
    pub fn new_node_advance_timeout(mut self, val: u64) -> Self {
        self.new_node_advance_timeout = Some(val);
        self
    }

    /// Set the desired value for `previous_group_config_change_timeout`.
    pub fn previous_group_config_change_timeout(mut self, val: u64) -> Self {
        self.previous_group_config_change_timeout = Some(val);
        self
    }

    /// Set the desired value for `worker_threads`.
    pub fn worker_threads(mut self, val: usize) -> Self {
        self.worker_threads = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let replication_interval = self.replication_interval.unwrap_or(DEFAULT_REPLICATION_INTERVAL);
        if replication_interval == 0 || replication_interval >= election_timeout_min {
            return Err(ConfigError::InvalidReplicationInterval);
        }
        let max_replication_entries = self.max_replication_entries.unwrap_or(None);
        let max_replication_entries_for_new_node = self.max_replication_entries_for_new_node.unwrap_or(None);
        if max_replication_entries == Some(0) || max_replication_entries_for_new_node == Some(0) {
            return Err(ConfigError::MaxReplicationEntriesTooSmall);
        }
        let snapshot_data_length = self.snapshot_data_length.unwrap_or(DEFAULT_SNAPSHOT_DATA_LENGTH);
        if snapshot_data_length == 0 {
            return Err(ConfigError::SnapshotDataLengthTooSmall);
        }
        let new_node_max_round = self.new_node_max_round.unwrap_or(DEFAULT_NEW_NODE_MAX_ROUND);
        if new_node_max_round == 0 {
            return Err(ConfigError::NewNodeMaxRoundTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            replication_delay: self.replication_delay.unwrap_or(DEFAULT_REPLICATION_DELAY),
            replication_interval,
            replication_read_timeout: self.replication_read_timeout.unwrap_or(DEFAULT_REPLICATION_READ_TIMEOUT),
            max_replication_entries,
            snapshot_data_length,
            snapshot_policy: self.snapshot_policy.unwrap_or_default(),
            max_replication_entries_for_new_node,
            new_node_max_round,
            new_node_read_timeout: self.new_node_read_timeout.unwrap_or(DEFAULT_NEW_NODE_READ_TIMEOUT),
            new_node_advance_timeout: self.new_node_advance_timeout.unwrap_or(DEFAULT_NEW_NODE_ADVANCE_TIMEOUT),
            previous_group_config_change_timeout: self
                .previous_group_config_change_timeout
                .unwrap_or(DEFAULT_PREVIOUS_GROUP_CONFIG_CHANGE_TIMEOUT),
            worker_threads: self.worker_threads.unwrap_or(DEFAULT_WORKER_THREADS),
        })
    }
}

fn parse_or_default<T>(key: &str, value: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    match value.parse::<T>() {
        Ok(val) => Some(val),
        Err(err) => {
            tracing::warn!(key, value, error=%err, "illegal config property value, using default");
            None
        }
    }
}

fn parse_entries_limit(key: &str, value: &str) -> Option<Option<u64>> {
    match value.parse::<i64>() {
        Ok(ALL_ENTRIES) => Some(None),
        Ok(val) if val > 0 => Some(Some(val as u64)),
        Ok(_) => {
            tracing::warn!(key, value, "illegal config property value, using default");
            None
        }
        Err(err) => {
            tracing::warn!(key, value, error=%err, "illegal config property value, using default");
            None
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

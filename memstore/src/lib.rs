//! An in-memory storage system implementing the `kraft::RaftStorage` trait.
//!
//! The state machine is a small key/value table recording the latest status of each client,
//! deduplicated by request serial number so that a retried request is applied exactly once.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use kraft::async_trait::async_trait;
use kraft::raft::{Entry, EntryPayload};
use kraft::storage::{EffectiveMembership, HardState, InitialState, Snapshot, SnapshotMeta};
use kraft::{AppData, AppDataResponse, LogId, NodeId, RaftStorage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};

/// The application data request type which the `MemStore` works with.
///
/// Conceptually, for demo purposes, this represents an update to a client's status info,
/// returning the previously recorded status.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientRequest {
    /// The ID of the client which has sent the request.
    pub client: String,
    /// The serial number of this request.
    pub serial: u64,
    /// A string describing the status of the client. For a real application, this should probably
    /// be an enum representing all of the various types of requests / operations which a client
    /// can perform.
    pub status: String,
}

impl AppData for ClientRequest {}

/// The application data response type which the `MemStore` works with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, derive_more::From)]
pub struct ClientResponse(pub Option<String>);

impl AppDataResponse for ClientResponse {}

/// Error used to trigger Raft shutdown from storage.
#[derive(Clone, Debug, Error)]
pub enum ShutdownError {
    #[error("unsafe storage error")]
    UnsafeStorageError,
}

/// The application snapshot type which the `MemStore` works with.
#[derive(Debug)]
pub struct MemStoreSnapshot {
    pub meta: SnapshotMeta,
    /// The data of the state machine at the time of this snapshot.
    pub data: Vec<u8>,
}

/// The state machine of the `MemStore`.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct MemStoreStateMachine {
    pub last_applied_log: LogId,
    /// The latest applied group config.
    pub last_membership: EffectiveMembership,
    /// A mapping of client IDs to their state info.
    pub client_serial_responses: HashMap<String, (u64, Option<String>)>,
    /// The current status of a client by ID.
    pub client_status: HashMap<String, String>,
}

/// An in-memory storage system implementing the `kraft::RaftStorage` trait.
pub struct MemStore {
    /// The ID of the Raft node for which this memory storage instances is configured.
    id: NodeId,
    /// The Raft log.
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    /// The Raft state machine.
    sm: RwLock<MemStoreStateMachine>,
    /// The current hard state.
    hs: RwLock<Option<HardState>>,
    /// Distinguishes the snapshots built by this store.
    snapshot_idx: AtomicU64,
    /// The current snapshot.
    current_snapshot: RwLock<Option<MemStoreSnapshot>>,
}

impl MemStore {
    /// Create a new `MemStore` instance.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            sm: RwLock::new(MemStoreStateMachine::default()),
            hs: RwLock::new(None),
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(None),
        }
    }

    /// The ID of the node this store belongs to.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get a handle to the log for testing purposes.
    pub async fn get_log(&self) -> RwLockReadGuard<'_, BTreeMap<u64, Entry<ClientRequest>>> {
        self.log.read().await
    }

    /// Get a handle to the state machine for testing purposes.
    pub async fn get_state_machine(&self) -> RwLockReadGuard<'_, MemStoreStateMachine> {
        self.sm.read().await
    }

    /// Get a handle to the current hard state for testing purposes.
    pub async fn read_hard_state(&self) -> RwLockReadGuard<'_, Option<HardState>> {
        self.hs.read().await
    }
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    type SnapshotData = Cursor<Vec<u8>>;

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_membership_config(&self) -> Result<EffectiveMembership> {
        let log = self.log.read().await;
        let cfg_opt = log.values().rev().find_map(|entry| match &entry.payload {
            EntryPayload::ConfigChange(cfg) => Some(EffectiveMembership {
                log_index: entry.log_id.index,
                membership: cfg.clone(),
            }),
            _ => None,
        });
        match cfg_opt {
            Some(cfg) => Ok(cfg),
            // Older configs were compacted into the state machine.
            None => Ok(self.sm.read().await.last_membership.clone()),
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let mut hs = self.hs.write().await;
        let log = self.log.read().await;
        let sm = self.sm.read().await;
        match &*hs {
            Some(inner) => {
                let last_log_id = match log.values().next_back() {
                    Some(entry) => entry.log_id,
                    None => sm.last_applied_log,
                };
                Ok(InitialState {
                    last_log_id,
                    last_applied: sm.last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                let new = InitialState::new_initial();
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<ClientRequest>>> {
        // Invalid request, return empty vec.
        if start > stop {
            tracing::error!("invalid request, start > stop");
            return Ok(vec![]);
        }
        let log = self.log.read().await;
        Ok(log.range(start..stop).map(|(_, val)| val.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&index).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete_logs_from(&self, start: u64) -> Result<()> {
        let mut log = self.log.write().await;
        let _ = log.split_off(&start);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_to_log(&self, entries: &[Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry.clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply_to_state_machine(&self, entries: &[Entry<ClientRequest>]) -> Result<Vec<ClientResponse>> {
        let mut sm = self.sm.write().await;
        let mut res = Vec::with_capacity(entries.len());

        for entry in entries {
            tracing::debug!(%entry.log_id, "id:{} replicate to sm", self.id);

            if entry.log_id.index > sm.last_applied_log.index + 1 {
                tracing::error!(%entry.log_id, last_applied=%sm.last_applied_log, "entries must be applied without gaps");
                return Err(ShutdownError::UnsafeStorageError.into());
            }
            if entry.log_id.index > sm.last_applied_log.index {
                sm.last_applied_log = entry.log_id;
            }

            match &entry.payload {
                EntryPayload::Blank => res.push(ClientResponse(None)),
                EntryPayload::Normal(data) => {
                    if let Some((serial, r)) = sm.client_serial_responses.get(&data.client) {
                        if serial == &data.serial {
                            res.push(ClientResponse(r.clone()));
                            continue;
                        }
                    }
                    let previous = sm.client_status.insert(data.client.clone(), data.status.clone());
                    sm.client_serial_responses.insert(data.client.clone(), (data.serial, previous.clone()));
                    res.push(previous.into());
                }
                EntryPayload::ConfigChange(cfg) => {
                    sm.last_membership = EffectiveMembership {
                        log_index: entry.log_id.index,
                        membership: cfg.clone(),
                    };
                    res.push(ClientResponse(None))
                }
            };
        }
        Ok(res)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self) -> Result<Snapshot<Self::SnapshotData>> {
        let (data, last_applied_log, membership);
        {
            // Serialize the data of the state machine.
            let sm = self.sm.read().await;
            data = serde_json::to_vec(&*sm)?;
            last_applied_log = sm.last_applied_log;
            membership = sm.last_membership.membership.clone();
        } // Release state machine read lock.

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = format!("{}-{}-{}", last_applied_log.term, last_applied_log.index, snapshot_idx);
        let meta = SnapshotMeta {
            last_log_id: last_applied_log,
            membership,
            snapshot_id,
        };

        {
            let mut log = self.log.write().await;
            let mut current_snapshot = self.current_snapshot.write().await;
            *log = log.split_off(&(last_applied_log.index + 1));
            *current_snapshot = Some(MemStoreSnapshot {
                meta: meta.clone(),
                data: data.clone(),
            });
        } // Release log & snapshot write locks.

        tracing::info!({ snapshot_size = data.len() }, "log compaction complete");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn begin_receiving_snapshot(&self) -> Result<Box<Self::SnapshotData>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn finalize_snapshot_installation(
        &self,
        meta: &SnapshotMeta,
        snapshot: Box<Self::SnapshotData>,
    ) -> Result<()> {
        tracing::info!(
            { snapshot_size = snapshot.get_ref().len() },
            "decoding snapshot for installation"
        );
        let new_sm: MemStoreStateMachine = serde_json::from_slice(snapshot.get_ref())?;

        // Update log.
        {
            let mut log = self.log.write().await;
            let last = meta.last_log_id;
            let retained = log.get(&last.index).map(|entry| entry.log_id == last).unwrap_or(false);
            if retained {
                *log = log.split_off(&(last.index + 1));
            } else {
                log.clear();
            }
        }

        // Update the state machine.
        *self.sm.write().await = new_sm;

        // Update current snapshot.
        let mut current_snapshot = self.current_snapshot.write().await;
        *current_snapshot = Some(MemStoreSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        });
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot<Self::SnapshotData>>> {
        match &*self.current_snapshot.read().await {
            Some(snapshot) => Ok(Some(Snapshot {
                meta: snapshot.meta.clone(),
                snapshot: Box::new(Cursor::new(snapshot.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use kraft::{Endpoint, MembershipConfig};
    use maplit::hashmap;

    use super::*;

    fn request(client: &str, serial: u64, status: &str) -> ClientRequest {
        ClientRequest {
            client: client.into(),
            serial,
            status: status.into(),
        }
    }

    fn normal(term: u64, index: u64, req: ClientRequest) -> Entry<ClientRequest> {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Normal(req),
        }
    }

    fn group(ids: &[NodeId]) -> MembershipConfig {
        MembershipConfig::new(ids.iter().map(|id| (*id, Endpoint::new("localhost", 7000 + *id as u16))).collect())
    }

    fn config_entry(term: u64, index: u64, ids: &[NodeId]) -> Entry<ClientRequest> {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::ConfigChange(group(ids)),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_pristine_initial_state() -> Result<()> {
        let store = MemStore::new(0);
        let state = store.get_initial_state().await?;
        assert_eq!(state, InitialState::new_initial());
        assert_eq!(store.read_hard_state().await.clone(), Some(HardState::default()));
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_initial_state_after_writes() -> Result<()> {
        let store = MemStore::new(0);
        let hs = HardState {
            current_term: 2,
            voted_for: Some(1),
        };
        store.save_hard_state(&hs).await?;
        store
            .append_to_log(&[config_entry(1, 1, &[0, 1]), normal(2, 2, request("c", 1, "a"))])
            .await?;
        store.apply_to_state_machine(&store.get_log_entries(1, 2).await?).await?;

        let state = store.get_initial_state().await?;
        assert_eq!(state.last_log_id, LogId::new(2, 2));
        assert_eq!(state.last_applied, LogId::new(1, 1));
        assert_eq!(state.hard_state, hs);
        assert_eq!(state.membership.log_index, 1);
        assert_eq!(state.membership.membership, group(&[0, 1]));
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_delete_logs_from_truncates_suffix() -> Result<()> {
        let store = MemStore::new(0);
        let entries = (1..=5).map(|i| normal(1, i, request("c", i, "s"))).collect::<Vec<_>>();
        store.append_to_log(&entries).await?;

        store.delete_logs_from(3).await?;
        assert_eq!(store.get_log().await.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert!(store.try_get_log_entry(3).await?.is_none());
        assert_eq!(store.get_log_entries(1, 10).await?.len(), 2);
        assert!(store.get_log_entries(5, 1).await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_apply_deduplicates_by_serial() -> Result<()> {
        let store = MemStore::new(0);
        let entries = vec![
            normal(1, 1, request("c", 1, "first")),
            normal(1, 2, request("c", 1, "first")),
            normal(1, 3, request("c", 2, "second")),
        ];
        store.append_to_log(&entries).await?;

        let res = store.apply_to_state_machine(&entries).await?;
        assert_eq!(res, vec![ClientResponse(None), ClientResponse(None), ClientResponse(Some("first".into()))]);

        let sm = store.get_state_machine().await;
        assert_eq!(sm.last_applied_log, LogId::new(1, 3));
        assert_eq!(sm.client_status.get("c"), Some(&"second".to_string()));
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_apply_rejects_gaps() -> Result<()> {
        let store = MemStore::new(0);
        let res = store.apply_to_state_machine(&[normal(1, 2, request("c", 1, "s"))]).await;
        assert!(res.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_membership_falls_back_to_state_machine() -> Result<()> {
        let store = MemStore::new(0);
        assert_eq!(store.get_membership_config().await?, EffectiveMembership::default());

        let entries = vec![config_entry(1, 1, &[0]), normal(1, 2, request("c", 1, "s"))];
        store.append_to_log(&entries).await?;
        store.apply_to_state_machine(&entries).await?;
        store.do_log_compaction().await?;
        assert!(store.get_log().await.is_empty());

        let membership = store.get_membership_config().await?;
        assert_eq!(membership.log_index, 1);
        assert_eq!(membership.membership, group(&[0]));
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_compaction_keeps_unapplied_entries() -> Result<()> {
        let store = MemStore::new(0);
        let entries = (1..=4).map(|i| normal(1, i, request("c", i, "s"))).collect::<Vec<_>>();
        store.append_to_log(&entries).await?;
        store.apply_to_state_machine(&entries[..2]).await?;

        let snapshot = store.do_log_compaction().await?;
        assert_eq!(snapshot.meta.last_log_id, LogId::new(1, 2));
        assert_eq!(store.get_log().await.keys().copied().collect::<Vec<_>>(), vec![3, 4]);

        let current = store.get_current_snapshot().await?.expect("snapshot should exist");
        assert_eq!(current.meta, snapshot.meta);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_install_snapshot_retains_matching_log_suffix() -> Result<()> {
        let leader = MemStore::new(0);
        let entries = (1..=3).map(|i| normal(1, i, request("c", i, "s"))).collect::<Vec<_>>();
        leader.append_to_log(&entries).await?;
        leader.apply_to_state_machine(&entries[..2]).await?;
        let snapshot = leader.do_log_compaction().await?;

        // A follower holding the snapshot's last entry keeps what follows it.
        let follower = MemStore::new(1);
        follower.append_to_log(&entries).await?;
        follower.finalize_snapshot_installation(&snapshot.meta, snapshot.snapshot).await?;
        assert_eq!(follower.get_log().await.keys().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(follower.get_state_machine().await.last_applied_log, LogId::new(1, 2));

        // A follower with a conflicting entry at that index loses its whole log.
        let snapshot = leader.get_current_snapshot().await?.expect("snapshot should exist");
        let diverged = MemStore::new(2);
        diverged.append_to_log(&[normal(1, 1, request("c", 1, "s")), normal(2, 2, request("x", 1, "y"))]).await?;
        diverged.finalize_snapshot_installation(&snapshot.meta, snapshot.snapshot).await?;
        assert!(diverged.get_log().await.is_empty());
        let sm = diverged.get_state_machine().await;
        assert_eq!(sm.client_status, hashmap! {"c".to_string() => "s".to_string()});
        Ok(())
    }
}

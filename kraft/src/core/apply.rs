use anyhow::anyhow;
use futures::stream::StreamExt;
use tokio::task::JoinError;
use tracing_futures::Instrument;

use crate::core::RaftCore;
use crate::error::RaftResult;
use crate::{AppData, AppDataResponse, LogId, RaftNetwork, RaftStorage};

/// The outcome of one apply task.
pub(super) struct ApplyResult<R> {
    /// The id of the last entry the task applied.
    pub last_applied: LogId,
    /// The state machine's response for each applied entry, keyed by log index.
    pub responses: Vec<(u64, R)>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Spawn a task applying every committed but unapplied entry, unless one is already running.
    ///
    /// Only one apply task runs at a time; whatever is committed while it runs is picked up by
    /// the next one, so entries reach the state machine exactly once and in log order.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_apply_if_needed(&mut self) {
        if !self.apply_handle.is_empty() {
            return;
        }
        let stop = std::cmp::min(self.commit_index, self.last_log_id.index);
        if stop <= self.last_applied.index {
            return;
        }
        let start = self.last_applied.index + 1;
        let storage = self.storage.clone();
        let handle = tokio::spawn(
            async move {
                let entries = storage.get_log_entries(start, stop + 1).await?;
                let expected = (stop + 1 - start) as usize;
                if entries.len() != expected || entries.first().map(|e| e.log_id.index) != Some(start) {
                    return Err(anyhow!(
                        "missing log entries to apply in range [{}, {}], found {}",
                        start,
                        stop,
                        entries.len()
                    ));
                }
                let data = storage.apply_to_state_machine(&entries).await?;
                if data.len() != entries.len() {
                    return Err(anyhow!(
                        "state machine returned {} responses for {} entries",
                        data.len(),
                        entries.len()
                    ));
                }
                let last_applied = entries[entries.len() - 1].log_id;
                let responses = entries.iter().map(|entry| entry.log_id.index).zip(data).collect();
                Ok(ApplyResult {
                    last_applied,
                    responses,
                })
            }
            .instrument(tracing::debug_span!("apply", start, stop)),
        );
        self.apply_handle.push_back(handle);
    }

    /// Record the outcome of a finished apply task and start the next one if needed.
    ///
    /// Any failure is fatal: the node shuts down.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(super) fn handle_apply_result(
        &mut self,
        res: Result<anyhow::Result<ApplyResult<R>>, JoinError>,
    ) -> RaftResult<Vec<(u64, R)>> {
        let responses = self.record_apply_result(res)?;
        self.trigger_log_compaction_if_needed(false);
        self.spawn_apply_if_needed();
        Ok(responses)
    }

    /// Wait for the in-flight apply task, if any, without starting another one.
    ///
    /// Used before the state machine is replaced by a snapshot.
    pub(super) async fn drain_apply(&mut self) -> RaftResult<()> {
        while let Some(res) = self.apply_handle.next().await {
            self.record_apply_result(res)?;
        }
        Ok(())
    }

    fn record_apply_result(
        &mut self,
        res: Result<anyhow::Result<ApplyResult<R>>, JoinError>,
    ) -> RaftResult<Vec<(u64, R)>> {
        let applied = match res {
            Ok(Ok(applied)) => applied,
            Ok(Err(err)) => return Err(self.map_fatal_storage_error(err)),
            Err(err) => return Err(self.map_fatal_storage_error(anyhow::Error::new(err))),
        };
        if applied.last_applied.index > self.last_applied.index {
            self.last_applied = applied.last_applied;
        }
        self.report_metrics();
        Ok(applied.responses)
    }
}

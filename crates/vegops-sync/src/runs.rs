//! Persistence wrapper around the sync-run state machine: the run row is
//! inserted as `started` when work begins and mutated exactly once at the
//! end, into a terminal state.

use tracing::warn;
use vegops_core::{SyncCounts, SyncErrorDetail, SyncRun, SyncRunKind, SyncTrigger};
use vegops_storage::{StoreError, SyncRunStore};

pub struct RunTracker<'a, S: SyncRunStore + ?Sized> {
    store: &'a S,
    run: SyncRun,
}

impl<'a, S: SyncRunStore + ?Sized> RunTracker<'a, S> {
    pub async fn start(
        store: &'a S,
        kind: SyncRunKind,
        trigger: SyncTrigger,
        scope: serde_json::Value,
    ) -> Result<Self, StoreError> {
        let run = SyncRun::start(kind, trigger, scope);
        store.insert_sync_run(&run).await?;
        Ok(Self { store, run })
    }

    pub fn run_id(&self) -> uuid::Uuid {
        self.run.id
    }

    /// Finishes a run whose batch completed, deriving completed/warning/
    /// failed from the counts and error list.
    pub async fn complete(
        mut self,
        counts: SyncCounts,
        errors: Vec<SyncErrorDetail>,
    ) -> Result<SyncRun, StoreError> {
        self.run.finish(counts, errors);
        self.store.complete_sync_run(&self.run).await?;
        Ok(self.run)
    }

    /// Records an aborted run. The caller re-raises the causing error after
    /// this returns, so a secondary persistence failure must not mask it.
    pub async fn abort(mut self, error_type: &str, message: &str) -> SyncRun {
        self.run.fail(error_type, message);
        if let Err(store_err) = self.store.complete_sync_run(&self.run).await {
            warn!(run_id = %self.run.id, error = %store_err, "failed to persist aborted run");
        }
        self.run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vegops_core::SyncRunStatus;
    use vegops_storage::MemStore;

    #[tokio::test]
    async fn start_persists_a_started_row() {
        let store = MemStore::new();
        let tracker = RunTracker::start(
            &store,
            SyncRunKind::CircuitSync,
            SyncTrigger::Manual,
            serde_json::json!({ "statuses": ["ACTIV"] }),
        )
        .await
        .unwrap();
        let run_id = tracker.run_id();

        let runs = store.sync_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run_id);
        assert_eq!(runs[0].status, SyncRunStatus::Started);
    }

    #[tokio::test]
    async fn complete_writes_the_terminal_state_once() {
        let store = MemStore::new();
        let tracker = RunTracker::start(
            &store,
            SyncRunKind::DailyRollup,
            SyncTrigger::Scheduled,
            serde_json::Value::Null,
        )
        .await
        .unwrap();

        let run = tracker
            .complete(
                SyncCounts {
                    processed: 4,
                    ..SyncCounts::default()
                },
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(run.status, SyncRunStatus::Completed);

        let stored = store.sync_runs().pop().unwrap();
        assert_eq!(stored.status, SyncRunStatus::Completed);
        assert_eq!(stored.counts.processed, 4);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn abort_records_the_failure() {
        let store = MemStore::new();
        let tracker = RunTracker::start(
            &store,
            SyncRunKind::CircuitSync,
            SyncTrigger::Manual,
            serde_json::Value::Null,
        )
        .await
        .unwrap();

        let run = tracker.abort("SourceError", "health probe failed").await;
        assert_eq!(run.status, SyncRunStatus::Failed);

        let stored = store.sync_runs().pop().unwrap();
        assert_eq!(stored.status, SyncRunStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("SourceError: health probe failed")
        );
    }
}

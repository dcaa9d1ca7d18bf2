//! Retention pruning: snapshots and sync runs older than the configured
//! window are deleted, as a tracked run of its own.

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::info;
use vegops_core::{SyncCounts, SyncRun, SyncRunKind, SyncTrigger};
use vegops_storage::PipelineStore;

use crate::runs::RunTracker;

pub async fn prune_expired<S: PipelineStore>(
    store: &S,
    retention_days: u32,
    trigger: SyncTrigger,
) -> Result<SyncRun> {
    let cutoff_at = Utc::now() - Duration::days(i64::from(retention_days));
    let cutoff_date = cutoff_at.date_naive();

    let tracker = RunTracker::start(
        store,
        SyncRunKind::Prune,
        trigger,
        serde_json::json!({ "retention_days": retention_days, "cutoff": cutoff_date }),
    )
    .await?;

    let snapshots = store.prune_snapshots_before(cutoff_date).await?;
    let runs = store.prune_sync_runs_before(cutoff_at).await?;
    info!(snapshots, runs, %cutoff_date, "retention prune finished");

    let counts = SyncCounts {
        processed: (snapshots + runs) as i64,
        ..SyncCounts::default()
    };
    Ok(tracker.complete(counts, Vec::new()).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;
    use vegops_core::{CircuitSnapshot, CircuitSnapshotType, SyncRunStatus};
    use vegops_storage::{MemStore, SnapshotStore};

    #[tokio::test]
    async fn prune_removes_old_snapshots_and_reports_counts() {
        let store = MemStore::new();
        let circuit_id = Uuid::new_v4();
        let old = CircuitSnapshot {
            id: Uuid::new_v4(),
            circuit_id,
            snapshot_type: CircuitSnapshotType::Daily,
            snapshot_date: chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            status_code: "ACTIV".into(),
            percent_complete: 10.0,
            miles_planned: 1.0,
            total_miles: 2.0,
            total_units: 0,
            captured_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap(),
        };
        store.upsert_circuit_snapshot(&old).await.unwrap();

        let run = prune_expired(&store, 365, SyncTrigger::Manual).await.unwrap();
        assert_eq!(run.status, SyncRunStatus::Completed);
        assert_eq!(run.counts.processed, 1);
    }
}

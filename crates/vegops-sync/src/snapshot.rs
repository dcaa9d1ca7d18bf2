//! Snapshot capture: milestone/status-triggered planned-units snapshots with
//! content-hash dedup, plus the daily circuit-snapshot pass.

use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;
use vegops_core::{
    Circuit, CircuitSnapshot, CircuitSnapshotType, PlannedUnitsSnapshot, SnapshotTrigger,
    SyncCounts, SyncErrorDetail, SyncRun, SyncRunKind, SyncTrigger, WorkUnit,
};
use vegops_storage::{CircuitFilter, PipelineStore};

use crate::progress::ProgressReporter;
use crate::runs::RunTracker;

/// Deterministic hash over the normalized unit list. Order-independent so a
/// reordered fetch of the same content hashes identically.
pub fn content_hash(units: &[WorkUnit]) -> String {
    let mut lines: Vec<String> = units
        .iter()
        .map(|unit| {
            format!(
                "{}|{}|{}|{}|{}",
                unit.external_id,
                unit.type_code,
                unit.quantity,
                unit.unit_of_measure,
                unit.permission_status.as_str()
            )
        })
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub struct SnapshotManager<S> {
    store: Arc<S>,
    milestone_thresholds: Vec<f64>,
}

impl<S: PipelineStore> SnapshotManager<S> {
    pub fn new(store: Arc<S>, milestone_thresholds: Vec<f64>) -> Self {
        Self {
            store,
            milestone_thresholds,
        }
    }

    /// Evaluates snapshot triggers for a circuit: a status transition, a
    /// newly crossed milestone threshold, or a manual request. Returns the
    /// created snapshot, or `None` when nothing fired or an identical
    /// capture already exists (idempotent under retries).
    pub async fn create_snapshot_if_needed(
        &self,
        circuit: &Circuit,
        units: &[WorkUnit],
        previous_status: Option<&str>,
        previous_percent: f64,
        manual: bool,
    ) -> Result<Option<PlannedUnitsSnapshot>> {
        let trigger = if manual {
            Some(SnapshotTrigger::Manual)
        } else if previous_status != Some(circuit.status_code.as_str()) {
            Some(SnapshotTrigger::StatusChange)
        } else {
            self.newly_crossed_milestone(previous_percent, circuit.percent_complete)
                .map(SnapshotTrigger::for_milestone)
        };
        let Some(trigger) = trigger else {
            return Ok(None);
        };

        let hash = content_hash(units);
        if self
            .store
            .planned_units_snapshot_exists(circuit.id, &hash)
            .await?
        {
            debug!(circuit = %circuit.external_id, %hash, "identical snapshot exists, skipping");
            return Ok(None);
        }

        let snapshot = PlannedUnitsSnapshot {
            id: Uuid::new_v4(),
            circuit_id: circuit.id,
            trigger,
            content_hash: hash,
            unit_count: units.len() as i64,
            status_code: circuit.status_code.clone(),
            percent_complete: circuit.percent_complete,
            miles_planned: circuit.miles_planned,
            units_json: serde_json::to_value(units)?,
            captured_at: Utc::now(),
        };
        self.store.insert_planned_units_snapshot(&snapshot).await?;
        Ok(Some(snapshot))
    }

    /// Highest milestone threshold crossed between the two percent values.
    fn newly_crossed_milestone(&self, previous: f64, current: f64) -> Option<f64> {
        self.milestone_thresholds
            .iter()
            .copied()
            .filter(|threshold| previous < *threshold && current >= *threshold)
            .fold(None, |best, threshold| match best {
                Some(b) if b >= threshold => Some(b),
                _ => Some(threshold),
            })
    }

    /// Daily pass: one circuit snapshot per non-closed, non-excluded circuit
    /// per day. Circuits already captured today are counted as skipped;
    /// per-circuit failures are isolated and reported.
    pub async fn run_daily_snapshots(
        &self,
        date: NaiveDate,
        trigger: SyncTrigger,
        reporter: &dyn ProgressReporter,
    ) -> Result<SyncRun> {
        let tracker = RunTracker::start(
            self.store.as_ref(),
            SyncRunKind::DailySnapshots,
            trigger,
            serde_json::json!({ "date": date }),
        )
        .await?;
        reporter.started("daily snapshots");

        let circuits = self
            .store
            .list_circuits(&CircuitFilter::not_excluded().and_not_closed())
            .await?;
        let total = circuits.len();

        let mut counts = SyncCounts::default();
        let mut errors = Vec::new();

        for (index, circuit) in circuits.iter().enumerate() {
            reporter.progress(index + 1, total, &circuit.external_id);
            match self.snapshot_one(circuit, date).await {
                Ok(true) => {
                    counts.processed += 1;
                    counts.snapshots_created += 1;
                }
                Ok(false) => counts.skipped += 1,
                Err(err) => {
                    reporter.error(&format!("{}: {err:#}", circuit.external_id));
                    errors.push(SyncErrorDetail {
                        entity_id: circuit.external_id.clone(),
                        message: format!("{err:#}"),
                    });
                }
            }
        }

        reporter.completed("daily snapshots");
        Ok(tracker.complete(counts, errors).await?)
    }

    async fn snapshot_one(&self, circuit: &Circuit, date: NaiveDate) -> Result<bool> {
        if self
            .store
            .circuit_snapshot_exists(circuit.id, CircuitSnapshotType::Daily, date)
            .await?
        {
            return Ok(false);
        }

        let total_units = self
            .store
            .latest_aggregate_at_or_before(circuit.id, date)
            .await?
            .map(|aggregate| aggregate.values.total_units)
            .unwrap_or(0);

        let snapshot = CircuitSnapshot {
            id: Uuid::new_v4(),
            circuit_id: circuit.id,
            snapshot_type: CircuitSnapshotType::Daily,
            snapshot_date: date,
            status_code: circuit.status_code.clone(),
            percent_complete: circuit.percent_complete,
            miles_planned: circuit.miles_planned,
            total_miles: circuit.total_miles,
            total_units,
            captured_at: Utc::now(),
        };
        self.store.upsert_circuit_snapshot(&snapshot).await?;
        Ok(true)
    }
}

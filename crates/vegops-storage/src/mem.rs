//! In-memory store used by the test suite and local dry runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;
use vegops_core::{
    Circuit, CircuitAggregate, CircuitSnapshot, CircuitSnapshotType, PlannedUnitsSnapshot,
    PlannerDailyAggregate, PlannerWeeklyAggregate, RegionalDailyAggregate,
    RegionalWeeklyAggregate, SyncRun, WorkUnit,
};

use crate::{
    AggregateStore, CircuitFilter, CircuitStore, RollupStore, SnapshotStore, StoreError,
    SyncRunStore,
};

#[derive(Debug, Default)]
struct Inner {
    circuits: HashMap<Uuid, Circuit>,
    work_units: HashMap<Uuid, Vec<WorkUnit>>,
    aggregates: HashMap<(Uuid, NaiveDate, bool), CircuitAggregate>,
    planned_snapshots: Vec<PlannedUnitsSnapshot>,
    circuit_snapshots: HashMap<(Uuid, CircuitSnapshotType, NaiveDate), CircuitSnapshot>,
    planner_daily: HashMap<(String, String, NaiveDate), PlannerDailyAggregate>,
    planner_weekly: HashMap<(String, String, NaiveDate), PlannerWeeklyAggregate>,
    regional_daily: HashMap<(String, NaiveDate), RegionalDailyAggregate>,
    regional_weekly: HashMap<(String, NaiveDate), RegionalWeeklyAggregate>,
    sync_runs: HashMap<Uuid, SyncRun>,
}

/// Mutex-backed implementation of every store trait. The single lock also
/// serializes overlapping writers the way the Postgres advisory locks do.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mem store mutex poisoned")
    }

    /// Test/diagnostic access: every recorded sync run, newest last.
    pub fn sync_runs(&self) -> Vec<SyncRun> {
        let mut runs: Vec<_> = self.lock().sync_runs.values().cloned().collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    /// Test/diagnostic access: planned-units snapshot count for a circuit.
    pub fn planned_snapshot_count(&self, circuit_id: Uuid) -> usize {
        self.lock()
            .planned_snapshots
            .iter()
            .filter(|s| s.circuit_id == circuit_id)
            .count()
    }

    /// Test/diagnostic access: all regional weekly rows.
    pub fn regional_weekly_rows(&self) -> Vec<RegionalWeeklyAggregate> {
        self.lock().regional_weekly.values().cloned().collect()
    }

    /// Test/diagnostic access: all planner weekly rows.
    pub fn planner_weekly_rows(&self) -> Vec<PlannerWeeklyAggregate> {
        self.lock().planner_weekly.values().cloned().collect()
    }

    /// Test/diagnostic access: all planner daily rows.
    pub fn planner_daily_rows(&self) -> Vec<PlannerDailyAggregate> {
        self.lock().planner_daily.values().cloned().collect()
    }

    /// Test/diagnostic access: all regional daily rows.
    pub fn regional_daily_rows(&self) -> Vec<RegionalDailyAggregate> {
        self.lock().regional_daily.values().cloned().collect()
    }
}

#[async_trait]
impl CircuitStore for MemStore {
    async fn circuit_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Circuit>, StoreError> {
        Ok(self
            .lock()
            .circuits
            .values()
            .find(|c| c.external_id == external_id)
            .cloned())
    }

    async fn insert_circuit(&self, circuit: &Circuit) -> Result<(), StoreError> {
        self.lock().circuits.insert(circuit.id, circuit.clone());
        Ok(())
    }

    async fn update_circuit(&self, circuit: &Circuit) -> Result<(), StoreError> {
        self.lock().circuits.insert(circuit.id, circuit.clone());
        Ok(())
    }

    async fn list_circuits(&self, filter: &CircuitFilter) -> Result<Vec<Circuit>, StoreError> {
        let mut circuits: Vec<_> = self
            .lock()
            .circuits
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        circuits.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(circuits)
    }

    async fn replace_work_units(
        &self,
        circuit_id: Uuid,
        units: &[WorkUnit],
    ) -> Result<(), StoreError> {
        self.lock().work_units.insert(circuit_id, units.to_vec());
        Ok(())
    }

    async fn work_units_for(&self, circuit_id: Uuid) -> Result<Vec<WorkUnit>, StoreError> {
        Ok(self.lock().work_units.get(&circuit_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl AggregateStore for MemStore {
    async fn aggregate_for(
        &self,
        circuit_id: Uuid,
        date: NaiveDate,
        is_rollup: bool,
    ) -> Result<Option<CircuitAggregate>, StoreError> {
        Ok(self.lock().aggregates.get(&(circuit_id, date, is_rollup)).cloned())
    }

    async fn latest_aggregate_at_or_before(
        &self,
        circuit_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<CircuitAggregate>, StoreError> {
        Ok(self
            .lock()
            .aggregates
            .values()
            .filter(|a| {
                a.circuit_id == circuit_id && !a.is_rollup && a.values.aggregate_date <= date
            })
            .max_by_key(|a| (a.values.aggregate_date, a.computed_at))
            .cloned())
    }

    async fn upsert_aggregate(&self, aggregate: &CircuitAggregate) -> Result<(), StoreError> {
        self.lock().aggregates.insert(
            (
                aggregate.circuit_id,
                aggregate.values.aggregate_date,
                aggregate.is_rollup,
            ),
            aggregate.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemStore {
    async fn planned_units_snapshot_exists(
        &self,
        circuit_id: Uuid,
        content_hash: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .planned_snapshots
            .iter()
            .any(|s| s.circuit_id == circuit_id && s.content_hash == content_hash))
    }

    async fn insert_planned_units_snapshot(
        &self,
        snapshot: &PlannedUnitsSnapshot,
    ) -> Result<(), StoreError> {
        self.lock().planned_snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn latest_planned_units_snapshot(
        &self,
        circuit_id: Uuid,
    ) -> Result<Option<PlannedUnitsSnapshot>, StoreError> {
        Ok(self
            .lock()
            .planned_snapshots
            .iter()
            .filter(|s| s.circuit_id == circuit_id)
            .max_by_key(|s| s.captured_at)
            .cloned())
    }

    async fn circuit_snapshot_exists(
        &self,
        circuit_id: Uuid,
        snapshot_type: CircuitSnapshotType,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .circuit_snapshots
            .contains_key(&(circuit_id, snapshot_type, date)))
    }

    async fn upsert_circuit_snapshot(&self, snapshot: &CircuitSnapshot) -> Result<(), StoreError> {
        self.lock().circuit_snapshots.insert(
            (snapshot.circuit_id, snapshot.snapshot_type, snapshot.snapshot_date),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn latest_miles_planned_at_or_before(
        &self,
        circuit_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<f64>, StoreError> {
        Ok(self
            .lock()
            .circuit_snapshots
            .values()
            .filter(|s| s.circuit_id == circuit_id && s.snapshot_date <= date)
            .max_by_key(|s| (s.snapshot_date, s.captured_at))
            .map(|s| s.miles_planned))
    }

    async fn prune_snapshots_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.planned_snapshots.len() + inner.circuit_snapshots.len();
        inner
            .planned_snapshots
            .retain(|s| s.captured_at.date_naive() >= cutoff);
        inner.circuit_snapshots.retain(|(_, _, date), _| *date >= cutoff);
        let after = inner.planned_snapshots.len() + inner.circuit_snapshots.len();
        Ok((before - after) as u64)
    }
}

#[async_trait]
impl RollupStore for MemStore {
    async fn upsert_planner_daily(&self, row: &PlannerDailyAggregate) -> Result<(), StoreError> {
        self.lock().planner_daily.insert(
            (row.planner.clone(), row.region.clone(), row.aggregate_date),
            row.clone(),
        );
        Ok(())
    }

    async fn upsert_planner_weekly(&self, row: &PlannerWeeklyAggregate) -> Result<(), StoreError> {
        self.lock().planner_weekly.insert(
            (row.planner.clone(), row.region.clone(), row.week_ending),
            row.clone(),
        );
        Ok(())
    }

    async fn upsert_regional_daily(&self, row: &RegionalDailyAggregate) -> Result<(), StoreError> {
        self.lock()
            .regional_daily
            .insert((row.region.clone(), row.aggregate_date), row.clone());
        Ok(())
    }

    async fn upsert_regional_weekly(
        &self,
        row: &RegionalWeeklyAggregate,
    ) -> Result<(), StoreError> {
        self.lock()
            .regional_weekly
            .insert((row.region.clone(), row.week_ending), row.clone());
        Ok(())
    }

    async fn regional_daily_in_window(
        &self,
        region: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RegionalDailyAggregate>, StoreError> {
        let mut rows: Vec<_> = self
            .lock()
            .regional_daily
            .values()
            .filter(|r| r.region == region && r.aggregate_date >= from && r.aggregate_date <= to)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.aggregate_date);
        Ok(rows)
    }

    async fn regions_with_daily_rows(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<String>, StoreError> {
        let regions: BTreeSet<_> = self
            .lock()
            .regional_daily
            .values()
            .filter(|r| r.aggregate_date >= from && r.aggregate_date <= to)
            .map(|r| r.region.clone())
            .collect();
        Ok(regions.into_iter().collect())
    }

    async fn regional_weekly_for(
        &self,
        region: &str,
        week_ending: NaiveDate,
    ) -> Result<Option<RegionalWeeklyAggregate>, StoreError> {
        Ok(self
            .lock()
            .regional_weekly
            .get(&(region.to_string(), week_ending))
            .cloned())
    }

    async fn planner_weekly_for(
        &self,
        planner: &str,
        region: &str,
        week_ending: NaiveDate,
    ) -> Result<Option<PlannerWeeklyAggregate>, StoreError> {
        Ok(self
            .lock()
            .planner_weekly
            .get(&(planner.to_string(), region.to_string(), week_ending))
            .cloned())
    }
}

#[async_trait]
impl SyncRunStore for MemStore {
    async fn insert_sync_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.lock().sync_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn complete_sync_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.lock().sync_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn prune_sync_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.sync_runs.len();
        inner.sync_runs.retain(|_, run| run.started_at >= cutoff);
        Ok((before - inner.sync_runs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vegops_core::{AggregateDraft, CircuitDraft};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).single().unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn circuit() -> Circuit {
        Circuit::from_draft(
            &CircuitDraft {
                external_id: "JOB-001".into(),
                work_order_code: "WO-1001".into(),
                region: "NORTH".into(),
                status_code: "ACTIV".into(),
                percent_complete: 40.0,
                total_miles: 12.5,
                miles_planned: Some(5.0),
                assigned_to: Some("pat".into()),
            },
            now(),
        )
    }

    #[tokio::test]
    async fn aggregate_upsert_replaces_by_natural_key() {
        let store = MemStore::new();
        let circuit = circuit();
        let date = d(2026, 3, 10);

        let mut draft = AggregateDraft {
            aggregate_date: date,
            total_units: 3,
            ..AggregateDraft::default()
        };
        store
            .upsert_aggregate(&CircuitAggregate::new(circuit.id, false, draft.clone(), now()))
            .await
            .unwrap();
        draft.total_units = 5;
        store
            .upsert_aggregate(&CircuitAggregate::new(circuit.id, false, draft, now()))
            .await
            .unwrap();

        let stored = store.aggregate_for(circuit.id, date, false).await.unwrap().unwrap();
        assert_eq!(stored.values.total_units, 5);
    }

    #[tokio::test]
    async fn latest_aggregate_prefers_the_newest_date() {
        let store = MemStore::new();
        let circuit = circuit();
        for (day, units) in [(8, 1), (9, 2), (10, 3)] {
            let draft = AggregateDraft {
                aggregate_date: d(2026, 3, day),
                total_units: units,
                ..AggregateDraft::default()
            };
            store
                .upsert_aggregate(&CircuitAggregate::new(circuit.id, false, draft, now()))
                .await
                .unwrap();
        }

        let found = store
            .latest_aggregate_at_or_before(circuit.id, d(2026, 3, 9))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.values.total_units, 2);
    }

    #[tokio::test]
    async fn snapshot_lookup_honors_type_and_date() {
        let store = MemStore::new();
        let circuit = circuit();
        let snapshot = CircuitSnapshot {
            id: Uuid::new_v4(),
            circuit_id: circuit.id,
            snapshot_type: CircuitSnapshotType::Daily,
            snapshot_date: d(2026, 3, 10),
            status_code: "ACTIV".into(),
            percent_complete: 40.0,
            miles_planned: 5.0,
            total_miles: 12.5,
            total_units: 3,
            captured_at: now(),
        };
        store.upsert_circuit_snapshot(&snapshot).await.unwrap();

        assert!(store
            .circuit_snapshot_exists(circuit.id, CircuitSnapshotType::Daily, d(2026, 3, 10))
            .await
            .unwrap());
        assert!(!store
            .circuit_snapshot_exists(circuit.id, CircuitSnapshotType::Manual, d(2026, 3, 10))
            .await
            .unwrap());
        assert_eq!(
            store
                .latest_miles_planned_at_or_before(circuit.id, d(2026, 3, 12))
                .await
                .unwrap(),
            Some(5.0)
        );
        assert_eq!(
            store
                .latest_miles_planned_at_or_before(circuit.id, d(2026, 3, 9))
                .await
                .unwrap(),
            None
        );
    }
}

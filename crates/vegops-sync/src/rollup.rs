//! Daily and weekly planner/regional rollups, plus the week-over-week
//! miles-planned delta. All writes are idempotent upserts by
//! (entity, time bucket).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::debug;
use vegops_core::{
    week_ending_for, week_starting_for, Circuit, CircuitAggregate, PlannerDailyAggregate,
    PlannerWeeklyAggregate, RegionalDailyAggregate, RegionalWeeklyAggregate, RollupMeasures,
    StatusBucket, SyncCounts, SyncErrorDetail, SyncRun, SyncRunKind, SyncTrigger,
};
use vegops_storage::{CircuitFilter, PipelineStore, SnapshotStore};

use crate::progress::ProgressReporter;
use crate::runs::RunTracker;

/// Week-over-week miles-planned movement for one planner/region.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeeklyDelta {
    pub start: f64,
    pub end: f64,
    pub delta: f64,
    pub met_weekly_target: bool,
}

/// Computes the miles-planned delta for a set of circuits across one week.
///
/// `start` sums each circuit's most recent snapshot at or before the week's
/// Sunday; a circuit with no qualifying snapshot contributes zero (new this
/// week, not missing data). `end` does the same against the week's Saturday,
/// falling back to the circuit's live miles-planned when no end-of-week
/// snapshot exists. The delta is clamped at zero so reassignment or snapshot
/// noise never registers as negative progress.
pub async fn weekly_delta<S: SnapshotStore + ?Sized>(
    store: &S,
    circuits: &[Circuit],
    week_ending: NaiveDate,
    weekly_miles_target: f64,
) -> Result<WeeklyDelta> {
    let week_starting = week_starting_for(week_ending);

    let mut start = 0.0;
    let mut end = 0.0;
    for circuit in circuits {
        start += store
            .latest_miles_planned_at_or_before(circuit.id, week_starting)
            .await?
            .unwrap_or(0.0);
        end += store
            .latest_miles_planned_at_or_before(circuit.id, week_ending)
            .await?
            .unwrap_or(circuit.miles_planned);
    }

    let delta = (end - start).max(0.0);
    Ok(WeeklyDelta {
        start,
        end,
        delta,
        met_weekly_target: delta >= weekly_miles_target,
    })
}

pub struct RollupBuilder<S> {
    store: Arc<S>,
    weekly_miles_target: f64,
}

impl<S: PipelineStore> RollupBuilder<S> {
    pub fn new(store: Arc<S>, weekly_miles_target: f64) -> Self {
        Self {
            store,
            weekly_miles_target,
        }
    }

    /// Builds the planner and regional daily rollups for one date from
    /// Circuit ⋈ latest CircuitAggregate, excluding excluded circuits.
    pub async fn build_daily(
        &self,
        date: NaiveDate,
        trigger: SyncTrigger,
        reporter: &dyn ProgressReporter,
    ) -> Result<SyncRun> {
        let tracker = RunTracker::start(
            self.store.as_ref(),
            SyncRunKind::DailyRollup,
            trigger,
            serde_json::json!({ "date": date }),
        )
        .await?;
        reporter.started("daily rollup");

        let circuits = self
            .store
            .list_circuits(&CircuitFilter::not_excluded())
            .await?;

        let mut counts = SyncCounts::default();
        let mut errors = Vec::new();

        let mut planner_rows: BTreeMap<(String, String), PlannerDailyAggregate> = BTreeMap::new();
        let mut regional_rows: BTreeMap<String, RegionalAccumulator> = BTreeMap::new();

        for circuit in &circuits {
            counts.processed += 1;
            let aggregate = self
                .store
                .latest_aggregate_at_or_before(circuit.id, date)
                .await?;

            let regional = regional_rows.entry(circuit.region.clone()).or_default();
            regional.observe(circuit, aggregate.as_ref());

            // Planner rows join circuit to aggregate; a circuit with no
            // aggregate yet has nothing to contribute.
            let (Some(planner), Some(aggregate)) = (&circuit.assigned_to, aggregate.as_ref())
            else {
                continue;
            };
            let row = planner_rows
                .entry((planner.clone(), circuit.region.clone()))
                .or_insert_with(|| PlannerDailyAggregate {
                    planner: planner.clone(),
                    region: circuit.region.clone(),
                    aggregate_date: date,
                    circuits_worked: 0,
                    measures: RollupMeasures::default(),
                });
            row.circuits_worked += 1;
            row.measures.add(&measures_from(circuit, Some(aggregate)));
        }

        let planner_total = planner_rows.len();
        for (index, row) in planner_rows.values().enumerate() {
            reporter.progress(index + 1, planner_total, &row.planner);
            match self.store.upsert_planner_daily(row).await {
                Ok(()) => counts.aggregates_created += 1,
                Err(err) => errors.push(SyncErrorDetail {
                    entity_id: format!("{}:{}", row.planner, row.region),
                    message: err.to_string(),
                }),
            }
        }

        for (region, accumulator) in &regional_rows {
            let row = accumulator.daily_row(region, date);
            match self.store.upsert_regional_daily(&row).await {
                Ok(()) => counts.aggregates_created += 1,
                Err(err) => errors.push(SyncErrorDetail {
                    entity_id: region.clone(),
                    message: err.to_string(),
                }),
            }
        }

        reporter.completed("daily rollup");
        Ok(tracker.complete(counts, errors).await?)
    }

    /// Builds the weekly rollups for the week containing `date`. Regional
    /// weeklies are folded from the daily rows across the Sunday → Saturday
    /// window; planner weeklies are computed directly from circuit,
    /// aggregate, and assignment state with the weekly delta attached.
    pub async fn build_weekly(
        &self,
        date: NaiveDate,
        trigger: SyncTrigger,
        reporter: &dyn ProgressReporter,
    ) -> Result<SyncRun> {
        let week_ending = week_ending_for(date);
        let week_starting = week_starting_for(date);

        let tracker = RunTracker::start(
            self.store.as_ref(),
            SyncRunKind::WeeklyRollup,
            trigger,
            serde_json::json!({ "week_ending": week_ending }),
        )
        .await?;
        reporter.started("weekly rollup");

        let mut counts = SyncCounts::default();
        let mut errors = Vec::new();

        // Regional: fold the daily rows.
        let regions = self
            .store
            .regions_with_daily_rows(week_starting, week_ending)
            .await?;
        for region in &regions {
            match self
                .build_regional_weekly(region, week_starting, week_ending)
                .await
            {
                Ok(()) => counts.aggregates_created += 1,
                Err(err) => errors.push(SyncErrorDetail {
                    entity_id: region.clone(),
                    message: format!("{err:#}"),
                }),
            }
        }

        // Planner: fuller variant over circuit + aggregate + assignment.
        let circuits = self
            .store
            .list_circuits(&CircuitFilter::not_excluded())
            .await?;
        let mut groups: BTreeMap<(String, String), Vec<&Circuit>> = BTreeMap::new();
        for circuit in &circuits {
            if let Some(planner) = &circuit.assigned_to {
                groups
                    .entry((planner.clone(), circuit.region.clone()))
                    .or_default()
                    .push(circuit);
            }
        }

        let total = groups.len();
        for (index, ((planner, region), group)) in groups.iter().enumerate() {
            reporter.progress(index + 1, total, planner);
            counts.processed += 1;
            match self
                .build_planner_weekly_group(planner, region, group, week_ending)
                .await
            {
                Ok(()) => counts.aggregates_created += 1,
                Err(err) => errors.push(SyncErrorDetail {
                    entity_id: format!("{planner}:{region}"),
                    message: format!("{err:#}"),
                }),
            }
        }

        reporter.completed("weekly rollup");
        Ok(tracker.complete(counts, errors).await?)
    }

    /// Weekly view for a single planner/region. Zero eligible circuits is a
    /// valid outcome (all-zero row, target not met), not an error.
    pub async fn build_planner_weekly_for(
        &self,
        planner: &str,
        region: &str,
        date: NaiveDate,
    ) -> Result<PlannerWeeklyAggregate> {
        let week_ending = week_ending_for(date);
        let circuits = self
            .store
            .list_circuits(
                &CircuitFilter::not_excluded()
                    .assigned_to(planner)
                    .in_region(region),
            )
            .await?;
        let refs: Vec<&Circuit> = circuits.iter().collect();
        let row = self
            .planner_weekly_row(planner, region, &refs, week_ending)
            .await?;
        self.store.upsert_planner_weekly(&row).await?;
        Ok(row)
    }

    async fn build_planner_weekly_group(
        &self,
        planner: &str,
        region: &str,
        group: &[&Circuit],
        week_ending: NaiveDate,
    ) -> Result<()> {
        let row = self
            .planner_weekly_row(planner, region, group, week_ending)
            .await?;

        // Materialize the week's per-circuit working aggregates under the
        // rollup flag, keeping them apart from sync-time rows.
        for circuit in group {
            if let Some(aggregate) = self
                .store
                .latest_aggregate_at_or_before(circuit.id, week_ending)
                .await?
            {
                let mut values = aggregate.values.clone();
                values.aggregate_date = week_ending;
                let weekly = CircuitAggregate::new(
                    circuit.id,
                    true,
                    values,
                    chrono::Utc::now(),
                );
                self.store.upsert_aggregate(&weekly).await?;
            }
        }

        self.store.upsert_planner_weekly(&row).await?;
        Ok(())
    }

    async fn planner_weekly_row(
        &self,
        planner: &str,
        region: &str,
        circuits: &[&Circuit],
        week_ending: NaiveDate,
    ) -> Result<PlannerWeeklyAggregate> {
        let mut measures = RollupMeasures::default();
        for circuit in circuits {
            let aggregate = self
                .store
                .latest_aggregate_at_or_before(circuit.id, week_ending)
                .await?;
            measures.add(&measures_from(circuit, aggregate.as_ref()));
        }

        let owned: Vec<Circuit> = circuits.iter().map(|c| (*c).clone()).collect();
        let delta = weekly_delta(
            self.store.as_ref(),
            &owned,
            week_ending,
            self.weekly_miles_target,
        )
        .await?;

        Ok(PlannerWeeklyAggregate {
            planner: planner.to_string(),
            region: region.to_string(),
            week_ending,
            circuits_worked: circuits.len() as i64,
            measures,
            miles_planned_start: delta.start,
            miles_planned_end: delta.end,
            miles_delta: delta.delta,
            met_weekly_target: delta.met_weekly_target,
        })
    }

    async fn build_regional_weekly(
        &self,
        region: &str,
        week_starting: NaiveDate,
        week_ending: NaiveDate,
    ) -> Result<()> {
        let daily = self
            .store
            .regional_daily_in_window(region, week_starting, week_ending)
            .await?;
        if daily.is_empty() {
            return Ok(());
        }
        debug!(region, days = daily.len(), "folding regional weekly");

        let mut row = RegionalWeeklyAggregate {
            region: region.to_string(),
            week_ending,
            total_circuits: 0,
            active_circuits: 0,
            qc_circuits: 0,
            closed_circuits: 0,
            rework_circuits: 0,
            active_planners: 0,
            measures: RollupMeasures::default(),
            avg_percent_complete: 0.0,
        };

        // Daily measures are cumulative per-circuit totals, so the weekly
        // value is the max across the window, not a sum.
        for day in &daily {
            row.total_circuits = row.total_circuits.max(day.total_circuits);
            row.active_circuits = row.active_circuits.max(day.active_circuits);
            row.qc_circuits = row.qc_circuits.max(day.qc_circuits);
            row.closed_circuits = row.closed_circuits.max(day.closed_circuits);
            row.rework_circuits = row.rework_circuits.max(day.rework_circuits);
            row.active_planners = row.active_planners.max(day.active_planners);
            row.measures.total_units = row.measures.total_units.max(day.measures.total_units);
            row.measures.total_linear_feet =
                row.measures.total_linear_feet.max(day.measures.total_linear_feet);
            row.measures.total_acres = row.measures.total_acres.max(day.measures.total_acres);
            row.measures.total_trees = row.measures.total_trees.max(day.measures.total_trees);
            row.measures.approved_units =
                row.measures.approved_units.max(day.measures.approved_units);
            row.measures.refused_units = row.measures.refused_units.max(day.measures.refused_units);
            row.measures.pending_units = row.measures.pending_units.max(day.measures.pending_units);
            row.measures.miles_planned = row.measures.miles_planned.max(day.measures.miles_planned);
            row.measures.total_miles = row.measures.total_miles.max(day.measures.total_miles);
        }

        // The weekly percent is the mean of the daily means, not recomputed
        // from base circuit data.
        row.avg_percent_complete = daily
            .iter()
            .map(|day| day.avg_percent_complete)
            .sum::<f64>()
            / daily.len() as f64;

        self.store.upsert_regional_weekly(&row).await?;
        Ok(())
    }
}

fn measures_from(circuit: &Circuit, aggregate: Option<&CircuitAggregate>) -> RollupMeasures {
    let mut measures = RollupMeasures {
        miles_planned: circuit.miles_planned,
        total_miles: circuit.total_miles,
        ..RollupMeasures::default()
    };
    if let Some(aggregate) = aggregate {
        measures.total_units = aggregate.values.total_units;
        measures.total_linear_feet = aggregate.values.total_linear_feet;
        measures.total_acres = aggregate.values.total_acres;
        measures.total_trees = aggregate.values.total_trees;
        measures.approved_units = aggregate.values.approved_units;
        measures.refused_units = aggregate.values.refused_units;
        measures.pending_units = aggregate.values.pending_units;
    }
    measures
}

/// Per-region accumulator for the daily build. Every non-excluded circuit
/// counts toward the total; bucket membership requires an exact status-code
/// match, so unrecognized codes land in no bucket.
#[derive(Debug, Default)]
struct RegionalAccumulator {
    total_circuits: i64,
    active_circuits: i64,
    qc_circuits: i64,
    closed_circuits: i64,
    rework_circuits: i64,
    planners: BTreeSet<String>,
    measures: RollupMeasures,
    percent_sum: f64,
}

impl RegionalAccumulator {
    fn observe(&mut self, circuit: &Circuit, aggregate: Option<&CircuitAggregate>) {
        self.total_circuits += 1;
        match circuit.status_bucket() {
            Some(StatusBucket::Active) => self.active_circuits += 1,
            Some(StatusBucket::Qc) => self.qc_circuits += 1,
            Some(StatusBucket::Closed) => self.closed_circuits += 1,
            Some(StatusBucket::Rework) => self.rework_circuits += 1,
            None => {}
        }
        if let Some(planner) = &circuit.assigned_to {
            self.planners.insert(planner.clone());
        }
        self.measures.add(&measures_from(circuit, aggregate));
        self.percent_sum += circuit.percent_complete;
    }

    fn daily_row(&self, region: &str, date: NaiveDate) -> RegionalDailyAggregate {
        RegionalDailyAggregate {
            region: region.to_string(),
            aggregate_date: date,
            total_circuits: self.total_circuits,
            active_circuits: self.active_circuits,
            qc_circuits: self.qc_circuits,
            closed_circuits: self.closed_circuits,
            rework_circuits: self.rework_circuits,
            active_planners: self.planners.len() as i64,
            measures: self.measures.clone(),
            avg_percent_complete: if self.total_circuits > 0 {
                self.percent_sum / self.total_circuits as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;
    use vegops_core::{CircuitDraft, CircuitSnapshot, CircuitSnapshotType, SyncRunStatus};
    use vegops_storage::{CircuitStore, MemStore, RollupStore, SnapshotStore};

    const TARGET: f64 = 6.5;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn circuit(external_id: &str, status: &str, region: &str, planner: Option<&str>) -> Circuit {
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).single().unwrap();
        Circuit::from_draft(
            &CircuitDraft {
                external_id: external_id.into(),
                work_order_code: format!("WO-{external_id}"),
                region: region.into(),
                status_code: status.into(),
                percent_complete: 40.0,
                total_miles: 100.0,
                miles_planned: Some(50.0),
                assigned_to: planner.map(ToString::to_string),
            },
            now,
        )
    }

    fn snapshot_on(circuit: &Circuit, date: NaiveDate, miles_planned: f64) -> CircuitSnapshot {
        CircuitSnapshot {
            id: Uuid::new_v4(),
            circuit_id: circuit.id,
            snapshot_type: CircuitSnapshotType::Daily,
            snapshot_date: date,
            status_code: circuit.status_code.clone(),
            percent_complete: circuit.percent_complete,
            miles_planned,
            total_miles: circuit.total_miles,
            total_units: 0,
            captured_at: Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).single().unwrap(),
        }
    }

    // Tuesday of a week ending Saturday 2026-03-14.
    fn build_date() -> NaiveDate {
        d(2026, 3, 10)
    }

    fn week_ending() -> NaiveDate {
        d(2026, 3, 14)
    }

    #[tokio::test]
    async fn regional_weekly_sums_three_active_circuits() {
        let store = Arc::new(MemStore::new());
        for id in ["JOB-1", "JOB-2", "JOB-3"] {
            store
                .insert_circuit(&circuit(id, "ACTIV", "NORTH", Some("pat")))
                .await
                .unwrap();
        }
        let builder = RollupBuilder::new(Arc::clone(&store), TARGET);

        builder
            .build_daily(build_date(), SyncTrigger::Manual, &crate::SilentReporter)
            .await
            .unwrap();
        builder
            .build_weekly(build_date(), SyncTrigger::Manual, &crate::SilentReporter)
            .await
            .unwrap();

        let weekly = store
            .regional_weekly_for("NORTH", week_ending())
            .await
            .unwrap()
            .expect("regional weekly row");
        assert_eq!(weekly.active_circuits, 3);
        assert_eq!(weekly.total_circuits, 3);
        assert_eq!(weekly.measures.total_miles, 300.0);
        assert_eq!(weekly.measures.miles_planned, 150.0);
    }

    #[tokio::test]
    async fn planner_with_only_an_excluded_circuit_gets_a_zero_row() {
        let store = Arc::new(MemStore::new());
        let mut excluded = circuit("JOB-1", "ACTIV", "NORTH", Some("pat"));
        excluded.is_excluded = true;
        excluded.exclusion_reason = Some("out of program".into());
        store.insert_circuit(&excluded).await.unwrap();
        let builder = RollupBuilder::new(Arc::clone(&store), TARGET);

        let row = builder
            .build_planner_weekly_for("pat", "NORTH", build_date())
            .await
            .unwrap();
        assert_eq!(row.circuits_worked, 0);
        assert_eq!(row.miles_delta, 0.0);
        assert!(!row.met_weekly_target);
    }

    #[tokio::test]
    async fn delta_uses_live_fallback_when_week_has_no_end_snapshot() {
        let store = Arc::new(MemStore::new());
        let mut c = circuit("JOB-1", "ACTIV", "NORTH", Some("pat"));
        c.miles_planned = 75.0;
        store.insert_circuit(&c).await.unwrap();

        // No snapshot at all: start = 0, end = live value.
        let delta = weekly_delta(store.as_ref(), &[c], week_ending(), TARGET)
            .await
            .unwrap();
        assert_eq!(delta.start, 0.0);
        assert_eq!(delta.end, 75.0);
        assert_eq!(delta.delta, 75.0);
        assert!(delta.met_weekly_target);
    }

    #[tokio::test]
    async fn new_circuit_with_end_snapshot_counts_fully() {
        let store = Arc::new(MemStore::new());
        let c = circuit("JOB-1", "ACTIV", "NORTH", Some("pat"));
        store.insert_circuit(&c).await.unwrap();
        store
            .upsert_circuit_snapshot(&snapshot_on(&c, d(2026, 3, 13), 75.0))
            .await
            .unwrap();

        let delta = weekly_delta(store.as_ref(), &[c], week_ending(), TARGET)
            .await
            .unwrap();
        assert_eq!(delta.start, 0.0);
        assert_eq!(delta.end, 75.0);
        assert_eq!(delta.delta, 75.0);
    }

    #[tokio::test]
    async fn delta_never_goes_negative() {
        let store = Arc::new(MemStore::new());
        let c = circuit("JOB-1", "ACTIV", "NORTH", Some("pat"));
        store.insert_circuit(&c).await.unwrap();
        // Pre-week snapshot higher than the end-of-week one.
        store
            .upsert_circuit_snapshot(&snapshot_on(&c, d(2026, 3, 8), 50.0))
            .await
            .unwrap();
        store
            .upsert_circuit_snapshot(&snapshot_on(&c, d(2026, 3, 13), 30.0))
            .await
            .unwrap();

        let delta = weekly_delta(store.as_ref(), &[c], week_ending(), TARGET)
            .await
            .unwrap();
        assert_eq!(delta.start, 50.0);
        assert_eq!(delta.end, 30.0);
        assert_eq!(delta.delta, 0.0);
        assert!(!delta.met_weekly_target);
    }

    #[tokio::test]
    async fn status_buckets_partition_with_unrecognized_gap() {
        let store = Arc::new(MemStore::new());
        for (id, status) in [
            ("JOB-1", "ACTIV"),
            ("JOB-2", "QC"),
            ("JOB-3", "CLOSD"),
            ("JOB-4", "REWRK"),
            ("JOB-5", "HOLD"),
        ] {
            store
                .insert_circuit(&circuit(id, status, "NORTH", Some("pat")))
                .await
                .unwrap();
        }
        let builder = RollupBuilder::new(Arc::clone(&store), TARGET);
        builder
            .build_daily(build_date(), SyncTrigger::Manual, &crate::SilentReporter)
            .await
            .unwrap();

        let daily = store.regional_daily_rows().pop().unwrap();
        assert_eq!(daily.total_circuits, 5);
        let bucketed = daily.active_circuits
            + daily.qc_circuits
            + daily.closed_circuits
            + daily.rework_circuits;
        assert_eq!(bucketed, 4);
        assert!(bucketed <= daily.total_circuits);
    }

    #[tokio::test]
    async fn weekly_build_is_idempotent() {
        let store = Arc::new(MemStore::new());
        store
            .insert_circuit(&circuit("JOB-1", "ACTIV", "NORTH", Some("pat")))
            .await
            .unwrap();
        let builder = RollupBuilder::new(Arc::clone(&store), TARGET);

        builder
            .build_daily(build_date(), SyncTrigger::Manual, &crate::SilentReporter)
            .await
            .unwrap();
        let first = builder
            .build_weekly(build_date(), SyncTrigger::Manual, &crate::SilentReporter)
            .await
            .unwrap();
        assert_eq!(first.status, SyncRunStatus::Completed);
        let second = builder
            .build_weekly(build_date(), SyncTrigger::Manual, &crate::SilentReporter)
            .await
            .unwrap();
        assert_eq!(second.status, SyncRunStatus::Completed);

        assert_eq!(store.regional_weekly_rows().len(), 1);
        assert_eq!(store.planner_weekly_rows().len(), 1);
    }

    #[tokio::test]
    async fn weekly_percent_is_the_mean_of_daily_means() {
        let store = Arc::new(MemStore::new());
        let builder = RollupBuilder::new(Arc::clone(&store), TARGET);

        // Two daily rows with different means.
        let mut day_one = RegionalDailyAggregate {
            region: "NORTH".into(),
            aggregate_date: d(2026, 3, 9),
            total_circuits: 1,
            active_circuits: 1,
            qc_circuits: 0,
            closed_circuits: 0,
            rework_circuits: 0,
            active_planners: 1,
            measures: RollupMeasures::default(),
            avg_percent_complete: 20.0,
        };
        store.upsert_regional_daily(&day_one).await.unwrap();
        day_one.aggregate_date = d(2026, 3, 10);
        day_one.avg_percent_complete = 60.0;
        store.upsert_regional_daily(&day_one).await.unwrap();

        builder
            .build_weekly(build_date(), SyncTrigger::Manual, &crate::SilentReporter)
            .await
            .unwrap();

        let weekly = store
            .regional_weekly_for("NORTH", week_ending())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(weekly.avg_percent_complete, 40.0);
    }
}

//! Persistence contracts for the pipeline, plus the Postgres and in-memory
//! implementations.
//!
//! Everything the pipeline writes is upsert-by-natural-key, so repeated or
//! overlapping runs converge instead of duplicating rows.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;
use vegops_core::{
    Circuit, CircuitAggregate, CircuitSnapshot, CircuitSnapshotType, PlannedUnitsSnapshot,
    PlannerDailyAggregate, PlannerWeeklyAggregate, RegionalDailyAggregate,
    RegionalWeeklyAggregate, StatusBucket, SyncRun, WorkUnit,
};

pub mod mem;
pub mod pg;

pub use mem::MemStore;
pub use pg::PgStore;

pub const CRATE_NAME: &str = "vegops-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Composable scope predicate over circuits. Each field narrows the result;
/// the default matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircuitFilter {
    pub statuses: Vec<String>,
    pub external_ids: Vec<String>,
    pub region: Option<String>,
    pub assigned_to: Option<String>,
    pub not_excluded: bool,
    pub not_closed: bool,
}

impl CircuitFilter {
    pub fn not_excluded() -> Self {
        Self {
            not_excluded: true,
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[String]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn with_external_ids(mut self, ids: &[String]) -> Self {
        self.external_ids = ids.to_vec();
        self
    }

    pub fn in_region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    pub fn assigned_to(mut self, planner: &str) -> Self {
        self.assigned_to = Some(planner.to_string());
        self
    }

    pub fn and_not_closed(mut self) -> Self {
        self.not_closed = true;
        self
    }

    /// In-memory evaluation of the predicate; the Postgres store compiles the
    /// same semantics to SQL.
    pub fn matches(&self, circuit: &Circuit) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&circuit.status_code) {
            return false;
        }
        if !self.external_ids.is_empty() && !self.external_ids.contains(&circuit.external_id) {
            return false;
        }
        if let Some(region) = &self.region {
            if &circuit.region != region {
                return false;
            }
        }
        if let Some(planner) = &self.assigned_to {
            if circuit.assigned_to.as_deref() != Some(planner.as_str()) {
                return false;
            }
        }
        if self.not_excluded && circuit.is_excluded {
            return false;
        }
        if self.not_closed && matches!(circuit.status_bucket(), Some(StatusBucket::Closed)) {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait CircuitStore: Send + Sync {
    async fn circuit_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Circuit>, StoreError>;
    async fn insert_circuit(&self, circuit: &Circuit) -> Result<(), StoreError>;
    async fn update_circuit(&self, circuit: &Circuit) -> Result<(), StoreError>;
    async fn list_circuits(&self, filter: &CircuitFilter) -> Result<Vec<Circuit>, StoreError>;
    /// Replaces the circuit's raw unit records wholesale.
    async fn replace_work_units(
        &self,
        circuit_id: Uuid,
        units: &[WorkUnit],
    ) -> Result<(), StoreError>;
    async fn work_units_for(&self, circuit_id: Uuid) -> Result<Vec<WorkUnit>, StoreError>;
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn aggregate_for(
        &self,
        circuit_id: Uuid,
        date: NaiveDate,
        is_rollup: bool,
    ) -> Result<Option<CircuitAggregate>, StoreError>;
    /// Latest non-rollup aggregate at or before `date`, used by the daily
    /// rollup builders.
    async fn latest_aggregate_at_or_before(
        &self,
        circuit_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<CircuitAggregate>, StoreError>;
    async fn upsert_aggregate(&self, aggregate: &CircuitAggregate) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn planned_units_snapshot_exists(
        &self,
        circuit_id: Uuid,
        content_hash: &str,
    ) -> Result<bool, StoreError>;
    async fn insert_planned_units_snapshot(
        &self,
        snapshot: &PlannedUnitsSnapshot,
    ) -> Result<(), StoreError>;
    /// Most recent planned-units snapshot for a circuit; the baseline the
    /// trigger evaluation compares against.
    async fn latest_planned_units_snapshot(
        &self,
        circuit_id: Uuid,
    ) -> Result<Option<PlannedUnitsSnapshot>, StoreError>;
    async fn circuit_snapshot_exists(
        &self,
        circuit_id: Uuid,
        snapshot_type: CircuitSnapshotType,
        date: NaiveDate,
    ) -> Result<bool, StoreError>;
    async fn upsert_circuit_snapshot(&self, snapshot: &CircuitSnapshot) -> Result<(), StoreError>;
    /// Miles-planned from the circuit's most recent snapshot dated at or
    /// before `date`, if any.
    async fn latest_miles_planned_at_or_before(
        &self,
        circuit_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<f64>, StoreError>;
    async fn prune_snapshots_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait RollupStore: Send + Sync {
    async fn upsert_planner_daily(&self, row: &PlannerDailyAggregate) -> Result<(), StoreError>;
    async fn upsert_planner_weekly(&self, row: &PlannerWeeklyAggregate) -> Result<(), StoreError>;
    async fn upsert_regional_daily(&self, row: &RegionalDailyAggregate) -> Result<(), StoreError>;
    async fn upsert_regional_weekly(
        &self,
        row: &RegionalWeeklyAggregate,
    ) -> Result<(), StoreError>;
    async fn regional_daily_in_window(
        &self,
        region: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RegionalDailyAggregate>, StoreError>;
    async fn regions_with_daily_rows(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<String>, StoreError>;
    async fn regional_weekly_for(
        &self,
        region: &str,
        week_ending: NaiveDate,
    ) -> Result<Option<RegionalWeeklyAggregate>, StoreError>;
    async fn planner_weekly_for(
        &self,
        planner: &str,
        region: &str,
        week_ending: NaiveDate,
    ) -> Result<Option<PlannerWeeklyAggregate>, StoreError>;
}

#[async_trait]
pub trait SyncRunStore: Send + Sync {
    async fn insert_sync_run(&self, run: &SyncRun) -> Result<(), StoreError>;
    /// Writes the terminal state of a run. Called exactly once per run.
    async fn complete_sync_run(&self, run: &SyncRun) -> Result<(), StoreError>;
    async fn prune_sync_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Umbrella trait the pipeline is generic over.
pub trait PipelineStore:
    CircuitStore + AggregateStore + SnapshotStore + RollupStore + SyncRunStore
{
}

impl<T> PipelineStore for T where
    T: CircuitStore + AggregateStore + SnapshotStore + RollupStore + SyncRunStore
{
}

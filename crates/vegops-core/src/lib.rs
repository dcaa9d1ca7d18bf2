//! Core domain model for the vegops work-order pipeline.

pub mod aggregate;
pub mod circuit;
pub mod rollup;
pub mod run;
pub mod snapshot;
pub mod week;

pub use aggregate::{AggregateDraft, CircuitAggregate, MeasurementKind};
pub use circuit::{
    Circuit, CircuitDraft, FieldModification, PermissionStatus, StatusBucket, UserModifiedFields,
    WorkUnit, USER_OVERRIDABLE_FIELDS,
};
pub use rollup::{
    PlannerDailyAggregate, PlannerWeeklyAggregate, RegionalDailyAggregate, RegionalWeeklyAggregate,
    RollupMeasures,
};
pub use run::{SyncCounts, SyncErrorDetail, SyncRun, SyncRunKind, SyncRunStatus, SyncTrigger};
pub use snapshot::{CircuitSnapshot, CircuitSnapshotType, PlannedUnitsSnapshot, SnapshotTrigger};
pub use week::{week_ending_for, week_starting_for};

pub const CRATE_NAME: &str = "vegops-core";

//! Per-circuit computed aggregates.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a unit type's quantity is measured. Exactly one kind per unit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    LinearFeet,
    Acres,
    Trees,
}

/// Computed aggregate values for one circuit on one date.
///
/// This is a pure value object: the calculation engine produces it without
/// side effects so the change detector can compare it against the last
/// persisted row before anything is written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateDraft {
    pub aggregate_date: NaiveDate,
    pub total_units: i64,
    pub total_linear_feet: f64,
    pub total_acres: f64,
    pub total_trees: i64,
    pub approved_units: i64,
    pub refused_units: i64,
    pub pending_units: i64,
    pub miles_planned: f64,
    pub total_miles: f64,
    /// Summed quantity per unit-type code.
    pub units_by_type: BTreeMap<String, f64>,
    /// Unit count per planner.
    pub units_by_planner: BTreeMap<String, i64>,
}

/// Persisted aggregate row. One row per (circuit, date, is_rollup); replaced
/// whole on upsert, never partially mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitAggregate {
    pub id: Uuid,
    pub circuit_id: Uuid,
    pub is_rollup: bool,
    pub values: AggregateDraft,
    pub computed_at: DateTime<Utc>,
}

impl CircuitAggregate {
    pub fn new(circuit_id: Uuid, is_rollup: bool, values: AggregateDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            circuit_id,
            is_rollup,
            values,
            computed_at: now,
        }
    }
}

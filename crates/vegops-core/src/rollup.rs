//! Planner and regional rollup rows (daily and weekly).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Shared measure block summed across circuits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupMeasures {
    pub total_units: i64,
    pub total_linear_feet: f64,
    pub total_acres: f64,
    pub total_trees: i64,
    pub approved_units: i64,
    pub refused_units: i64,
    pub pending_units: i64,
    pub miles_planned: f64,
    pub total_miles: f64,
}

impl RollupMeasures {
    pub fn add(&mut self, other: &RollupMeasures) {
        self.total_units += other.total_units;
        self.total_linear_feet += other.total_linear_feet;
        self.total_acres += other.total_acres;
        self.total_trees += other.total_trees;
        self.approved_units += other.approved_units;
        self.refused_units += other.refused_units;
        self.pending_units += other.pending_units;
        self.miles_planned += other.miles_planned;
        self.total_miles += other.total_miles;
    }
}

/// One planner's work in one region on one date.
/// Unique key: (planner, region, aggregate_date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerDailyAggregate {
    pub planner: String,
    pub region: String,
    pub aggregate_date: NaiveDate,
    pub circuits_worked: i64,
    pub measures: RollupMeasures,
}

/// One planner's week in one region, with the miles-planned delta across the
/// week boundary and the weekly-target evaluation.
/// Unique key: (planner, region, week_ending) — the key carries the region
/// because a planner may work multiple regions in the same week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerWeeklyAggregate {
    pub planner: String,
    pub region: String,
    pub week_ending: NaiveDate,
    pub circuits_worked: i64,
    pub measures: RollupMeasures,
    pub miles_planned_start: f64,
    pub miles_planned_end: f64,
    pub miles_delta: f64,
    pub met_weekly_target: bool,
}

/// All non-excluded circuits in one region on one date.
/// Unique key: (region, aggregate_date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalDailyAggregate {
    pub region: String,
    pub aggregate_date: NaiveDate,
    pub total_circuits: i64,
    pub active_circuits: i64,
    pub qc_circuits: i64,
    pub closed_circuits: i64,
    pub rework_circuits: i64,
    pub active_planners: i64,
    pub measures: RollupMeasures,
    pub avg_percent_complete: f64,
}

/// Weekly regional summary built from the daily rows across the
/// Sunday -> Saturday window. Unique key: (region, week_ending).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalWeeklyAggregate {
    pub region: String,
    pub week_ending: NaiveDate,
    pub total_circuits: i64,
    pub active_circuits: i64,
    pub qc_circuits: i64,
    pub closed_circuits: i64,
    pub rework_circuits: i64,
    pub active_planners: i64,
    pub measures: RollupMeasures,
    pub avg_percent_complete: f64,
}

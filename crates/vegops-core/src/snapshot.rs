//! Point-in-time captures used for dedup, trend history, and weekly deltas.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What caused a planned-units snapshot to be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Milestone50,
    Milestone100,
    StatusChange,
    Manual,
    Daily,
}

impl SnapshotTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Milestone50 => "milestone_50",
            Self::Milestone100 => "milestone_100",
            Self::StatusChange => "status_change",
            Self::Manual => "manual",
            Self::Daily => "daily",
        }
    }

    pub fn for_milestone(threshold: f64) -> Self {
        if threshold >= 100.0 {
            Self::Milestone100
        } else {
            Self::Milestone50
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "milestone_50" => Some(Self::Milestone50),
            "milestone_100" => Some(Self::Milestone100),
            "status_change" => Some(Self::StatusChange),
            "manual" => Some(Self::Manual),
            "daily" => Some(Self::Daily),
            _ => None,
        }
    }
}

/// Immutable capture of a circuit's raw unit records at a point in time.
/// Deduplicated by (circuit, content_hash): capturing identical content is a
/// no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedUnitsSnapshot {
    pub id: Uuid,
    pub circuit_id: Uuid,
    pub trigger: SnapshotTrigger,
    pub content_hash: String,
    pub unit_count: i64,
    pub status_code: String,
    pub percent_complete: f64,
    pub miles_planned: f64,
    pub units_json: serde_json::Value,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitSnapshotType {
    Daily,
    Manual,
}

impl CircuitSnapshotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(Self::Daily),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Lighter daily/manual copy of circuit + aggregate metrics. One row per
/// (circuit, type, date); feeds the weekly miles-planned delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub id: Uuid,
    pub circuit_id: Uuid,
    pub snapshot_type: CircuitSnapshotType,
    pub snapshot_date: NaiveDate,
    pub status_code: String,
    pub percent_complete: f64,
    pub miles_planned: f64,
    pub total_miles: f64,
    pub total_units: i64,
    pub captured_at: DateTime<Utc>,
}

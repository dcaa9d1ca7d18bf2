//! Sync-run records: one per pipeline invocation, with a small terminal
//! state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunKind {
    CircuitSync,
    AggregateSync,
    DailySnapshots,
    DailyRollup,
    WeeklyRollup,
    Prune,
}

impl SyncRunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitSync => "circuit_sync",
            Self::AggregateSync => "aggregate_sync",
            Self::DailySnapshots => "daily_snapshots",
            Self::DailyRollup => "daily_rollup",
            Self::WeeklyRollup => "weekly_rollup",
            Self::Prune => "prune",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "circuit_sync" => Some(Self::CircuitSync),
            "aggregate_sync" => Some(Self::AggregateSync),
            "daily_snapshots" => Some(Self::DailySnapshots),
            "daily_rollup" => Some(Self::DailyRollup),
            "weekly_rollup" => Some(Self::WeeklyRollup),
            "prune" => Some(Self::Prune),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    Scheduled,
    FollowUp,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::FollowUp => "follow_up",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "scheduled" => Some(Self::Scheduled),
            "follow_up" => Some(Self::FollowUp),
            _ => None,
        }
    }
}

/// `Started` is the only non-terminal state. A run is mutated exactly once
/// after creation, into one of the three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Started,
    Completed,
    Warning,
    Failed,
}

impl SyncRunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Warning => "warning",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "warning" => Some(Self::Warning),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Per-record failure captured with enough context to diagnose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncErrorDetail {
    pub entity_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub processed: i64,
    pub created: i64,
    pub updated: i64,
    pub aggregates_created: i64,
    pub snapshots_created: i64,
    pub skipped: i64,
}

impl SyncCounts {
    pub fn any_success(&self) -> bool {
        self.processed > 0
            || self.created > 0
            || self.updated > 0
            || self.aggregates_created > 0
            || self.snapshots_created > 0
    }
}

/// Lifecycle record of one orchestrator/builder invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub kind: SyncRunKind,
    pub trigger: SyncTrigger,
    pub status: SyncRunStatus,
    pub scope: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub counts: SyncCounts,
    pub error_message: Option<String>,
    pub error_details: Vec<SyncErrorDetail>,
    pub context: serde_json::Value,
}

impl SyncRun {
    pub fn start(kind: SyncRunKind, trigger: SyncTrigger, scope: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            trigger,
            status: SyncRunStatus::Started,
            scope,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            counts: SyncCounts::default(),
            error_message: None,
            error_details: Vec::new(),
            context: serde_json::Value::Null,
        }
    }

    /// Finishes a run that reached the end of its batch. `Completed` when the
    /// error list is empty, `Warning` when some records failed but at least
    /// one unit of work succeeded, `Failed` when everything failed.
    pub fn finish(&mut self, counts: SyncCounts, errors: Vec<SyncErrorDetail>) {
        debug_assert_eq!(self.status, SyncRunStatus::Started);
        let now = Utc::now();
        self.status = if errors.is_empty() {
            SyncRunStatus::Completed
        } else if counts.any_success() {
            SyncRunStatus::Warning
        } else {
            SyncRunStatus::Failed
        };
        self.error_message = summarize_errors(&errors);
        self.error_details = errors;
        self.counts = counts;
        self.completed_at = Some(now);
        self.duration_ms = Some(elapsed_ms(self.started_at, now));
    }

    /// Marks a run that aborted before its batch could complete, recording
    /// the escaping error so the hosting retry policy has the full picture.
    pub fn fail(&mut self, error_type: &str, message: &str) {
        let now = Utc::now();
        self.status = SyncRunStatus::Failed;
        self.error_message = Some(format!("{error_type}: {message}"));
        self.completed_at = Some(now);
        self.duration_ms = Some(elapsed_ms(self.started_at, now));
    }
}

fn elapsed_ms(started: DateTime<Utc>, finished: DateTime<Utc>) -> i64 {
    (finished - started).num_milliseconds().max(0)
}

fn summarize_errors(errors: &[SyncErrorDetail]) -> Option<String> {
    match errors.len() {
        0 => None,
        1 => Some(format!("1 record failed: {}", errors[0].entity_id)),
        n => Some(format!("{n} records failed (first: {})", errors[0].entity_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(processed: i64) -> SyncCounts {
        SyncCounts {
            processed,
            ..SyncCounts::default()
        }
    }

    #[test]
    fn clean_finish_is_completed() {
        let mut run = SyncRun::start(
            SyncRunKind::CircuitSync,
            SyncTrigger::Manual,
            serde_json::Value::Null,
        );
        run.finish(counts(3), vec![]);
        assert_eq!(run.status, SyncRunStatus::Completed);
        assert!(run.status.is_terminal());
        assert!(run.error_message.is_none());
        assert!(run.duration_ms.unwrap() >= 0);
    }

    #[test]
    fn partial_failure_is_warning() {
        let mut run = SyncRun::start(
            SyncRunKind::CircuitSync,
            SyncTrigger::Manual,
            serde_json::Value::Null,
        );
        run.finish(
            counts(1),
            vec![SyncErrorDetail {
                entity_id: "JOB-002".into(),
                message: "boom".into(),
            }],
        );
        assert_eq!(run.status, SyncRunStatus::Warning);
        assert_eq!(run.error_details.len(), 1);
        assert_eq!(run.error_message.as_deref(), Some("1 record failed: JOB-002"));
    }

    #[test]
    fn total_failure_is_failed() {
        let mut run = SyncRun::start(
            SyncRunKind::CircuitSync,
            SyncTrigger::Manual,
            serde_json::Value::Null,
        );
        run.finish(
            counts(0),
            vec![SyncErrorDetail {
                entity_id: "JOB-001".into(),
                message: "boom".into(),
            }],
        );
        assert_eq!(run.status, SyncRunStatus::Failed);
    }

    #[test]
    fn abort_records_error_type_and_message() {
        let mut run = SyncRun::start(
            SyncRunKind::AggregateSync,
            SyncTrigger::Scheduled,
            serde_json::Value::Null,
        );
        run.fail("SourceError", "health probe failed");
        assert_eq!(run.status, SyncRunStatus::Failed);
        assert_eq!(
            run.error_message.as_deref(),
            Some("SourceError: health probe failed")
        );
        assert!(run.duration_ms.unwrap() >= 0);
    }
}

//! Circuits, their raw work units, and user-edit tracking.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fields a sync pass may only overwrite when they are not flagged as
/// user-modified (or when force-overwrite is requested).
pub const USER_OVERRIDABLE_FIELDS: &[&str] = &["miles_planned", "assigned_to"];

/// Approval state of an individual work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Approved,
    Refused,
    Pending,
}

impl PermissionStatus {
    /// Parses the external permission code. Unknown codes are treated as
    /// pending rather than rejected.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "APPROVED" | "APPR" => Self::Approved,
            "REFUSED" | "REF" => Self::Refused,
            _ => Self::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Refused => "refused",
            Self::Pending => "pending",
        }
    }
}

/// Operational bucket a circuit's external status code maps into.
///
/// Classification is by exact code; a circuit with an unrecognized status
/// belongs to no bucket but still counts toward regional totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusBucket {
    Active,
    Qc,
    Closed,
    Rework,
}

impl StatusBucket {
    pub fn classify(status_code: &str) -> Option<Self> {
        match status_code {
            "ACTIV" => Some(Self::Active),
            "QC" => Some(Self::Qc),
            "CLOSD" => Some(Self::Closed),
            "REWRK" => Some(Self::Rework),
            _ => None,
        }
    }
}

/// Record of a single user override on a synced field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldModification {
    pub modified_at: DateTime<Utc>,
    pub modified_by: String,
    pub original_value: serde_json::Value,
}

/// Field name -> override record. A field present here is never silently
/// overwritten by a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserModifiedFields(pub BTreeMap<String, FieldModification>);

impl UserModifiedFields {
    pub fn is_modified(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn record(
        &mut self,
        field: &str,
        modified_by: &str,
        original_value: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        self.0.entry(field.to_string()).or_insert(FieldModification {
            modified_at: now,
            modified_by: modified_by.to_string(),
            original_value,
        });
    }

    /// Clears every override at once. Force-overwrite syncs call this before
    /// merging so the whole map is dropped atomically with the merge.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }
}

/// Normalized external payload for one circuit, produced by the raw-record
/// transformer. Carries both the always-synced fields and the
/// user-overridable ones; the merge in [`Circuit::apply_sync`] decides which
/// land.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitDraft {
    pub external_id: String,
    pub work_order_code: String,
    pub region: String,
    pub status_code: String,
    pub percent_complete: f64,
    pub total_miles: f64,
    pub miles_planned: Option<f64>,
    pub assigned_to: Option<String>,
}

/// One unit of vegetation-management work tied to an external work order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circuit {
    pub id: Uuid,
    pub external_id: String,
    pub work_order_code: String,
    pub region: String,
    pub status_code: String,
    pub percent_complete: f64,
    pub total_miles: f64,
    pub miles_planned: f64,
    pub assigned_to: Option<String>,
    pub user_modified: UserModifiedFields,
    pub is_excluded: bool,
    pub exclusion_reason: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub units_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Circuit {
    /// Creates a circuit from its first synced draft.
    pub fn from_draft(draft: &CircuitDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: draft.external_id.clone(),
            work_order_code: draft.work_order_code.clone(),
            region: draft.region.clone(),
            status_code: draft.status_code.clone(),
            percent_complete: draft.percent_complete,
            total_miles: draft.total_miles,
            miles_planned: draft.miles_planned.unwrap_or(0.0),
            assigned_to: draft.assigned_to.clone(),
            user_modified: UserModifiedFields::default(),
            is_excluded: false,
            exclusion_reason: None,
            last_synced_at: Some(now),
            units_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merges a synced draft into this circuit.
    ///
    /// Always-synced fields (work order code, region, status, percent,
    /// total miles) are overwritten unconditionally. User-overridable fields
    /// are overwritten only when not flagged in [`Self::user_modified`];
    /// with `force` the whole override map is cleared first and everything
    /// lands. Returns the names of fields preserved because of a user edit.
    pub fn apply_sync(
        &mut self,
        draft: &CircuitDraft,
        force: bool,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        if force {
            self.user_modified.clear();
        }

        self.work_order_code = draft.work_order_code.clone();
        self.region = draft.region.clone();
        self.status_code = draft.status_code.clone();
        self.percent_complete = draft.percent_complete;
        self.total_miles = draft.total_miles;

        let mut preserved = Vec::new();

        if self.user_modified.is_modified("miles_planned") {
            preserved.push("miles_planned".to_string());
        } else if let Some(miles) = draft.miles_planned {
            self.miles_planned = miles;
        }

        if self.user_modified.is_modified("assigned_to") {
            preserved.push("assigned_to".to_string());
        } else if draft.assigned_to.is_some() {
            self.assigned_to = draft.assigned_to.clone();
        }

        self.last_synced_at = Some(now);
        self.updated_at = now;
        preserved
    }

    /// Records a user override of one of the overridable fields, capturing
    /// the pre-edit value for the audit trail. Fields outside
    /// [`USER_OVERRIDABLE_FIELDS`] are not tracked; syncs own them outright.
    pub fn record_user_override(
        &mut self,
        field: &str,
        modified_by: &str,
        original_value: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        if !USER_OVERRIDABLE_FIELDS.contains(&field) {
            return;
        }
        self.user_modified.record(field, modified_by, original_value, now);
        self.updated_at = now;
    }

    pub fn status_bucket(&self) -> Option<StatusBucket> {
        StatusBucket::classify(&self.status_code)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.status_bucket(), Some(StatusBucket::Closed))
    }
}

/// Raw per-circuit work-unit record as normalized from the external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub external_id: String,
    pub circuit_external_id: String,
    pub type_code: String,
    pub quantity: f64,
    pub unit_of_measure: String,
    pub permission_status: PermissionStatus,
    pub planned_by: Option<String>,
}

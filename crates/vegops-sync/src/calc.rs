//! Aggregate calculation and change detection. Both are pure so drafts can
//! be compared before anything is committed.

use chrono::NaiveDate;
use vegops_core::{AggregateDraft, Circuit, MeasurementKind, PermissionStatus, WorkUnit};

use crate::catalog::UnitTypeCatalog;

/// Computes the aggregate value object for one circuit from its current raw
/// unit records. Groups by unit-type code, summing each group's quantity
/// into the measurement the catalog assigns that type, and tallies
/// permission-status counts and per-planner unit counts.
pub fn compute_for_circuit(
    circuit: &Circuit,
    units: &[WorkUnit],
    catalog: &UnitTypeCatalog,
    aggregate_date: NaiveDate,
) -> AggregateDraft {
    let mut draft = AggregateDraft {
        aggregate_date,
        miles_planned: circuit.miles_planned,
        total_miles: circuit.total_miles,
        ..AggregateDraft::default()
    };

    for unit in units {
        draft.total_units += 1;
        *draft.units_by_type.entry(unit.type_code.clone()).or_insert(0.0) += unit.quantity;

        match catalog.kind_for(&unit.type_code, &unit.unit_of_measure) {
            MeasurementKind::LinearFeet => draft.total_linear_feet += unit.quantity,
            MeasurementKind::Acres => draft.total_acres += unit.quantity,
            MeasurementKind::Trees => draft.total_trees += unit.quantity.round() as i64,
        }

        match unit.permission_status {
            PermissionStatus::Approved => draft.approved_units += 1,
            PermissionStatus::Refused => draft.refused_units += 1,
            PermissionStatus::Pending => draft.pending_units += 1,
        }

        if let Some(planner) = &unit.planned_by {
            *draft.units_by_planner.entry(planner.clone()).or_insert(0) += 1;
        }
    }

    draft
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateComparison {
    pub has_changes: bool,
    pub changed_fields: Vec<String>,
}

/// Decides whether a freshly computed draft differs meaningfully from the
/// last persisted one. With no previous aggregate the draft always counts as
/// changed. This gate runs before every aggregate write and snapshot
/// evaluation so no-op sync cycles do not accumulate rows.
pub fn compare_aggregates(
    draft: &AggregateDraft,
    previous: Option<&AggregateDraft>,
) -> AggregateComparison {
    let Some(previous) = previous else {
        return AggregateComparison {
            has_changes: true,
            changed_fields: vec!["initial".to_string()],
        };
    };

    let mut changed_fields = Vec::new();
    if draft.total_units != previous.total_units {
        changed_fields.push("total_units".to_string());
    }
    if draft.total_linear_feet != previous.total_linear_feet {
        changed_fields.push("total_linear_feet".to_string());
    }
    if draft.total_acres != previous.total_acres {
        changed_fields.push("total_acres".to_string());
    }
    if draft.total_trees != previous.total_trees {
        changed_fields.push("total_trees".to_string());
    }
    if draft.approved_units != previous.approved_units {
        changed_fields.push("approved_units".to_string());
    }
    if draft.refused_units != previous.refused_units {
        changed_fields.push("refused_units".to_string());
    }
    if draft.pending_units != previous.pending_units {
        changed_fields.push("pending_units".to_string());
    }
    if draft.miles_planned != previous.miles_planned {
        changed_fields.push("miles_planned".to_string());
    }
    if draft.total_miles != previous.total_miles {
        changed_fields.push("total_miles".to_string());
    }
    if draft.units_by_type != previous.units_by_type {
        changed_fields.push("units_by_type".to_string());
    }
    if draft.units_by_planner != previous.units_by_planner {
        changed_fields.push("units_by_planner".to_string());
    }

    AggregateComparison {
        has_changes: !changed_fields.is_empty(),
        changed_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use vegops_core::CircuitDraft;

    fn circuit() -> Circuit {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).single().unwrap();
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
            now,
        )
    }

    fn unit(
        id: &str,
        type_code: &str,
        qty: f64,
        uom: &str,
        permission: PermissionStatus,
        planner: Option<&str>,
    ) -> WorkUnit {
        WorkUnit {
            external_id: id.into(),
            circuit_external_id: "JOB-001".into(),
            type_code: type_code.into(),
            quantity: qty,
            unit_of_measure: uom.into(),
            permission_status: permission,
            planned_by: planner.map(ToString::to_string),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    #[test]
    fn per_type_sums_equal_the_raw_values() {
        let catalog = UnitTypeCatalog::default();
        let units = vec![
            unit("U-1", "TRIM", 150.0, "LF", PermissionStatus::Approved, Some("pat")),
            unit("U-2", "TRIM", 250.0, "LF", PermissionStatus::Pending, Some("pat")),
            unit("U-3", "MOW", 2.5, "AC", PermissionStatus::Approved, Some("sam")),
            unit("U-4", "REM", 3.0, "EA", PermissionStatus::Refused, None),
        ];
        let draft = compute_for_circuit(&circuit(), &units, &catalog, date());

        assert_eq!(draft.total_units, 4);
        assert_eq!(draft.total_linear_feet, 400.0);
        assert_eq!(draft.total_acres, 2.5);
        assert_eq!(draft.total_trees, 3);
        assert_eq!(draft.units_by_type["TRIM"], 400.0);
        assert_eq!(draft.units_by_type["MOW"], 2.5);
        assert_eq!(draft.units_by_type["REM"], 3.0);
        assert_eq!(draft.approved_units, 2);
        assert_eq!(draft.refused_units, 1);
        assert_eq!(draft.pending_units, 1);
        assert_eq!(draft.units_by_planner["pat"], 2);
        assert_eq!(draft.units_by_planner["sam"], 1);
        assert_eq!(draft.miles_planned, 5.0);
        assert_eq!(draft.total_miles, 12.5);
    }

    #[test]
    fn empty_unit_list_yields_zeroed_draft() {
        let catalog = UnitTypeCatalog::default();
        let draft = compute_for_circuit(&circuit(), &[], &catalog, date());
        assert_eq!(draft.total_units, 0);
        assert!(draft.units_by_type.is_empty());
        // Miles still come from the circuit.
        assert_eq!(draft.miles_planned, 5.0);
    }

    #[test]
    fn missing_previous_always_counts_as_changed() {
        let draft = AggregateDraft::default();
        let comparison = compare_aggregates(&draft, None);
        assert!(comparison.has_changes);
    }

    #[test]
    fn identical_drafts_are_unchanged() {
        let catalog = UnitTypeCatalog::default();
        let units = vec![unit("U-1", "TRIM", 150.0, "LF", PermissionStatus::Approved, Some("pat"))];
        let a = compute_for_circuit(&circuit(), &units, &catalog, date());
        let b = compute_for_circuit(&circuit(), &units, &catalog, date());
        assert!(!compare_aggregates(&a, Some(&b)).has_changes);
    }

    #[test]
    fn any_field_difference_flags_a_change() {
        let catalog = UnitTypeCatalog::default();
        let units = vec![unit("U-1", "TRIM", 150.0, "LF", PermissionStatus::Approved, Some("pat"))];
        let previous = compute_for_circuit(&circuit(), &units, &catalog, date());

        let mut changed = previous.clone();
        changed.pending_units += 1;
        let comparison = compare_aggregates(&changed, Some(&previous));
        assert!(comparison.has_changes);
        assert_eq!(comparison.changed_fields, vec!["pending_units".to_string()]);
    }
}

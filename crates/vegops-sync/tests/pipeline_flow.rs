//! End-to-end pipeline flow against the in-memory store and a scripted
//! source: circuit sync, aggregate follow-up, daily snapshots, then the
//! daily and weekly rollups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use vegops_adapters::{
    FetchFilters, RawUnitEntry, RawWorkOrderRecord, SourceError, WorkSource,
};
use vegops_core::{week_ending_for, SyncRunKind, SyncRunStatus, SyncTrigger};
use vegops_storage::{CircuitStore, MemStore, RollupStore};
use vegops_sync::{
    ExternalSyncOrchestrator, PipelineConfig, RollupBuilder, SilentReporter, SnapshotManager,
    UnitTypeCatalog,
};

struct ScriptedSource {
    orders: Vec<RawWorkOrderRecord>,
    units: HashMap<String, Vec<RawUnitEntry>>,
}

#[async_trait]
impl WorkSource for ScriptedSource {
    async fn health_check(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn fetch_work_orders(
        &self,
        filters: &FetchFilters,
    ) -> Result<Vec<RawWorkOrderRecord>, SourceError> {
        let orders = self
            .orders
            .iter()
            .filter(|order| {
                filters.statuses.is_empty()
                    || order
                        .status
                        .as_deref()
                        .map(|status| filters.statuses.iter().any(|s| s == status))
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(orders)
    }

    async fn fetch_work_units(
        &self,
        external_id: &str,
    ) -> Result<Vec<RawUnitEntry>, SourceError> {
        Ok(self.units.get(external_id).cloned().unwrap_or_default())
    }
}

fn order(job_guid: &str, region: &str, planner: &str) -> RawWorkOrderRecord {
    RawWorkOrderRecord {
        job_guid: job_guid.into(),
        work_order: Some(format!("WO-{job_guid}")),
        region: Some(region.into()),
        status: Some("ACTIV".into()),
        pct_complete: Some(40.0),
        total_miles: Some(100.0),
        planned_miles: Some(50.0),
        assigned_to: Some(planner.into()),
        units: vec![],
    }
}

fn trim_unit(guid: &str, qty: f64, planner: &str) -> RawUnitEntry {
    RawUnitEntry {
        unit_guid: Some(guid.into()),
        unit_type: Some("TRIM".into()),
        qty: Some(qty),
        uom: Some("LF".into()),
        permission: Some("APPROVED".into()),
        planned_by: Some(planner.into()),
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        database_url: String::new(),
        api_base_url: String::new(),
        api_token: None,
        calls_before_delay: 2,
        rate_limit_delay: Duration::from_millis(0),
        sync_interval_hours: 4,
        weekly_miles_target: 6.5,
        milestone_thresholds: vec![50.0, 100.0],
        retention_days: 365,
        scheduler_enabled: false,
        http_timeout: Duration::from_secs(20),
        aggregate_followup_delay: Duration::from_millis(0),
        unit_catalog_path: None,
    }
}

#[tokio::test]
async fn full_pipeline_flow_produces_consistent_rollups() {
    let store = Arc::new(MemStore::new());
    let mut units = HashMap::new();
    units.insert(
        "JOB-001".to_string(),
        vec![trim_unit("U-1", 150.0, "pat"), trim_unit("U-2", 250.0, "pat")],
    );
    units.insert("JOB-002".to_string(), vec![trim_unit("U-3", 300.0, "sam")]);
    units.insert("JOB-003".to_string(), vec![]);

    let source = ScriptedSource {
        orders: vec![
            order("JOB-001", "NORTH", "pat"),
            order("JOB-002", "NORTH", "sam"),
            order("JOB-003", "SOUTH", "pat"),
        ],
        units,
    };
    let orchestrator = Arc::new(ExternalSyncOrchestrator::new(
        Arc::clone(&store),
        Arc::new(source),
        config(),
        UnitTypeCatalog::default(),
    ));

    // Circuit sync creates all three circuits.
    let summary = orchestrator
        .run_circuit_sync(
            &FetchFilters::default(),
            false,
            SyncTrigger::Manual,
            &SilentReporter,
        )
        .await
        .unwrap();
    assert_eq!(summary.run.status, SyncRunStatus::Completed);
    assert_eq!(summary.run.counts.created, 3);

    // Follow-up aggregate pass lands once the cool-down elapses.
    let handle = ExternalSyncOrchestrator::spawn_aggregate_followup(
        Arc::clone(&orchestrator),
        Duration::from_millis(0),
    );
    let aggregate = handle.await.unwrap().unwrap();
    assert_eq!(aggregate.run.status, SyncRunStatus::Completed);
    assert_eq!(aggregate.run.counts.aggregates_created, 3);
    assert_eq!(aggregate.run.trigger, SyncTrigger::FollowUp);

    let today = Utc::now().date_naive();
    let week_ending = week_ending_for(today);

    // Daily + weekly rollups.
    let builder = RollupBuilder::new(Arc::clone(&store), 6.5);
    let daily = builder
        .build_daily(today, SyncTrigger::Scheduled, &SilentReporter)
        .await
        .unwrap();
    assert_eq!(daily.status, SyncRunStatus::Completed);
    let weekly = builder
        .build_weekly(today, SyncTrigger::Scheduled, &SilentReporter)
        .await
        .unwrap();
    assert_eq!(weekly.status, SyncRunStatus::Completed);

    // The NORTH weekly row folds both NORTH circuits.
    let north = store
        .regional_weekly_for("NORTH", week_ending)
        .await
        .unwrap()
        .expect("NORTH weekly row");
    assert_eq!(north.total_circuits, 2);
    assert_eq!(north.active_circuits, 2);
    assert_eq!(north.measures.total_miles, 200.0);
    assert_eq!(north.measures.total_linear_feet, 700.0);

    // pat worked circuits in two regions: one weekly row per region.
    let pat_north = store
        .planner_weekly_for("pat", "NORTH", week_ending)
        .await
        .unwrap()
        .expect("pat NORTH row");
    let pat_south = store
        .planner_weekly_for("pat", "SOUTH", week_ending)
        .await
        .unwrap()
        .expect("pat SOUTH row");
    assert_eq!(pat_north.circuits_worked, 1);
    assert_eq!(pat_south.circuits_worked, 1);
    assert_eq!(pat_north.measures.total_linear_feet, 400.0);

    // No snapshot history yet: the end-of-week value falls back to the live
    // miles-planned, with no week-start baseline.
    assert_eq!(pat_north.miles_planned_end, 50.0);
    assert_eq!(pat_north.miles_delta, 50.0);
    assert!(pat_north.met_weekly_target);

    // Daily snapshots for every open circuit.
    let snapshots = SnapshotManager::new(Arc::clone(&store), vec![50.0, 100.0]);
    let run = snapshots
        .run_daily_snapshots(today, SyncTrigger::Scheduled, &SilentReporter)
        .await
        .unwrap();
    assert_eq!(run.counts.snapshots_created, 3);

    // Every invocation left a tracked run in a terminal state.
    let runs = store.sync_runs();
    assert!(runs.len() >= 5);
    assert!(runs.iter().all(|run| run.status.is_terminal()));
    let kinds: Vec<SyncRunKind> = runs.iter().map(|run| run.kind).collect();
    assert!(kinds.contains(&SyncRunKind::CircuitSync));
    assert!(kinds.contains(&SyncRunKind::AggregateSync));
    assert!(kinds.contains(&SyncRunKind::DailySnapshots));
    assert!(kinds.contains(&SyncRunKind::DailyRollup));
    assert!(kinds.contains(&SyncRunKind::WeeklyRollup));
}

#[tokio::test]
async fn status_filtered_sync_only_touches_matching_orders() {
    let store = Arc::new(MemStore::new());
    let mut closed = order("JOB-009", "NORTH", "pat");
    closed.status = Some("CLOSD".into());
    let source = ScriptedSource {
        orders: vec![order("JOB-001", "NORTH", "pat"), closed],
        units: HashMap::new(),
    };
    let orchestrator = ExternalSyncOrchestrator::new(
        Arc::clone(&store),
        Arc::new(source),
        config(),
        UnitTypeCatalog::default(),
    );

    let summary = orchestrator
        .run_circuit_sync(
            &FetchFilters::by_statuses(&["ACTIV"]),
            false,
            SyncTrigger::Manual,
            &SilentReporter,
        )
        .await
        .unwrap();
    assert_eq!(summary.run.counts.created, 1);
    assert!(store
        .circuit_by_external_id("JOB-001")
        .await
        .unwrap()
        .is_some());
    assert!(store
        .circuit_by_external_id("JOB-009")
        .await
        .unwrap()
        .is_none());
}

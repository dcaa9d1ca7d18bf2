//! Rate-limited batch fetch + upsert of circuits and their aggregates.
//!
//! Fatal failures (unreachable source, a batch-level fetch error) abort the
//! run, mark it failed, and re-raise so the hosting retry policy can
//! re-attempt the whole invocation. Per-record failures are collected and
//! never abort the batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tracing::{info, warn};
use vegops_adapters::{
    transform_work_order, transform_work_units, CallBudget, FetchFilters, RawWorkOrderRecord,
    WorkSource,
};
use vegops_core::{
    Circuit, CircuitAggregate, SyncCounts, SyncErrorDetail, SyncRun, SyncRunKind, SyncTrigger,
};
use vegops_storage::{CircuitFilter, PipelineStore};

use crate::calc::{compare_aggregates, compute_for_circuit};
use crate::catalog::UnitTypeCatalog;
use crate::progress::{ProgressReporter, TracingReporter};
use crate::runs::RunTracker;
use crate::snapshot::SnapshotManager;
use crate::PipelineConfig;

/// Result of a circuit-sync batch: the persisted run record plus, per
/// circuit, the fields a user edit kept out of the merge (for audit).
#[derive(Debug, Clone)]
pub struct CircuitSyncSummary {
    pub run: SyncRun,
    pub preserved_fields: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct AggregateSyncSummary {
    pub run: SyncRun,
}

pub struct ExternalSyncOrchestrator<S, W> {
    store: Arc<S>,
    source: Arc<W>,
    config: PipelineConfig,
    catalog: UnitTypeCatalog,
    snapshots: SnapshotManager<S>,
}

impl<S: PipelineStore, W: WorkSource> ExternalSyncOrchestrator<S, W> {
    pub fn new(
        store: Arc<S>,
        source: Arc<W>,
        config: PipelineConfig,
        catalog: UnitTypeCatalog,
    ) -> Self {
        let snapshots =
            SnapshotManager::new(Arc::clone(&store), config.milestone_thresholds.clone());
        Self {
            store,
            source,
            config,
            catalog,
            snapshots,
        }
    }

    fn budget(&self) -> CallBudget {
        CallBudget::new(self.config.calls_before_delay, self.config.rate_limit_delay)
    }

    /// Fetches the work orders in scope and merges each into local storage,
    /// preserving user-modified fields unless `force` is set.
    pub async fn run_circuit_sync(
        &self,
        filters: &FetchFilters,
        force: bool,
        trigger: SyncTrigger,
        reporter: &dyn ProgressReporter,
    ) -> Result<CircuitSyncSummary> {
        let scope = serde_json::json!({
            "statuses": filters.statuses,
            "external_ids": filters.external_ids,
            "force": force,
        });
        let tracker =
            RunTracker::start(self.store.as_ref(), SyncRunKind::CircuitSync, trigger, scope)
                .await?;
        reporter.started("circuit sync");

        if let Err(err) = self.source.health_check().await {
            reporter.error(&format!("source health probe failed: {err}"));
            let run = tracker.abort("SourceError", &err.to_string()).await;
            return Err(anyhow!(err)).with_context(|| format!("run {} aborted", run.id));
        }

        let budget = self.budget();
        budget.tick().await;
        let records = match self.source.fetch_work_orders(filters).await {
            Ok(records) => records,
            Err(err) => {
                reporter.error(&format!("batch fetch failed: {err}"));
                let run = tracker.abort("SourceError", &err.to_string()).await;
                return Err(anyhow!(err)).with_context(|| format!("run {} aborted", run.id));
            }
        };

        let total = records.len();
        let mut counts = SyncCounts::default();
        let mut errors = Vec::new();
        let mut preserved_fields = BTreeMap::new();

        for (index, record) in records.iter().enumerate() {
            reporter.progress(index + 1, total, &record.job_guid);
            match self.sync_one(record, force).await {
                Ok((created, preserved)) => {
                    counts.processed += 1;
                    if created {
                        counts.created += 1;
                    } else {
                        counts.updated += 1;
                    }
                    if !preserved.is_empty() {
                        preserved_fields.insert(record.job_guid.clone(), preserved);
                    }
                }
                Err(err) => {
                    warn!(record = %record.job_guid, error = %format!("{err:#}"), "record failed");
                    errors.push(SyncErrorDetail {
                        entity_id: record.job_guid.clone(),
                        message: format!("{err:#}"),
                    });
                }
            }
        }

        reporter.completed("circuit sync");
        let run = tracker.complete(counts, errors).await?;
        Ok(CircuitSyncSummary {
            run,
            preserved_fields,
        })
    }

    async fn sync_one(
        &self,
        record: &RawWorkOrderRecord,
        force: bool,
    ) -> Result<(bool, Vec<String>)> {
        let draft = transform_work_order(record)?;
        let now = Utc::now();

        match self.store.circuit_by_external_id(&draft.external_id).await? {
            Some(mut circuit) => {
                let preserved = circuit.apply_sync(&draft, force, now);
                self.store.update_circuit(&circuit).await?;
                Ok((false, preserved))
            }
            None => {
                let circuit = Circuit::from_draft(&draft, now);
                self.store.insert_circuit(&circuit).await?;
                Ok((true, Vec::new()))
            }
        }
    }

    /// Recomputes per-circuit aggregates from freshly fetched unit records.
    /// Persistence is gated by the change detector; on change the snapshot
    /// triggers are evaluated as well.
    pub async fn run_aggregate_sync(
        &self,
        trigger: SyncTrigger,
        reporter: &dyn ProgressReporter,
    ) -> Result<AggregateSyncSummary> {
        let tracker = RunTracker::start(
            self.store.as_ref(),
            SyncRunKind::AggregateSync,
            trigger,
            serde_json::Value::Null,
        )
        .await?;
        reporter.started("aggregate sync");

        if let Err(err) = self.source.health_check().await {
            reporter.error(&format!("source health probe failed: {err}"));
            let run = tracker.abort("SourceError", &err.to_string()).await;
            return Err(anyhow!(err)).with_context(|| format!("run {} aborted", run.id));
        }

        let circuits = self
            .store
            .list_circuits(&CircuitFilter::not_excluded())
            .await?;
        let total = circuits.len();
        let budget = self.budget();

        let mut counts = SyncCounts::default();
        let mut errors = Vec::new();

        for (index, circuit) in circuits.iter().enumerate() {
            reporter.progress(index + 1, total, &circuit.external_id);
            budget.tick().await;
            match self.aggregate_one(circuit).await {
                Ok(outcome) => {
                    counts.processed += 1;
                    match outcome {
                        AggregateOutcome::Unchanged => counts.skipped += 1,
                        AggregateOutcome::Stored { snapshot_created } => {
                            counts.aggregates_created += 1;
                            if snapshot_created {
                                counts.snapshots_created += 1;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(circuit = %circuit.external_id, error = %format!("{err:#}"), "aggregate failed");
                    errors.push(SyncErrorDetail {
                        entity_id: circuit.external_id.clone(),
                        message: format!("{err:#}"),
                    });
                }
            }
        }

        reporter.completed("aggregate sync");
        let run = tracker.complete(counts, errors).await?;
        Ok(AggregateSyncSummary { run })
    }

    async fn aggregate_one(&self, circuit: &Circuit) -> Result<AggregateOutcome> {
        let raw_units = self
            .source
            .fetch_work_units(&circuit.external_id)
            .await
            .context("fetching work units")?;
        let units = transform_work_units(&circuit.external_id, &raw_units);
        self.store.replace_work_units(circuit.id, &units).await?;

        let now = Utc::now();
        let today = now.date_naive();
        let mut circuit = circuit.clone();
        circuit.units_synced_at = Some(now);
        circuit.updated_at = now;
        self.store.update_circuit(&circuit).await?;

        let draft = compute_for_circuit(&circuit, &units, &self.catalog, today);
        let previous = self
            .store
            .latest_aggregate_at_or_before(circuit.id, today)
            .await?;
        let comparison = compare_aggregates(&draft, previous.as_ref().map(|a| &a.values));
        if !comparison.has_changes {
            return Ok(AggregateOutcome::Unchanged);
        }

        info!(
            circuit = %circuit.external_id,
            changed = ?comparison.changed_fields,
            "aggregate changed, persisting"
        );
        let aggregate = CircuitAggregate::new(circuit.id, false, draft, now);
        self.store.upsert_aggregate(&aggregate).await?;

        let baseline = self
            .store
            .latest_planned_units_snapshot(circuit.id)
            .await?;
        let previous_status = baseline.as_ref().map(|s| s.status_code.clone());
        let previous_percent = baseline.as_ref().map(|s| s.percent_complete).unwrap_or(0.0);
        let snapshot = self
            .snapshots
            .create_snapshot_if_needed(
                &circuit,
                &units,
                previous_status.as_deref(),
                previous_percent,
                false,
            )
            .await?;

        Ok(AggregateOutcome::Stored {
            snapshot_created: snapshot.is_some(),
        })
    }

    /// Schedules the follow-up aggregate pass after the rate-limit window
    /// cools down, instead of running it inline with the circuit batch.
    pub fn spawn_aggregate_followup(
        orchestrator: Arc<Self>,
        delay: std::time::Duration,
    ) -> tokio::task::JoinHandle<Result<AggregateSyncSummary>>
    where
        S: 'static,
        W: 'static,
    {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            orchestrator
                .run_aggregate_sync(SyncTrigger::FollowUp, &TracingReporter)
                .await
        })
    }
}

enum AggregateOutcome {
    Unchanged,
    Stored { snapshot_created: bool },
}

//! Postgres-backed store. Runtime-checked queries, natural-key upserts via
//! `ON CONFLICT`, embedded migrations.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;
use vegops_core::{
    AggregateDraft, Circuit, CircuitAggregate, CircuitSnapshot, CircuitSnapshotType,
    PermissionStatus, PlannedUnitsSnapshot, PlannerDailyAggregate, PlannerWeeklyAggregate,
    RegionalDailyAggregate, RegionalWeeklyAggregate, RollupMeasures, SnapshotTrigger, SyncRun,
    WorkUnit,
};

use crate::{
    AggregateStore, CircuitFilter, CircuitStore, RollupStore, SnapshotStore, StoreError,
    SyncRunStore,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    /// Serializes writers targeting the same natural key. Held for the
    /// lifetime of the surrounding transaction.
    async fn advisory_lock(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        key: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|err| StoreError::CorruptRow(err.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|err| StoreError::CorruptRow(err.to_string()))
}

fn circuit_from_row(row: &PgRow) -> Result<Circuit, StoreError> {
    Ok(Circuit {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        work_order_code: row.try_get("work_order_code")?,
        region: row.try_get("region")?,
        status_code: row.try_get("status_code")?,
        percent_complete: row.try_get("percent_complete")?,
        total_miles: row.try_get("total_miles")?,
        miles_planned: row.try_get("miles_planned")?,
        assigned_to: row.try_get("assigned_to")?,
        user_modified: from_json(row.try_get::<serde_json::Value, _>("user_modified")?)?,
        is_excluded: row.try_get("is_excluded")?,
        exclusion_reason: row.try_get("exclusion_reason")?,
        last_synced_at: row.try_get("last_synced_at")?,
        units_synced_at: row.try_get("units_synced_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn aggregate_from_row(row: &PgRow) -> Result<CircuitAggregate, StoreError> {
    let values = AggregateDraft {
        aggregate_date: row.try_get("aggregate_date")?,
        total_units: row.try_get("total_units")?,
        total_linear_feet: row.try_get("total_linear_feet")?,
        total_acres: row.try_get("total_acres")?,
        total_trees: row.try_get("total_trees")?,
        approved_units: row.try_get("approved_units")?,
        refused_units: row.try_get("refused_units")?,
        pending_units: row.try_get("pending_units")?,
        miles_planned: row.try_get("miles_planned")?,
        total_miles: row.try_get("total_miles")?,
        units_by_type: from_json(row.try_get::<serde_json::Value, _>("units_by_type")?)?,
        units_by_planner: from_json(row.try_get::<serde_json::Value, _>("units_by_planner")?)?,
    };
    Ok(CircuitAggregate {
        id: row.try_get("id")?,
        circuit_id: row.try_get("circuit_id")?,
        is_rollup: row.try_get("is_rollup")?,
        values,
        computed_at: row.try_get("computed_at")?,
    })
}

fn measures_from_row(row: &PgRow) -> Result<RollupMeasures, StoreError> {
    Ok(RollupMeasures {
        total_units: row.try_get("total_units")?,
        total_linear_feet: row.try_get("total_linear_feet")?,
        total_acres: row.try_get("total_acres")?,
        total_trees: row.try_get("total_trees")?,
        approved_units: row.try_get("approved_units")?,
        refused_units: row.try_get("refused_units")?,
        pending_units: row.try_get("pending_units")?,
        miles_planned: row.try_get("miles_planned")?,
        total_miles: row.try_get("total_miles")?,
    })
}

fn regional_daily_from_row(row: &PgRow) -> Result<RegionalDailyAggregate, StoreError> {
    Ok(RegionalDailyAggregate {
        region: row.try_get("region")?,
        aggregate_date: row.try_get("aggregate_date")?,
        total_circuits: row.try_get("total_circuits")?,
        active_circuits: row.try_get("active_circuits")?,
        qc_circuits: row.try_get("qc_circuits")?,
        closed_circuits: row.try_get("closed_circuits")?,
        rework_circuits: row.try_get("rework_circuits")?,
        active_planners: row.try_get("active_planners")?,
        measures: measures_from_row(row)?,
        avg_percent_complete: row.try_get("avg_percent_complete")?,
    })
}

#[async_trait]
impl CircuitStore for PgStore {
    async fn circuit_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Circuit>, StoreError> {
        let row = sqlx::query("SELECT * FROM circuits WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(circuit_from_row).transpose()
    }

    async fn insert_circuit(&self, circuit: &Circuit) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO circuits
                (id, external_id, work_order_code, region, status_code, percent_complete,
                 total_miles, miles_planned, assigned_to, user_modified, is_excluded,
                 exclusion_reason, last_synced_at, units_synced_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(circuit.id)
        .bind(&circuit.external_id)
        .bind(&circuit.work_order_code)
        .bind(&circuit.region)
        .bind(&circuit.status_code)
        .bind(circuit.percent_complete)
        .bind(circuit.total_miles)
        .bind(circuit.miles_planned)
        .bind(&circuit.assigned_to)
        .bind(json(&circuit.user_modified)?)
        .bind(circuit.is_excluded)
        .bind(&circuit.exclusion_reason)
        .bind(circuit.last_synced_at)
        .bind(circuit.units_synced_at)
        .bind(circuit.created_at)
        .bind(circuit.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_circuit(&self, circuit: &Circuit) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE circuits
               SET work_order_code = $2,
                   region = $3,
                   status_code = $4,
                   percent_complete = $5,
                   total_miles = $6,
                   miles_planned = $7,
                   assigned_to = $8,
                   user_modified = $9,
                   is_excluded = $10,
                   exclusion_reason = $11,
                   last_synced_at = $12,
                   units_synced_at = $13,
                   updated_at = $14
             WHERE id = $1
            "#,
        )
        .bind(circuit.id)
        .bind(&circuit.work_order_code)
        .bind(&circuit.region)
        .bind(&circuit.status_code)
        .bind(circuit.percent_complete)
        .bind(circuit.total_miles)
        .bind(circuit.miles_planned)
        .bind(&circuit.assigned_to)
        .bind(json(&circuit.user_modified)?)
        .bind(circuit.is_excluded)
        .bind(&circuit.exclusion_reason)
        .bind(circuit.last_synced_at)
        .bind(circuit.units_synced_at)
        .bind(circuit.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_circuits(&self, filter: &CircuitFilter) -> Result<Vec<Circuit>, StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM circuits WHERE 1=1");
        if !filter.statuses.is_empty() {
            builder.push(" AND status_code = ANY(");
            builder.push_bind(filter.statuses.clone());
            builder.push(")");
        }
        if !filter.external_ids.is_empty() {
            builder.push(" AND external_id = ANY(");
            builder.push_bind(filter.external_ids.clone());
            builder.push(")");
        }
        if let Some(region) = &filter.region {
            builder.push(" AND region = ");
            builder.push_bind(region.clone());
        }
        if let Some(planner) = &filter.assigned_to {
            builder.push(" AND assigned_to = ");
            builder.push_bind(planner.clone());
        }
        if filter.not_excluded {
            builder.push(" AND NOT is_excluded");
        }
        if filter.not_closed {
            builder.push(" AND status_code <> ");
            builder.push_bind("CLOSD");
        }
        builder.push(" ORDER BY external_id");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(circuit_from_row).collect()
    }

    async fn replace_work_units(
        &self,
        circuit_id: Uuid,
        units: &[WorkUnit],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM work_units WHERE circuit_id = $1")
            .bind(circuit_id)
            .execute(&mut *tx)
            .await?;
        for unit in units {
            sqlx::query(
                r#"
                INSERT INTO work_units
                    (circuit_id, external_id, circuit_external_id, type_code, quantity,
                     unit_of_measure, permission_status, planned_by)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(circuit_id)
            .bind(&unit.external_id)
            .bind(&unit.circuit_external_id)
            .bind(&unit.type_code)
            .bind(unit.quantity)
            .bind(&unit.unit_of_measure)
            .bind(unit.permission_status.as_str())
            .bind(&unit.planned_by)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn work_units_for(&self, circuit_id: Uuid) -> Result<Vec<WorkUnit>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM work_units WHERE circuit_id = $1 ORDER BY external_id",
        )
        .bind(circuit_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(WorkUnit {
                    external_id: row.try_get("external_id")?,
                    circuit_external_id: row.try_get("circuit_external_id")?,
                    type_code: row.try_get("type_code")?,
                    quantity: row.try_get("quantity")?,
                    unit_of_measure: row.try_get("unit_of_measure")?,
                    permission_status: PermissionStatus::from_code(
                        row.try_get::<String, _>("permission_status")?.as_str(),
                    ),
                    planned_by: row.try_get("planned_by")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AggregateStore for PgStore {
    async fn aggregate_for(
        &self,
        circuit_id: Uuid,
        date: NaiveDate,
        is_rollup: bool,
    ) -> Result<Option<CircuitAggregate>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM circuit_aggregates
             WHERE circuit_id = $1 AND aggregate_date = $2 AND is_rollup = $3
            "#,
        )
        .bind(circuit_id)
        .bind(date)
        .bind(is_rollup)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(aggregate_from_row).transpose()
    }

    async fn latest_aggregate_at_or_before(
        &self,
        circuit_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<CircuitAggregate>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM circuit_aggregates
             WHERE circuit_id = $1 AND aggregate_date <= $2 AND NOT is_rollup
             ORDER BY aggregate_date DESC, computed_at DESC
             LIMIT 1
            "#,
        )
        .bind(circuit_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(aggregate_from_row).transpose()
    }

    async fn upsert_aggregate(&self, aggregate: &CircuitAggregate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO circuit_aggregates
                (id, circuit_id, aggregate_date, is_rollup, total_units, total_linear_feet,
                 total_acres, total_trees, approved_units, refused_units, pending_units,
                 miles_planned, total_miles, units_by_type, units_by_planner, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (circuit_id, aggregate_date, is_rollup) DO UPDATE SET
                total_units = EXCLUDED.total_units,
                total_linear_feet = EXCLUDED.total_linear_feet,
                total_acres = EXCLUDED.total_acres,
                total_trees = EXCLUDED.total_trees,
                approved_units = EXCLUDED.approved_units,
                refused_units = EXCLUDED.refused_units,
                pending_units = EXCLUDED.pending_units,
                miles_planned = EXCLUDED.miles_planned,
                total_miles = EXCLUDED.total_miles,
                units_by_type = EXCLUDED.units_by_type,
                units_by_planner = EXCLUDED.units_by_planner,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(aggregate.id)
        .bind(aggregate.circuit_id)
        .bind(aggregate.values.aggregate_date)
        .bind(aggregate.is_rollup)
        .bind(aggregate.values.total_units)
        .bind(aggregate.values.total_linear_feet)
        .bind(aggregate.values.total_acres)
        .bind(aggregate.values.total_trees)
        .bind(aggregate.values.approved_units)
        .bind(aggregate.values.refused_units)
        .bind(aggregate.values.pending_units)
        .bind(aggregate.values.miles_planned)
        .bind(aggregate.values.total_miles)
        .bind(json(&aggregate.values.units_by_type)?)
        .bind(json(&aggregate.values.units_by_planner)?)
        .bind(aggregate.computed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn planned_units_snapshot_exists(
        &self,
        circuit_id: Uuid,
        content_hash: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM planned_units_snapshots WHERE circuit_id = $1 AND content_hash = $2",
        )
        .bind(circuit_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_planned_units_snapshot(
        &self,
        snapshot: &PlannedUnitsSnapshot,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO planned_units_snapshots
                (id, circuit_id, trigger_kind, content_hash, unit_count, status_code,
                 percent_complete, miles_planned, units_json, captured_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (circuit_id, content_hash) DO NOTHING
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.circuit_id)
        .bind(snapshot.trigger.as_str())
        .bind(&snapshot.content_hash)
        .bind(snapshot.unit_count)
        .bind(&snapshot.status_code)
        .bind(snapshot.percent_complete)
        .bind(snapshot.miles_planned)
        .bind(&snapshot.units_json)
        .bind(snapshot.captured_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_planned_units_snapshot(
        &self,
        circuit_id: Uuid,
    ) -> Result<Option<PlannedUnitsSnapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM planned_units_snapshots
             WHERE circuit_id = $1
             ORDER BY captured_at DESC
             LIMIT 1
            "#,
        )
        .bind(circuit_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(|row| {
                let trigger_raw: String = row.try_get("trigger_kind")?;
                let trigger = SnapshotTrigger::parse(&trigger_raw).ok_or_else(|| {
                    StoreError::CorruptRow(format!("unknown snapshot trigger `{trigger_raw}`"))
                })?;
                Ok(PlannedUnitsSnapshot {
                    id: row.try_get("id")?,
                    circuit_id: row.try_get("circuit_id")?,
                    trigger,
                    content_hash: row.try_get("content_hash")?,
                    unit_count: row.try_get("unit_count")?,
                    status_code: row.try_get("status_code")?,
                    percent_complete: row.try_get("percent_complete")?,
                    miles_planned: row.try_get("miles_planned")?,
                    units_json: row.try_get("units_json")?,
                    captured_at: row.try_get("captured_at")?,
                })
            })
            .transpose()
    }

    async fn circuit_snapshot_exists(
        &self,
        circuit_id: Uuid,
        snapshot_type: CircuitSnapshotType,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM circuit_snapshots
             WHERE circuit_id = $1 AND snapshot_type = $2 AND snapshot_date = $3
            "#,
        )
        .bind(circuit_id)
        .bind(snapshot_type.as_str())
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn upsert_circuit_snapshot(&self, snapshot: &CircuitSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO circuit_snapshots
                (id, circuit_id, snapshot_type, snapshot_date, status_code, percent_complete,
                 miles_planned, total_miles, total_units, captured_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (circuit_id, snapshot_type, snapshot_date) DO UPDATE SET
                status_code = EXCLUDED.status_code,
                percent_complete = EXCLUDED.percent_complete,
                miles_planned = EXCLUDED.miles_planned,
                total_miles = EXCLUDED.total_miles,
                total_units = EXCLUDED.total_units,
                captured_at = EXCLUDED.captured_at
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.circuit_id)
        .bind(snapshot.snapshot_type.as_str())
        .bind(snapshot.snapshot_date)
        .bind(&snapshot.status_code)
        .bind(snapshot.percent_complete)
        .bind(snapshot.miles_planned)
        .bind(snapshot.total_miles)
        .bind(snapshot.total_units)
        .bind(snapshot.captured_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_miles_planned_at_or_before(
        &self,
        circuit_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<f64>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT miles_planned FROM circuit_snapshots
             WHERE circuit_id = $1 AND snapshot_date <= $2
             ORDER BY snapshot_date DESC, captured_at DESC
             LIMIT 1
            "#,
        )
        .bind(circuit_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("miles_planned")).transpose().map_err(Into::into)
    }

    async fn prune_snapshots_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError> {
        let planned = sqlx::query(
            "DELETE FROM planned_units_snapshots WHERE captured_at::date < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let circuits = sqlx::query("DELETE FROM circuit_snapshots WHERE snapshot_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(planned.rows_affected() + circuits.rows_affected())
    }
}

#[async_trait]
impl RollupStore for PgStore {
    async fn upsert_planner_daily(&self, row: &PlannerDailyAggregate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let key = format!(
            "planner_daily:{}:{}:{}",
            row.planner, row.region, row.aggregate_date
        );
        Self::advisory_lock(&mut tx, &key).await?;
        sqlx::query(
            r#"
            INSERT INTO planner_daily_aggregates
                (planner, region, aggregate_date, circuits_worked, total_units,
                 total_linear_feet, total_acres, total_trees, approved_units, refused_units,
                 pending_units, miles_planned, total_miles)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (planner, region, aggregate_date) DO UPDATE SET
                circuits_worked = EXCLUDED.circuits_worked,
                total_units = EXCLUDED.total_units,
                total_linear_feet = EXCLUDED.total_linear_feet,
                total_acres = EXCLUDED.total_acres,
                total_trees = EXCLUDED.total_trees,
                approved_units = EXCLUDED.approved_units,
                refused_units = EXCLUDED.refused_units,
                pending_units = EXCLUDED.pending_units,
                miles_planned = EXCLUDED.miles_planned,
                total_miles = EXCLUDED.total_miles
            "#,
        )
        .bind(&row.planner)
        .bind(&row.region)
        .bind(row.aggregate_date)
        .bind(row.circuits_worked)
        .bind(row.measures.total_units)
        .bind(row.measures.total_linear_feet)
        .bind(row.measures.total_acres)
        .bind(row.measures.total_trees)
        .bind(row.measures.approved_units)
        .bind(row.measures.refused_units)
        .bind(row.measures.pending_units)
        .bind(row.measures.miles_planned)
        .bind(row.measures.total_miles)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_planner_weekly(&self, row: &PlannerWeeklyAggregate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let key = format!(
            "planner_weekly:{}:{}:{}",
            row.planner, row.region, row.week_ending
        );
        Self::advisory_lock(&mut tx, &key).await?;
        sqlx::query(
            r#"
            INSERT INTO planner_weekly_aggregates
                (planner, region, week_ending, circuits_worked, total_units, total_linear_feet,
                 total_acres, total_trees, approved_units, refused_units, pending_units,
                 miles_planned, total_miles, miles_planned_start, miles_planned_end,
                 miles_delta, met_weekly_target)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (planner, region, week_ending) DO UPDATE SET
                circuits_worked = EXCLUDED.circuits_worked,
                total_units = EXCLUDED.total_units,
                total_linear_feet = EXCLUDED.total_linear_feet,
                total_acres = EXCLUDED.total_acres,
                total_trees = EXCLUDED.total_trees,
                approved_units = EXCLUDED.approved_units,
                refused_units = EXCLUDED.refused_units,
                pending_units = EXCLUDED.pending_units,
                miles_planned = EXCLUDED.miles_planned,
                total_miles = EXCLUDED.total_miles,
                miles_planned_start = EXCLUDED.miles_planned_start,
                miles_planned_end = EXCLUDED.miles_planned_end,
                miles_delta = EXCLUDED.miles_delta,
                met_weekly_target = EXCLUDED.met_weekly_target
            "#,
        )
        .bind(&row.planner)
        .bind(&row.region)
        .bind(row.week_ending)
        .bind(row.circuits_worked)
        .bind(row.measures.total_units)
        .bind(row.measures.total_linear_feet)
        .bind(row.measures.total_acres)
        .bind(row.measures.total_trees)
        .bind(row.measures.approved_units)
        .bind(row.measures.refused_units)
        .bind(row.measures.pending_units)
        .bind(row.measures.miles_planned)
        .bind(row.measures.total_miles)
        .bind(row.miles_planned_start)
        .bind(row.miles_planned_end)
        .bind(row.miles_delta)
        .bind(row.met_weekly_target)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_regional_daily(&self, row: &RegionalDailyAggregate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let key = format!("regional_daily:{}:{}", row.region, row.aggregate_date);
        Self::advisory_lock(&mut tx, &key).await?;
        sqlx::query(
            r#"
            INSERT INTO regional_daily_aggregates
                (region, aggregate_date, total_circuits, active_circuits, qc_circuits,
                 closed_circuits, rework_circuits, active_planners, total_units,
                 total_linear_feet, total_acres, total_trees, approved_units, refused_units,
                 pending_units, miles_planned, total_miles, avg_percent_complete)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (region, aggregate_date) DO UPDATE SET
                total_circuits = EXCLUDED.total_circuits,
                active_circuits = EXCLUDED.active_circuits,
                qc_circuits = EXCLUDED.qc_circuits,
                closed_circuits = EXCLUDED.closed_circuits,
                rework_circuits = EXCLUDED.rework_circuits,
                active_planners = EXCLUDED.active_planners,
                total_units = EXCLUDED.total_units,
                total_linear_feet = EXCLUDED.total_linear_feet,
                total_acres = EXCLUDED.total_acres,
                total_trees = EXCLUDED.total_trees,
                approved_units = EXCLUDED.approved_units,
                refused_units = EXCLUDED.refused_units,
                pending_units = EXCLUDED.pending_units,
                miles_planned = EXCLUDED.miles_planned,
                total_miles = EXCLUDED.total_miles,
                avg_percent_complete = EXCLUDED.avg_percent_complete
            "#,
        )
        .bind(&row.region)
        .bind(row.aggregate_date)
        .bind(row.total_circuits)
        .bind(row.active_circuits)
        .bind(row.qc_circuits)
        .bind(row.closed_circuits)
        .bind(row.rework_circuits)
        .bind(row.active_planners)
        .bind(row.measures.total_units)
        .bind(row.measures.total_linear_feet)
        .bind(row.measures.total_acres)
        .bind(row.measures.total_trees)
        .bind(row.measures.approved_units)
        .bind(row.measures.refused_units)
        .bind(row.measures.pending_units)
        .bind(row.measures.miles_planned)
        .bind(row.measures.total_miles)
        .bind(row.avg_percent_complete)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_regional_weekly(
        &self,
        row: &RegionalWeeklyAggregate,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let key = format!("regional_weekly:{}:{}", row.region, row.week_ending);
        Self::advisory_lock(&mut tx, &key).await?;
        sqlx::query(
            r#"
            INSERT INTO regional_weekly_aggregates
                (region, week_ending, total_circuits, active_circuits, qc_circuits,
                 closed_circuits, rework_circuits, active_planners, total_units,
                 total_linear_feet, total_acres, total_trees, approved_units, refused_units,
                 pending_units, miles_planned, total_miles, avg_percent_complete)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (region, week_ending) DO UPDATE SET
                total_circuits = EXCLUDED.total_circuits,
                active_circuits = EXCLUDED.active_circuits,
                qc_circuits = EXCLUDED.qc_circuits,
                closed_circuits = EXCLUDED.closed_circuits,
                rework_circuits = EXCLUDED.rework_circuits,
                active_planners = EXCLUDED.active_planners,
                total_units = EXCLUDED.total_units,
                total_linear_feet = EXCLUDED.total_linear_feet,
                total_acres = EXCLUDED.total_acres,
                total_trees = EXCLUDED.total_trees,
                approved_units = EXCLUDED.approved_units,
                refused_units = EXCLUDED.refused_units,
                pending_units = EXCLUDED.pending_units,
                miles_planned = EXCLUDED.miles_planned,
                total_miles = EXCLUDED.total_miles,
                avg_percent_complete = EXCLUDED.avg_percent_complete
            "#,
        )
        .bind(&row.region)
        .bind(row.week_ending)
        .bind(row.total_circuits)
        .bind(row.active_circuits)
        .bind(row.qc_circuits)
        .bind(row.closed_circuits)
        .bind(row.rework_circuits)
        .bind(row.active_planners)
        .bind(row.measures.total_units)
        .bind(row.measures.total_linear_feet)
        .bind(row.measures.total_acres)
        .bind(row.measures.total_trees)
        .bind(row.measures.approved_units)
        .bind(row.measures.refused_units)
        .bind(row.measures.pending_units)
        .bind(row.measures.miles_planned)
        .bind(row.measures.total_miles)
        .bind(row.avg_percent_complete)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn regional_daily_in_window(
        &self,
        region: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RegionalDailyAggregate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM regional_daily_aggregates
             WHERE region = $1 AND aggregate_date BETWEEN $2 AND $3
             ORDER BY aggregate_date
            "#,
        )
        .bind(region)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(regional_daily_from_row).collect()
    }

    async fn regions_with_daily_rows(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT region FROM regional_daily_aggregates
             WHERE aggregate_date BETWEEN $1 AND $2
             ORDER BY region
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("region").map_err(Into::into))
            .collect()
    }

    async fn regional_weekly_for(
        &self,
        region: &str,
        week_ending: NaiveDate,
    ) -> Result<Option<RegionalWeeklyAggregate>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM regional_weekly_aggregates WHERE region = $1 AND week_ending = $2",
        )
        .bind(region)
        .bind(week_ending)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(|row| {
                Ok(RegionalWeeklyAggregate {
                    region: row.try_get("region")?,
                    week_ending: row.try_get("week_ending")?,
                    total_circuits: row.try_get("total_circuits")?,
                    active_circuits: row.try_get("active_circuits")?,
                    qc_circuits: row.try_get("qc_circuits")?,
                    closed_circuits: row.try_get("closed_circuits")?,
                    rework_circuits: row.try_get("rework_circuits")?,
                    active_planners: row.try_get("active_planners")?,
                    measures: measures_from_row(row)?,
                    avg_percent_complete: row.try_get("avg_percent_complete")?,
                })
            })
            .transpose()
    }

    async fn planner_weekly_for(
        &self,
        planner: &str,
        region: &str,
        week_ending: NaiveDate,
    ) -> Result<Option<PlannerWeeklyAggregate>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM planner_weekly_aggregates
             WHERE planner = $1 AND region = $2 AND week_ending = $3
            "#,
        )
        .bind(planner)
        .bind(region)
        .bind(week_ending)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(|row| {
                Ok(PlannerWeeklyAggregate {
                    planner: row.try_get("planner")?,
                    region: row.try_get("region")?,
                    week_ending: row.try_get("week_ending")?,
                    circuits_worked: row.try_get("circuits_worked")?,
                    measures: measures_from_row(row)?,
                    miles_planned_start: row.try_get("miles_planned_start")?,
                    miles_planned_end: row.try_get("miles_planned_end")?,
                    miles_delta: row.try_get("miles_delta")?,
                    met_weekly_target: row.try_get("met_weekly_target")?,
                })
            })
            .transpose()
    }
}

#[async_trait]
impl SyncRunStore for PgStore {
    async fn insert_sync_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs
                (id, kind, trigger_kind, status, scope, started_at, completed_at, duration_ms,
                 circuits_processed, circuits_created, circuits_updated, aggregates_created,
                 snapshots_created, skipped, error_message, error_details, context)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(run.id)
        .bind(run.kind.as_str())
        .bind(run.trigger.as_str())
        .bind(run.status.as_str())
        .bind(&run.scope)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.duration_ms)
        .bind(run.counts.processed)
        .bind(run.counts.created)
        .bind(run.counts.updated)
        .bind(run.counts.aggregates_created)
        .bind(run.counts.snapshots_created)
        .bind(run.counts.skipped)
        .bind(&run.error_message)
        .bind(json(&run.error_details)?)
        .bind(&run.context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_sync_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_runs
               SET status = $2,
                   completed_at = $3,
                   duration_ms = $4,
                   circuits_processed = $5,
                   circuits_created = $6,
                   circuits_updated = $7,
                   aggregates_created = $8,
                   snapshots_created = $9,
                   skipped = $10,
                   error_message = $11,
                   error_details = $12,
                   context = $13
             WHERE id = $1 AND status = 'started'
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.completed_at)
        .bind(run.duration_ms)
        .bind(run.counts.processed)
        .bind(run.counts.created)
        .bind(run.counts.updated)
        .bind(run.counts.aggregates_created)
        .bind(run.counts.snapshots_created)
        .bind(run.counts.skipped)
        .bind(&run.error_message)
        .bind(json(&run.error_details)?)
        .bind(&run.context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_sync_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sync_runs WHERE started_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

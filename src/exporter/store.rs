//! Relational sink of the resource exporter.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::mapper::{FaultRecord, OpsJobRecord, WorkloadRecord};
use crate::error::Result;

/// Upsert-by-primary-key store for exported records.
#[async_trait]
pub trait ExportStore: Send + Sync {
    async fn upsert_workload(&self, record: &WorkloadRecord) -> Result<()>;
    async fn upsert_fault(&self, record: &FaultRecord) -> Result<()>;
    async fn upsert_ops_job(&self, record: &OpsJobRecord) -> Result<()>;
}

/// PostgreSQL-backed [`ExportStore`].
pub struct PgExportStore {
    pool: PgPool,
}

impl PgExportStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!("Connected to export database");
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

const UPSERT_WORKLOAD: &str = r#"
INSERT INTO workload (
    workload_id, workspace, cluster, resources, image, entry_point, gvk, phase,
    creation_time, start_time, end_time, deletion_time, priority, max_retry,
    dispatch_count, ttl_second, conditions, pods, nodes, dependencies,
    customer_labels, workload_uid
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
    $17, $18, $19, $20, $21, $22
)
ON CONFLICT (workload_id) DO UPDATE SET
    workspace = EXCLUDED.workspace,
    cluster = EXCLUDED.cluster,
    resources = EXCLUDED.resources,
    image = EXCLUDED.image,
    entry_point = EXCLUDED.entry_point,
    gvk = EXCLUDED.gvk,
    phase = EXCLUDED.phase,
    start_time = EXCLUDED.start_time,
    end_time = EXCLUDED.end_time,
    deletion_time = EXCLUDED.deletion_time,
    priority = EXCLUDED.priority,
    max_retry = EXCLUDED.max_retry,
    dispatch_count = EXCLUDED.dispatch_count,
    ttl_second = EXCLUDED.ttl_second,
    conditions = EXCLUDED.conditions,
    pods = EXCLUDED.pods,
    nodes = EXCLUDED.nodes,
    dependencies = EXCLUDED.dependencies,
    customer_labels = EXCLUDED.customer_labels,
    workload_uid = EXCLUDED.workload_uid
"#;

const UPSERT_FAULT: &str = r#"
INSERT INTO fault (
    uid, monitor_id, message, action, phase, cluster, node, creation_time,
    update_time, deletion_time, is_auto_repaired
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (uid) DO UPDATE SET
    monitor_id = EXCLUDED.monitor_id,
    message = EXCLUDED.message,
    action = EXCLUDED.action,
    phase = EXCLUDED.phase,
    cluster = EXCLUDED.cluster,
    node = EXCLUDED.node,
    update_time = EXCLUDED.update_time,
    deletion_time = EXCLUDED.deletion_time,
    is_auto_repaired = EXCLUDED.is_auto_repaired
"#;

const UPSERT_OPS_JOB: &str = r#"
INSERT INTO ops_job (
    job_id, cluster, workspace, type, inputs, timeout, phase, conditions,
    outputs, creation_time, start_time, end_time, deletion_time
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
ON CONFLICT (job_id) DO UPDATE SET
    cluster = EXCLUDED.cluster,
    workspace = EXCLUDED.workspace,
    type = EXCLUDED.type,
    inputs = EXCLUDED.inputs,
    timeout = EXCLUDED.timeout,
    phase = EXCLUDED.phase,
    conditions = EXCLUDED.conditions,
    outputs = EXCLUDED.outputs,
    start_time = EXCLUDED.start_time,
    end_time = EXCLUDED.end_time,
    deletion_time = EXCLUDED.deletion_time
"#;

#[async_trait]
impl ExportStore for PgExportStore {
    async fn upsert_workload(&self, r: &WorkloadRecord) -> Result<()> {
        sqlx::query(UPSERT_WORKLOAD)
            .bind(&r.workload_id)
            .bind(&r.workspace)
            .bind(&r.cluster)
            .bind(&r.resources)
            .bind(&r.image)
            .bind(&r.entry_point)
            .bind(&r.gvk)
            .bind(&r.phase)
            .bind(r.creation_time)
            .bind(r.start_time)
            .bind(r.end_time)
            .bind(r.deletion_time)
            .bind(r.priority)
            .bind(r.max_retry)
            .bind(r.dispatch_count)
            .bind(r.ttl_second)
            .bind(&r.conditions)
            .bind(&r.pods)
            .bind(&r.nodes)
            .bind(&r.dependencies)
            .bind(&r.customer_labels)
            .bind(&r.workload_uid)
            .execute(&self.pool)
            .await?;
        debug!(workload = %r.workload_id, phase = %r.phase, "Upserted workload record");
        Ok(())
    }

    async fn upsert_fault(&self, r: &FaultRecord) -> Result<()> {
        sqlx::query(UPSERT_FAULT)
            .bind(&r.uid)
            .bind(&r.monitor_id)
            .bind(&r.message)
            .bind(&r.action)
            .bind(&r.phase)
            .bind(&r.cluster)
            .bind(&r.node)
            .bind(r.creation_time)
            .bind(r.update_time)
            .bind(r.deletion_time)
            .bind(r.is_auto_repaired)
            .execute(&self.pool)
            .await?;
        debug!(fault = %r.uid, "Upserted fault record");
        Ok(())
    }

    async fn upsert_ops_job(&self, r: &OpsJobRecord) -> Result<()> {
        sqlx::query(UPSERT_OPS_JOB)
            .bind(&r.job_id)
            .bind(&r.cluster)
            .bind(&r.workspace)
            .bind(&r.job_type)
            .bind(&r.inputs)
            .bind(r.timeout)
            .bind(&r.phase)
            .bind(&r.conditions)
            .bind(&r.outputs)
            .bind(r.creation_time)
            .bind(r.start_time)
            .bind(r.end_time)
            .bind(r.deletion_time)
            .execute(&self.pool)
            .await?;
        debug!(job = %r.job_id, "Upserted ops job record");
        Ok(())
    }
}

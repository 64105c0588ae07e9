//! Dispatcher
//!
//! Sends scheduled workloads to their data-plane cluster. The object is built
//! from the kind's workload template and ResourceTemplate, created in the
//! workspace namespace, and the workload is then marked dispatched with the
//! next dispatch count. Spec changes of an already dispatched workload are
//! re-applied to the live object.

mod object;

pub use object::{
    apply_workload, build_object, entry_point, is_spec_changed, object_labels, GPU_RESOURCE,
    SHARED_MEMORY_VOLUME,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::DynamicObject;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::syncer::is_unrecoverable;
use crate::conditions::{
    build_condition, find_condition, generate_dispatch_reason, set_condition, set_workload_failed,
    ADMIN_DISPATCHED, CONDITION_TRUE,
};
use crate::crd::{
    ResourceTemplate, Workload, WORKLOAD_DISPATCHED_ANNOTATION, WORKLOAD_DISPATCH_COUNT_ANNOTATION,
    WORKLOAD_RESCHEDULED_ANNOTATION,
};
use crate::error::{OperatorError, Result};
use crate::informer::{
    run_watch, AdminCluster, Change, ChangeHandler, ClusterInformer, ClusterRegistry, ObjectCache,
};
use crate::workload_store::WorkloadStore;
use crate::workqueue::{Handler, RateLimitedController, RateLimitingQueue, ReconcileResult};

pub struct Dispatcher {
    registry: Arc<ClusterRegistry>,
    admin: Arc<dyn AdminCluster>,
    workloads: Arc<dyn WorkloadStore>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        admin: Arc<dyn AdminCluster>,
        workloads: Arc<dyn WorkloadStore>,
    ) -> Self {
        Self {
            registry,
            admin,
            workloads,
        }
    }

    async fn resource_template(&self, workload: &Workload) -> Result<ResourceTemplate> {
        let gvk = &workload.spec.group_version_kind;
        self.admin
            .find_resource_template(gvk)
            .await?
            .ok_or_else(|| OperatorError::NotFound(format!("no resource template for {gvk}")))
    }

    async fn handle(&self, workload: &Workload) -> Result<()> {
        let cluster_id = workload.cluster_id().ok_or_else(|| {
            OperatorError::InvalidState(format!("workload {} has no cluster", workload.name_any()))
        })?;
        let cluster = self.registry.acquire(cluster_id).await?;
        let gvk = &workload.spec.group_version_kind;
        let cached = cluster
            .get_resource_informer(gvk)
            .await?
            .get(&workload.name_any(), &workload.spec.workspace);

        if !workload.is_dispatched() {
            if cached.is_none() {
                self.dispatch(workload, &cluster).await?;
            }
            return self.mark_dispatched(workload).await;
        }
        match cached {
            Some(obj) => self.update_dispatched(workload, &cluster, &obj).await,
            None => {
                debug!(workload = %workload.name_any(), "Dispatched object is not cached");
                Ok(())
            }
        }
    }

    async fn dispatch(&self, workload: &Workload, cluster: &ClusterInformer) -> Result<()> {
        let gvk = &workload.spec.group_version_kind;
        let rt = self.resource_template(workload).await?;
        let template = self
            .admin
            .find_workload_template(gvk)
            .await?
            .ok_or_else(|| OperatorError::NotFound(format!("no workload template for {gvk}")))?;
        let object = build_object(&template, workload, &rt)?;
        cluster.client().create_object(gvk, &object).await?;
        info!(
            workload = %workload.name_any(),
            cluster = %cluster.name(),
            gvk = %gvk,
            "Created data-plane object"
        );
        Ok(())
    }

    async fn mark_dispatched(&self, workload: &Workload) -> Result<()> {
        let count = workload.dispatch_count() + 1;
        let reason = generate_dispatch_reason(count);
        if find_condition(workload.conditions(), ADMIN_DISPATCHED, &reason).is_none() {
            let mut updated = workload.clone();
            set_condition(
                &mut updated.status_mut().conditions,
                build_condition(ADMIN_DISPATCHED, CONDITION_TRUE, &reason, "the workload is dispatched"),
            );
            self.workloads.update_status(&updated).await?;
        }
        let annotations = BTreeMap::from([
            (WORKLOAD_DISPATCHED_ANNOTATION.to_string(), Some(Utc::now().to_rfc3339())),
            (WORKLOAD_DISPATCH_COUNT_ANNOTATION.to_string(), Some(count.to_string())),
            (WORKLOAD_RESCHEDULED_ANNOTATION.to_string(), None),
        ]);
        self.workloads
            .patch_annotations(&workload.name_any(), annotations)
            .await?;
        info!(
            workload = %workload.name_any(),
            dispatch_count = count,
            max_retry = workload.spec.max_retry,
            "The workload is dispatched"
        );
        Ok(())
    }

    async fn update_dispatched(
        &self,
        workload: &Workload,
        cluster: &ClusterInformer,
        obj: &DynamicObject,
    ) -> Result<()> {
        let rt = self.resource_template(workload).await?;
        let mut value = serde_json::to_value(obj)?;
        if !is_spec_changed(&value, workload, &rt) {
            return Ok(());
        }
        apply_workload(&mut value, workload, &rt).map_err(|e| match e {
            OperatorError::BadRequest(_) => e,
            other => OperatorError::Internal(other.to_string()),
        })?;
        let updated: DynamicObject = serde_json::from_value(value)?;
        cluster
            .client()
            .replace_object(&workload.spec.group_version_kind, &updated)
            .await?;
        info!(workload = %workload.name_any(), cluster = %cluster.name(), "Updated data-plane object");
        Ok(())
    }
}

#[async_trait]
impl Handler<String> for Dispatcher {
    async fn reconcile(&self, name: String) -> Result<ReconcileResult> {
        let Some(workload) = self.workloads.get(&name).await? else {
            return Ok(ReconcileResult::done());
        };
        if workload.metadata.deletion_timestamp.is_some() || workload.is_end() {
            return Ok(ReconcileResult::done());
        }
        if !workload.is_dispatched() && !workload.is_scheduled() {
            return Ok(ReconcileResult::done());
        }

        match self.handle(&workload).await {
            Err(e) if is_unrecoverable(&e) => {
                warn!(workload = %name, error = %e, "Failed to dispatch workload");
                let mut failed = self.workloads.get(&name).await?.unwrap_or(workload);
                set_workload_failed(&mut failed, &e.to_string());
                self.workloads.update_status(&failed).await?;
                Ok(ReconcileResult::done())
            }
            Err(e) => Err(e),
            Ok(()) => Ok(ReconcileResult::done()),
        }
    }
}

/// Whether an update of a dispatched workload touches what its object carries.
fn is_dispatched_spec_update(old: &Workload, new: &Workload) -> bool {
    new.is_dispatched()
        && (old.spec.image != new.spec.image
            || old.spec.entry_point != new.spec.entry_point
            || old.spec.resources != new.spec.resources)
}

/// Enqueues workloads that become ready to dispatch or change while dispatched.
pub struct DispatcherWatch {
    queue: RateLimitingQueue<String>,
}

impl DispatcherWatch {
    pub fn new(queue: RateLimitingQueue<String>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl ChangeHandler<Workload> for DispatcherWatch {
    async fn on_change(&self, change: Change<Workload>) {
        let enqueue = match &change {
            Change::Added(w) => w.is_dispatching(),
            Change::Updated { old, new } => {
                (!old.is_dispatching() && new.is_dispatching()) || is_dispatched_spec_update(old, new)
            }
            Change::Deleted(_) => false,
        };
        if enqueue {
            self.queue.add(change.object().name_any());
        }
    }
}

/// Run the dispatcher until `token` is cancelled.
pub async fn run(dispatcher: Arc<Dispatcher>, client: Client, concurrency: usize, token: CancellationToken) {
    let engine = RateLimitedController::new("dispatcher", dispatcher as Arc<dyn Handler<String>>, concurrency);
    let watch = DispatcherWatch::new(engine.queue().clone());
    tokio::join!(
        run_watch(
            Api::<Workload>::all(client),
            watcher::Config::default(),
            Arc::new(ObjectCache::default()),
            Arc::new(watch),
            token.clone(),
        ),
        engine.start(token),
    );
}

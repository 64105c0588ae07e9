//! Syncer
//!
//! Mirrors the state of dispatched data-plane objects back onto their admin
//! Workloads. Messages come from the cluster informers; each one is resolved
//! against the live workload, so redelivered or stale messages are harmless.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::conditions::{
    build_condition, generate_dispatch_reason, set_condition, set_workload_failed,
    ADMIN_SCHEDULING, CONDITION_TRUE, K8S_DELETED, K8S_FAILED, K8S_PENDING, K8S_RUNNING,
    K8S_SUCCEEDED, K8S_UPDATING,
};
use crate::crd::{
    Workload, WorkloadPhase, WORKLOAD_DISPATCHED_ANNOTATION, WORKLOAD_RESCHEDULED_ANNOTATION,
    WORKLOAD_SCHEDULED_ANNOTATION,
};
use crate::error::{OperatorError, Result};
use crate::informer::{
    AdminCluster, ClusterInformer, ClusterRegistry, MessageSink, ResourceAction, ResourceMessage,
    EVENT_KIND, POD_KIND,
};
use crate::unstructured::{get_k8s_object_status, K8sObjectStatus};
use crate::workload_store::WorkloadStore;
use crate::workqueue::{Handler, RateLimitingQueue, ReconcileResult};

/// Wait before re-checking a workload that has not been dispatched yet.
pub const NOT_DISPATCHED_REQUEUE: Duration = Duration::from_secs(1);
/// Wait before re-checking whether a deleted object's pods are gone.
pub const DELETION_REQUEUE: Duration = Duration::from_secs(3);
/// Failed pods quoted in a failure message.
const MAX_FAILED_PODS_REPORTED: usize = 3;

pub struct Syncer {
    registry: Arc<ClusterRegistry>,
    admin: Arc<dyn AdminCluster>,
    workloads: Arc<dyn WorkloadStore>,
}

impl Syncer {
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

    async fn handle_message(
        &self,
        msg: &ResourceMessage,
        cluster: &ClusterInformer,
        workload: Workload,
    ) -> Result<ReconcileResult> {
        if msg.action == ResourceAction::Delete {
            let remaining = cluster
                .client()
                .count_workload_pods(&msg.namespace, &msg.workload_id)
                .await?;
            if remaining > 0 {
                warn!(workload = %msg.workload_id, pods = remaining, "Pods of the deleted object still exist");
                return Ok(ReconcileResult::requeue_after(DELETION_REQUEUE));
            }
        }

        let status = self.observe(msg, cluster, &workload).await?;
        let workload = self.update_workload_status(workload, status.as_ref(), msg).await?;

        if msg.action == ResourceAction::Delete && !workload.is_end() {
            if cluster
                .client()
                .object_exists(&msg.gvk, &msg.name, &msg.namespace)
                .await?
            {
                warn!(workload = %msg.workload_id, name = %msg.name, "Deleted object still exists");
                return Ok(ReconcileResult::requeue_after(DELETION_REQUEUE));
            }
            self.reschedule(workload, msg.dispatch_count).await?;
        }
        Ok(ReconcileResult::done())
    }

    /// Current status of the message's object, or `None` when it is no longer
    /// in the informer cache.
    async fn observe(
        &self,
        msg: &ResourceMessage,
        cluster: &ClusterInformer,
        workload: &Workload,
    ) -> Result<Option<K8sObjectStatus>> {
        if msg.action == ResourceAction::Delete {
            return Ok(Some(K8sObjectStatus {
                phase: K8S_DELETED.to_string(),
                message: format!("{} {} is deleted", msg.gvk.kind, msg.name),
                ..Default::default()
            }));
        }

        let informer = cluster
            .get_resource_informer(&msg.gvk)
            .await
            .map_err(|e| OperatorError::Reconciliation(e.to_string()))?;
        let Some(obj) = informer.get(&msg.name, &msg.namespace) else {
            debug!(name = %msg.name, namespace = %msg.namespace, "Object is no longer cached");
            return Ok(None);
        };
        let rt = self
            .admin
            .find_resource_template(&msg.gvk)
            .await?
            .ok_or_else(|| {
                OperatorError::Reconciliation(format!("no resource template for {}", msg.gvk))
            })?;

        let value = serde_json::to_value(obj.as_ref())?;
        let mut status =
            get_k8s_object_status(&value, &rt).map_err(|e| OperatorError::Internal(e.to_string()))?;
        if status.phase == K8S_FAILED {
            if let Some(details) = failed_pod_info(workload) {
                status.message = format!("{}, details: {details}", status.message);
            }
        }
        Ok(Some(status))
    }

    /// Fold `status` into the workload and write it if anything changed.
    async fn update_workload_status(
        &self,
        original: Workload,
        status: Option<&K8sObjectStatus>,
        msg: &ResourceMessage,
    ) -> Result<Workload> {
        let Some(status) = status.filter(|s| !s.phase.is_empty()) else {
            return Ok(original);
        };
        if original.is_end() {
            return Ok(original);
        }

        let mut updated = original.clone();
        apply_phase(&mut updated, status, msg.dispatch_count);
        let ended = updated.is_end();
        let now = Utc::now().to_rfc3339();
        let current = updated.status_mut();
        if current.start_time.is_none() {
            current.start_time = Some(now.clone());
        }
        if ended && current.end_time.is_none() {
            current.end_time = Some(now);
        }
        if !status.is_pending() {
            current.message = None;
        }
        current.k8s_object_uid = Some(msg.uid.clone());
        set_condition(
            &mut current.conditions,
            build_condition(
                &status.phase,
                CONDITION_TRUE,
                &generate_dispatch_reason(msg.dispatch_count),
                &status.message,
            ),
        );

        if updated.status == original.status {
            return Ok(original);
        }
        let written = self.workloads.update_status(&updated).await?;
        info!(
            workload = %written.name_any(),
            phase = %written.phase(),
            dispatch_count = msg.dispatch_count,
            k8s_phase = %status.phase,
            "Updated workload status"
        );
        Ok(written)
    }

    /// Send a workload whose object was deleted before it ended back to the
    /// scheduler.
    async fn reschedule(&self, workload: Workload, count: i32) -> Result<()> {
        let mut updated = workload.clone();
        let next_reason = generate_dispatch_reason(updated.dispatch_count() + 1);
        let mut changed = false;
        let status = updated.status_mut();
        if !status.pods.is_empty() {
            status.pods.clear();
            changed = true;
        }
        if status.phase != Some(WorkloadPhase::Pending) {
            status.phase = Some(WorkloadPhase::Pending);
            set_condition(
                &mut status.conditions,
                build_condition(
                    ADMIN_SCHEDULING,
                    CONDITION_TRUE,
                    &next_reason,
                    "the workload is re-scheduling",
                ),
            );
            changed = true;
        }
        if status.nodes.len() < count.max(0) as usize {
            status.nodes.push(Vec::new());
            changed = true;
        }
        let workload = if changed {
            self.workloads.update_status(&updated).await?
        } else {
            updated
        };

        if workload.is_dispatched() {
            let annotations = BTreeMap::from([
                (WORKLOAD_DISPATCHED_ANNOTATION.to_string(), None),
                (WORKLOAD_SCHEDULED_ANNOTATION.to_string(), None),
                (WORKLOAD_RESCHEDULED_ANNOTATION.to_string(), Some(String::new())),
            ]);
            self.workloads
                .patch_annotations(&workload.name_any(), annotations)
                .await?;
        }
        info!(workload = %workload.name_any(), dispatch_count = count, "Re-scheduling workload");
        Ok(())
    }
}

#[async_trait]
impl Handler<ResourceMessage> for Syncer {
    async fn reconcile(&self, msg: ResourceMessage) -> Result<ReconcileResult> {
        if msg.gvk.kind == EVENT_KIND || msg.gvk.kind == POD_KIND {
            debug!(kind = %msg.gvk.kind, name = %msg.name, "Acknowledged pod-level message");
            return Ok(ReconcileResult::done());
        }

        let Some(workload) = self.workloads.get(&msg.workload_id).await? else {
            return Ok(ReconcileResult::done());
        };
        if workload.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }
        if !workload.is_dispatched() {
            return Ok(ReconcileResult::requeue_after(NOT_DISPATCHED_REQUEUE));
        }
        if msg.dispatch_count < workload.dispatch_count() {
            debug!(
                workload = %msg.workload_id,
                message_count = msg.dispatch_count,
                current_count = workload.dispatch_count(),
                "Dropping message of an earlier dispatch"
            );
            return Ok(ReconcileResult::done());
        }

        let cluster = self.registry.get(&msg.cluster).ok_or_else(|| {
            OperatorError::InvalidState(format!("informer of cluster {} is not ready", msg.cluster))
        })?;
        match self.handle_message(&msg, &cluster, workload.clone()).await {
            Err(e) if is_unrecoverable(&e) => {
                warn!(workload = %msg.workload_id, error = %e, "Unrecoverable sync error, failing workload");
                let mut failed = self
                    .workloads
                    .get(&msg.workload_id)
                    .await?
                    .unwrap_or(workload);
                set_workload_failed(&mut failed, &e.to_string());
                self.workloads.update_status(&failed).await?;
                Ok(ReconcileResult::done())
            }
            other => other,
        }
    }
}

/// A sink that feeds informer messages into `queue`.
pub fn message_sink(queue: RateLimitingQueue<ResourceMessage>) -> MessageSink {
    Arc::new(move |msg| queue.add(msg))
}

/// Errors raised by this system's own checks; retrying cannot fix them.
pub(super) fn is_unrecoverable(e: &OperatorError) -> bool {
    matches!(e, OperatorError::Internal(_) | OperatorError::BadRequest(_))
}

/// Whether a failed or deleted object ends the workload, i.e. no retry is left.
fn is_workload_end(workload: &Workload, k8s_phase: &str, count: i32) -> bool {
    match k8s_phase {
        K8S_SUCCEEDED => true,
        K8S_FAILED | K8S_DELETED => {
            let max_retry = workload.spec.max_retry;
            max_retry <= 0 || count > max_retry || workload.is_failover_disabled()
        }
        _ => false,
    }
}

fn apply_phase(workload: &mut Workload, status: &K8sObjectStatus, count: i32) {
    let phase = match status.phase.as_str() {
        K8S_PENDING => Some(WorkloadPhase::Pending),
        K8S_SUCCEEDED if is_workload_end(workload, &status.phase, count) => {
            Some(WorkloadPhase::Succeeded)
        }
        K8S_FAILED | K8S_DELETED if is_workload_end(workload, &status.phase, count) => {
            Some(WorkloadPhase::Failed)
        }
        K8S_RUNNING => Some(WorkloadPhase::Running),
        K8S_UPDATING => Some(WorkloadPhase::Updating),
        _ => None,
    };
    if let Some(phase) = phase {
        workload.status_mut().phase = Some(phase);
    }
}

fn failed_pod_info(workload: &Workload) -> Option<String> {
    let failed: Vec<_> = workload
        .status
        .as_ref()?
        .pods
        .iter()
        .filter(|p| p.phase.as_deref() == Some("Failed"))
        .take(MAX_FAILED_PODS_REPORTED)
        .map(|p| json!({ "pod": p.pod_id, "node": p.k8s_node_name }))
        .collect();
    if failed.is_empty() {
        return None;
    }
    serde_json::to_string(&failed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::fixtures::dispatched_workload;
    use crate::crd::{
        ActiveReplica, GroupVersionKind, PhaseExpression, ResourceStatus, WorkloadPod,
    };
    use crate::informer::fakes::{template, FakeAdmin, FakeRemote};
    use crate::workload_store::fake::FakeWorkloadStore;
    use kube::api::{ApiResource, DynamicObject};
    use kube::runtime::watcher::Event;
    use std::sync::atomic::Ordering;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        syncer: Syncer,
        store: Arc<FakeWorkloadStore>,
        remote: Arc<FakeRemote>,
    }

    fn job_gvk() -> GroupVersionKind {
        GroupVersionKind::new("batch", "v1", "Job")
    }

    fn job_template() -> crate::crd::ResourceTemplate {
        let mut rt = template(job_gvk());
        rt.spec.active_replica = ActiveReplica {
            pre_paths: vec!["status".to_string()],
            replica_path: "active".to_string(),
        };
        rt.spec.resource_status = ResourceStatus {
            pre_paths: vec!["status".to_string(), "conditions".to_string()],
            phases: vec![
                PhaseExpression {
                    match_expressions: BTreeMap::from([
                        ("type".to_string(), "Complete".to_string()),
                        ("status".to_string(), "True".to_string()),
                    ]),
                    phase: K8S_SUCCEEDED.to_string(),
                },
                PhaseExpression {
                    match_expressions: BTreeMap::from([
                        ("type".to_string(), "Failed".to_string()),
                        ("status".to_string(), "True".to_string()),
                    ]),
                    phase: K8S_FAILED.to_string(),
                },
            ],
            message_paths: vec!["message".to_string()],
        };
        rt
    }

    async fn fixture() -> Fixture {
        let admin = Arc::new(FakeAdmin::default());
        admin.workspaces.lock().insert("ws-1".to_string());
        admin.templates.lock().push(job_template());
        let remote = Arc::new(FakeRemote::default());
        let sink: MessageSink = Arc::new(|_| {});
        let informer = ClusterInformer::new(
            "cluster-a",
            remote.clone(),
            remote.clone(),
            admin.clone(),
            sink,
            CancellationToken::new(),
        );
        informer.add_resource_template(&job_template()).await.unwrap();
        let registry = Arc::new(ClusterRegistry::default());
        registry.upsert(informer);

        let store = Arc::new(FakeWorkloadStore::default());
        Fixture {
            syncer: Syncer::new(registry, admin, store.clone()),
            store,
            remote,
        }
    }

    fn cache_job(remote: &FakeRemote, status: serde_json::Value) {
        let ar = ApiResource::from_gvk(&job_gvk().to_kube());
        let mut obj = DynamicObject::new("wl-1", &ar).within("ws-1");
        obj.data = json!({ "status": status });
        let caches = remote.caches.lock();
        caches[&job_gvk().key()].apply(Event::Apply(obj));
    }

    fn message(action: ResourceAction, count: i32) -> ResourceMessage {
        ResourceMessage {
            cluster: "cluster-a".to_string(),
            name: "wl-1".to_string(),
            namespace: "ws-1".to_string(),
            uid: "uid-1".to_string(),
            gvk: job_gvk(),
            action,
            workload_id: "wl-1".to_string(),
            dispatch_count: count,
        }
    }

    #[tokio::test]
    async fn test_running_job_marks_workload_running() {
        let f = fixture().await;
        f.store.put(dispatched_workload("wl-1", 1));
        cache_job(&f.remote, json!({"active": 1}));

        let result = f.syncer.reconcile(message(ResourceAction::Update, 1)).await.unwrap();
        assert_eq!(result, ReconcileResult::done());

        let stored = f.store.stored("wl-1");
        assert_eq!(stored.phase(), WorkloadPhase::Running);
        let status = stored.status.as_ref().unwrap();
        assert!(status.start_time.is_some());
        assert!(status.end_time.is_none());
        assert_eq!(status.k8s_object_uid.as_deref(), Some("uid-1"));
        let cond = stored.last_condition().unwrap();
        assert_eq!(cond.r#type, K8S_RUNNING);
        assert_eq!(cond.reason, "run-1");

        // Same observation again is not written
        f.syncer.reconcile(message(ResourceAction::Update, 1)).await.unwrap();
        assert_eq!(f.store.status_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_job_with_retries_left_stays_running() {
        let f = fixture().await;
        let mut workload = dispatched_workload("wl-1", 1);
        workload.spec.max_retry = 2;
        workload.status_mut().phase = Some(WorkloadPhase::Running);
        workload.status_mut().pods = vec![WorkloadPod {
            pod_id: "wl-1-0".to_string(),
            k8s_node_name: Some("node-1".to_string()),
            admin_node_name: None,
            phase: Some("Failed".to_string()),
        }];
        f.store.put(workload);
        cache_job(
            &f.remote,
            json!({"conditions": [{"type": "Failed", "status": "True", "message": "BackoffLimitExceeded"}]}),
        );

        f.syncer.reconcile(message(ResourceAction::Update, 1)).await.unwrap();
        let stored = f.store.stored("wl-1");
        assert_eq!(stored.phase(), WorkloadPhase::Running);
        let cond = stored.last_condition().unwrap();
        assert_eq!(cond.r#type, K8S_FAILED);
        assert!(cond.message.starts_with("BackoffLimitExceeded, details: "));
        assert!(cond.message.contains("node-1"));
    }

    #[tokio::test]
    async fn test_failed_job_without_retries_fails_workload() {
        let f = fixture().await;
        f.store.put(dispatched_workload("wl-1", 1));
        cache_job(&f.remote, json!({"conditions": [{"type": "Failed", "status": "True"}]}));

        f.syncer.reconcile(message(ResourceAction::Update, 1)).await.unwrap();
        let stored = f.store.stored("wl-1");
        assert_eq!(stored.phase(), WorkloadPhase::Failed);
        assert!(stored.status.as_ref().unwrap().end_time.is_some());
        assert_eq!(stored.last_condition().unwrap().message, "Job is failed");
    }

    #[tokio::test]
    async fn test_not_dispatched_is_requeued() {
        let f = fixture().await;
        f.store.put(crate::crd::fixtures::workload("wl-1"));
        let result = f.syncer.reconcile(message(ResourceAction::Add, 0)).await.unwrap();
        assert_eq!(result, ReconcileResult::requeue_after(NOT_DISPATCHED_REQUEUE));
    }

    #[tokio::test]
    async fn test_stale_message_is_dropped() {
        let f = fixture().await;
        f.store.put(dispatched_workload("wl-1", 3));
        cache_job(&f.remote, json!({"active": 1}));
        f.syncer.reconcile(message(ResourceAction::Update, 2)).await.unwrap();
        assert_eq!(f.store.status_writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_waits_for_pods_then_reschedules() {
        let f = fixture().await;
        let mut workload = dispatched_workload("wl-1", 1);
        workload.spec.max_retry = 3;
        workload.status_mut().phase = Some(WorkloadPhase::Running);
        f.store.put(workload);

        f.remote.remaining_pods.store(2, Ordering::SeqCst);
        let result = f.syncer.reconcile(message(ResourceAction::Delete, 1)).await.unwrap();
        assert_eq!(result, ReconcileResult::requeue_after(DELETION_REQUEUE));

        f.remote.remaining_pods.store(0, Ordering::SeqCst);
        f.syncer.reconcile(message(ResourceAction::Delete, 1)).await.unwrap();

        let stored = f.store.stored("wl-1");
        assert_eq!(stored.phase(), WorkloadPhase::Pending);
        let conditions = stored.conditions();
        assert!(conditions
            .iter()
            .any(|c| c.r#type == K8S_DELETED && c.message == "Job wl-1 is deleted"));
        let last = stored.last_condition().unwrap();
        assert_eq!(last.r#type, ADMIN_SCHEDULING);
        assert_eq!(last.reason, "run-2");
        assert_eq!(stored.status.as_ref().unwrap().nodes.len(), 1);
        let annotations = stored.annotations();
        assert!(!annotations.contains_key(WORKLOAD_DISPATCHED_ANNOTATION));
        assert!(annotations.contains_key(WORKLOAD_RESCHEDULED_ANNOTATION));
    }

    #[tokio::test]
    async fn test_delete_after_last_retry_fails_workload() {
        let f = fixture().await;
        f.store.put(dispatched_workload("wl-1", 1));
        f.syncer.reconcile(message(ResourceAction::Delete, 1)).await.unwrap();

        let stored = f.store.stored("wl-1");
        assert_eq!(stored.phase(), WorkloadPhase::Failed);
        assert!(stored.annotations().contains_key(WORKLOAD_DISPATCHED_ANNOTATION));
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_retryable() {
        let f = fixture().await;
        f.store.put(dispatched_workload("wl-1", 1));
        let mut msg = message(ResourceAction::Update, 1);
        msg.cluster = "cluster-b".to_string();
        let err = f.syncer.reconcile(msg).await.unwrap_err();
        assert!(!err.is_non_retryable());
    }

    #[tokio::test]
    async fn test_event_messages_are_acknowledged() {
        let f = fixture().await;
        let mut msg = message(ResourceAction::Add, 0);
        msg.gvk = GroupVersionKind::new("", "v1", EVENT_KIND);
        let result = f.syncer.reconcile(msg).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
    }
}

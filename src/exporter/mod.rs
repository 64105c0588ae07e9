//! Resource exporter.
//!
//! Mirrors selected admin-cluster kinds into a relational store. Each exported
//! kind gets its own watch and rate-limited controller; a finalizer keeps the
//! object around until its deleting state has been written.

mod filter;
mod mapper;
mod store;

pub use filter::{no_filter, unchanged_filter, ResourceFilter};
pub use mapper::{
    convert, fault_record, ops_job_record, workload_record, FaultRecord, OpsJobRecord,
    WorkloadRecord, MAX_FAULT_MESSAGE_CHARS,
};
pub use store::{ExportStore, PgExportStore};

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject, Patch, PatchParams};
use kube::discovery::pinned_kind;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::conditions::EXPORTER_FINALIZER;
use crate::crd::GroupVersionKind;
use crate::error::Result;
use crate::informer::{run_watch, Change, ChangeHandler, ObjectCache};
use crate::workqueue::{Handler, RateLimitedController, RateLimitingQueue, ReconcileResult};

/// Queue item of an exporter: the object's name and namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExportKey {
    pub name: String,
    pub namespace: Option<String>,
}

impl ExportKey {
    pub fn of(obj: &DynamicObject) -> Self {
        Self {
            name: obj.name_any(),
            namespace: obj.namespace(),
        }
    }
}

/// Writes one observed object to the sink.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn handle(&self, obj: &DynamicObject) -> Result<()>;
}

/// Object access needed by the exporter reconcile.
#[async_trait]
pub trait ExportedObjects: Send + Sync {
    async fn get(&self, key: &ExportKey) -> Result<Option<DynamicObject>>;
    async fn add_finalizer(&self, obj: &DynamicObject, finalizer: &str) -> Result<()>;
    async fn remove_finalizer(&self, obj: &DynamicObject, finalizer: &str) -> Result<()>;
}

/// [`ExportedObjects`] backed by the Kubernetes API.
pub struct KubeExportedObjects {
    client: Client,
    resource: ApiResource,
}

impl KubeExportedObjects {
    pub fn new(client: Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

/// Merge patch replacing the finalizers of `obj`. The resourceVersion makes
/// the write fail with a conflict if `obj` is stale.
fn finalizers_patch(obj: &DynamicObject, finalizers: &[&str]) -> serde_json::Value {
    json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    })
}

#[async_trait]
impl ExportedObjects for KubeExportedObjects {
    async fn get(&self, key: &ExportKey) -> Result<Option<DynamicObject>> {
        Ok(self.api(key.namespace.as_deref()).get_opt(&key.name).await?)
    }

    async fn add_finalizer(&self, obj: &DynamicObject, finalizer: &str) -> Result<()> {
        let mut finalizers: Vec<&str> = obj.finalizers().iter().map(String::as_str).collect();
        finalizers.push(finalizer);
        let patch = finalizers_patch(obj, &finalizers);
        self.api(obj.namespace().as_deref())
            .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, obj: &DynamicObject, finalizer: &str) -> Result<()> {
        let finalizers: Vec<&str> = obj
            .finalizers()
            .iter()
            .map(String::as_str)
            .filter(|f| *f != finalizer)
            .collect();
        let patch = finalizers_patch(obj, &finalizers);
        self.api(obj.namespace().as_deref())
            .patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Reconciler of one exported kind.
pub struct ResourceExporter {
    gvk: GroupVersionKind,
    objects: Arc<dyn ExportedObjects>,
    handler: Arc<dyn ResourceHandler>,
}

impl ResourceExporter {
    pub fn new(
        gvk: GroupVersionKind,
        objects: Arc<dyn ExportedObjects>,
        handler: Arc<dyn ResourceHandler>,
    ) -> Self {
        Self {
            gvk,
            objects,
            handler,
        }
    }
}

#[async_trait]
impl Handler<ExportKey> for ResourceExporter {
    async fn reconcile(&self, key: ExportKey) -> Result<ReconcileResult> {
        let Some(obj) = self.objects.get(&key).await? else {
            debug!(gvk = %self.gvk, name = %key.name, "Exported object is gone");
            return Ok(ReconcileResult::done());
        };
        let deleting = obj.metadata.deletion_timestamp.is_some();
        let has_finalizer = obj.finalizers().iter().any(|f| f == EXPORTER_FINALIZER);

        if !deleting && !has_finalizer {
            self.objects.add_finalizer(&obj, EXPORTER_FINALIZER).await?;
        }
        self.handler.handle(&obj).await?;
        if deleting && has_finalizer {
            self.objects.remove_finalizer(&obj, EXPORTER_FINALIZER).await?;
            debug!(gvk = %self.gvk, name = %key.name, "Removed exporter finalizer");
        }
        Ok(ReconcileResult::done())
    }
}

/// Whether a watched change should be reconciled. Creations pass unless the
/// filter flags them; updates pass unless the filter judges the old/new pair
/// a no-op. Deletions need no work: the finalizer already delivered the final
/// state.
pub fn should_export(filter: ResourceFilter, change: &Change<DynamicObject>) -> bool {
    match change {
        Change::Added(obj) => !filter(None, obj),
        Change::Updated { old, new } => !filter(Some(old.as_ref()), new),
        Change::Deleted(_) => false,
    }
}

struct EnqueueChanges {
    queue: RateLimitingQueue<ExportKey>,
    filter: ResourceFilter,
}

#[async_trait]
impl ChangeHandler<DynamicObject> for EnqueueChanges {
    async fn on_change(&self, change: Change<DynamicObject>) {
        if should_export(self.filter, &change) {
            self.queue.add(ExportKey::of(change.object()));
        }
    }
}

/// Kinds mirrored into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportedKind {
    Workload,
    Fault,
    OpsJob,
}

impl ExportedKind {
    pub const ALL: [ExportedKind; 3] = [Self::Workload, Self::Fault, Self::OpsJob];

    pub fn gvk(&self) -> GroupVersionKind {
        let kind = match self {
            Self::Workload => "Workload",
            Self::Fault => "Fault",
            Self::OpsJob => "OpsJob",
        };
        GroupVersionKind::new("amd.com", "v1", kind)
    }

    pub fn filter(&self) -> ResourceFilter {
        unchanged_filter
    }
}

/// Maps an object of one kind to its record and upserts it.
pub struct RecordHandler {
    kind: ExportedKind,
    store: Arc<dyn ExportStore>,
}

impl RecordHandler {
    pub fn new(kind: ExportedKind, store: Arc<dyn ExportStore>) -> Self {
        Self { kind, store }
    }
}

#[async_trait]
impl ResourceHandler for RecordHandler {
    async fn handle(&self, obj: &DynamicObject) -> Result<()> {
        match self.kind {
            ExportedKind::Workload => self.store.upsert_workload(&workload_record(obj)?).await,
            ExportedKind::Fault => self.store.upsert_fault(&fault_record(obj)?).await,
            ExportedKind::OpsJob => self.store.upsert_ops_job(&ops_job_record(obj)?).await,
        }
    }
}

/// Watch `kind` and export it until `token` is cancelled.
pub async fn run_exporter(
    client: Client,
    kind: ExportedKind,
    store: Arc<dyn ExportStore>,
    max_concurrent: usize,
    token: CancellationToken,
) -> Result<()> {
    let gvk = kind.gvk();
    let (resource, _caps) = pinned_kind(&client, &gvk.to_kube()).await?;
    let objects = Arc::new(KubeExportedObjects::new(client.clone(), resource.clone()));
    let handler = Arc::new(RecordHandler::new(kind, store));
    let exporter = Arc::new(ResourceExporter::new(gvk.clone(), objects, handler));
    let controller = RateLimitedController::<ExportKey>::new(
        &format!("{}-exporter", gvk.kind.to_lowercase()),
        exporter,
        max_concurrent,
    );

    let enqueue = Arc::new(EnqueueChanges {
        queue: controller.queue().clone(),
        filter: kind.filter(),
    });
    info!(gvk = %gvk, "Starting resource exporter");
    tokio::join!(
        run_watch(
            Api::<DynamicObject>::all_with(client, &resource),
            watcher::Config::default(),
            Arc::new(ObjectCache::default()),
            enqueue,
            token.clone(),
        ),
        controller.start(token),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperatorError;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeObjects {
        objects: Mutex<HashMap<String, DynamicObject>>,
    }

    impl FakeObjects {
        fn put(&self, obj: DynamicObject) {
            self.objects.lock().insert(obj.name_any(), obj);
        }

        fn finalizers(&self, name: &str) -> Vec<String> {
            self.objects.lock()[name].finalizers().to_vec()
        }

        fn start_deletion(&self, name: &str) {
            let mut objects = self.objects.lock();
            let obj = objects.get_mut(name).unwrap();
            obj.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        }
    }

    #[async_trait]
    impl ExportedObjects for FakeObjects {
        async fn get(&self, key: &ExportKey) -> Result<Option<DynamicObject>> {
            Ok(self.objects.lock().get(&key.name).cloned())
        }

        async fn add_finalizer(&self, obj: &DynamicObject, finalizer: &str) -> Result<()> {
            let mut objects = self.objects.lock();
            let stored = objects.get_mut(&obj.name_any()).unwrap();
            stored
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(finalizer.to_string());
            Ok(())
        }

        async fn remove_finalizer(&self, obj: &DynamicObject, finalizer: &str) -> Result<()> {
            let mut objects = self.objects.lock();
            let name = obj.name_any();
            let stored = objects.get_mut(&name).unwrap();
            if let Some(f) = stored.metadata.finalizers.as_mut() {
                f.retain(|x| x != finalizer);
            }
            // The API server removes a deleting object once no finalizer is left
            if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
                objects.remove(&name);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(String, bool)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ResourceHandler for RecordingHandler {
        async fn handle(&self, obj: &DynamicObject) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(OperatorError::Internal("store down".to_string()));
            }
            self.seen
                .lock()
                .push((obj.name_any(), obj.metadata.deletion_timestamp.is_some()));
            Ok(())
        }
    }

    fn workload_obj(name: &str) -> DynamicObject {
        let ar = ApiResource::from_gvk(&ExportedKind::Workload.gvk().to_kube());
        DynamicObject::new(name, &ar)
    }

    fn key(name: &str) -> ExportKey {
        ExportKey {
            name: name.to_string(),
            namespace: None,
        }
    }

    fn exporter(objects: Arc<FakeObjects>, handler: Arc<RecordingHandler>) -> ResourceExporter {
        ResourceExporter::new(ExportedKind::Workload.gvk(), objects, handler)
    }

    #[tokio::test]
    async fn test_deletion_is_observed_before_finalizer_removal() {
        let objects = Arc::new(FakeObjects::default());
        let handler = Arc::new(RecordingHandler::default());
        let exporter = exporter(objects.clone(), handler.clone());
        objects.put(workload_obj("wl-1"));

        exporter.reconcile(key("wl-1")).await.unwrap();
        assert_eq!(objects.finalizers("wl-1"), vec![EXPORTER_FINALIZER.to_string()]);

        objects.start_deletion("wl-1");
        handler.fail.store(true, Ordering::SeqCst);
        assert!(exporter.reconcile(key("wl-1")).await.is_err());
        // Handler failed: the object must stay pinned
        assert_eq!(objects.finalizers("wl-1"), vec![EXPORTER_FINALIZER.to_string()]);

        handler.fail.store(false, Ordering::SeqCst);
        exporter.reconcile(key("wl-1")).await.unwrap();
        assert!(objects.objects.lock().get("wl-1").is_none());
        assert_eq!(
            *handler.seen.lock(),
            vec![("wl-1".to_string(), false), ("wl-1".to_string(), true)]
        );

        // Already gone
        let result = exporter.reconcile(key("wl-1")).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
        assert_eq!(handler.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_deleting_object_without_finalizer_is_not_repinned() {
        let objects = Arc::new(FakeObjects::default());
        let handler = Arc::new(RecordingHandler::default());
        let exporter = exporter(objects.clone(), handler.clone());
        let mut obj = workload_obj("wl-2");
        obj.metadata.finalizers = Some(vec!["other".to_string()]);
        objects.put(obj);
        objects.start_deletion("wl-2");

        exporter.reconcile(key("wl-2")).await.unwrap();
        assert_eq!(objects.finalizers("wl-2"), vec!["other".to_string()]);
        assert_eq!(*handler.seen.lock(), vec![("wl-2".to_string(), true)]);
    }

    #[test]
    fn test_should_export_predicate() {
        let a = Arc::new(workload_obj("a"));
        assert!(should_export(unchanged_filter, &Change::Added(a.clone())));
        assert!(!should_export(
            unchanged_filter,
            &Change::Updated { old: a.clone(), new: a.clone() }
        ));
        let mut changed = workload_obj("a");
        changed.data = json!({"status": {"phase": "Running"}});
        assert!(should_export(
            unchanged_filter,
            &Change::Updated { old: a.clone(), new: Arc::new(changed) }
        ));
        assert!(!should_export(no_filter, &Change::Deleted(a)));
    }

    #[test]
    fn test_finalizer_patches_are_guarded_by_resource_version() {
        let mut obj = workload_obj("a");
        obj.metadata.resource_version = Some("42".to_string());
        let patch = finalizers_patch(&obj, &["other", EXPORTER_FINALIZER]);
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["metadata"]["finalizers"], json!(["other", EXPORTER_FINALIZER]));

        let cleared = finalizers_patch(&obj, &[]);
        assert_eq!(cleared["metadata"]["resourceVersion"], "42");
        assert_eq!(cleared["metadata"]["finalizers"], json!([]));
    }
}

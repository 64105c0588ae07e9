//! Per-cluster set of dynamic resource watches.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::admin::AdminCluster;
use super::message::{ResourceAction, ResourceMessage};
use super::remote::{RemoteClusterClient, RemoteClusterWatcher, ResourceInformer};
use super::watch::{Change, ChangeHandler};
use crate::crd::{
    GroupVersionKind, ResourceTemplate, WORKLOAD_DISPATCH_COUNT_LABEL, WORKLOAD_ID_LABEL,
};
use crate::error::{OperatorError, Result};
use crate::object_manager::{ObjectManager, Release};

pub const EVENT_KIND: &str = "Event";
pub const POD_KIND: &str = "Pod";

/// Receives every message a cluster informer lets through.
pub type MessageSink = Arc<dyn Fn(ResourceMessage) + Send + Sync>;

/// Warning events about pods are the only events forwarded.
pub fn is_cared_pod_event(obj: &DynamicObject) -> bool {
    obj.data.get("type").and_then(Value::as_str) == Some("Warning")
        && obj
            .data
            .pointer("/involvedObject/kind")
            .and_then(Value::as_str)
            == Some(POD_KIND)
}

/// Watches of one data-plane cluster, at most one per GVK.
pub struct ClusterInformer {
    name: String,
    watcher: Arc<dyn RemoteClusterWatcher>,
    client: Arc<dyn RemoteClusterClient>,
    admin: Arc<dyn AdminCluster>,
    informers: ObjectManager<ResourceInformer>,
    sink: MessageSink,
    token: CancellationToken,
}

impl std::fmt::Debug for ClusterInformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInformer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ClusterInformer {
    pub fn new(
        name: &str,
        watcher: Arc<dyn RemoteClusterWatcher>,
        client: Arc<dyn RemoteClusterClient>,
        admin: Arc<dyn AdminCluster>,
        sink: MessageSink,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            watcher,
            client,
            admin,
            informers: ObjectManager::new(),
            sink,
            token,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<dyn RemoteClusterClient> {
        &self.client
    }

    /// Number of active per-GVK informers.
    pub fn informer_count(&self) -> usize {
        self.informers.len()
    }

    /// Start watching the template's kind. A kind that is already watched is
    /// left untouched.
    pub async fn add_resource_template(self: &Arc<Self>, rt: &ResourceTemplate) -> Result<()> {
        let gvk = rt.spec.group_version_kind.clone();
        let key = gvk.key();
        if self.informers.has(&key) {
            debug!(cluster = %self.name, gvk = %gvk, "Resource informer already running");
            return Ok(());
        }

        let handler = Arc::new(ForwardChanges {
            informer: Arc::downgrade(self),
            gvk: gvk.clone(),
        });
        let informer = self.watcher.subscribe(&gvk, handler).await?;
        if let Err(e) = self.informers.register(&key, Arc::clone(&informer)) {
            // Lost a race with a concurrent registration; keep the live one
            debug!(cluster = %self.name, gvk = %gvk, error = %e, "Dropping duplicate informer");
            informer.release()?;
            return Ok(());
        }
        info!(cluster = %self.name, gvk = %gvk, "Added resource informer");
        Ok(())
    }

    /// Stop watching the template's kind.
    pub fn del_resource_template(&self, gvk: &GroupVersionKind) {
        if self.informers.delete(&gvk.key()) {
            info!(cluster = %self.name, gvk = %gvk, "Removed resource informer");
        } else {
            info!(cluster = %self.name, gvk = %gvk, "No resource informer to remove");
        }
    }

    /// The running informer for `gvk`. When there is none, the error says
    /// whether the template exists but its informer has not started, or there
    /// is no template at all.
    pub async fn get_resource_informer(&self, gvk: &GroupVersionKind) -> Result<Arc<ResourceInformer>> {
        if let Some(informer) = self.informers.get(&gvk.key()) {
            return Ok(informer);
        }
        match self.admin.find_resource_template(gvk).await? {
            Some(_) => Err(OperatorError::InvalidState(format!(
                "the resource informer for {gvk} on cluster {} has not started yet",
                self.name
            ))),
            None => Err(OperatorError::NotFound(format!(
                "no resource template for {gvk}"
            ))),
        }
    }

    /// Translate one change into a message, or `None` when it is filtered out.
    pub async fn handle_resource(
        &self,
        gvk: &GroupVersionKind,
        change: Change<DynamicObject>,
    ) -> Option<ResourceMessage> {
        let action = match &change {
            Change::Added(_) => ResourceAction::Add,
            Change::Updated { .. } => ResourceAction::Update,
            Change::Deleted(_) => ResourceAction::Delete,
        };
        let obj = change.object();

        if gvk.kind == EVENT_KIND {
            if !is_cared_pod_event(obj) {
                return None;
            }
            let involved = |field: &str| {
                obj.data
                    .pointer(&format!("/involvedObject/{field}"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            return Some(ResourceMessage {
                cluster: self.name.clone(),
                name: involved("name"),
                namespace: involved("namespace"),
                uid: involved("uid"),
                gvk: gvk.clone(),
                action,
                workload_id: String::new(),
                dispatch_count: 0,
            });
        }

        let labels = obj.labels();
        let workload_id = labels.get(WORKLOAD_ID_LABEL)?.clone();
        let namespace = obj.namespace().unwrap_or_default();
        match self.admin.workspace_exists(&namespace).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(cluster = %self.name, namespace = %namespace, "Dropping object outside any workspace");
                return None;
            }
            Err(e) => {
                warn!(cluster = %self.name, namespace = %namespace, error = %e, "Failed to look up workspace");
                return None;
            }
        }
        let dispatch_count = labels
            .get(WORKLOAD_DISPATCH_COUNT_LABEL)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Some(ResourceMessage {
            cluster: self.name.clone(),
            name: obj.name_any(),
            namespace,
            uid: obj.uid().unwrap_or_default(),
            gvk: gvk.clone(),
            action,
            workload_id,
            dispatch_count,
        })
    }
}

impl Release for ClusterInformer {
    fn release(&self) -> Result<()> {
        info!(cluster = %self.name, "Releasing cluster informer");
        self.informers.clear();
        self.token.cancel();
        Ok(())
    }
}

/// Feeds one GVK's changes back into its cluster informer.
struct ForwardChanges {
    informer: Weak<ClusterInformer>,
    gvk: GroupVersionKind,
}

#[async_trait]
impl ChangeHandler<DynamicObject> for ForwardChanges {
    async fn on_change(&self, change: Change<DynamicObject>) {
        let Some(informer) = self.informer.upgrade() else {
            return;
        };
        if let Some(message) = informer.handle_resource(&self.gvk, change).await {
            (informer.sink)(message);
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::crd::ResourceTemplateSpec;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::informer::watch::ObjectCache;

    /// Records subscriptions and keeps the handlers so tests can push changes.
    #[derive(Default)]
    pub(crate) struct FakeRemote {
        pub subscribes: AtomicUsize,
        pub handlers: Mutex<Vec<(GroupVersionKind, Arc<dyn ChangeHandler<DynamicObject>>)>>,
        pub deleted: Mutex<Vec<(String, String)>>,
        pub node_workloads: Mutex<Vec<String>>,
        pub caches: Mutex<std::collections::HashMap<String, Arc<ObjectCache<DynamicObject>>>>,
        pub remaining_pods: AtomicUsize,
        pub existing_objects: Mutex<HashSet<String>>,
        pub created: Mutex<Vec<DynamicObject>>,
        pub replaced: Mutex<Vec<DynamicObject>>,
    }

    #[async_trait]
    impl RemoteClusterWatcher for FakeRemote {
        async fn subscribe(
            &self,
            gvk: &GroupVersionKind,
            handler: Arc<dyn ChangeHandler<DynamicObject>>,
        ) -> Result<Arc<ResourceInformer>> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            self.handlers.lock().push((gvk.clone(), handler));
            let cache = Arc::new(ObjectCache::default());
            self.caches.lock().insert(gvk.key(), Arc::clone(&cache));
            Ok(Arc::new(ResourceInformer::new(
                gvk.clone(),
                cache,
                CancellationToken::new(),
            )))
        }
    }

    #[async_trait]
    impl RemoteClusterClient for FakeRemote {
        async fn create_object(&self, _gvk: &GroupVersionKind, object: &DynamicObject) -> Result<()> {
            self.created.lock().push(object.clone());
            Ok(())
        }

        async fn replace_object(&self, _gvk: &GroupVersionKind, object: &DynamicObject) -> Result<()> {
            self.replaced.lock().push(object.clone());
            Ok(())
        }

        async fn delete_object(&self, _gvk: &GroupVersionKind, name: &str, namespace: &str) -> Result<()> {
            self.deleted
                .lock()
                .push((namespace.to_string(), name.to_string()));
            Ok(())
        }

        async fn workloads_on_node(&self, _k8s_node: &str) -> Result<Vec<String>> {
            Ok(self.node_workloads.lock().clone())
        }

        async fn count_workload_pods(&self, _namespace: &str, _workload_id: &str) -> Result<usize> {
            Ok(self.remaining_pods.load(Ordering::SeqCst))
        }

        async fn object_exists(&self, _gvk: &GroupVersionKind, name: &str, _namespace: &str) -> Result<bool> {
            Ok(self.existing_objects.lock().contains(name))
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeAdmin {
        pub workspaces: Mutex<HashSet<String>>,
        pub templates: Mutex<Vec<ResourceTemplate>>,
        pub nodes: Mutex<Vec<crate::crd::Node>>,
        pub workload_templates: Mutex<std::collections::HashMap<String, Value>>,
    }

    #[async_trait]
    impl AdminCluster for FakeAdmin {
        async fn workspace_exists(&self, name: &str) -> Result<bool> {
            Ok(self.workspaces.lock().contains(name))
        }

        async fn find_resource_template(&self, gvk: &GroupVersionKind) -> Result<Option<ResourceTemplate>> {
            Ok(self
                .templates
                .lock()
                .iter()
                .find(|rt| rt.spec.group_version_kind == *gvk)
                .cloned())
        }

        async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
            Ok(self.templates.lock().clone())
        }

        async fn find_node(&self, name: &str) -> Result<Option<crate::crd::Node>> {
            Ok(self
                .nodes
                .lock()
                .iter()
                .find(|n| n.metadata.name.as_deref() == Some(name))
                .cloned())
        }

        async fn find_workload_template(&self, gvk: &GroupVersionKind) -> Result<Option<Value>> {
            Ok(self.workload_templates.lock().get(&gvk.key()).cloned())
        }
    }

    pub(crate) fn template(gvk: GroupVersionKind) -> ResourceTemplate {
        ResourceTemplate::new(
            &gvk.kind.to_lowercase(),
            ResourceTemplateSpec {
                group_version_kind: gvk,
                ..Default::default()
            },
        )
    }
}

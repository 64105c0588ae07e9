//! Access to one data-plane cluster.
//!
//! The cluster informer only depends on the two traits here; the kube-backed
//! implementation discovers each GVK's REST mapping at subscribe time.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, DynamicObject, ListParams, PostParams, PropagationPolicy};
use kube::discovery::{pinned_kind, Scope};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::watch::{run_watch, ChangeHandler, ObjectCache};
use crate::crd::{GroupVersionKind, WORKLOAD_ID_LABEL};
use crate::error::{ignore_not_found, OperatorError, Result};
use crate::object_manager::Release;

/// A running watch of one GVK together with its object cache.
pub struct ResourceInformer {
    gvk: GroupVersionKind,
    cache: Arc<ObjectCache<DynamicObject>>,
    token: CancellationToken,
}

impl std::fmt::Debug for ResourceInformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceInformer")
            .field("gvk", &self.gvk)
            .finish_non_exhaustive()
    }
}

impl ResourceInformer {
    pub fn new(
        gvk: GroupVersionKind,
        cache: Arc<ObjectCache<DynamicObject>>,
        token: CancellationToken,
    ) -> Self {
        Self { gvk, cache, token }
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    pub fn get(&self, name: &str, namespace: &str) -> Option<Arc<DynamicObject>> {
        self.cache.get(name, Some(namespace))
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Release for ResourceInformer {
    fn release(&self) -> Result<()> {
        debug!(gvk = %self.gvk, "Stopping resource informer");
        self.token.cancel();
        Ok(())
    }
}

/// Starts per-GVK watches on a remote cluster.
#[async_trait]
pub trait RemoteClusterWatcher: Send + Sync {
    /// Begin watching `gvk`, delivering every change to `handler`. Releasing the
    /// returned informer stops the watch.
    async fn subscribe(
        &self,
        gvk: &GroupVersionKind,
        handler: Arc<dyn ChangeHandler<DynamicObject>>,
    ) -> Result<Arc<ResourceInformer>>;
}

/// Direct object operations on a remote cluster.
#[async_trait]
pub trait RemoteClusterClient: Send + Sync {
    /// Create an object in its namespace; an object that already exists is success.
    async fn create_object(&self, gvk: &GroupVersionKind, object: &DynamicObject) -> Result<()>;

    /// Replace an object, guarded by the resourceVersion it carries.
    async fn replace_object(&self, gvk: &GroupVersionKind, object: &DynamicObject) -> Result<()>;

    /// Delete an object in the background; a missing object is success.
    async fn delete_object(&self, gvk: &GroupVersionKind, name: &str, namespace: &str) -> Result<()>;

    /// Ids of the workloads with pods on node `k8s_node`.
    async fn workloads_on_node(&self, k8s_node: &str) -> Result<Vec<String>>;

    /// Number of pods still carrying `workload_id` in `namespace`.
    async fn count_workload_pods(&self, namespace: &str, workload_id: &str) -> Result<usize>;

    async fn object_exists(&self, gvk: &GroupVersionKind, name: &str, namespace: &str) -> Result<bool>;
}

/// Kube-backed remote cluster. All watches are children of `token`.
pub struct KubeRemoteCluster {
    client: Client,
    token: CancellationToken,
}

impl KubeRemoteCluster {
    pub fn new(client: Client, token: CancellationToken) -> Self {
        Self { client, token }
    }

    async fn dynamic_api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, caps) = pinned_kind(&self.client, &gvk.to_kube()).await?;
        let api = match (caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok(api)
    }
}

#[async_trait]
impl RemoteClusterWatcher for KubeRemoteCluster {
    async fn subscribe(
        &self,
        gvk: &GroupVersionKind,
        handler: Arc<dyn ChangeHandler<DynamicObject>>,
    ) -> Result<Arc<ResourceInformer>> {
        let api = self.dynamic_api(gvk, None).await?;
        let cache = Arc::new(ObjectCache::default());
        let token = self.token.child_token();

        tokio::spawn(run_watch(
            api,
            watcher::Config::default(),
            Arc::clone(&cache),
            handler,
            token.clone(),
        ));
        info!(gvk = %gvk, "Started resource informer");
        Ok(Arc::new(ResourceInformer::new(gvk.clone(), cache, token)))
    }
}

#[async_trait]
impl RemoteClusterClient for KubeRemoteCluster {
    async fn create_object(&self, gvk: &GroupVersionKind, object: &DynamicObject) -> Result<()> {
        let api = self.dynamic_api(gvk, object.metadata.namespace.as_deref()).await?;
        match api.create(&PostParams::default(), object).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = OperatorError::from(e);
                if e.is_already_exists() {
                    debug!(gvk = %gvk, name = %object.name_any(), "Object already exists");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn replace_object(&self, gvk: &GroupVersionKind, object: &DynamicObject) -> Result<()> {
        let api = self.dynamic_api(gvk, object.metadata.namespace.as_deref()).await?;
        api.replace(&object.name_any(), &PostParams::default(), object)
            .await?;
        Ok(())
    }

    async fn delete_object(&self, gvk: &GroupVersionKind, name: &str, namespace: &str) -> Result<()> {
        let api = self.dynamic_api(gvk, Some(namespace)).await?;
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        let result: Result<()> = api.delete(name, &dp).await.map(|_| ()).map_err(Into::into);
        ignore_not_found(result)
    }

    async fn workloads_on_node(&self, k8s_node: &str) -> Result<Vec<String>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default()
            .fields(&format!("spec.nodeName={k8s_node}"))
            .labels(WORKLOAD_ID_LABEL);
        let ids: BTreeSet<String> = pods
            .list(&lp)
            .await?
            .items
            .iter()
            .filter_map(|pod| pod.labels().get(WORKLOAD_ID_LABEL).cloned())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn count_workload_pods(&self, namespace: &str, workload_id: &str) -> Result<usize> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{WORKLOAD_ID_LABEL}={workload_id}"));
        Ok(pods.list_metadata(&lp).await?.items.len())
    }

    async fn object_exists(&self, gvk: &GroupVersionKind, name: &str, namespace: &str) -> Result<bool> {
        let api = self.dynamic_api(gvk, Some(namespace)).await?;
        Ok(api.get_opt(name).await?.is_some())
    }
}

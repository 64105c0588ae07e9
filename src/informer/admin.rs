//! Read access to the admin cluster used while filtering and diagnosing events.
//!
//! Lookups are answered from reflector stores, never from the API server, so
//! a cluster informer can check every event without stalling its watch.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crd::{GroupVersionKind, Node, ResourceTemplate, Workspace};
use crate::error::{OperatorError, Result};

/// Label naming the kind a workload-template ConfigMap is for.
pub const WORKLOAD_KIND_LABEL: &str = "primus-safe.workload.kind";
/// Label naming the version a workload-template ConfigMap is for.
pub const WORKLOAD_VERSION_LABEL: &str = "primus-safe.workload.version";
/// ConfigMap data key holding the base object as JSON.
pub const WORKLOAD_TEMPLATE_KEY: &str = "template";

#[async_trait]
pub trait AdminCluster: Send + Sync {
    async fn workspace_exists(&self, name: &str) -> Result<bool>;

    async fn find_resource_template(&self, gvk: &GroupVersionKind) -> Result<Option<ResourceTemplate>>;

    async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>>;

    async fn find_node(&self, name: &str) -> Result<Option<Node>>;

    /// Base object a workload of `gvk` is built from.
    async fn find_workload_template(&self, gvk: &GroupVersionKind) -> Result<Option<Value>>;
}

pub struct KubeAdminCluster {
    workspaces: Store<Workspace>,
    templates: Store<ResourceTemplate>,
    nodes: Store<Node>,
    workload_templates: Store<ConfigMap>,
}

impl KubeAdminCluster {
    /// Start the admin caches and wait for their initial lists. The caches
    /// stop when `token` is cancelled.
    pub async fn start(client: Client, template_namespace: &str, token: CancellationToken) -> Result<Self> {
        let admin = Self {
            workspaces: spawn_reflector(Api::all(client.clone()), watcher::Config::default(), token.clone()),
            templates: spawn_reflector(Api::all(client.clone()), watcher::Config::default(), token.clone()),
            nodes: spawn_reflector(Api::all(client.clone()), watcher::Config::default(), token.clone()),
            workload_templates: spawn_reflector(
                Api::namespaced(client, template_namespace),
                watcher::Config::default().labels(WORKLOAD_KIND_LABEL),
                token,
            ),
        };
        let synced = tokio::try_join!(
            admin.workspaces.wait_until_ready(),
            admin.templates.wait_until_ready(),
            admin.nodes.wait_until_ready(),
            admin.workload_templates.wait_until_ready(),
        );
        synced.map_err(|e| OperatorError::Configuration(format!("admin cache did not sync: {e}")))?;
        info!(
            workspaces = admin.workspaces.state().len(),
            templates = admin.templates.state().len(),
            nodes = admin.nodes.state().len(),
            "Admin cluster caches synced"
        );
        Ok(admin)
    }
}

/// Keep a store of `api` current until `token` is cancelled.
fn spawn_reflector<K>(api: Api<K>, config: watcher::Config, token: CancellationToken) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let stream = watcher(api, config).default_backoff().reflect(writer).touched_objects();
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!(kind = %kind, error = %e, "Admin cache watch error"),
                    None => break,
                },
            }
        }
    });
    reader
}

/// The base object in a workload-template ConfigMap, if it is for `gvk`.
fn template_for(cm: &ConfigMap, gvk: &GroupVersionKind) -> Option<Result<Value>> {
    let labels = cm.labels();
    if labels.get(WORKLOAD_KIND_LABEL) != Some(&gvk.kind)
        || labels.get(WORKLOAD_VERSION_LABEL) != Some(&gvk.version)
    {
        return None;
    }
    let raw = cm.data.as_ref().and_then(|d| d.get(WORKLOAD_TEMPLATE_KEY));
    Some(match raw {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| {
            OperatorError::Internal(format!("template of {} is not valid JSON: {e}", cm.name_any()))
        }),
        _ => Err(OperatorError::Internal(format!(
            "failed to find the template. name: {}",
            cm.name_any()
        ))),
    })
}

#[async_trait]
impl AdminCluster for KubeAdminCluster {
    async fn workspace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.workspaces.get(&ObjectRef::new(name)).is_some())
    }

    async fn find_resource_template(&self, gvk: &GroupVersionKind) -> Result<Option<ResourceTemplate>> {
        Ok(self
            .templates
            .find(|rt| rt.spec.group_version_kind == *gvk)
            .map(|rt| (*rt).clone()))
    }

    async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        Ok(self.templates.state().iter().map(|rt| (**rt).clone()).collect())
    }

    async fn find_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.nodes.get(&ObjectRef::new(name)).map(|n| (*n).clone()))
    }

    async fn find_workload_template(&self, gvk: &GroupVersionKind) -> Result<Option<Value>> {
        self.workload_templates
            .state()
            .iter()
            .find_map(|cm| template_for(cm, gvk))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::runtime::watcher::Event;
    use std::collections::BTreeMap;

    fn workspace(name: &str) -> Workspace {
        Workspace::new(name, Default::default())
    }

    fn template_cm(name: &str, kind: &str, version: &str, body: &str) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.to_string());
        cm.metadata.namespace = Some("primus-safe".to_string());
        cm.metadata.labels = Some(BTreeMap::from([
            (WORKLOAD_KIND_LABEL.to_string(), kind.to_string()),
            (WORKLOAD_VERSION_LABEL.to_string(), version.to_string()),
        ]));
        cm.data = Some(BTreeMap::from([(WORKLOAD_TEMPLATE_KEY.to_string(), body.to_string())]));
        cm
    }

    /// An admin cache fed directly through its store writers.
    fn seeded(workspaces: Vec<Workspace>, configmaps: Vec<ConfigMap>) -> KubeAdminCluster {
        let (workspace_reader, mut workspace_writer) = reflector::store();
        for ws in workspaces {
            workspace_writer.apply_watcher_event(&Event::Apply(ws));
        }
        let (cm_reader, mut cm_writer) = reflector::store();
        for cm in configmaps {
            cm_writer.apply_watcher_event(&Event::Apply(cm));
        }
        KubeAdminCluster {
            workspaces: workspace_reader,
            templates: reflector::store().0,
            nodes: reflector::store().0,
            workload_templates: cm_reader,
        }
    }

    #[tokio::test]
    async fn test_workspace_lookup_reads_the_store() {
        let admin = seeded(vec![workspace("team-a")], vec![]);
        assert!(admin.workspace_exists("team-a").await.unwrap());
        assert!(!admin.workspace_exists("team-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_workload_template_matches_kind_and_version() {
        let admin = seeded(
            vec![],
            vec![
                template_cm("job-v1", "Job", "v1", r#"{"apiVersion": "batch/v1", "kind": "Job"}"#),
                template_cm("broken", "PyTorchJob", "v1", ""),
            ],
        );
        let job = admin
            .find_workload_template(&GroupVersionKind::new("batch", "v1", "Job"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job["kind"], "Job");

        let other_version = GroupVersionKind::new("batch", "v2", "Job");
        assert!(admin.find_workload_template(&other_version).await.unwrap().is_none());

        let empty = GroupVersionKind::new("kubeflow.org", "v1", "PyTorchJob");
        let err = admin.find_workload_template(&empty).await.unwrap_err();
        assert!(err.is_non_retryable());
    }
}

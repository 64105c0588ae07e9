//! ResourceTemplate watcher
//!
//! Keeps every cluster informer's set of watched kinds in step with the
//! ResourceTemplates in the admin cluster.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crd::ResourceTemplate;
use crate::informer::{run_watch, Change, ChangeHandler, ClusterRegistry, ObjectCache};

pub struct ResourceTemplateWatch {
    registry: Arc<ClusterRegistry>,
}

impl ResourceTemplateWatch {
    pub fn new(registry: Arc<ClusterRegistry>) -> Self {
        Self { registry }
    }

    async fn add(&self, rt: &ResourceTemplate) {
        for cluster in self.registry.all() {
            if let Err(e) = cluster.add_resource_template(rt).await {
                warn!(cluster = %cluster.name(), template = %rt.name_any(), error = %e, "Failed to add resource template");
            }
        }
    }

    fn delete(&self, rt: &ResourceTemplate) {
        for cluster in self.registry.all() {
            cluster.del_resource_template(&rt.spec.group_version_kind);
        }
    }
}

#[async_trait]
impl ChangeHandler<ResourceTemplate> for ResourceTemplateWatch {
    async fn on_change(&self, change: Change<ResourceTemplate>) {
        match change {
            Change::Added(rt) => self.add(&rt).await,
            Change::Updated { old, new } => {
                if old.spec.group_version_kind != new.spec.group_version_kind {
                    self.delete(&old);
                }
                self.add(&new).await;
            }
            Change::Deleted(rt) => self.delete(&rt),
        }
    }
}

/// Watch ResourceTemplates until `token` is cancelled.
pub async fn run(registry: Arc<ClusterRegistry>, client: Client, token: CancellationToken) {
    info!("Starting ResourceTemplate watcher");
    run_watch(
        Api::<ResourceTemplate>::all(client),
        watcher::Config::default(),
        Arc::new(ObjectCache::default()),
        Arc::new(ResourceTemplateWatch::new(registry)),
        token,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::GroupVersionKind;
    use crate::informer::fakes::{template, FakeAdmin, FakeRemote};
    use crate::informer::{ClusterInformer, MessageSink};

    fn registry_with(names: &[&str]) -> Arc<ClusterRegistry> {
        let registry = Arc::new(ClusterRegistry::default());
        for name in names {
            let remote = Arc::new(FakeRemote::default());
            let sink: MessageSink = Arc::new(|_| {});
            registry.upsert(ClusterInformer::new(
                name,
                remote.clone(),
                remote,
                Arc::new(FakeAdmin::default()),
                sink,
                CancellationToken::new(),
            ));
        }
        registry
    }

    #[tokio::test]
    async fn test_templates_follow_every_cluster() {
        let registry = registry_with(&["a", "b"]);
        let watch = ResourceTemplateWatch::new(registry.clone());
        let job = Arc::new(template(GroupVersionKind::new("batch", "v1", "Job")));

        watch.on_change(Change::Added(job.clone())).await;
        assert!(registry.all().iter().all(|c| c.informer_count() == 1));

        watch.on_change(Change::Deleted(job)).await;
        assert!(registry.all().iter().all(|c| c.informer_count() == 0));
    }

    #[tokio::test]
    async fn test_kind_change_swaps_informer() {
        let registry = registry_with(&["a"]);
        let watch = ResourceTemplateWatch::new(registry.clone());
        let old = Arc::new(template(GroupVersionKind::new("batch", "v1", "Job")));
        let mut new = template(GroupVersionKind::new("apps", "v1", "Deployment"));
        new.metadata.name = old.metadata.name.clone();

        watch.on_change(Change::Added(old.clone())).await;
        watch
            .on_change(Change::Updated {
                old,
                new: Arc::new(new),
            })
            .await;

        let cluster = registry.get("a").unwrap();
        assert_eq!(cluster.informer_count(), 1);
        assert!(cluster
            .get_resource_informer(&GroupVersionKind::new("apps", "v1", "Deployment"))
            .await
            .is_ok());
    }
}

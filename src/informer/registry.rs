//! Process-wide registry of cluster informers, keyed by cluster name.

use std::sync::Arc;

use super::cluster_informer::ClusterInformer;
use crate::error::{OperatorError, Result};
use crate::object_manager::ObjectManager;
use crate::retry::BoundedFixedDelayRetry;

pub struct ClusterRegistry {
    clusters: ObjectManager<ClusterInformer>,
    acquire_retry: BoundedFixedDelayRetry,
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new(BoundedFixedDelayRetry::default())
    }
}

impl ClusterRegistry {
    pub fn new(acquire_retry: BoundedFixedDelayRetry) -> Self {
        Self {
            clusters: ObjectManager::new(),
            acquire_retry,
        }
    }

    /// Install the informer for its cluster, releasing any previous one.
    pub fn upsert(&self, informer: Arc<ClusterInformer>) {
        let name = informer.name().to_string();
        self.clusters.upsert(&name, informer);
    }

    pub fn delete(&self, name: &str) -> bool {
        self.clusters.delete(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClusterInformer>> {
        self.clusters.get(name)
    }

    pub fn all(&self) -> Vec<Arc<ClusterInformer>> {
        self.clusters.get_all().into_iter().map(|(_, c)| c).collect()
    }

    pub fn clear(&self) {
        self.clusters.clear();
    }

    /// The informer of `name`, waiting a bounded time for it to be registered.
    pub async fn acquire(&self, name: &str) -> Result<Arc<ClusterInformer>> {
        self.acquire_retry
            .retry("acquire_cluster_informer", || async move {
                self.get(name).ok_or_else(|| {
                    OperatorError::NotFound(format!("informer of cluster {name} is not ready"))
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::informer::cluster_informer::fakes::{FakeAdmin, FakeRemote};
    use crate::informer::MessageSink;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn cluster(name: &str) -> Arc<ClusterInformer> {
        let remote = Arc::new(FakeRemote::default());
        let sink: MessageSink = Arc::new(|_| {});
        ClusterInformer::new(
            name,
            remote.clone(),
            remote,
            Arc::new(FakeAdmin::default()),
            sink,
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_registration() {
        let registry = Arc::new(ClusterRegistry::new(BoundedFixedDelayRetry::new(
            10,
            Duration::from_millis(200),
        )));
        let late = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            late.upsert(cluster("a"));
        });

        let informer = registry.acquire("a").await.unwrap();
        assert_eq!(informer.name(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up() {
        let registry = ClusterRegistry::new(BoundedFixedDelayRetry::new(3, Duration::from_millis(200)));
        assert!(registry.acquire("missing").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_upsert_releases_replaced_informer() {
        let registry = ClusterRegistry::default();
        let token = CancellationToken::new();
        let remote = Arc::new(FakeRemote::default());
        let sink: MessageSink = Arc::new(|_| {});
        let first = ClusterInformer::new(
            "a",
            remote.clone(),
            remote,
            Arc::new(FakeAdmin::default()),
            sink,
            token.clone(),
        );
        registry.upsert(first);
        registry.upsert(cluster("a"));
        assert!(token.is_cancelled());
        assert_eq!(registry.all().len(), 1);
    }
}

//! Cluster Controller
//!
//! Reconciles admin Cluster objects into running cluster informers. A Ready
//! cluster is connected and watched for every known ResourceTemplate; a
//! cluster that leaves Ready or is deleted has its watches torn down.

use crate::conditions::CLUSTER_FINALIZER;
use crate::crd::{Cluster, ControlPlane};
use crate::error::{OperatorError, Result};
use crate::informer::{
    build_client, AdminCluster, ClusterInformer, ClusterRegistry, KubeRemoteCluster, MessageSink,
    RemoteClusterClient, RemoteClusterWatcher,
};
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Installs and removes cluster informers in the registry.
pub struct ClusterLifecycle {
    registry: Arc<ClusterRegistry>,
    admin: Arc<dyn AdminCluster>,
    sink: MessageSink,
    token: CancellationToken,
    connected: Mutex<HashMap<String, ControlPlane>>,
}

impl ClusterLifecycle {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        admin: Arc<dyn AdminCluster>,
        sink: MessageSink,
        token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            admin,
            sink,
            token,
            connected: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `name` is already connected with these parameters.
    pub fn is_current(&self, name: &str, control_plane: &ControlPlane) -> bool {
        self.registry.get(name).is_some()
            && self.connected.lock().get(name) == Some(control_plane)
    }

    /// Build an informer for `name`, start a watch per existing template and
    /// store it, replacing any previous informer of the same cluster.
    pub async fn install(
        &self,
        name: &str,
        control_plane: &ControlPlane,
        watcher: Arc<dyn RemoteClusterWatcher>,
        client: Arc<dyn RemoteClusterClient>,
        token: CancellationToken,
    ) -> Result<Arc<ClusterInformer>> {
        let informer = ClusterInformer::new(
            name,
            watcher,
            client,
            Arc::clone(&self.admin),
            Arc::clone(&self.sink),
            token,
        );
        for rt in self.admin.list_resource_templates().await? {
            if let Err(e) = informer.add_resource_template(&rt).await {
                warn!(cluster = %name, template = %rt.name_any(), error = %e, "Failed to start resource informer");
            }
        }
        self.registry.upsert(Arc::clone(&informer));
        self.connected
            .lock()
            .insert(name.to_string(), control_plane.clone());
        info!(cluster = %name, informers = informer.informer_count(), "Cluster informer installed");
        Ok(informer)
    }

    /// Connect to the data-plane API server of `cluster` and install it.
    pub async fn connect(&self, cluster: &Cluster) -> Result<Arc<ClusterInformer>> {
        let name = cluster.name_any();
        let client = build_client(&name, &cluster.spec.control_plane).await?;
        let token = self.token.child_token();
        let remote = Arc::new(KubeRemoteCluster::new(client, token.clone()));
        self.install(
            &name,
            &cluster.spec.control_plane,
            remote.clone(),
            remote,
            token,
        )
        .await
    }

    /// Release the informer of `name`, if any.
    pub fn remove(&self, name: &str) {
        self.connected.lock().remove(name);
        if self.registry.delete(name) {
            info!(cluster = %name, "Cluster informer removed");
        }
    }
}

/// Context for the cluster controller
pub struct ClusterController {
    client: Client,
    lifecycle: ClusterLifecycle,
}

impl ClusterController {
    pub fn new(client: Client, lifecycle: ClusterLifecycle) -> Self {
        Self { client, lifecycle }
    }

    /// Run the cluster controller until shutdown.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let clusters: Api<Cluster> = Api::all(self.client.clone());

        info!("Starting Cluster controller");

        let controller = Controller::new(clusters, Config::default())
            .shutdown_on_signal()
            .run(
                |cluster, ctx| async move { ctx.reconcile(cluster).await },
                |cluster, error, _ctx| {
                    error!(cluster = %cluster.name_any(), error = %error, "Reconciliation error");
                    Action::requeue(Duration::from_secs(30))
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!(cluster = %obj.name, "Reconciled cluster");
                    }
                    Err(e) => {
                        error!(error = %e, "Reconciliation failed");
                    }
                }
            });

        tokio::select! {
            _ = controller => {}
            _ = token.cancelled() => {}
        }
        self.lifecycle.registry.clear();
        Ok(())
    }

    async fn reconcile(&self, cluster: Arc<Cluster>) -> std::result::Result<Action, OperatorError> {
        let name = cluster.name_any();

        if cluster.metadata.deletion_timestamp.is_some() || !cluster.is_ready() {
            self.lifecycle.remove(&name);
            if has_finalizer(&cluster) {
                self.set_finalizers(&name, without_finalizer(&cluster)).await?;
                info!(cluster = %name, "Finalizer removed");
            }
            return Ok(Action::await_change());
        }

        if !has_finalizer(&cluster) {
            let mut finalizers = cluster.finalizers().to_vec();
            finalizers.push(CLUSTER_FINALIZER.to_string());
            self.set_finalizers(&name, finalizers).await?;
        }

        if self.lifecycle.is_current(&name, &cluster.spec.control_plane) {
            return Ok(Action::await_change());
        }
        self.lifecycle.connect(&cluster).await?;
        Ok(Action::await_change())
    }

    async fn set_finalizers(&self, name: &str, finalizers: Vec<String>) -> Result<()> {
        let clusters: Api<Cluster> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        clusters
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn has_finalizer(cluster: &Cluster) -> bool {
    cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER)
}

fn without_finalizer(cluster: &Cluster) -> Vec<String> {
    cluster
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != CLUSTER_FINALIZER)
        .cloned()
        .collect()
}

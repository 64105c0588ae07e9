//! Failover Controller
//!
//! Re-dispatches failed workloads. The data-plane object of a workload that
//! needs failover is deleted; the syncer then observes the deletion and sends
//! the workload back to the scheduler.
//!
//! Two triggers feed the controller: a workload's own failure (or a forced
//! failover annotation), and a handled node fault whose policy asks for a
//! global restart of everything on that node.

mod config;
mod policy;

pub use config::{FailoverConfig, FailoverPolicies, GLOBAL_RESTART};
pub use policy::{is_disable_failover, is_failover_transition, is_need_failover};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conditions::{
    build_condition, generate_dispatch_reason, set_condition, ADMIN_FAILOVER, CONDITION_TRUE,
    K8S_FAILED,
};
use crate::crd::{Fault, FaultPhase, Workload, WORKLOAD_FORCE_FAILOVER_ANNOTATION};
use crate::error::{OperatorError, Result};
use crate::informer::{run_watch, AdminCluster, Change, ChangeHandler, ClusterRegistry, ObjectCache};
use crate::retry::BoundedFixedDelayRetry;
use crate::workload_store::WorkloadStore;
use crate::workqueue::{Handler, RateLimitedController, RateLimitingQueue, ReconcileResult};

/// Settings of the failover controller.
#[derive(Debug, Clone)]
pub struct FailoverSettings {
    pub config_map_name: String,
    pub config_map_namespace: String,
    pub concurrency: usize,
    /// Bound on re-reading and patching one workload during a fault restart.
    pub restart_retry: BoundedFixedDelayRetry,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            config_map_name: "primus-safe-failover".to_string(),
            config_map_namespace: "primus-safe".to_string(),
            concurrency: 1,
            restart_retry: BoundedFixedDelayRetry::default(),
        }
    }
}

pub struct FailoverController {
    registry: Arc<ClusterRegistry>,
    admin: Arc<dyn AdminCluster>,
    workloads: Arc<dyn WorkloadStore>,
    policies: Arc<FailoverPolicies>,
    restart_retry: BoundedFixedDelayRetry,
}

impl FailoverController {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        admin: Arc<dyn AdminCluster>,
        workloads: Arc<dyn WorkloadStore>,
        policies: Arc<FailoverPolicies>,
        restart_retry: BoundedFixedDelayRetry,
    ) -> Self {
        Self {
            registry,
            admin,
            workloads,
            policies,
            restart_retry,
        }
    }

    pub fn policies(&self) -> &Arc<FailoverPolicies> {
        &self.policies
    }

    /// React to a handled fault by restarting the workloads on its node, if
    /// the fault's policy asks for it. Individual workloads that cannot be
    /// restarted are logged and skipped.
    pub async fn handle_fault(&self, fault: &Fault) -> Result<()> {
        let monitor_id = &fault.spec.monitor_id;
        let Some(config) = self.policies.get(monitor_id) else {
            debug!(fault = %fault.name_any(), monitor = %monitor_id, "No failover policy for fault");
            return Ok(());
        };
        if !config.is_global_restart() {
            return Ok(());
        }
        let Some(node) = fault.spec.node.as_ref() else {
            return Ok(());
        };

        let (cluster_name, k8s_name) = if node.cluster_name.is_empty() || node.k8s_name.is_empty() {
            let admin_node = self.admin.find_node(&node.admin_name).await?.ok_or_else(|| {
                OperatorError::NotFound(format!("node {} not found", node.admin_name))
            })?;
            let cluster = admin_node.spec.cluster.clone().unwrap_or_default();
            (cluster, admin_node.k8s_name())
        } else {
            (node.cluster_name.clone(), node.k8s_name.clone())
        };
        if cluster_name.is_empty() {
            debug!(node = %node.admin_name, "Faulty node is not in a cluster");
            return Ok(());
        }

        let cluster = self.registry.acquire(&cluster_name).await?;
        let workload_ids = cluster.client().workloads_on_node(&k8s_name).await?;
        info!(
            fault = %fault.name_any(),
            node = %k8s_name,
            workloads = workload_ids.len(),
            force = config.force,
            "Restarting workloads on faulty node"
        );
        for id in workload_ids {
            if let Err(e) = self.restart_workload(&id, &config, fault).await {
                warn!(workload = %id, fault = %fault.name_any(), error = %e, "Giving up restarting workload");
            }
        }
        Ok(())
    }

    async fn restart_workload(&self, id: &str, config: &FailoverConfig, fault: &Fault) -> Result<()> {
        let message = format!(
            "the workload is restarted because of fault {} on node {}",
            fault.spec.monitor_id,
            fault.spec.node.as_ref().map(|n| n.admin_name.as_str()).unwrap_or_default()
        );
        self.restart_retry
            .retry("failover_restart_workload", || {
                let message = message.clone();
                async move {
                    let Some(mut workload) = self.workloads.get(id).await? else {
                        return Ok::<(), OperatorError>(());
                    };
                    if config.force {
                        if !workload.is_forced_failover() {
                            let annotations = BTreeMap::from([(
                                WORKLOAD_FORCE_FAILOVER_ANNOTATION.to_string(),
                                Some("true".to_string()),
                            )]);
                            self.workloads.patch_annotations(id, annotations).await?;
                            let Some(fresh) = self.workloads.get(id).await? else {
                                return Ok(());
                            };
                            workload = fresh;
                        }
                    } else if is_disable_failover(&workload) || created_after(&workload, fault) {
                        return Ok(());
                    }

                    let reason = generate_dispatch_reason(workload.dispatch_count());
                    set_condition(
                        &mut workload.status_mut().conditions,
                        build_condition(K8S_FAILED, CONDITION_TRUE, &reason, &message),
                    );
                    self.workloads.update_status(&workload).await?;
                    Ok(())
                }
            })
            .await
    }
}

/// Whether the workload started after the fault was raised.
fn created_after(workload: &Workload, fault: &Fault) -> bool {
    match (workload.creation_timestamp(), fault.creation_timestamp()) {
        (Some(w), Some(f)) => w.0 > f.0,
        _ => false,
    }
}

#[async_trait]
impl Handler<String> for FailoverController {
    async fn reconcile(&self, name: String) -> Result<ReconcileResult> {
        let Some(workload) = self.workloads.get(&name).await? else {
            return Ok(ReconcileResult::done());
        };
        if workload.metadata.deletion_timestamp.is_some()
            || !is_need_failover(&workload)
            || is_disable_failover(&workload)
        {
            return Ok(ReconcileResult::done());
        }
        let Some(cluster_id) = workload.cluster_id() else {
            warn!(workload = %name, "Dispatched workload has no cluster");
            return Ok(ReconcileResult::done());
        };

        let cluster = self.registry.acquire(cluster_id).await?;
        cluster
            .client()
            .delete_object(&workload.spec.group_version_kind, &name, &workload.spec.workspace)
            .await?;
        if workload.is_forced_failover() {
            let annotations =
                BTreeMap::from([(WORKLOAD_FORCE_FAILOVER_ANNOTATION.to_string(), None)]);
            self.workloads.patch_annotations(&name, annotations).await?;
        }

        let Some(mut latest) = self.workloads.get(&name).await? else {
            return Ok(ReconcileResult::done());
        };
        let reason = generate_dispatch_reason(latest.dispatch_count());
        set_condition(
            &mut latest.status_mut().conditions,
            build_condition(ADMIN_FAILOVER, CONDITION_TRUE, &reason, "the workload does failover"),
        );
        self.workloads.update_status(&latest).await?;
        info!(workload = %name, cluster = %cluster.name(), "Failover triggered");
        Ok(ReconcileResult::done())
    }
}

struct WorkloadTransitions {
    queue: RateLimitingQueue<String>,
}

#[async_trait]
impl ChangeHandler<Workload> for WorkloadTransitions {
    async fn on_change(&self, change: Change<Workload>) {
        let trigger = match &change {
            Change::Added(new) => is_failover_transition(None, new),
            Change::Updated { old, new } => is_failover_transition(Some(old), new),
            Change::Deleted(_) => false,
        };
        if trigger {
            self.queue.add(change.object().name_any());
        }
    }
}

struct FaultTransitions {
    controller: Arc<FailoverController>,
}

#[async_trait]
impl ChangeHandler<Fault> for FaultTransitions {
    async fn on_change(&self, change: Change<Fault>) {
        let fault = match change {
            Change::Added(new) if new.is_succeeded() => new,
            Change::Updated { old, new } if old.phase() != FaultPhase::Succeeded && new.is_succeeded() => new,
            _ => return,
        };
        let controller = Arc::clone(&self.controller);
        tokio::spawn(async move {
            if let Err(e) = controller.handle_fault(&fault).await {
                warn!(fault = %fault.name_any(), error = %e, "Failed to handle fault");
            }
        });
    }
}

struct PolicyUpdates {
    policies: Arc<FailoverPolicies>,
}

#[async_trait]
impl ChangeHandler<ConfigMap> for PolicyUpdates {
    async fn on_change(&self, change: Change<ConfigMap>) {
        match change {
            Change::Added(cm) | Change::Updated { new: cm, .. } => {
                self.policies.apply(&cm.data.clone().unwrap_or_default());
            }
            Change::Deleted(_) => self.policies.clear(),
        }
    }
}

/// Run the failover controller and its three watches until `token` is
/// cancelled.
pub async fn run(controller: Arc<FailoverController>, client: Client, settings: FailoverSettings, token: CancellationToken) {
    let engine = RateLimitedController::new(
        "failover",
        Arc::clone(&controller) as Arc<dyn Handler<String>>,
        settings.concurrency,
    );
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &settings.config_map_namespace);
    let cm_config =
        watcher::Config::default().fields(&format!("metadata.name={}", settings.config_map_name));

    info!(
        config_map = %settings.config_map_name,
        namespace = %settings.config_map_namespace,
        "Starting failover controller"
    );
    tokio::join!(
        run_watch(
            config_maps,
            cm_config,
            Arc::new(ObjectCache::default()),
            Arc::new(PolicyUpdates {
                policies: Arc::clone(controller.policies()),
            }),
            token.clone(),
        ),
        run_watch(
            Api::<Workload>::all(client.clone()),
            watcher::Config::default(),
            Arc::new(ObjectCache::default()),
            Arc::new(WorkloadTransitions {
                queue: engine.queue().clone(),
            }),
            token.clone(),
        ),
        run_watch(
            Api::<Fault>::all(client),
            watcher::Config::default(),
            Arc::new(ObjectCache::default()),
            Arc::new(FaultTransitions {
                controller: Arc::clone(&controller),
            }),
            token.clone(),
        ),
        engine.start(token),
    );
}

//! Primus-SaFE controller manager
//!
//! Runs the cluster, dispatcher, syncer, failover, workload-flow and exporter
//! controllers against the admin cluster. The process exits non-zero when any
//! of them stops on its own.
//!
//! ## Usage
//!
//! ```bash
//! # Run the controllers (requires kubeconfig)
//! primus-safe-controller --database-url postgres://primus@db/primus
//!
//! # Run with custom log level
//! RUST_LOG=primus_safe_controller=debug primus-safe-controller
//! ```

use anyhow::anyhow;
use clap::Parser;
use kube::Client;
use primus_safe_controller::controllers::{
    dispatcher, failover, message_sink, workload_flow, run_resource_template_watch,
    ClusterController, ClusterLifecycle, Dispatcher, FailoverController, FailoverPolicies,
    FailoverSettings, Syncer, WorkloadFlow,
};
use primus_safe_controller::exporter::{run_exporter, ExportStore, ExportedKind, PgExportStore};
use primus_safe_controller::informer::{
    AdminCluster, ClusterRegistry, KubeAdminCluster, ResourceMessage,
};
use primus_safe_controller::leader_election::{self, LeaderElectionConfig, LeaderElector};
use primus_safe_controller::retry::BoundedFixedDelayRetry;
use primus_safe_controller::workload_store::{KubeWorkloadStore, WorkloadStore};
use primus_safe_controller::workqueue::RateLimitedController;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Primus-SaFE controller manager
#[derive(Parser, Debug)]
#[command(name = "primus-safe-controller")]
#[command(version, about = "Multi-cluster workload dispatch, failover and export controllers")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, env = "LEADER_ELECTION", default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "")]
    leader_election_namespace: String,

    /// Name of the leader election Lease
    #[arg(long, env = "LEADER_ELECTION_LEASE", default_value = "primus-safe-controller-leader")]
    leader_election_lease: String,

    /// ConfigMap holding the failover policies
    #[arg(long, env = "FAILOVER_CONFIG_MAP", default_value = "primus-safe-failover")]
    failover_config_map: String,

    /// Namespace of the failover ConfigMap
    #[arg(long, env = "FAILOVER_CONFIG_NAMESPACE", default_value = "primus-safe")]
    failover_config_namespace: String,

    #[arg(long, env = "FAILOVER_CONCURRENCY", default_value_t = 1)]
    failover_concurrency: usize,

    #[arg(long, env = "DISPATCHER_CONCURRENCY", default_value_t = 4)]
    dispatcher_concurrency: usize,

    /// Namespace of the workload-template ConfigMaps
    #[arg(long, env = "WORKLOAD_TEMPLATE_NAMESPACE", default_value = "primus-safe")]
    workload_template_namespace: String,

    #[arg(long, env = "SYNCER_CONCURRENCY", default_value_t = 4)]
    syncer_concurrency: usize,

    #[arg(long, env = "FLOW_CONCURRENCY", default_value_t = 1)]
    flow_concurrency: usize,

    #[arg(long, env = "EXPORTER_CONCURRENCY", default_value_t = 1)]
    exporter_concurrency: usize,

    /// PostgreSQL URL of the export database; the exporter is off when unset
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5)]
    database_max_connections: u32,

    /// Attempts to find a cluster informer before giving up on an item
    #[arg(long, env = "CLUSTER_ACQUIRE_ATTEMPTS", default_value_t = 10)]
    cluster_acquire_attempts: u32,

    #[arg(long, env = "CLUSTER_ACQUIRE_INTERVAL_MS", default_value_t = 200)]
    cluster_acquire_interval_ms: u64,
}

impl Args {
    fn acquire_retry(&self) -> BoundedFixedDelayRetry {
        BoundedFixedDelayRetry::new(
            self.cluster_acquire_attempts,
            Duration::from_millis(self.cluster_acquire_interval_ms),
        )
    }

    fn failover_settings(&self) -> FailoverSettings {
        FailoverSettings {
            config_map_name: self.failover_config_map.clone(),
            config_map_namespace: self.failover_config_namespace.clone(),
            concurrency: self.failover_concurrency,
            ..Default::default()
        }
    }

    fn leader_election_config(&self) -> LeaderElectionConfig {
        LeaderElectionConfig {
            lease_name: self.leader_election_lease.clone(),
            namespace: leader_election::detect_namespace(&self.leader_election_namespace),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    info!("Starting Primus-SaFE controllers");
    info!(leader_election = args.leader_election, exporter = args.database_url.is_some(), "Configuration loaded");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let token = CancellationToken::new();

    // Leader election: acquire the lease before starting controllers
    let elector = if args.leader_election {
        let elector = LeaderElector::new(client.clone(), args.leader_election_config());
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let export_store = match &args.database_url {
        Some(url) => {
            let store: Arc<dyn ExportStore> =
                Arc::new(PgExportStore::connect(url, args.database_max_connections).await?);
            Some(store)
        }
        None => None,
    };

    let registry = Arc::new(ClusterRegistry::new(args.acquire_retry()));
    let admin: Arc<dyn AdminCluster> = Arc::new(
        KubeAdminCluster::start(
            client.clone(),
            &args.workload_template_namespace,
            token.child_token(),
        )
        .await?,
    );
    let workloads: Arc<dyn WorkloadStore> = Arc::new(KubeWorkloadStore::new(client.clone()));

    let syncer = Arc::new(RateLimitedController::<ResourceMessage>::new(
        "syncer",
        Arc::new(Syncer::new(
            Arc::clone(&registry),
            Arc::clone(&admin),
            Arc::clone(&workloads),
        )),
        args.syncer_concurrency,
    ));
    let lifecycle = ClusterLifecycle::new(
        Arc::clone(&registry),
        Arc::clone(&admin),
        message_sink(syncer.queue().clone()),
        token.child_token(),
    );
    let cluster_controller = Arc::new(ClusterController::new(client.clone(), lifecycle));
    let failover_controller = Arc::new(FailoverController::new(
        Arc::clone(&registry),
        Arc::clone(&admin),
        Arc::clone(&workloads),
        Arc::new(FailoverPolicies::new()),
        BoundedFixedDelayRetry::default(),
    ));
    let flow = Arc::new(WorkloadFlow::new(Arc::clone(&workloads)));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&admin),
        Arc::clone(&workloads),
    ));

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    {
        let token = token.clone();
        tasks.spawn(async move {
            cluster_controller
                .run(token)
                .await
                .map_err(|e| anyhow!("cluster controller: {e}"))
        });
    }
    {
        let (registry, client, token) = (Arc::clone(&registry), client.clone(), token.clone());
        tasks.spawn(async move {
            run_resource_template_watch(registry, client, token).await;
            Ok(())
        });
    }
    {
        let (client, token) = (client.clone(), token.clone());
        let concurrency = args.dispatcher_concurrency;
        tasks.spawn(async move {
            dispatcher::run(dispatcher, client, concurrency, token).await;
            Ok(())
        });
    }
    {
        let token = token.clone();
        tasks.spawn(async move {
            syncer.start(token).await;
            Ok(())
        });
    }
    {
        let (client, settings, token) = (client.clone(), args.failover_settings(), token.clone());
        tasks.spawn(async move {
            failover::run(failover_controller, client, settings, token).await;
            Ok(())
        });
    }
    {
        let (client, token) = (client.clone(), token.clone());
        let concurrency = args.flow_concurrency;
        tasks.spawn(async move {
            workload_flow::run(flow, client, concurrency, token).await;
            Ok(())
        });
    }
    if let Some(store) = export_store {
        for kind in ExportedKind::ALL {
            let (client, store, token) = (client.clone(), Arc::clone(&store), token.clone());
            let concurrency = args.exporter_concurrency;
            tasks.spawn(async move {
                run_exporter(client, kind, store, concurrency, token)
                    .await
                    .map_err(|e| anyhow!("{kind:?} exporter: {e}"))
            });
        }
    }

    // Periodic lease renewal; losing the lease cancels the token
    if let Some(e) = elector.clone() {
        let token = token.clone();
        tasks.spawn(async move {
            e.keep_renewing(token).await;
            Ok(())
        });
    }

    let mut failure = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = token.cancelled() => {
            error!("Leader lease lost, initiating shutdown");
        }
        Some(result) = tasks.join_next() => {
            // Every task runs until the token is cancelled
            let e = match result {
                Ok(Ok(())) if token.is_cancelled() => anyhow!("leader lease lost"),
                Ok(Ok(())) => anyhow!("a controller task exited early"),
                Ok(Err(e)) => e,
                Err(e) => e.into(),
            };
            error!(error = %e, "Controller task failed");
            failure = Some(e);
        }
    }

    token.cancel();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Err(e)) => error!(error = %e, "Controller task failed during shutdown"),
            Err(e) => error!(error = %e, "Controller task failed during shutdown"),
            Ok(Ok(())) => {}
        }
    }
    registry.clear();

    // Release the lease before exiting so a standby replica can take over immediately
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("Primus-SaFE controllers shutting down");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

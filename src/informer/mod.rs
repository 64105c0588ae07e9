//! Per-cluster dynamic watches of dispatched resources.
//!
//! One [`ClusterInformer`] exists per ready data-plane cluster. It runs one
//! watch per ResourceTemplate kind, drops objects this system did not dispatch
//! or whose namespace is not a known workspace, and forwards the rest as
//! [`ResourceMessage`]s.

mod admin;
mod client_factory;
mod cluster_informer;
mod message;
mod registry;
mod remote;
mod watch;

pub use admin::{
    AdminCluster, KubeAdminCluster, WORKLOAD_KIND_LABEL, WORKLOAD_TEMPLATE_KEY, WORKLOAD_VERSION_LABEL,
};
pub use client_factory::{build_client, build_kubeconfig};
pub use cluster_informer::{is_cared_pod_event, ClusterInformer, MessageSink, EVENT_KIND, POD_KIND};
pub use message::{ResourceAction, ResourceMessage};
pub use registry::ClusterRegistry;
pub use remote::{KubeRemoteCluster, RemoteClusterClient, RemoteClusterWatcher, ResourceInformer};
pub use watch::{object_key, run_watch, Change, ChangeHandler, ObjectCache};

#[cfg(test)]
pub(crate) use cluster_informer::fakes;

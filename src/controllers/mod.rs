//! Controllers of the Primus-SaFE control plane
//!
//! Each controller owns a watch on its inputs and a rate-limited queue of
//! keys; handlers re-read live state, so duplicate or late triggers are safe.

mod cluster;
pub mod dispatcher;
pub mod failover;
mod resource_template;
mod syncer;
pub mod workload_flow;

pub use cluster::{ClusterController, ClusterLifecycle};
pub use dispatcher::{Dispatcher, DispatcherWatch};
pub use failover::{FailoverConfig, FailoverController, FailoverPolicies, FailoverSettings};
pub use resource_template::{run as run_resource_template_watch, ResourceTemplateWatch};
pub use syncer::{message_sink, Syncer, DELETION_REQUEUE, NOT_DISPATCHED_REQUEUE};
pub use workload_flow::{DependencyIndex, WorkloadFlow, WorkloadFlowWatch};

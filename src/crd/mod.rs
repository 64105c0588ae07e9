//! Custom Resource Definitions for the Primus-SaFE controllers
//!
//! - Workload: a unit of schedulable work dispatched to a data-plane cluster
//! - Fault: a detected node problem
//! - ResourceTemplate: path rules for reading an arbitrary resource kind
//! - Cluster, Workspace, Node: admin-cluster topology

mod cluster;
mod fault;
mod resource_template;
mod workload;
mod workspace;

pub use cluster::{Cluster, ClusterPhase, ClusterSpec, ClusterStatus, ControlPlane};
pub use fault::{Fault, FaultNode, FaultPhase, FaultSpec, FaultStatus};
pub use resource_template::{
    ActiveReplica, PhaseExpression, ResourceSpec, ResourceStatus, ResourceTemplate,
    ResourceTemplateSpec,
};
pub use workload::{
    GroupVersionKind, Workload, WorkloadCondition, WorkloadPhase, WorkloadPod, WorkloadResource,
    WorkloadSpec, WorkloadStatus,
};
pub use workspace::{Node, NodeSpec, Workspace, WorkspaceSpec};

// Labels stamped on dispatched data-plane objects
pub const WORKLOAD_ID_LABEL: &str = "primus-safe.workload.id";
pub const WORKLOAD_DISPATCH_COUNT_LABEL: &str = "primus-safe.workload.dispatch.count";
pub const WORKSPACE_ID_LABEL: &str = "primus-safe.workspace.id";
pub const CLUSTER_ID_LABEL: &str = "primus-safe.cluster.id";
pub const OPS_JOB_ID_LABEL: &str = "primus-safe.ops.job.id";

// Workload annotations
pub const WORKLOAD_DISPATCH_COUNT_ANNOTATION: &str = "primus-safe.workload.dispatch.count";
pub const WORKLOAD_DISPATCHED_ANNOTATION: &str = "primus-safe.workload.dispatched";
pub const WORKLOAD_SCHEDULED_ANNOTATION: &str = "primus-safe.workload.scheduled";
pub const WORKLOAD_RESCHEDULED_ANNOTATION: &str = "primus-safe.workload.rescheduled";
pub const WORKLOAD_FORCE_FAILOVER_ANNOTATION: &str = "primus-safe.workload.force.failover";
pub const WORKLOAD_DISABLE_FAILOVER_ANNOTATION: &str = "primus-safe.workload.disable.failover";

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use kube::ResourceExt;

    pub(crate) fn workload(name: &str) -> Workload {
        Workload::new(
            name,
            WorkloadSpec {
                workspace: "ws-1".to_string(),
                group_version_kind: GroupVersionKind::new("batch", "v1", "Job"),
                ..Default::default()
            },
        )
    }

    /// A workload that has been dispatched `count` times.
    pub(crate) fn dispatched_workload(name: &str, count: i32) -> Workload {
        let mut w = workload(name);
        let annotations = w.annotations_mut();
        annotations.insert(WORKLOAD_DISPATCHED_ANNOTATION.to_string(), String::new());
        annotations.insert(
            WORKLOAD_DISPATCH_COUNT_ANNOTATION.to_string(),
            count.to_string(),
        );
        w.labels_mut()
            .insert(CLUSTER_ID_LABEL.to_string(), "cluster-a".to_string());
        w
    }
}

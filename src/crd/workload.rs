//! Workload Custom Resource Definition
//!
//! A Workload is the unit of schedulable work. The admin cluster holds the
//! Workload; the dispatcher materializes it as an arbitrary resource kind
//! (PyTorchJob, Job, StatefulSet, ...) in one data-plane cluster.

use kube::api::GroupVersionKind as KubeGvk;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    CLUSTER_ID_LABEL, WORKLOAD_DISABLE_FAILOVER_ANNOTATION, WORKLOAD_DISPATCHED_ANNOTATION,
    WORKLOAD_DISPATCH_COUNT_ANNOTATION, WORKLOAD_FORCE_FAILOVER_ANNOTATION,
    WORKLOAD_SCHEDULED_ANNOTATION,
};

/// Workload is the Schema for the workloads API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "amd.com",
    version = "v1",
    kind = "Workload",
    status = "WorkloadStatus",
    shortname = "wl",
    printcolumn = r#"{"name":"Workspace","type":"string","jsonPath":".spec.workspace"}"#,
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.groupVersionKind.kind"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Requested workspace id; also the data-plane namespace
    pub workspace: String,

    /// Image used by the main container
    #[serde(default)]
    pub image: String,

    /// Startup command, base64 encoded
    #[serde(default)]
    pub entry_point: String,

    /// Kind of resource the workload is dispatched as
    #[serde(default)]
    pub group_version_kind: GroupVersionKind,

    /// Resource requirements, one entry per role (e.g. master and worker)
    #[serde(default)]
    pub resources: Vec<WorkloadResource>,

    /// Workloads that must complete successfully before this one can start
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Failure retry limit
    #[serde(default)]
    pub max_retry: i32,

    /// Scheduling priority, 0-2
    #[serde(default)]
    pub priority: i32,

    /// Lifetime after completion, in seconds
    #[serde(default)]
    pub ttl_seconds_after_finished: Option<i32>,

    /// The workload only runs on nodes carrying all of these labels
    #[serde(default)]
    pub customer_labels: BTreeMap<String, String>,
}

/// Group, version and kind of the dispatched resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn to_kube(&self) -> KubeGvk {
        KubeGvk::gvk(&self.group, &self.version, &self.kind)
    }

    /// Stable registry key, `group/version/kind` with an empty core group.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.group, self.version, self.kind)
    }
}

impl From<&KubeGvk> for GroupVersionKind {
    fn from(gvk: &KubeGvk) -> Self {
        Self::new(&gvk.group, &gvk.version, &gvk.kind)
    }
}

impl std::fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
        }
    }
}

/// Per-role resource request
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadResource {
    /// Number of requested nodes
    #[serde(default)]
    pub replica: i32,
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub gpu: Option<String>,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub shared_memory: Option<String>,
    #[serde(default)]
    pub ephemeral_storage: Option<String>,
}

/// Status of the Workload
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default)]
    pub phase: Option<WorkloadPhase>,

    /// Processing history of the workload
    #[serde(default)]
    pub conditions: Vec<WorkloadCondition>,

    /// Phase of each dependency once it has ended
    #[serde(default)]
    pub dependencies_phase: BTreeMap<String, WorkloadPhase>,

    #[serde(default)]
    pub start_time: Option<String>,

    #[serde(default)]
    pub end_time: Option<String>,

    /// Pending-only status description
    #[serde(default)]
    pub message: Option<String>,

    /// Pods of the current dispatch
    #[serde(default)]
    pub pods: Vec<WorkloadPod>,

    /// Nodes used by each dispatch attempt
    #[serde(default)]
    pub nodes: Vec<Vec<String>>,

    /// UID of the data-plane object of the current dispatch
    #[serde(default)]
    pub k8s_object_uid: Option<String>,
}

/// Phase of the workload lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum WorkloadPhase {
    #[default]
    Pending,
    Dispatched,
    Running,
    /// Only for Deployment/StatefulSet
    Updating,
    /// Only for Deployment/StatefulSet
    NotReady,
    Succeeded,
    Failed,
    Stopped,
}

impl WorkloadPhase {
    pub fn is_end(&self) -> bool {
        matches!(
            self,
            WorkloadPhase::Succeeded | WorkloadPhase::Failed | WorkloadPhase::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadPhase::Pending => "Pending",
            WorkloadPhase::Dispatched => "Dispatched",
            WorkloadPhase::Running => "Running",
            WorkloadPhase::Updating => "Updating",
            WorkloadPhase::NotReady => "NotReady",
            WorkloadPhase::Succeeded => "Succeeded",
            WorkloadPhase::Failed => "Failed",
            WorkloadPhase::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition of the workload
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadCondition {
    /// Type of condition, e.g. K8sRunning or AdminFailover
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Dispatch-derived reason, e.g. run-2
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

/// Pod bound to the workload
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadPod {
    pub pod_id: String,
    #[serde(default)]
    pub k8s_node_name: Option<String>,
    #[serde(default)]
    pub admin_node_name: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
}

impl Workload {
    pub fn phase(&self) -> WorkloadPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }

    /// A workload is ended iff its phase is Succeeded, Failed or Stopped.
    pub fn is_end(&self) -> bool {
        self.phase().is_end()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == WorkloadPhase::Running
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.labels().get(CLUSTER_ID_LABEL).map(String::as_str)
    }

    /// Number of times the workload has been dispatched, read from its annotation.
    pub fn dispatch_count(&self) -> i32 {
        self.annotations()
            .get(WORKLOAD_DISPATCH_COUNT_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_dispatched(&self) -> bool {
        self.annotations()
            .contains_key(WORKLOAD_DISPATCHED_ANNOTATION)
    }

    pub fn is_scheduled(&self) -> bool {
        self.annotations()
            .contains_key(WORKLOAD_SCHEDULED_ANNOTATION)
    }

    /// Placed by the scheduler but not yet sent to its cluster.
    pub fn is_dispatching(&self) -> bool {
        self.is_scheduled() && !self.is_dispatched()
    }

    /// Sum of the replicas requested by every role.
    pub fn total_replica(&self) -> i64 {
        self.spec.resources.iter().map(|r| i64::from(r.replica)).sum()
    }

    pub fn is_forced_failover(&self) -> bool {
        self.annotations()
            .contains_key(WORKLOAD_FORCE_FAILOVER_ANNOTATION)
    }

    pub fn is_failover_disabled(&self) -> bool {
        self.annotations()
            .get(WORKLOAD_DISABLE_FAILOVER_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    pub fn conditions(&self) -> &[WorkloadCondition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn last_condition(&self) -> Option<&WorkloadCondition> {
        self.conditions().last()
    }

    pub fn status_mut(&mut self) -> &mut WorkloadStatus {
        self.status.get_or_insert_with(WorkloadStatus::default)
    }

    pub fn set_dependencies_phase(&mut self, workload_id: &str, phase: WorkloadPhase) {
        self.status_mut()
            .dependencies_phase
            .insert(workload_id.to_string(), phase);
    }

    pub fn dependencies_phase(&self, workload_id: &str) -> Option<WorkloadPhase> {
        self.status
            .as_ref()
            .and_then(|s| s.dependencies_phase.get(workload_id).copied())
    }

    /// True when every dependency has been recorded as Succeeded.
    pub fn is_dependencies_finish(&self) -> bool {
        if self.is_end() {
            return false;
        }
        self.spec
            .dependencies
            .iter()
            .all(|dep| self.dependencies_phase(dep) == Some(WorkloadPhase::Succeeded))
    }

    /// Nodes used by the latest dispatch attempt.
    pub fn current_nodes(&self) -> &[String] {
        self.status
            .as_ref()
            .and_then(|s| s.nodes.last())
            .map(|n| n.as_slice())
            .unwrap_or_default()
    }
}

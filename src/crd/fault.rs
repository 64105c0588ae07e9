//! Fault Custom Resource Definition
//!
//! A Fault is raised by node-health agents when a hardware or node problem is
//! detected. Its `monitorId` keys the failover policy applied once the fault
//! has been handled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Fault is the Schema for the faults API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "amd.com",
    version = "v1",
    kind = "Fault",
    status = "FaultStatus",
    printcolumn = r#"{"name":"Monitor","type":"string","jsonPath":".spec.monitorId"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.node.adminName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FaultSpec {
    /// Fault type, e.g. "501" or "gpu-xgmi"
    pub monitor_id: String,

    /// Node the fault was observed on
    #[serde(default)]
    pub node: Option<FaultNode>,

    /// Remediation action taken by the fault handler, e.g. taint or drain
    #[serde(default)]
    pub action: String,

    #[serde(default)]
    pub is_auto_repair_enabled: bool,

    #[serde(default)]
    pub message: String,
}

/// Node reference carried by a Fault
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FaultNode {
    /// Name of the admin-cluster Node object
    pub admin_name: String,
    /// Name of the node inside its data-plane cluster
    #[serde(default)]
    pub k8s_name: String,
    #[serde(default)]
    pub cluster_name: String,
}

/// Status of the Fault
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FaultStatus {
    #[serde(default)]
    pub phase: Option<FaultPhase>,
    #[serde(default)]
    pub update_time: Option<String>,
}

/// Phase of the fault lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum FaultPhase {
    #[default]
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl Fault {
    pub fn phase(&self) -> FaultPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }

    pub fn is_succeeded(&self) -> bool {
        self.phase() == FaultPhase::Succeeded
    }
}

//! Cluster Custom Resource Definition
//!
//! A Cluster describes one data-plane Kubernetes cluster and how to reach it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster is the Schema for the clusters API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "amd.com",
    version = "v1",
    kind = "Cluster",
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub control_plane: ControlPlane,
}

/// Connection parameters of the data-plane API server
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlane {
    /// API server endpoints, the first reachable one is used
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Base64-encoded PEM client certificate
    #[serde(default)]
    pub cert_data: String,
    /// Base64-encoded PEM client key
    #[serde(default)]
    pub key_data: String,
    /// Base64-encoded PEM cluster CA
    #[serde(default)]
    pub ca_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: Option<ClusterPhase>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Creating,
    Ready,
    Failed,
    Deleting,
}

impl Cluster {
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .is_some_and(|p| p == ClusterPhase::Ready)
    }
}

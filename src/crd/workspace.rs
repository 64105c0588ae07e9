//! Workspace and admin Node Custom Resource Definitions
//!
//! A Workspace is a tenant; its name is also the namespace its workloads are
//! dispatched into on the data plane. An admin Node mirrors one data-plane node.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Workspace is the Schema for the workspaces API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(group = "amd.com", version = "v1", kind = "Workspace")]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// Cluster the workspace belongs to
    #[serde(default)]
    pub cluster: String,
}

/// Node is the Schema for the admin nodes API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(group = "amd.com", version = "v1", kind = "Node", plural = "nodes")]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Cluster the node has been joined to, if any
    #[serde(default)]
    pub cluster: Option<String>,
    /// Node name inside the data-plane cluster
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Node {
    /// Data-plane node name, falling back to the admin object name.
    pub fn k8s_name(&self) -> String {
        self.spec
            .hostname
            .clone()
            .or_else(|| self.metadata.name.clone())
            .unwrap_or_default()
    }
}

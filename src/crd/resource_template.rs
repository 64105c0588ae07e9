//! ResourceTemplate Custom Resource Definition
//!
//! A ResourceTemplate tells the controllers how to read replica counts,
//! container specs, phase and message out of an arbitrary resource kind. Paths
//! are ordered field-traversal sequences into the object's nested map.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::GroupVersionKind;

/// ResourceTemplate is the Schema for the resourcetemplates API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "amd.com",
    version = "v1",
    kind = "ResourceTemplate",
    shortname = "rt",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.groupVersionKind.kind"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplateSpec {
    /// Kind described by this template
    pub group_version_kind: GroupVersionKind,

    /// One entry per role; replica counts are summed across entries
    #[serde(default)]
    pub resource_specs: Vec<ResourceSpec>,

    /// Where the running replica count lives
    #[serde(default)]
    pub active_replica: ActiveReplica,

    /// How phase and message are derived
    #[serde(default)]
    pub resource_status: ResourceStatus,
}

/// Path triple locating one role inside the object
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default)]
    pub pre_paths: Vec<String>,
    /// Path from the role to its pod template
    #[serde(default)]
    pub template_paths: Vec<String>,
    /// Path from the role to its replica field; the last element is the field name
    #[serde(default)]
    pub replicas_paths: Vec<String>,
    /// Fixed replica count of the role; 0 takes whatever the other roles leave
    #[serde(default)]
    pub replica: i64,
}

impl ResourceSpec {
    /// `pre_paths` followed by `template_paths`.
    pub fn template_path(&self) -> Vec<String> {
        let mut path = self.pre_paths.clone();
        path.extend(self.template_paths.iter().cloned());
        path
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveReplica {
    #[serde(default)]
    pub pre_paths: Vec<String>,
    #[serde(default)]
    pub replica_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Path to the status object, or to a list of candidate status objects
    #[serde(default)]
    pub pre_paths: Vec<String>,
    /// Tried in order; the first fully matching expression wins
    #[serde(default)]
    pub phases: Vec<PhaseExpression>,
    /// Path, relative to the matched status object, of the message
    #[serde(default)]
    pub message_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseExpression {
    /// Field name -> expected stringified value
    #[serde(default)]
    pub match_expressions: BTreeMap<String, String>,
    pub phase: String,
}

impl ResourceTemplate {
    pub fn spec_kind(&self) -> &str {
        &self.spec.group_version_kind.kind
    }
}

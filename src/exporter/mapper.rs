//! Row mappers from exported objects to their relational records.
//!
//! Optional values stay `None` so they are written as SQL NULL; collections
//! are stored as JSON text and only when non-empty.

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::crd::{Fault, FaultPhase, Workload, WorkloadPhase, CLUSTER_ID_LABEL, WORKSPACE_ID_LABEL};
use crate::error::Result;
use crate::unstructured::{nested_field, nested_i64, nested_string_silently};

/// Fault messages longer than this are truncated.
pub const MAX_FAULT_MESSAGE_CHARS: usize = 256;

/// Row of the `workload` table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadRecord {
    pub workload_id: String,
    pub workspace: String,
    pub cluster: Option<String>,
    pub resources: Option<String>,
    pub image: String,
    pub entry_point: String,
    pub gvk: String,
    pub phase: String,
    pub creation_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub deletion_time: Option<DateTime<Utc>>,
    pub priority: i32,
    pub max_retry: i32,
    pub dispatch_count: i32,
    pub ttl_second: i32,
    pub conditions: Option<String>,
    pub pods: Option<String>,
    pub nodes: Option<String>,
    pub dependencies: Option<String>,
    pub customer_labels: Option<String>,
    pub workload_uid: Option<String>,
}

/// Row of the `fault` table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultRecord {
    pub uid: String,
    pub monitor_id: String,
    pub message: Option<String>,
    pub action: Option<String>,
    pub phase: Option<String>,
    pub cluster: Option<String>,
    pub node: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub deletion_time: Option<DateTime<Utc>>,
    pub is_auto_repaired: bool,
}

/// Row of the `ops_job` table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpsJobRecord {
    pub job_id: String,
    pub cluster: Option<String>,
    pub workspace: Option<String>,
    pub job_type: String,
    pub inputs: Option<String>,
    pub timeout: i64,
    pub phase: Option<String>,
    pub conditions: Option<String>,
    pub outputs: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub deletion_time: Option<DateTime<Utc>>,
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn non_empty<S: AsRef<str>>(value: S) -> Option<String> {
    let value = value.as_ref();
    (!value.is_empty()).then(|| value.to_string())
}

fn json_if<T: Serialize>(present: bool, value: &T) -> Option<String> {
    if !present {
        return None;
    }
    serde_json::to_string(value).ok()
}

fn json_value_if_non_empty(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::Array(a)) if a.is_empty() => None,
        Some(Value::Object(o)) if o.is_empty() => None,
        Some(v) => Some(v.to_string()),
    }
}

/// Typed view of a dynamic object.
pub fn convert<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn creation_time<K: ResourceExt>(obj: &K) -> Option<DateTime<Utc>> {
    obj.creation_timestamp().map(|t| t.0)
}

fn deletion_time<K: Resource>(obj: &K) -> Option<DateTime<Utc>> {
    obj.meta().deletion_timestamp.as_ref().map(|t| t.0)
}

/// Map a workload. A workload deleted before it ended is recorded as Stopped,
/// ending at its deletion time.
pub fn workload_record(obj: &DynamicObject) -> Result<WorkloadRecord> {
    let workload: Workload = convert(obj)?;
    let status = workload.status.clone().unwrap_or_default();
    let deleted_at = deletion_time(&workload);

    let mut phase = status.phase.unwrap_or_default();
    let mut end_time = parse_time(status.end_time.as_deref());
    if let Some(deleted_at) = deleted_at {
        if !matches!(
            phase,
            WorkloadPhase::Succeeded | WorkloadPhase::Failed | WorkloadPhase::Stopped
        ) {
            phase = WorkloadPhase::Stopped;
            end_time = Some(deleted_at);
        }
    }

    let mut pods = status.pods.clone();
    if deleted_at.is_some() {
        for pod in pods.iter_mut() {
            if !matches!(pod.phase.as_deref(), Some("Succeeded") | Some("Failed")) {
                pod.phase = Some(WorkloadPhase::Stopped.as_str().to_string());
            }
        }
    }

    let spec = &workload.spec;
    Ok(WorkloadRecord {
        workload_id: workload.name_any(),
        workspace: spec.workspace.clone(),
        cluster: workload.cluster_id().and_then(non_empty),
        resources: json_if(!spec.resources.is_empty(), &spec.resources),
        image: spec.image.clone(),
        entry_point: spec.entry_point.clone(),
        gvk: serde_json::to_string(&spec.group_version_kind)?,
        phase: phase.as_str().to_string(),
        creation_time: creation_time(&workload),
        start_time: parse_time(status.start_time.as_deref()),
        end_time,
        deletion_time: deleted_at,
        priority: spec.priority,
        max_retry: spec.max_retry,
        dispatch_count: workload.dispatch_count(),
        ttl_second: spec.ttl_seconds_after_finished.unwrap_or_default(),
        conditions: json_if(!status.conditions.is_empty(), &status.conditions),
        pods: json_if(!pods.is_empty(), &pods),
        nodes: json_if(!status.nodes.is_empty(), &status.nodes),
        dependencies: json_if(!spec.dependencies.is_empty(), &spec.dependencies),
        customer_labels: json_if(!spec.customer_labels.is_empty(), &spec.customer_labels),
        workload_uid: workload.uid().and_then(non_empty),
    })
}

pub fn fault_record(obj: &DynamicObject) -> Result<FaultRecord> {
    let fault: Fault = convert(obj)?;
    let status = fault.status.clone().unwrap_or_default();
    let phase = status.phase.map(|p| match p {
        FaultPhase::Pending => "Pending",
        FaultPhase::Processing => "Processing",
        FaultPhase::Succeeded => "Succeeded",
        FaultPhase::Failed => "Failed",
    });

    Ok(FaultRecord {
        uid: fault.uid().unwrap_or_default(),
        monitor_id: fault.spec.monitor_id.clone(),
        message: non_empty(truncate_chars(&fault.spec.message, MAX_FAULT_MESSAGE_CHARS)),
        action: non_empty(&fault.spec.action),
        phase: phase.map(str::to_string),
        cluster: fault.labels().get(CLUSTER_ID_LABEL).and_then(non_empty),
        node: fault.spec.node.as_ref().and_then(|n| non_empty(&n.admin_name)),
        creation_time: creation_time(&fault),
        update_time: parse_time(status.update_time.as_deref()),
        deletion_time: deletion_time(&fault),
        is_auto_repaired: fault.spec.is_auto_repair_enabled,
    })
}

/// Map an ops job. A job deleted while running, or before it ever reported a
/// phase, is recorded as Failed.
pub fn ops_job_record(obj: &DynamicObject) -> Result<OpsJobRecord> {
    let data = &obj.data;
    let mut phase = nested_string_silently(data, &["status", "phase"]);
    let deleted_at = deletion_time(obj);
    if deleted_at.is_some() && (phase.is_empty() || phase == "Running") {
        phase = "Failed".to_string();
    }

    Ok(OpsJobRecord {
        job_id: obj.name_any(),
        cluster: obj.labels().get(CLUSTER_ID_LABEL).and_then(non_empty),
        workspace: obj.labels().get(WORKSPACE_ID_LABEL).and_then(non_empty),
        job_type: nested_string_silently(data, &["spec", "type"]),
        inputs: json_value_if_non_empty(nested_field(data, &["spec", "inputs"])?),
        timeout: nested_i64(data, &["spec", "timeoutSecond"])?.unwrap_or_default(),
        phase: non_empty(phase),
        conditions: json_value_if_non_empty(nested_field(data, &["status", "conditions"])?),
        outputs: json_value_if_non_empty(nested_field(data, &["status", "outputs"])?),
        creation_time: creation_time(obj),
        start_time: parse_time(Some(&nested_string_silently(data, &["status", "startedAt"]))),
        end_time: parse_time(Some(&nested_string_silently(data, &["status", "finishedAt"]))),
        deletion_time: deleted_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    fn workload_json(phase: Option<&str>, deleting: bool) -> DynamicObject {
        let mut metadata = json!({
            "name": "wl-1",
            "uid": "u-1",
            "creationTimestamp": "2025-01-01T00:00:00Z",
            "labels": {CLUSTER_ID_LABEL: "cluster-a"},
            "annotations": {"primus-safe.workload.dispatch.count": "2"}
        });
        if deleting {
            metadata["deletionTimestamp"] = json!("2025-01-02T00:00:00Z");
        }
        let mut status = json!({
            "pods": [{"podId": "p-0", "phase": "Running"}, {"podId": "p-1", "phase": "Succeeded"}]
        });
        if let Some(phase) = phase {
            status["phase"] = json!(phase);
        }
        dynamic(json!({
            "apiVersion": "amd.com/v1",
            "kind": "Workload",
            "metadata": metadata,
            "spec": {
                "workspace": "ws-1",
                "groupVersionKind": {"group": "batch", "version": "v1", "kind": "Job"},
                "maxRetry": 3,
                "dependencies": ["wl-0"]
            },
            "status": status
        }))
    }

    #[test]
    fn test_workload_record_defaults_to_pending() {
        let record = workload_record(&workload_json(None, false)).unwrap();
        assert_eq!(record.phase, "Pending");
        assert_eq!(record.workload_id, "wl-1");
        assert_eq!(record.cluster.as_deref(), Some("cluster-a"));
        assert_eq!(record.dispatch_count, 2);
        assert_eq!(record.max_retry, 3);
        assert_eq!(record.dependencies.as_deref(), Some(r#"["wl-0"]"#));
        assert!(record.conditions.is_none());
        assert!(record.deletion_time.is_none());
    }

    #[test]
    fn test_deleted_running_workload_is_stopped() {
        let record = workload_record(&workload_json(Some("Running"), true)).unwrap();
        assert_eq!(record.phase, "Stopped");
        assert_eq!(record.end_time, record.deletion_time);
        assert!(record.end_time.is_some());
        let pods = record.pods.unwrap();
        assert!(pods.contains(r#""phase":"Stopped""#));
        assert!(pods.contains(r#""phase":"Succeeded""#));
    }

    #[test]
    fn test_deleted_finished_workload_keeps_phase() {
        let record = workload_record(&workload_json(Some("Failed"), true)).unwrap();
        assert_eq!(record.phase, "Failed");
        assert!(record.end_time.is_none());
    }

    #[test]
    fn test_fault_record_truncates_message() {
        let obj = dynamic(json!({
            "apiVersion": "amd.com/v1",
            "kind": "Fault",
            "metadata": {"name": "f-1", "uid": "fu-1"},
            "spec": {
                "monitorId": "501",
                "message": "x".repeat(300),
                "node": {"adminName": "node-1"}
            },
            "status": {"phase": "Succeeded"}
        }));
        let record = fault_record(&obj).unwrap();
        assert_eq!(record.uid, "fu-1");
        assert_eq!(record.message.unwrap().chars().count(), MAX_FAULT_MESSAGE_CHARS);
        assert_eq!(record.node.as_deref(), Some("node-1"));
        assert_eq!(record.phase.as_deref(), Some("Succeeded"));
        assert!(record.action.is_none());
    }

    #[test]
    fn test_deleted_running_ops_job_is_failed() {
        let obj = dynamic(json!({
            "apiVersion": "amd.com/v1",
            "kind": "OpsJob",
            "metadata": {
                "name": "job-1",
                "deletionTimestamp": "2025-01-02T00:00:00Z",
                "labels": {WORKSPACE_ID_LABEL: "ws-1"}
            },
            "spec": {"type": "preflight", "timeoutSecond": 600, "inputs": [{"name": "node", "value": "n1"}]},
            "status": {"phase": "Running", "startedAt": "2025-01-01T00:00:00Z"}
        }));
        let record = ops_job_record(&obj).unwrap();
        assert_eq!(record.phase.as_deref(), Some("Failed"));
        assert_eq!(record.timeout, 600);
        assert_eq!(record.workspace.as_deref(), Some("ws-1"));
        assert!(record.inputs.unwrap().contains("n1"));
        assert!(record.start_time.is_some());
        assert!(record.end_time.is_none());
        assert!(record.outputs.is_none());
    }
}

//! Rendering a Workload into its data-plane object.
//!
//! A base object from the workload template is shaped by the kind's
//! ResourceTemplate: every resource spec is one role whose replica count, main
//! container and shared memory come from the Workload.

use std::collections::BTreeMap;

use base64::prelude::*;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{json, Map, Value};

use crate::crd::{
    ResourceSpec, ResourceTemplate, Workload, WorkloadResource, WORKLOAD_DISPATCH_COUNT_LABEL,
    WORKLOAD_ID_LABEL, WORKSPACE_ID_LABEL,
};
use crate::error::{OperatorError, Result};
use crate::unstructured::{
    get_commands, get_images, get_memory_storage_size, get_resources, nested_field, nested_slice,
    remove_nested_field, set_nested_field,
};

pub const SHARED_MEMORY_VOLUME: &str = "shared-memory";
pub const GPU_RESOURCE: &str = "amd.com/gpu";
/// Selects the first container of every role.
const MAIN_CONTAINER: &str = "";

/// The decoded entry point of the workload.
pub fn entry_point(workload: &Workload) -> Result<String> {
    let decoded = BASE64_STANDARD
        .decode(workload.spec.entry_point.as_bytes())
        .map_err(|e| OperatorError::BadRequest(format!("entry point is not valid base64: {e}")))?;
    String::from_utf8(decoded)
        .map_err(|e| OperatorError::BadRequest(format!("entry point is not valid UTF-8: {e}")))
}

/// Resources of role `index`; roles beyond the list share the last entry.
fn role_resource(workload: &Workload, index: usize) -> Option<&WorkloadResource> {
    let resources = &workload.spec.resources;
    resources.get(index).or_else(|| resources.last())
}

fn build_resources(resource: &WorkloadResource) -> Value {
    let mut limits = Map::new();
    let mut put = |key: &str, value: &str| {
        if !value.is_empty() {
            limits.insert(key.to_string(), json!(value));
        }
    };
    put("cpu", &resource.cpu);
    put("memory", &resource.memory);
    put("ephemeral-storage", resource.ephemeral_storage.as_deref().unwrap_or_default());
    put(GPU_RESOURCE, resource.gpu.as_deref().unwrap_or_default());
    Value::Object(limits)
}

fn path_with(base: Vec<String>, tail: &[&str]) -> Vec<String> {
    let mut path = base;
    path.extend(tail.iter().map(|s| s.to_string()));
    path
}

/// Apply the workload's replicas, main container and shared memory to `obj`.
/// A role left with no replicas is removed from the object.
pub fn apply_workload(obj: &mut Value, workload: &Workload, rt: &ResourceTemplate) -> Result<()> {
    let fixed: i64 = rt.spec.resource_specs.iter().map(|s| s.replica).sum();
    let total = workload.total_replica();
    let command = entry_point(workload)?;

    for (index, spec) in rt.spec.resource_specs.iter().enumerate() {
        let replica = if spec.replica == 0 { total - fixed } else { spec.replica };
        if replica <= 0 {
            if !spec.pre_paths.is_empty() {
                remove_nested_field(obj, &spec.pre_paths)?;
            }
            continue;
        }
        if !spec.replicas_paths.is_empty() {
            let mut path = spec.pre_paths.clone();
            path.extend(spec.replicas_paths.iter().cloned());
            set_nested_field(obj, json!(replica), &path)?;
        }
        let resource = role_resource(workload, index);
        update_main_container(obj, spec, resource, &workload.spec.image, &command)?;
        if let Some(size) = resource.and_then(|r| r.shared_memory.as_deref()) {
            update_shared_memory(obj, spec, size)?;
        }
    }
    Ok(())
}

fn update_main_container(
    obj: &mut Value,
    spec: &ResourceSpec,
    resource: Option<&WorkloadResource>,
    image: &str,
    command: &str,
) -> Result<()> {
    let path = path_with(spec.template_path(), &["spec", "containers"]);
    let mut containers = nested_slice(obj, &path)?
        .filter(|c| !c.is_empty())
        .cloned()
        .ok_or_else(|| {
            OperatorError::Internal(format!("failed to find container with path: {}", path.join(".")))
        })?;
    let Some(main) = containers.first_mut().and_then(Value::as_object_mut) else {
        return Err(OperatorError::Internal("the main container is not an object".to_string()));
    };
    if let Some(resource) = resource {
        let resources = build_resources(resource);
        main.insert(
            "resources".to_string(),
            json!({ "limits": resources, "requests": resources }),
        );
    }
    main.insert("image".to_string(), json!(image));
    main.insert("command".to_string(), json!(["/bin/sh", "-c", command]));
    set_nested_field(obj, Value::Array(containers), &path)
}

fn is_memory_volume(volume: &Value) -> bool {
    volume.pointer("/emptyDir/medium").and_then(Value::as_str) == Some("Memory")
}

fn update_shared_memory(obj: &mut Value, spec: &ResourceSpec, size: &str) -> Result<()> {
    let path = path_with(spec.template_path(), &["spec", "volumes"]);
    let mut volumes = nested_slice(obj, &path)?.cloned().unwrap_or_default();
    match volumes.iter().position(is_memory_volume) {
        Some(i) => {
            if let Some(dir) = volumes[i].get_mut("emptyDir").and_then(Value::as_object_mut) {
                dir.insert("sizeLimit".to_string(), json!(size));
            }
        }
        None => volumes.push(json!({
            "name": SHARED_MEMORY_VOLUME,
            "emptyDir": { "medium": "Memory", "sizeLimit": size },
        })),
    }
    set_nested_field(obj, Value::Array(volumes), &path)
}

/// Labels of the object created for the workload's next dispatch.
pub fn object_labels(workload: &Workload) -> BTreeMap<String, String> {
    BTreeMap::from([
        (WORKLOAD_ID_LABEL.to_string(), workload.name_any()),
        (
            WORKLOAD_DISPATCH_COUNT_LABEL.to_string(),
            (workload.dispatch_count() + 1).to_string(),
        ),
        (WORKSPACE_ID_LABEL.to_string(), workload.spec.workspace.clone()),
    ])
}

/// Build the object for the workload's next dispatch from a base `template`.
pub fn build_object(template: &Value, workload: &Workload, rt: &ResourceTemplate) -> Result<DynamicObject> {
    let mut obj = template.clone();
    apply_workload(&mut obj, workload, rt)?;

    let labels = object_labels(workload);
    for spec in &rt.spec.resource_specs {
        // Roles removed above keep no pod template
        if !spec.pre_paths.is_empty() && nested_field(&obj, &spec.pre_paths)?.is_none() {
            continue;
        }
        for key in [WORKLOAD_ID_LABEL, WORKLOAD_DISPATCH_COUNT_LABEL] {
            let path = path_with(spec.template_path(), &["metadata", "labels", key]);
            set_nested_field(&mut obj, json!(labels[key]), &path)?;
        }
    }
    set_nested_field(&mut obj, json!(workload.name_any()), &["metadata", "name"])?;
    set_nested_field(&mut obj, json!(workload.spec.workspace), &["metadata", "namespace"])?;
    set_nested_field(&mut obj, json!(labels), &["metadata", "labels"])?;

    serde_json::from_value(obj)
        .map_err(|e| OperatorError::Internal(format!("invalid object for {}: {e}", workload.name_any())))
}

/// Whether a dispatched object no longer matches the workload's spec.
pub fn is_spec_changed(obj: &Value, workload: &Workload, rt: &ResourceTemplate) -> bool {
    resources_changed(obj, workload, rt)
        || image_changed(obj, workload, rt)
        || entry_point_changed(obj, workload, rt)
        || shared_memory_changed(obj, workload, rt)
}

fn resources_changed(obj: &Value, workload: &Workload, rt: &ResourceTemplate) -> bool {
    let Ok((replicas, limits)) = get_resources(obj, rt, MAIN_CONTAINER, GPU_RESOURCE) else {
        return false;
    };
    let Some(actual) = limits.first() else {
        return false;
    };
    if replicas.iter().sum::<i64>() != workload.total_replica() {
        return true;
    }
    let Some(wanted) = workload.spec.resources.first() else {
        return false;
    };
    actual.cpu != wanted.cpu
        || actual.memory != wanted.memory
        || actual.gpu != wanted.gpu.clone().unwrap_or_default()
}

fn image_changed(obj: &Value, workload: &Workload, rt: &ResourceTemplate) -> bool {
    get_images(obj, rt, MAIN_CONTAINER)
        .map(|images| images.iter().any(|image| *image != workload.spec.image))
        .unwrap_or(false)
}

fn entry_point_changed(obj: &Value, workload: &Workload, rt: &ResourceTemplate) -> bool {
    let (Ok(commands), Ok(wanted)) = (get_commands(obj, rt, MAIN_CONTAINER), entry_point(workload)) else {
        return false;
    };
    commands
        .last()
        .and_then(|command| command.last())
        .is_some_and(|current| *current != wanted)
}

fn shared_memory_changed(obj: &Value, workload: &Workload, rt: &ResourceTemplate) -> bool {
    let Some(wanted) = workload
        .spec
        .resources
        .first()
        .and_then(|r| r.shared_memory.as_deref())
    else {
        return false;
    };
    match get_memory_storage_size(obj, rt) {
        Ok(sizes) => sizes.first().map(String::as_str) != Some(wanted),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::fixtures::workload;
    use crate::crd::{GroupVersionKind, ResourceTemplateSpec, WORKLOAD_DISPATCH_COUNT_ANNOTATION};

    fn strings(path: &[&str]) -> Vec<String> {
        path.iter().map(|s| s.to_string()).collect()
    }

    fn pytorch_template() -> ResourceTemplate {
        let role = |name: &str, replica: i64| ResourceSpec {
            pre_paths: strings(&["spec", "pytorchReplicaSpecs", name]),
            template_paths: strings(&["template"]),
            replicas_paths: strings(&["replicas"]),
            replica,
        };
        ResourceTemplate::new(
            "pytorchjob",
            ResourceTemplateSpec {
                group_version_kind: GroupVersionKind::new("kubeflow.org", "v1", "PyTorchJob"),
                resource_specs: vec![role("Master", 1), role("Worker", 0)],
                ..Default::default()
            },
        )
    }

    fn base_template() -> Value {
        let pod = json!({"spec": {"containers": [{"name": "pytorch", "env": []}]}});
        json!({
            "apiVersion": "kubeflow.org/v1",
            "kind": "PyTorchJob",
            "metadata": {"name": "placeholder"},
            "spec": {"pytorchReplicaSpecs": {
                "Master": {"replicas": 0, "template": pod},
                "Worker": {"replicas": 0, "template": pod}
            }}
        })
    }

    fn training(replica: i32) -> Workload {
        let mut w = workload("train");
        w.spec.workspace = "team-a".to_string();
        w.spec.image = "rocm/pytorch:2.4".to_string();
        w.spec.entry_point = BASE64_STANDARD.encode("python train.py");
        w.spec.resources = vec![WorkloadResource {
            replica,
            cpu: "96".to_string(),
            memory: "1Ti".to_string(),
            gpu: Some("8".to_string()),
            shared_memory: Some("512Gi".to_string()),
            ..Default::default()
        }];
        w.annotations_mut()
            .insert(WORKLOAD_DISPATCH_COUNT_ANNOTATION.to_string(), "1".to_string());
        w
    }

    #[test]
    fn test_build_object_fills_roles() {
        let obj = build_object(&base_template(), &training(4), &pytorch_template()).unwrap();
        assert_eq!(obj.name_any(), "train");
        assert_eq!(obj.namespace().as_deref(), Some("team-a"));
        assert_eq!(obj.labels()[WORKLOAD_DISPATCH_COUNT_LABEL], "2");
        assert_eq!(obj.labels()[WORKSPACE_ID_LABEL], "team-a");

        let specs = &obj.data["spec"]["pytorchReplicaSpecs"];
        assert_eq!(specs["Master"]["replicas"], 1);
        assert_eq!(specs["Worker"]["replicas"], 3);

        let worker = &specs["Worker"]["template"];
        assert_eq!(worker["metadata"]["labels"][WORKLOAD_ID_LABEL], "train");
        let main = &worker["spec"]["containers"][0];
        assert_eq!(main["image"], "rocm/pytorch:2.4");
        assert_eq!(main["command"], json!(["/bin/sh", "-c", "python train.py"]));
        assert_eq!(main["resources"]["limits"][GPU_RESOURCE], "8");
        assert_eq!(main["resources"]["requests"]["cpu"], "96");
        assert_eq!(main["name"], "pytorch");
        let shm = &worker["spec"]["volumes"][0];
        assert_eq!(shm["name"], SHARED_MEMORY_VOLUME);
        assert_eq!(shm["emptyDir"]["sizeLimit"], "512Gi");
    }

    #[test]
    fn test_role_without_replicas_is_removed() {
        let obj = build_object(&base_template(), &training(1), &pytorch_template()).unwrap();
        let specs = obj.data["spec"]["pytorchReplicaSpecs"].as_object().unwrap();
        assert!(specs.contains_key("Master"));
        assert!(!specs.contains_key("Worker"));
    }

    #[test]
    fn test_invalid_entry_point_is_a_bad_request() {
        let mut w = training(2);
        w.spec.entry_point = "not base64!".to_string();
        let err = build_object(&base_template(), &w, &pytorch_template()).unwrap_err();
        assert!(matches!(err, OperatorError::BadRequest(_)));
    }

    #[test]
    fn test_spec_change_detection() {
        let rt = pytorch_template();
        let w = training(4);
        let obj = build_object(&base_template(), &w, &rt).unwrap();
        let rendered = serde_json::to_value(&obj).unwrap();
        assert!(!is_spec_changed(&rendered, &w, &rt));

        let mut image = w.clone();
        image.spec.image = "rocm/pytorch:2.5".to_string();
        assert!(is_spec_changed(&rendered, &image, &rt));

        let mut scaled = w.clone();
        scaled.spec.resources[0].replica = 6;
        assert!(is_spec_changed(&rendered, &scaled, &rt));

        let mut command = w.clone();
        command.spec.entry_point = BASE64_STANDARD.encode("python eval.py");
        assert!(is_spec_changed(&rendered, &command, &rt));

        let mut shm = w.clone();
        shm.spec.resources[0].shared_memory = Some("1Ti".to_string());
        assert!(is_spec_changed(&rendered, &shm, &rt));
    }

    #[test]
    fn test_apply_updates_existing_shared_memory_in_place() {
        let rt = pytorch_template();
        let w = training(4);
        let mut obj = serde_json::to_value(build_object(&base_template(), &w, &rt).unwrap()).unwrap();

        let mut resized = w.clone();
        resized.spec.resources[0].shared_memory = Some("1Ti".to_string());
        apply_workload(&mut obj, &resized, &rt).unwrap();

        let volumes = &obj["spec"]["pytorchReplicaSpecs"]["Master"]["template"]["spec"]["volumes"];
        assert_eq!(volumes.as_array().unwrap().len(), 1);
        assert_eq!(volumes[0]["emptyDir"]["sizeLimit"], "1Ti");
        assert!(!is_spec_changed(&obj, &resized, &rt));
    }
}

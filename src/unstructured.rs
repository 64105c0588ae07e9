//! Template-driven field extraction over schema-less objects.
//!
//! Data-plane objects are handled as plain JSON trees. A [`ResourceTemplate`]
//! names the paths at which an arbitrary kind keeps its replica counts, pod
//! templates and status, and the functions here read those paths.
//!
//! Paths are sequences of map keys. A numeric element indexes into a list.
//! A missing field is not an error; walking through a value that is neither a
//! map nor a list is.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::conditions::{K8S_FAILED, K8S_PENDING, K8S_RUNNING, K8S_SUCCEEDED, K8S_UPDATING};
use crate::crd::{ResourceSpec, ResourceTemplate};
use crate::error::{OperatorError, Result};

pub const STATEFULSET_KIND: &str = "StatefulSet";
pub const JOB_KIND: &str = "Job";

/// Phase and replica counts read from a data-plane object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sObjectStatus {
    /// A `K8s*` condition type, or empty when nothing matched
    pub phase: String,
    pub message: String,
    pub spec_replica: i64,
    pub active_replica: i64,
}

impl K8sObjectStatus {
    pub fn is_pending(&self) -> bool {
        self.phase.is_empty() || self.phase == K8S_PENDING
    }
}

/// How phase is derived for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStrategy {
    /// Revision and readiness comparison, no template expressions
    StatefulSet,
    /// Template expressions, then Running when pods are active
    Job,
    /// Template expressions only
    Generic,
}

impl StatusStrategy {
    pub fn for_kind(kind: &str) -> Self {
        match kind {
            STATEFULSET_KIND => StatusStrategy::StatefulSet,
            JOB_KIND => StatusStrategy::Job,
            _ => StatusStrategy::Generic,
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn accessor_error<S: AsRef<str>>(path: &[S], step: usize, value: &Value) -> OperatorError {
    let walked: Vec<&str> = path[..step].iter().map(AsRef::as_ref).collect();
    OperatorError::InvalidState(format!(
        "{} accessor error: value is of type {}, expected map or list",
        walked.join("."),
        type_name(value)
    ))
}

/// Resolve `path` inside `obj`. `Ok(None)` means some field along the path is absent.
pub fn nested_field<'a, S: AsRef<str>>(obj: &'a Value, path: &[S]) -> Result<Option<&'a Value>> {
    if path.is_empty() {
        return Err(OperatorError::BadRequest("empty path".to_string()));
    }
    let mut current = obj;
    for (step, key) in path.iter().enumerate() {
        let key = key.as_ref();
        current = match current {
            Value::Object(map) => match map.get(key) {
                Some(v) => v,
                None => return Ok(None),
            },
            Value::Array(list) => {
                let index: usize = key.parse().map_err(|_| accessor_error(path, step, current))?;
                match list.get(index) {
                    Some(v) => v,
                    None => {
                        return Err(OperatorError::InvalidState(format!(
                            "index {index} out of range (len={})",
                            list.len()
                        )))
                    }
                }
            }
            Value::Null => return Ok(None),
            other => return Err(accessor_error(path, step, other)),
        };
    }
    Ok(Some(current))
}

/// String at `path`; a non-string value is an error.
pub fn nested_string<S: AsRef<str>>(obj: &Value, path: &[S]) -> Result<Option<String>> {
    match nested_field(obj, path)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(OperatorError::InvalidState(format!(
            "invalid field type {}, expected string",
            type_name(other)
        ))),
    }
}

/// String at `path`, or empty on any failure.
pub fn nested_string_silently<S: AsRef<str>>(obj: &Value, path: &[S]) -> String {
    if path.is_empty() {
        return String::new();
    }
    nested_string(obj, path).ok().flatten().unwrap_or_default()
}

pub fn nested_i64<S: AsRef<str>>(obj: &Value, path: &[S]) -> Result<Option<i64>> {
    match nested_field(obj, path)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
            OperatorError::InvalidState(format!("invalid field type, {n} is not an integer"))
        }),
        Some(other) => Err(OperatorError::InvalidState(format!(
            "invalid field type {}, expected integer",
            type_name(other)
        ))),
    }
}

pub fn nested_slice<'a, S: AsRef<str>>(obj: &'a Value, path: &[S]) -> Result<Option<&'a Vec<Value>>> {
    match nested_field(obj, path)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(list)) => Ok(Some(list)),
        Some(other) => Err(OperatorError::InvalidState(format!(
            "invalid field type {}, expected list",
            type_name(other)
        ))),
    }
}

pub fn nested_map<'a, S: AsRef<str>>(
    obj: &'a Value,
    path: &[S],
) -> Result<Option<&'a Map<String, Value>>> {
    match nested_field(obj, path)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(OperatorError::InvalidState(format!(
            "invalid field type {}, expected map",
            type_name(other)
        ))),
    }
}

/// Set `value` at `path`, creating missing intermediate maps. List elements
/// are addressed by index and must already exist.
pub fn set_nested_field<S: AsRef<str>>(obj: &mut Value, value: Value, path: &[S]) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        return Err(OperatorError::BadRequest("empty path".to_string()));
    };
    let mut current = obj;
    for (step, key) in parents.iter().enumerate() {
        let key = key.as_ref();
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(list) => {
                let len = list.len();
                let index: usize = key
                    .parse()
                    .map_err(|_| OperatorError::InvalidState(format!("{key} is not a list index")))?;
                list.get_mut(index).ok_or_else(|| {
                    OperatorError::InvalidState(format!("index {index} out of range (len={len})"))
                })?
            }
            other => return Err(accessor_error(path, step, other)),
        };
    }
    let last = last.as_ref();
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(list) => {
            let len = list.len();
            let index: usize = last
                .parse()
                .map_err(|_| OperatorError::InvalidState(format!("{last} is not a list index")))?;
            let slot = list.get_mut(index).ok_or_else(|| {
                OperatorError::InvalidState(format!("index {index} out of range (len={len})"))
            })?;
            *slot = value;
            Ok(())
        }
        Value::Null => {
            let mut map = Map::new();
            map.insert(last.to_string(), value);
            *current = Value::Object(map);
            Ok(())
        }
        other => Err(accessor_error(path, parents.len(), other)),
    }
}

/// Remove the field (or list element) at `path`. Absent paths are a no-op.
pub fn remove_nested_field<S: AsRef<str>>(obj: &mut Value, path: &[S]) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        return Err(OperatorError::BadRequest("empty path".to_string()));
    };
    let mut current = obj;
    for key in parents {
        let next = match current {
            Value::Object(map) => map.get_mut(key.as_ref()),
            Value::Array(list) => match key.as_ref().parse::<usize>() {
                Ok(index) => list.get_mut(index),
                Err(_) => None,
            },
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Ok(()),
        }
    }
    match current {
        Value::Object(map) => {
            map.remove(last.as_ref());
        }
        Value::Array(list) => {
            if let Ok(index) = last.as_ref().parse::<usize>() {
                if index < list.len() {
                    list.remove(index);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// The value at `path` as the candidate objects it stands for: a map is one
/// candidate, a list contributes each element that is a map.
fn resolve_objects<'a>(obj: &'a Value, path: &[String]) -> Result<Vec<&'a Map<String, Value>>> {
    let value = if path.is_empty() {
        Some(obj)
    } else {
        nested_field(obj, path)?
    };
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => Ok(vec![map]),
        Some(Value::Array(list)) => Ok(list.iter().filter_map(Value::as_object).collect()),
        Some(other) => Err(OperatorError::InvalidState(format!(
            "invalid path {}: value is of type {}",
            path.join("."),
            type_name(other)
        ))),
    }
}

/// `Some(n)` when `name` exists in `obj`; a present non-integer counts as zero.
fn int_value_by_name(obj: &Map<String, Value>, name: &str) -> Option<i64> {
    obj.get(name).map(|v| v.as_i64().unwrap_or(0))
}

/// Sum the integer field `name` over every candidate object at `pre_paths`,
/// falling back to the object's direct child maps when the field is absent.
fn get_replica(obj: &Value, pre_paths: &[String], name: &str) -> Result<i64> {
    let mut total = 0;
    for candidate in resolve_objects(obj, pre_paths)? {
        match int_value_by_name(candidate, name) {
            Some(n) => total += n,
            None => {
                total += candidate
                    .values()
                    .filter_map(Value::as_object)
                    .filter_map(|child| int_value_by_name(child, name))
                    .sum::<i64>();
            }
        }
    }
    Ok(total)
}

/// Desired replica count, summed across every resource spec of the template.
pub fn get_spec_replica(obj: &Value, rt: &ResourceTemplate) -> Result<i64> {
    let mut replica = 0;
    for spec in &rt.spec.resource_specs {
        let Some((name, parents)) = spec.replicas_paths.split_last() else {
            continue;
        };
        let mut pre_paths = spec.pre_paths.clone();
        pre_paths.extend(parents.iter().cloned());
        replica += get_replica(obj, &pre_paths, name)?;
    }
    Ok(replica)
}

/// Replica count currently running.
pub fn get_active_replica(obj: &Value, rt: &ResourceTemplate) -> Result<i64> {
    let active = &rt.spec.active_replica;
    if active.pre_paths.is_empty() && active.replica_path.is_empty() {
        return Ok(0);
    }
    get_replica(obj, &active.pre_paths, &active.replica_path)
}

/// Derive phase, message and replica counts of `obj` from its template.
pub fn get_k8s_object_status(obj: &Value, rt: &ResourceTemplate) -> Result<K8sObjectStatus> {
    let mut result = K8sObjectStatus {
        spec_replica: get_spec_replica(obj, rt)?,
        active_replica: get_active_replica(obj, rt)?,
        ..Default::default()
    };

    match StatusStrategy::for_kind(rt.spec_kind()) {
        StatusStrategy::StatefulSet => statefulset_status(obj, &mut result),
        StatusStrategy::Job => {
            status_by_template(obj, rt, &mut result)?;
            if result.phase.is_empty() && result.active_replica > 0 {
                result.phase = K8S_RUNNING.to_string();
                result.message = "the job is running".to_string();
            }
        }
        StatusStrategy::Generic => status_by_template(obj, rt, &mut result)?,
    }
    Ok(result)
}

fn statefulset_status(obj: &Value, result: &mut K8sObjectStatus) {
    let current = nested_string_silently(obj, &["status", "currentRevision"]);
    let update = nested_string_silently(obj, &["status", "updateRevision"]);
    let (phase, message) = if current != update {
        (K8S_UPDATING, "the statefulSet is updating")
    } else if result.spec_replica == result.active_replica {
        (K8S_RUNNING, "the statefulSet is ready")
    } else {
        (K8S_FAILED, "the statefulSet is not ready")
    };
    result.phase = phase.to_string();
    result.message = message.to_string();
}

fn status_by_template(obj: &Value, rt: &ResourceTemplate, result: &mut K8sObjectStatus) -> Result<()> {
    let status = &rt.spec.resource_status;
    if status.pre_paths.is_empty() {
        return Ok(());
    }
    let candidates = resolve_objects(obj, &status.pre_paths)?;
    for expression in &status.phases {
        let matched = candidates.iter().find(|candidate| {
            expression
                .match_expressions
                .iter()
                .all(|(field, expected)| value_to_string(candidate.get(field)) == *expected)
        });
        if let Some(candidate) = matched {
            result.phase = expression.phase.clone();
            let message = if status.message_paths.is_empty() {
                String::new()
            } else {
                // Candidates are maps; re-wrap to reuse the path walker
                let wrapped = Value::Object((*candidate).clone());
                nested_string_silently(&wrapped, &status.message_paths)
            };
            result.message = if message.is_empty() {
                default_message(&expression.phase).to_string()
            } else {
                message
            };
            return Ok(());
        }
    }
    Ok(())
}

fn value_to_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

fn default_message(phase: &str) -> &'static str {
    match phase {
        K8S_SUCCEEDED => "Job is successfully completed",
        K8S_FAILED => "Job is failed",
        K8S_RUNNING => "Job is running",
        _ => "unknown",
    }
}

/// Resource limits declared by a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLimits {
    pub cpu: String,
    pub memory: String,
    pub gpu: String,
    pub ephemeral_storage: String,
}

fn role_containers<'a>(obj: &'a Value, spec: &ResourceSpec) -> Result<Option<&'a Vec<Value>>> {
    let mut path = spec.template_path();
    path.extend(["spec".to_string(), "containers".to_string()]);
    nested_slice(obj, &path)
}

/// The named container, or the first one when `main_container` is empty.
fn main_container<'a>(containers: &'a [Value], main_container: &str) -> Option<&'a Value> {
    containers.iter().find(|c| {
        main_container.is_empty()
            || c.get("name").and_then(Value::as_str) == Some(main_container)
    })
}

/// Replica count and main-container limits of every role that declares them.
pub fn get_resources(
    obj: &Value,
    rt: &ResourceTemplate,
    main: &str,
    gpu_name: &str,
) -> Result<(Vec<i64>, Vec<ContainerLimits>)> {
    let mut replicas = Vec::new();
    let mut limits = Vec::new();
    for spec in &rt.spec.resource_specs {
        if !spec.replicas_paths.is_empty() {
            let mut path = spec.pre_paths.clone();
            path.extend(spec.replicas_paths.iter().cloned());
            if let Some(n) = nested_i64(obj, &path)? {
                replicas.push(n);
            }
        }
        let Some(containers) = role_containers(obj, spec)? else {
            continue;
        };
        if let Some(container) = main_container(containers, main) {
            let Some(l) = nested_map(container, &["resources", "limits"])? else {
                return Err(OperatorError::InvalidState(
                    "failed to find container limits".to_string(),
                ));
            };
            let get = |key: &str| l.get(key).map(|v| value_to_string(Some(v))).unwrap_or_default();
            limits.push(ContainerLimits {
                cpu: get("cpu"),
                memory: get("memory"),
                gpu: get(gpu_name),
                ephemeral_storage: get("ephemeral-storage"),
            });
        }
    }
    Ok((replicas, limits))
}

/// Image of the main container of every role.
pub fn get_images(obj: &Value, rt: &ResourceTemplate, main: &str) -> Result<Vec<String>> {
    let mut images = Vec::new();
    for spec in &rt.spec.resource_specs {
        let containers = role_containers(obj, spec)?
            .ok_or_else(|| OperatorError::NotFound("containers".to_string()))?;
        if let Some(image) = main_container(containers, main)
            .and_then(|c| c.get("image"))
            .and_then(Value::as_str)
        {
            images.push(image.to_string());
        }
    }
    if images.is_empty() {
        return Err(OperatorError::NotFound("container image".to_string()));
    }
    Ok(images)
}

/// Command of the main container of every role.
pub fn get_commands(obj: &Value, rt: &ResourceTemplate, main: &str) -> Result<Vec<Vec<String>>> {
    let mut commands = Vec::new();
    for spec in &rt.spec.resource_specs {
        let containers = role_containers(obj, spec)?
            .ok_or_else(|| OperatorError::NotFound("containers".to_string()))?;
        let Some(container) = main_container(containers, main) else {
            continue;
        };
        let command = container
            .get("command")
            .and_then(Value::as_array)
            .ok_or_else(|| OperatorError::NotFound("container command".to_string()))?;
        commands.push(
            command
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        );
    }
    Ok(commands)
}

/// Size limit of the memory-backed emptyDir of every role, "0" when absent.
pub fn get_memory_storage_size(obj: &Value, rt: &ResourceTemplate) -> Result<Vec<String>> {
    let mut sizes = Vec::new();
    for spec in &rt.spec.resource_specs {
        let mut path = spec.template_path();
        path.extend(["spec".to_string(), "volumes".to_string()]);
        let volumes = nested_slice(obj, &path)?
            .ok_or_else(|| OperatorError::NotFound(format!("volumes at {}", path.join("."))))?;
        let size = volumes
            .iter()
            .filter_map(|v| v.get("emptyDir"))
            .find(|dir| dir.get("medium").and_then(Value::as_str) == Some("Memory"))
            .and_then(|dir| dir.get("sizeLimit"))
            .and_then(Value::as_str)
            .unwrap_or("0");
        sizes.push(size.to_string());
    }
    Ok(sizes)
}

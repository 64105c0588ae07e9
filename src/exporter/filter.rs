//! Update filters. A filter returns `true` to suppress an event.

use kube::api::DynamicObject;
use serde_json::Value;

/// Decides whether a change is a no-op for the exported record. `old` is
/// `None` for creations.
pub type ResourceFilter = fn(Option<&DynamicObject>, &DynamicObject) -> bool;

/// Suppress updates that leave spec, status and every piece of metadata the
/// records are built from untouched. Creations are never suppressed, nor is
/// the start of a deletion.
pub fn unchanged_filter(old: Option<&DynamicObject>, new: &DynamicObject) -> bool {
    let Some(old) = old else {
        return false;
    };
    let (om, nm) = (&old.metadata, &new.metadata);
    if om.deletion_timestamp.is_none() && nm.deletion_timestamp.is_some() {
        return false;
    }
    field(old, "spec") == field(new, "spec")
        && field(old, "status") == field(new, "status")
        && om.labels == nm.labels
        && om.annotations == nm.annotations
        && om.finalizers == nm.finalizers
        && om.deletion_timestamp == nm.deletion_timestamp
}

/// Forward everything.
pub fn no_filter(_old: Option<&DynamicObject>, _new: &DynamicObject) -> bool {
    false
}

fn field<'a>(obj: &'a DynamicObject, name: &str) -> Option<&'a Value> {
    obj.data.get(name)
}

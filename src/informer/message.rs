//! Normalized change notification for an object in a data-plane cluster.

use std::fmt;

use crate::crd::GroupVersionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceAction {
    Add,
    Update,
    Delete,
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAction::Add => f.write_str("add"),
            ResourceAction::Update => f.write_str("update"),
            ResourceAction::Delete => f.write_str("delete"),
        }
    }
}

/// A change of one dispatched object, as seen by one cluster informer.
///
/// `dispatch_count` is the count stamped on the object when it was created. A
/// re-dispatch can make older messages arrive late, so consumers compare it
/// against the workload's current count instead of trusting arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceMessage {
    pub cluster: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub gvk: GroupVersionKind,
    pub action: ResourceAction,
    pub workload_id: String,
    pub dispatch_count: i32,
}

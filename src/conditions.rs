//! Workload status condition helpers
//!
//! Every condition written for a dispatch attempt carries the reason
//! `run-<dispatch count>`, which is how a failure condition is told apart from
//! one left over by an earlier attempt.

use chrono::Utc;

use crate::crd::{Workload, WorkloadCondition, WorkloadPhase};

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// Conditions mirrored from the data-plane object
pub const K8S_PENDING: &str = "K8sPending";
pub const K8S_RUNNING: &str = "K8sRunning";
pub const K8S_SUCCEEDED: &str = "K8sSucceeded";
pub const K8S_FAILED: &str = "K8sFailed";
pub const K8S_UPDATING: &str = "K8sUpdating";
pub const K8S_DELETED: &str = "K8sDeleted";

// Conditions written by the admin-side controllers
pub const ADMIN_SCHEDULING: &str = "AdminScheduling";
pub const ADMIN_DISPATCHED: &str = "AdminDispatched";
pub const ADMIN_FAILOVER: &str = "AdminFailover";
pub const ADMIN_FAILED: &str = "AdminFailed";

/// Conditions kept on a workload; older entries are dropped first.
pub const MAX_CONDITION_HISTORY: usize = 30;

// Finalizer names
pub const CLUSTER_FINALIZER: &str = "amd.com/cluster-informer";
pub const EXPORTER_FINALIZER: &str = "amd.com/resource-exporter";

/// Reason carried by every condition written for dispatch attempt `count`.
pub fn generate_dispatch_reason(count: i32) -> String {
    format!("run-{count}")
}

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> WorkloadCondition {
    WorkloadCondition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Set or update a condition in a list.
///
/// An entry with the same type and reason is replaced in place, keeping its
/// transition time when the status did not change. Anything else is appended
/// and the list is trimmed to the newest [`MAX_CONDITION_HISTORY`] entries.
pub fn set_condition(conditions: &mut Vec<WorkloadCondition>, new: WorkloadCondition) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.r#type == new.r#type && c.reason == new.reason)
    {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.message = new.message;
        }
        return;
    }
    conditions.push(new);
    if conditions.len() > MAX_CONDITION_HISTORY {
        let excess = conditions.len() - MAX_CONDITION_HISTORY;
        conditions.drain(..excess);
    }
}

/// Find a condition by type and reason.
pub fn find_condition<'a>(
    conditions: &'a [WorkloadCondition],
    condition_type: &str,
    reason: &str,
) -> Option<&'a WorkloadCondition> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type && c.reason == reason)
}

/// Mark a workload Failed for its current dispatch attempt.
pub fn set_workload_failed(workload: &mut Workload, message: &str) {
    let reason = generate_dispatch_reason(workload.dispatch_count());
    let status = workload.status_mut();
    status.phase = Some(WorkloadPhase::Failed);
    if status.end_time.is_none() {
        status.end_time = Some(Utc::now().to_rfc3339());
    }
    set_condition(
        &mut status.conditions,
        build_condition(ADMIN_FAILED, CONDITION_TRUE, &reason, message),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::fixtures::dispatched_workload;

    #[test]
    fn test_generate_dispatch_reason() {
        assert_eq!(generate_dispatch_reason(0), "run-0");
        assert_eq!(generate_dispatch_reason(3), "run-3");
    }

    #[test]
    fn test_build_condition() {
        let cond = build_condition(K8S_FAILED, CONDITION_TRUE, "run-1", "pod crashed");
        assert_eq!(cond.r#type, "K8sFailed");
        assert_eq!(cond.status, "True");
        assert_eq!(cond.reason, "run-1");
        assert_eq!(cond.message, "pod crashed");
        assert!(cond.last_transition_time.is_some());
    }

    #[test]
    fn test_set_condition_replaces_same_type_and_reason() {
        let mut conditions = vec![WorkloadCondition {
            r#type: K8S_RUNNING.to_string(),
            status: CONDITION_TRUE.to_string(),
            reason: "run-1".to_string(),
            message: "first".to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
        }];

        set_condition(
            &mut conditions,
            build_condition(K8S_RUNNING, CONDITION_TRUE, "run-1", "second"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "second");
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );

        // A new dispatch attempt appends rather than replaces
        set_condition(
            &mut conditions,
            build_condition(K8S_RUNNING, CONDITION_TRUE, "run-2", "third"),
        );
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn test_set_condition_keeps_bounded_history() {
        let mut conditions = Vec::new();
        for i in 0..40 {
            set_condition(
                &mut conditions,
                build_condition(K8S_PENDING, CONDITION_TRUE, &generate_dispatch_reason(i), ""),
            );
        }
        assert_eq!(conditions.len(), MAX_CONDITION_HISTORY);
        assert_eq!(conditions[0].reason, "run-10");
        assert_eq!(conditions.last().unwrap().reason, "run-39");
    }

    #[test]
    fn test_set_workload_failed() {
        let mut w = dispatched_workload("a", 2);
        set_workload_failed(&mut w, "dependency failed");

        assert_eq!(w.phase(), WorkloadPhase::Failed);
        assert!(w.status.as_ref().unwrap().end_time.is_some());
        let cond = w.last_condition().unwrap();
        assert_eq!(cond.r#type, ADMIN_FAILED);
        assert_eq!(cond.reason, "run-2");
        assert_eq!(cond.message, "dependency failed");
    }
}

//! Failover eligibility of a workload.

use crate::conditions::{find_condition, generate_dispatch_reason, K8S_FAILED};
use crate::crd::Workload;

/// True when the workload asks for failover: it is forced, or its current
/// dispatch attempt has failed. Failures of earlier attempts do not count.
pub fn is_need_failover(workload: &Workload) -> bool {
    if workload.is_forced_failover() {
        return true;
    }
    let reason = generate_dispatch_reason(workload.dispatch_count());
    find_condition(workload.conditions(), K8S_FAILED, &reason).is_some()
}

/// True when failover must not happen even if it is needed.
pub fn is_disable_failover(workload: &Workload) -> bool {
    if workload.is_end() || workload.is_failover_disabled() || !workload.is_dispatched() {
        return true;
    }
    if workload.is_forced_failover() {
        return false;
    }
    let max_retry = workload.spec.max_retry;
    max_retry <= 0 || workload.dispatch_count() > max_retry
}

/// Only the step from "no failover needed" to "failover needed" triggers a
/// reconcile; a workload that stays failed across updates does not.
pub fn is_failover_transition(old: Option<&Workload>, new: &Workload) -> bool {
    is_need_failover(new) && !old.is_some_and(is_need_failover)
}

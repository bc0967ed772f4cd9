//! Observed state of a machineset, derived from the machines it owns and their nodes.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::controller::util::get_node_condition;
use crate::resources::{
    Condition, ConditionSeverity, ConditionStatus, Machine, MachineSet, MachineSetStatus, Node,
    NodeConditionType, Time,
};

pub const PAUSED_CONDITION: &str = "Paused";
pub const REPLICA_FAILURE_CONDITION: &str = "ReplicaFailure";

pub const INVALID_CONFIGURATION_REASON: &str = "InvalidConfiguration";

pub fn is_node_ready(node: &Node) -> bool {
    get_node_condition(&node.status.conditions, NodeConditionType::Ready)
        .map_or(false, |c| c.status == ConditionStatus::True)
}

/// Ready for at least `min_ready_seconds` as of `now`.
pub fn is_node_available(node: &Node, min_ready_seconds: u32, now: Time) -> bool {
    if !is_node_ready(node) {
        return false;
    }
    if min_ready_seconds == 0 {
        return true;
    }
    get_node_condition(&node.status.conditions, NodeConditionType::Ready)
        .and_then(|c| c.last_transition_time)
        .map_or(false, |ltt| {
            ltt.0 + Duration::from_secs(min_ready_seconds.into()) <= now.0
        })
}

/// Count the machines and their nodes into a new status. Conditions, error fields and the
/// observed generation are carried over from the current status.
pub fn calculate_status(
    machineset: &MachineSet,
    machines: &[&Machine],
    nodes: &BTreeMap<String, Node>,
    now: Time,
) -> MachineSetStatus {
    let mut new_status = machineset.status.clone();

    // Template labels are a superset of the selector, so only selected machines can be fully
    // labeled.
    let template_labels = &machineset.spec.template.metadata.labels;
    let mut fully_labeled_replicas_count = 0;
    let mut ready_replicas_count = 0;
    let mut available_replicas_count = 0;
    for machine in machines {
        if template_labels
            .iter()
            .all(|(k, v)| machine.metadata.labels.get(k) == Some(v))
        {
            fully_labeled_replicas_count += 1;
        }
        let Some(node) = machine.node_name().and_then(|name| nodes.get(name)) else {
            continue;
        };
        if is_node_ready(node) {
            ready_replicas_count += 1;
            if is_node_available(node, machineset.spec.min_ready_seconds, now) {
                available_replicas_count += 1;
            }
        }
    }

    new_status.replicas = machines.len() as u32;
    new_status.fully_labeled_replicas = fully_labeled_replicas_count;
    new_status.ready_replicas = ready_replicas_count;
    new_status.available_replicas = available_replicas_count;
    new_status
}

/// The machineset with `new_status` applied and the generation observed, or `None` when the
/// stored status is already up to date.
pub fn update_machineset_status(
    machineset: &MachineSet,
    mut new_status: MachineSetStatus,
) -> Option<MachineSet> {
    new_status.observed_generation = machineset.metadata.generation;
    if machineset.status == new_status {
        return None;
    }
    let mut machineset = machineset.clone();
    machineset.status = new_status;
    Some(machineset)
}

pub fn get_condition<'a>(status: &'a MachineSetStatus, cond_type: &str) -> Option<&'a Condition> {
    status.conditions.iter().find(|c| c.r#type == cond_type)
}

/// Set the condition, keeping the existing transition time when the status is unchanged.
pub fn set_condition(status: &mut MachineSetStatus, mut condition: Condition) {
    if let Some(existing) = get_condition(status, &condition.r#type) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
    }
    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type)
    {
        *existing = condition;
    } else {
        status.conditions.push(condition);
    }
}

pub fn remove_condition(status: &mut MachineSetStatus, cond_type: &str) {
    status.conditions.retain(|c| c.r#type != cond_type)
}

pub fn new_condition(
    cond_type: &str,
    status: ConditionStatus,
    severity: Option<ConditionSeverity>,
    reason: impl Into<String>,
    message: impl Into<String>,
    now: Time,
) -> Condition {
    Condition {
        r#type: cond_type.to_owned(),
        status,
        severity,
        last_transition_time: Some(now),
        reason: Some(reason.into()),
        message: Some(message.into()),
    }
}

use crate::resources::{
    GroupVersionKind, Machine, MachineSet, MachineStatus, Metadata, NodeCondition,
    NodeConditionType, OwnerReference,
};

pub const DELETE_MACHINE_ANNOTATION: &str = "machine.openshift.io/delete-machine";
pub const OLD_DELETE_MACHINE_ANNOTATION: &str = "machine.openshift.io/cluster-api-delete-machine";
pub const DELETION_IN_PROGRESS_ANNOTATION: &str = "machine.openshift.io/deletion-in-progress";

pub fn new_controller_ref(owner: &Metadata, gvk: &GroupVersionKind) -> OwnerReference {
    OwnerReference {
        api_version: gvk.api_version(),
        kind: gvk.kind.to_owned(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        block_owner_deletion: true,
        controller: true,
    }
}

/// Build a new machine from the machineset template. The name is left for the store to
/// generate from the prefix.
pub fn get_machine_from_template(machineset: &MachineSet) -> Machine {
    let template = &machineset.spec.template;
    let mut machine = Machine {
        metadata: Metadata {
            generate_name: get_machines_prefix(&machineset.metadata.name),
            namespace: machineset.metadata.namespace.clone(),
            labels: template.metadata.labels.clone(),
            annotations: template.metadata.annotations.clone(),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: MachineStatus::default(),
    };
    machine
        .metadata
        .owner_references
        .push(new_controller_ref(&machineset.metadata, &MachineSet::GVK));
    machine
}

fn get_machines_prefix(controller_name: &str) -> String {
    format!("{}-", controller_name)
}

pub fn get_node_condition(
    conditions: &[NodeCondition],
    cond_type: NodeConditionType,
) -> Option<&NodeCondition> {
    conditions.iter().find(|c| c.r#type == cond_type)
}

pub fn has_delete_annotation(machine: &Machine) -> bool {
    let annotations = &machine.metadata.annotations;
    annotations.contains_key(DELETE_MACHINE_ANNOTATION)
        || annotations.contains_key(OLD_DELETE_MACHINE_ANNOTATION)
}

pub fn is_delete_protected(machine: &Machine) -> bool {
    machine
        .metadata
        .annotations
        .contains_key(DELETION_IN_PROGRESS_ANNOTATION)
}

pub fn has_error(machine: &Machine) -> bool {
    machine.status.error_reason.is_some() || machine.status.error_message.is_some()
}

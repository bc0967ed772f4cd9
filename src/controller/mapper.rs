//! Translate machine and node changes into machineset reconcile keys.

use std::collections::BTreeSet;

use crate::cache::Snapshot;
use crate::controller::selector::{Matches, Selector};
use crate::resources::{Machine, MachineSet, Node, ObjectKey};

/// The machinesets that should reconcile because of `machine`.
///
/// A controller reference names its machineset directly. Without one, every machineset in the
/// namespace whose selector matches is a potential adopter. A machine controlled by something
/// other than a machineset maps to nothing.
pub fn machinesets_for_machine<'a>(
    machine: &Machine,
    machinesets: impl Iterator<Item = &'a MachineSet>,
) -> BTreeSet<ObjectKey> {
    let mut keys = BTreeSet::new();
    if let Some(owner) = machine.metadata.controller_ref() {
        if owner.kind == MachineSet::GVK.kind {
            keys.insert(ObjectKey::new(
                machine.metadata.namespace.clone(),
                owner.name.clone(),
            ));
        }
        return keys;
    }
    if machine.metadata.labels.is_empty() {
        return keys;
    }
    for machineset in machinesets {
        if machineset.metadata.namespace != machine.metadata.namespace {
            continue;
        }
        let Ok(selector) = Selector::parse(&machineset.spec.selector) else {
            continue;
        };
        if selector.matches(&machine.metadata.labels) {
            keys.insert(ObjectKey::of(machineset));
        }
    }
    keys
}

/// Keys for a machine event, using the snapshot from before the event was applied. A
/// modification also maps the previously cached version so a machine relabelled out of a
/// machineset reaches it.
pub fn map_machine(snapshot: &Snapshot, machine: &Machine) -> BTreeSet<ObjectKey> {
    let namespace = &machine.metadata.namespace;
    let mut keys = machinesets_for_machine(machine, snapshot.machinesets_in(namespace));
    if let Some(old) = snapshot.machines.get(&ObjectKey::of(machine)) {
        if old.metadata.labels != machine.metadata.labels
            || old.metadata.owner_references != machine.metadata.owner_references
        {
            keys.extend(machinesets_for_machine(old, snapshot.machinesets_in(namespace)));
        }
    }
    keys
}

/// Machinesets owning machines backed by `node`, so readiness changes reach status.
pub fn map_node(snapshot: &Snapshot, node: &Node) -> BTreeSet<ObjectKey> {
    snapshot
        .machines_on_node(&node.metadata.name)
        .flat_map(|machine| {
            machinesets_for_machine(machine, snapshot.machinesets_in(&machine.metadata.namespace))
        })
        .collect()
}

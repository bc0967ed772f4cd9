//! Adoption and release of machines by a machineset.

use tracing::debug;

use crate::controller::selector::{Matches, Selector};
use crate::controller::util::new_controller_ref;
use crate::resources::{Machine, MachineSet};

/// The machines of a namespace, as seen by one machineset.
#[derive(Debug, Default)]
pub struct Partition<'a> {
    /// Controlled by us, matching the selector and not being deleted.
    pub owned: Vec<&'a Machine>,
    /// Controlled by us and being deleted.
    pub terminating: Vec<&'a Machine>,
    /// Without a controller, matching the selector and not being deleted.
    pub to_adopt: Vec<&'a Machine>,
    /// Controlled by us but no longer matching the selector.
    pub to_release: Vec<&'a Machine>,
    /// Everything else.
    pub foreign: Vec<&'a Machine>,
}

pub fn partition<'a>(
    machineset: &MachineSet,
    selector: &Selector,
    machines: &'a [Machine],
) -> Partition<'a> {
    let mut partition = Partition::default();
    for machine in machines {
        let matches = selector.matches(&machine.metadata.labels);
        let deleting = machine.metadata.is_deleting();
        match machine.metadata.controller_ref() {
            Some(_) if machine.metadata.is_controlled_by(&machineset.metadata) => {
                if deleting {
                    partition.terminating.push(machine);
                } else if matches {
                    partition.owned.push(machine);
                } else {
                    partition.to_release.push(machine);
                }
            }
            None if matches && !deleting => partition.to_adopt.push(machine),
            _ => partition.foreign.push(machine),
        }
    }
    debug!(
        owned = partition.owned.len(),
        terminating = partition.terminating.len(),
        to_adopt = partition.to_adopt.len(),
        to_release = partition.to_release.len(),
        foreign = partition.foreign.len(),
        "Partitioned machines"
    );
    partition
}

/// The machine with a controller reference to the machineset. An existing non controller
/// reference to the same machineset is promoted in place.
pub fn adopt(machine: &Machine, machineset: &MachineSet) -> Machine {
    let mut machine = machine.clone();
    if let Some(us) = machine
        .metadata
        .owner_references
        .iter_mut()
        .find(|or| or.uid == machineset.metadata.uid)
    {
        us.block_owner_deletion = true;
        us.controller = true;
    } else {
        machine
            .metadata
            .owner_references
            .push(new_controller_ref(&machineset.metadata, &MachineSet::GVK));
    }
    machine
}

/// The machine without any reference to the machineset.
pub fn release(machine: &Machine, machineset: &MachineSet) -> Machine {
    let mut machine = machine.clone();
    machine
        .metadata
        .owner_references
        .retain(|or| or.uid != machineset.metadata.uid);
    machine
}

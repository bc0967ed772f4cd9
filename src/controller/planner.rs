use tracing::debug;

use crate::controller::delete_policy::{get_machines_to_delete, DeletePolicy};
use crate::controller::util::is_delete_protected;
use crate::resources::{Machine, MachineSet, Time};

#[derive(Debug, PartialEq)]
pub enum PlanAction<'a> {
    None,
    Create {
        count: usize,
    },
    /// `shortfall` victims could not be chosen because the remaining machines are protected.
    Delete {
        victims: Vec<&'a Machine>,
        shortfall: usize,
    },
}

#[derive(Debug, PartialEq)]
pub struct ReplicaPlan<'a> {
    pub desired: usize,
    pub live: usize,
    pub action: PlanAction<'a>,
}

/// Plan how to move `live` machines towards the desired replica count. `live` must only hold
/// owned machines that are not being deleted. A plan never both creates and deletes.
pub fn plan<'a>(machineset: &MachineSet, live: &[&'a Machine], now: Time) -> ReplicaPlan<'a> {
    let desired = machineset.desired_replicas();
    let action = if live.len() < desired {
        PlanAction::Create {
            count: desired - live.len(),
        }
    } else if live.len() > desired {
        let diff = live.len() - desired;
        let candidates = live
            .iter()
            .copied()
            .filter(|m| !is_delete_protected(m) && !m.metadata.is_deleting())
            .collect::<Vec<_>>();
        let policy = DeletePolicy::from(machineset.spec.delete_policy.as_str());
        let victims = get_machines_to_delete(policy, &candidates, diff, now);
        PlanAction::Delete {
            shortfall: diff - victims.len(),
            victims,
        }
    } else {
        PlanAction::None
    };
    debug!(desired, live = live.len(), ?action, "Planned replicas");
    ReplicaPlan {
        desired,
        live: live.len(),
        action,
    }
}

//! Ranking of machines for removal on scale down.
//!
//! Every policy maps a machine to a priority in `[0, 100]`. Candidates are stable sorted by
//! descending priority and the first `k` are deleted, so ties keep the listing order.

use std::fmt::Display;

use tracing::debug;

use crate::controller::util::{has_delete_annotation, has_error};
use crate::resources::{Machine, Time};

pub type DeletePriority = f64;

pub const MUST_DELETE: DeletePriority = 100.0;
pub const BETTER_DELETE: DeletePriority = 50.0;
pub const PREFER_DELETE: DeletePriority = 40.0;
pub const COULD_DELETE: DeletePriority = 20.0;
pub const MUST_NOT_DELETE: DeletePriority = 0.0;

// Age at which the oldest policy reaches ~63% of MUST_DELETE.
const SECONDS_PER_TEN_DAYS: f64 = 864_000.0;

pub trait Priority {
    fn priority(&self, machine: &Machine, now: Time) -> DeletePriority;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeletePolicy {
    #[default]
    Random,
    Newest,
    Oldest,
}

impl From<&str> for DeletePolicy {
    /// Empty and unrecognised values fall back to random.
    fn from(value: &str) -> Self {
        match value {
            "Newest" => DeletePolicy::Newest,
            "Oldest" => DeletePolicy::Oldest,
            _ => DeletePolicy::Random,
        }
    }
}

impl Display for DeletePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeletePolicy::Random => "Random",
            DeletePolicy::Newest => "Newest",
            DeletePolicy::Oldest => "Oldest",
        };
        f.write_str(s)
    }
}

impl Priority for DeletePolicy {
    fn priority(&self, machine: &Machine, now: Time) -> DeletePriority {
        match self {
            DeletePolicy::Random => random_delete_priority(machine),
            DeletePolicy::Newest => newest_delete_priority(machine, now),
            DeletePolicy::Oldest => oldest_delete_priority(machine, now),
        }
    }
}

fn must_delete(machine: &Machine) -> bool {
    machine.metadata.is_deleting() || has_delete_annotation(machine) || has_error(machine)
}

fn oldest_delete_priority(machine: &Machine, now: Time) -> DeletePriority {
    if must_delete(machine) {
        return MUST_DELETE;
    }
    let Some(created) = machine.metadata.creation_timestamp else {
        return MUST_NOT_DELETE;
    };
    let age = (now.0 - created.0).as_seconds_f64();
    if age < 0.0 {
        return MUST_NOT_DELETE;
    }
    MUST_DELETE * (1.0 - (-age / SECONDS_PER_TEN_DAYS).exp())
}

fn newest_delete_priority(machine: &Machine, now: Time) -> DeletePriority {
    if must_delete(machine) {
        return MUST_DELETE;
    }
    if machine.metadata.creation_timestamp.is_none() {
        return MUST_NOT_DELETE;
    }
    MUST_DELETE - oldest_delete_priority(machine, now)
}

fn random_delete_priority(machine: &Machine) -> DeletePriority {
    if machine.metadata.is_deleting() {
        return MUST_DELETE;
    }
    if has_delete_annotation(machine) || has_error(machine) {
        return BETTER_DELETE;
    }
    if machine.status.node_ref.is_none() {
        return PREFER_DELETE;
    }
    COULD_DELETE
}

/// Choose `diff` machines to delete from `candidates` under `policy`.
pub fn get_machines_to_delete<'a>(
    policy: DeletePolicy,
    candidates: &[&'a Machine],
    diff: usize,
    now: Time,
) -> Vec<&'a Machine> {
    if diff == 0 {
        return Vec::new();
    }
    let mut ranked: Vec<(DeletePriority, &'a Machine)> = candidates
        .iter()
        .map(|m| (policy.priority(m, now), *m))
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    debug!(
        %policy,
        ranking = ?ranked
            .iter()
            .map(|(p, m)| (m.metadata.name.as_str(), *p))
            .collect::<Vec<_>>(),
        "Ranked delete candidates"
    );
    ranked.into_iter().take(diff).map(|(_, m)| m).collect()
}

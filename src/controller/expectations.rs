//! Machine writes a machineset is waiting to see reflected in the informer cache.
//!
//! A snapshot taken before our own creates and deletes arrive through the watch would make the
//! planner repeat them. Until every created machine shows up and every deleted machine is gone
//! or terminating, the machineset is not managed again. Entries expire so that a missed watch
//! event cannot block a machineset forever.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cache::Snapshot;
use crate::resources::ObjectKey;

pub const DEFAULT_EXPECTATIONS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Pending {
    /// Names of created machines.
    creations: BTreeSet<String>,
    /// Uids of deleted machines.
    deletions: BTreeSet<String>,
    since: Instant,
}

#[derive(Debug)]
pub struct Expectations {
    pending: Mutex<HashMap<ObjectKey, Pending>>,
    timeout: Duration,
}

impl Default for Expectations {
    fn default() -> Self {
        Self::new(DEFAULT_EXPECTATIONS_TIMEOUT)
    }
}

impl Expectations {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKey, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn expect_creations(&self, key: &ObjectKey, names: impl IntoIterator<Item = String>) {
        let names = names.into_iter().collect::<Vec<_>>();
        if names.is_empty() {
            return;
        }
        let mut pending = self.lock();
        let entry = pending.entry(key.clone()).or_insert_with(Pending::new);
        entry.creations.extend(names);
        entry.since = Instant::now();
    }

    pub fn expect_deletions(&self, key: &ObjectKey, uids: impl IntoIterator<Item = String>) {
        let uids = uids.into_iter().collect::<Vec<_>>();
        if uids.is_empty() {
            return;
        }
        let mut pending = self.lock();
        let entry = pending.entry(key.clone()).or_insert_with(Pending::new);
        entry.deletions.extend(uids);
        entry.since = Instant::now();
    }

    /// Settle whatever the snapshot already reflects, true when nothing is outstanding.
    pub fn satisfied(&self, key: &ObjectKey, snapshot: &Snapshot) -> bool {
        let mut pending = self.lock();
        let Some(entry) = pending.get_mut(key) else {
            return true;
        };
        entry.creations.retain(|name| {
            snapshot
                .machines
                .get(&ObjectKey::new(key.namespace.clone(), name.clone()))
                .is_none()
        });
        entry.deletions.retain(|uid| {
            snapshot
                .machines
                .in_namespace(&key.namespace)
                .any(|m| &m.metadata.uid == uid && !m.metadata.is_deleting())
        });
        if entry.creations.is_empty() && entry.deletions.is_empty() {
            pending.remove(key);
            return true;
        }
        if entry.since.elapsed() >= self.timeout {
            warn!(
                machineset = %key,
                creations = entry.creations.len(),
                deletions = entry.deletions.len(),
                "Expectations expired"
            );
            pending.remove(key);
            return true;
        }
        debug!(
            machineset = %key,
            creations = entry.creations.len(),
            deletions = entry.deletions.len(),
            "Waiting for the cache to observe earlier writes"
        );
        false
    }

    pub fn forget(&self, key: &ObjectKey) {
        self.lock().remove(key);
    }
}

impl Pending {
    fn new() -> Self {
        Self {
            creations: BTreeSet::new(),
            deletions: BTreeSet::new(),
            since: Instant::now(),
        }
    }
}

//! Informer cache of machinesets, machines and nodes.
//!
//! Watch events are folded into persistent maps and each change publishes a new immutable
//! [`Snapshot`], so readers never hold a lock.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::resources::{Machine, MachineSet, Meta, Node, ObjectKey};
use crate::store::WatchEvent;

/// Resources unique by key, in sorted order for deterministic iteration.
#[derive(derivative::Derivative)]
#[derivative(Default(bound = ""))]
#[derive(Clone, Debug)]
pub struct Resources<T>(imbl::OrdMap<ObjectKey, Arc<T>>);

impl<T: Meta + Clone> Resources<T> {
    pub fn get(&self, key: &ObjectKey) -> Option<&Arc<T>> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.0.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.0.keys()
    }

    /// Resources in `namespace`, using the ordering of the keys to avoid a full scan.
    pub fn in_namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a Arc<T>> {
        self.0
            .range(ObjectKey::new(namespace, "")..)
            .take_while(move |(k, _)| k.namespace == namespace)
            .map(|(_, v)| v)
    }

    fn upsert(&mut self, res: T) {
        self.0.insert(ObjectKey::of(&res), Arc::new(res));
    }

    fn remove(&mut self, res: &T) {
        self.0.remove(&ObjectKey::of(res));
    }

    fn replace_all(&mut self, resources: Vec<T>) {
        self.0 = resources
            .into_iter()
            .map(|r| (ObjectKey::of(&r), Arc::new(r)))
            .collect();
    }

    fn apply(&mut self, event: WatchEvent<T>) {
        match event {
            WatchEvent::Added(r) | WatchEvent::Modified(r) => self.upsert(r),
            WatchEvent::Deleted(r) => self.remove(&r),
            WatchEvent::Restarted(rs) => self.replace_all(rs),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Synced {
    pub machinesets: bool,
    pub machines: bool,
    pub nodes: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Incremented on every applied event.
    pub revision: u64,
    pub machinesets: Resources<MachineSet>,
    pub machines: Resources<Machine>,
    pub nodes: Resources<Node>,
    pub synced: Synced,
}

impl Snapshot {
    /// Every watch has delivered its initial listing.
    pub fn is_synced(&self) -> bool {
        self.synced.machinesets && self.synced.machines && self.synced.nodes
    }

    pub fn machinesets_in<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a MachineSet> {
        self.machinesets.in_namespace(namespace).map(|ms| ms.as_ref())
    }

    pub fn machines_on_node<'a>(&'a self, node_name: &'a str) -> impl Iterator<Item = &'a Machine> {
        self.machines
            .iter()
            .map(|m| m.as_ref())
            .filter(move |m| m.node_name() == Some(node_name))
    }
}

#[derive(Debug)]
pub struct Cache {
    tx: watch::Sender<Snapshot>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Snapshot::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// The current snapshot, cheap to clone thanks to structural sharing.
    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn apply_machineset(&self, event: WatchEvent<MachineSet>) {
        self.modify(|s| {
            if matches!(event, WatchEvent::Restarted(_)) {
                s.synced.machinesets = true;
            }
            s.machinesets.apply(event);
        });
    }

    pub fn apply_machine(&self, event: WatchEvent<Machine>) {
        self.modify(|s| {
            if matches!(event, WatchEvent::Restarted(_)) {
                s.synced.machines = true;
            }
            s.machines.apply(event);
        });
    }

    pub fn apply_node(&self, event: WatchEvent<Node>) {
        self.modify(|s| {
            if matches!(event, WatchEvent::Restarted(_)) {
                s.synced.nodes = true;
            }
            s.nodes.apply(event);
        });
    }

    fn modify(&self, f: impl FnOnce(&mut Snapshot)) {
        self.tx.send_modify(|s| {
            f(s);
            s.revision += 1;
            debug!(
                revision = s.revision,
                machinesets = s.machinesets.len(),
                machines = s.machines.len(),
                nodes = s.nodes.len(),
                "Cache updated"
            );
        });
    }
}

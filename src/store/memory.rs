//! An in-process object store with api server semantics: resource versions, generated names,
//! finalizer-gated deletion, owner garbage collection and watch streams.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ObjectStore, StoreError, WatchEvent, WatchStream};
use crate::resources::{Machine, MachineSet, Meta, Node, ObjectKey};
use crate::utils::{generate_name, new_uid, now};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Store operations that can have faults injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    GetMachineSet,
    UpdateMachineSetStatus,
    CreateMachine,
    UpdateMachine,
    DeleteMachine,
}

/// A successful write, as observed by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    CreateMachine(ObjectKey),
    UpdateMachine(ObjectKey),
    DeleteMachine(ObjectKey),
    UpdateMachineSetStatus(ObjectKey),
}

impl Mutation {
    pub fn is_machine_mutation(&self) -> bool {
        !matches!(self, Mutation::UpdateMachineSetStatus(_))
    }
}

#[derive(Default)]
struct Inner {
    revision: u64,
    machinesets: BTreeMap<ObjectKey, MachineSet>,
    machines: BTreeMap<ObjectKey, Machine>,
    nodes: BTreeMap<String, Node>,
    faults: HashMap<Operation, VecDeque<StoreError>>,
    mutations: Vec<Mutation>,
    machine_finalizer: Option<String>,
}

impl Inner {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn check_fault(&mut self, op: Operation) -> Result<(), StoreError> {
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => {
                debug!(?op, %err, "Injecting fault");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    machinesets_tx: broadcast::Sender<WatchEvent<MachineSet>>,
    machines_tx: broadcast::Sender<WatchEvent<Machine>>,
    nodes_tx: broadcast::Sender<WatchEvent<Node>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (machinesets_tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        let (machines_tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        let (nodes_tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            machinesets_tx,
            machines_tx,
            nodes_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add this finalizer to every machine created from now on, as a platform machine
    /// controller would.
    pub fn set_machine_finalizer(&self, finalizer: impl Into<String>) {
        self.lock().machine_finalizer = Some(finalizer.into());
    }

    /// Make the next call of `op` fail with `err`. Faults queue up per operation.
    pub fn fail_next(&self, op: Operation, err: StoreError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.lock().mutations.clear();
    }

    pub fn machineset(&self, namespace: &str, name: &str) -> Option<MachineSet> {
        self.lock()
            .machinesets
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    pub fn machine(&self, namespace: &str, name: &str) -> Option<Machine> {
        self.lock()
            .machines
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    pub fn machines(&self, namespace: &str) -> Vec<Machine> {
        self.lock()
            .machines
            .values()
            .filter(|m| m.metadata.namespace == namespace)
            .cloned()
            .collect()
    }

    pub fn create_machineset(&self, mut machineset: MachineSet) -> Result<MachineSet, StoreError> {
        let mut inner = self.lock();
        let key = ObjectKey::of(&machineset);
        if key.name.is_empty() {
            return Err(StoreError::Invalid("name is required".to_owned()));
        }
        if inner.machinesets.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: "MachineSet",
                name: key.name,
            });
        }
        initialise_metadata(&mut machineset, &mut inner);
        machineset.metadata.generation = 1;
        inner.machinesets.insert(key, machineset.clone());
        let _ = self
            .machinesets_tx
            .send(WatchEvent::Added(machineset.clone()));
        Ok(machineset)
    }

    /// Client side spec update, bumping the generation when the spec changes.
    pub fn update_machineset(&self, machineset: &MachineSet) -> Result<MachineSet, StoreError> {
        let mut inner = self.lock();
        let key = ObjectKey::of(machineset);
        let existing = inner
            .machinesets
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("MachineSet", key.name.clone()))?;
        check_resource_version(&existing, machineset)?;
        let mut updated = existing.clone();
        updated.metadata.labels = machineset.metadata.labels.clone();
        updated.metadata.annotations = machineset.metadata.annotations.clone();
        updated.metadata.finalizers = machineset.metadata.finalizers.clone();
        if updated.spec != machineset.spec {
            updated.spec = machineset.spec.clone();
            updated.metadata.generation += 1;
        }
        updated.metadata.resource_version = inner.next_revision();
        inner.machinesets.insert(key, updated.clone());
        let _ = self
            .machinesets_tx
            .send(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    /// Delete a machineset, garbage collecting the machines that it owns.
    pub fn delete_machineset(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = ObjectKey::new(namespace, name);
        let Some(mut machineset) = inner.machinesets.remove(&key) else {
            return Err(StoreError::not_found("MachineSet", name));
        };
        if !machineset.metadata.finalizers.is_empty() {
            machineset.metadata.deletion_timestamp = Some(now());
            machineset.metadata.resource_version = inner.next_revision();
            inner.machinesets.insert(key, machineset.clone());
            let _ = self.machinesets_tx.send(WatchEvent::Modified(machineset));
            return Ok(());
        }
        let dependents: Vec<ObjectKey> = inner
            .machines
            .iter()
            .filter(|(_, m)| {
                m.metadata
                    .owner_references
                    .iter()
                    .any(|or| or.uid == machineset.metadata.uid)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for dependent in dependents {
            let _ = self.delete_machine_locked(&mut inner, &dependent, None);
        }
        let _ = self.machinesets_tx.send(WatchEvent::Deleted(machineset));
        Ok(())
    }

    /// Remove all finalizers from a machine, letting a pending deletion complete.
    pub fn remove_machine_finalizers(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = ObjectKey::new(namespace, name);
        let mut machine = inner
            .machines
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Machine", name))?;
        machine.metadata.finalizers.clear();
        self.store_machine_locked(&mut inner, key, machine);
        Ok(())
    }

    /// Replace the status of a machine, as the platform machine controller would.
    pub fn set_machine_status(
        &self,
        namespace: &str,
        name: &str,
        status: crate::resources::MachineStatus,
    ) -> Result<Machine, StoreError> {
        let mut inner = self.lock();
        let key = ObjectKey::new(namespace, name);
        let mut machine = inner
            .machines
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Machine", name))?;
        machine.status = status;
        machine.metadata.resource_version = inner.next_revision();
        inner.machines.insert(key, machine.clone());
        let _ = self.machines_tx.send(WatchEvent::Modified(machine.clone()));
        Ok(machine)
    }

    pub fn put_node(&self, mut node: Node) {
        let mut inner = self.lock();
        let existed = inner.nodes.contains_key(&node.metadata.name);
        if node.metadata.uid.is_empty() {
            node.metadata.uid = new_uid();
        }
        node.metadata.resource_version = inner.next_revision();
        inner.nodes.insert(node.metadata.name.clone(), node.clone());
        let event = if existed {
            WatchEvent::Modified(node)
        } else {
            WatchEvent::Added(node)
        };
        let _ = self.nodes_tx.send(event);
    }

    fn store_machine_locked(&self, inner: &mut Inner, key: ObjectKey, mut machine: Machine) {
        if machine.metadata.is_deleting() && machine.metadata.finalizers.is_empty() {
            inner.machines.remove(&key);
            let _ = self.machines_tx.send(WatchEvent::Deleted(machine));
            return;
        }
        machine.metadata.resource_version = inner.next_revision();
        inner.machines.insert(key, machine.clone());
        let _ = self.machines_tx.send(WatchEvent::Modified(machine));
    }

    fn delete_machine_locked(&self, inner: &mut Inner, key: &ObjectKey, uid: Option<&str>) -> Result<(), StoreError> {
        let Some(mut machine) = inner.machines.get(key).cloned() else {
            return Err(StoreError::not_found("Machine", key.name.clone()));
        };
        if let Some(uid) = uid {
            if machine.metadata.uid != uid {
                return Err(StoreError::Conflict(format!(
                    "precondition failed: uid in precondition {uid} does not match {}",
                    machine.metadata.uid
                )));
            }
        }
        if machine.metadata.finalizers.is_empty() {
            inner.machines.remove(key);
            let _ = self.machines_tx.send(WatchEvent::Deleted(machine));
        } else if !machine.metadata.is_deleting() {
            machine.metadata.deletion_timestamp = Some(now());
            self.store_machine_locked(inner, key.clone(), machine);
        }
        Ok(())
    }

    fn relist<T: Clone + Meta>(items: &BTreeMap<ObjectKey, T>, namespace: Option<&str>) -> Vec<T> {
        items
            .values()
            .filter(|i| namespace.map_or(true, |ns| i.metadata().namespace == ns))
            .cloned()
            .collect()
    }
}

fn initialise_metadata<M: Meta>(resource: &mut M, inner: &mut Inner) {
    let metadata = resource.metadata_mut();
    metadata.uid = new_uid();
    metadata.resource_version = inner.next_revision();
    metadata.deletion_timestamp = None;
    if metadata.creation_timestamp.is_none() {
        metadata.creation_timestamp = Some(now());
    }
}

fn check_resource_version<M: Meta>(existing: &M, update: &M) -> Result<(), StoreError> {
    let current = &existing.metadata().resource_version;
    let given = &update.metadata().resource_version;
    if current != given {
        return Err(StoreError::Conflict(format!(
            "the object has been modified; resource version {given:?} does not match {current:?}"
        )));
    }
    Ok(())
}

fn watch_stream<T, F>(
    initial: Vec<T>,
    rx: broadcast::Receiver<WatchEvent<T>>,
    namespace: Option<String>,
    relist: F,
) -> WatchStream<T>
where
    T: Clone + Meta + Send + 'static,
    F: Fn() -> Vec<T> + Send + 'static,
{
    let head = futures::stream::once(async move { Ok(WatchEvent::Restarted(initial)) });
    let tail = futures::stream::unfold((rx, relist), move |(mut rx, relist)| {
        let namespace = namespace.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if in_namespace(&event, namespace.as_deref()) {
                            return Some((Ok(event), (rx, relist)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Watch lagged, relisting");
                        let items = relist();
                        return Some((Ok(WatchEvent::Restarted(items)), (rx, relist)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    });
    head.chain(tail).boxed()
}

fn in_namespace<T: Meta>(event: &WatchEvent<T>, namespace: Option<&str>) -> bool {
    let Some(namespace) = namespace else {
        return true;
    };
    match event {
        WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => {
            o.metadata().namespace == namespace
        }
        WatchEvent::Restarted(_) => true,
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_machineset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineSet>, StoreError> {
        let mut inner = self.lock();
        inner.check_fault(Operation::GetMachineSet)?;
        Ok(inner
            .machinesets
            .get(&ObjectKey::new(namespace, name))
            .cloned())
    }

    async fn update_machineset_status(
        &self,
        machineset: &MachineSet,
    ) -> Result<MachineSet, StoreError> {
        let mut inner = self.lock();
        inner.check_fault(Operation::UpdateMachineSetStatus)?;
        let key = ObjectKey::of(machineset);
        let existing = inner
            .machinesets
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("MachineSet", key.name.clone()))?;
        check_resource_version(&existing, machineset)?;
        let mut updated = existing;
        updated.status = machineset.status.clone();
        updated.metadata.resource_version = inner.next_revision();
        inner.machinesets.insert(key.clone(), updated.clone());
        inner.mutations.push(Mutation::UpdateMachineSetStatus(key));
        let _ = self
            .machinesets_tx
            .send(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn create_machine(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let mut inner = self.lock();
        inner.check_fault(Operation::CreateMachine)?;
        let mut machine = machine.clone();
        if machine.metadata.name.is_empty() {
            if machine.metadata.generate_name.is_empty() {
                return Err(StoreError::Invalid(
                    "name or generateName is required".to_owned(),
                ));
            }
            machine.metadata.name = generate_name(&machine.metadata.generate_name);
        }
        let key = ObjectKey::of(&machine);
        if inner.machines.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: "Machine",
                name: key.name,
            });
        }
        initialise_metadata(&mut machine, &mut inner);
        if let Some(finalizer) = inner.machine_finalizer.clone() {
            if !machine.metadata.finalizers.contains(&finalizer) {
                machine.metadata.finalizers.push(finalizer);
            }
        }
        inner.machines.insert(key.clone(), machine.clone());
        inner.mutations.push(Mutation::CreateMachine(key));
        let _ = self.machines_tx.send(WatchEvent::Added(machine.clone()));
        Ok(machine)
    }

    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let mut inner = self.lock();
        inner.check_fault(Operation::UpdateMachine)?;
        let key = ObjectKey::of(machine);
        let existing = inner
            .machines
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Machine", key.name.clone()))?;
        check_resource_version(&existing, machine)?;
        let mut updated = existing;
        updated.metadata.labels = machine.metadata.labels.clone();
        updated.metadata.annotations = machine.metadata.annotations.clone();
        updated.metadata.owner_references = machine.metadata.owner_references.clone();
        updated.metadata.finalizers = machine.metadata.finalizers.clone();
        inner.mutations.push(Mutation::UpdateMachine(key.clone()));
        self.store_machine_locked(&mut inner, key.clone(), updated);
        Ok(inner.machines.get(&key).cloned().unwrap_or_else(|| machine.clone()))
    }

    async fn delete_machine(&self, machine: &Machine) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check_fault(Operation::DeleteMachine)?;
        let key = ObjectKey::of(machine);
        self.delete_machine_locked(&mut inner, &key, Some(&machine.metadata.uid))?;
        inner.mutations.push(Mutation::DeleteMachine(key));
        Ok(())
    }

    fn watch_machinesets(&self, namespace: Option<&str>) -> WatchStream<MachineSet> {
        let rx = self.machinesets_tx.subscribe();
        let namespace = namespace.map(str::to_owned);
        let initial = Self::relist(&self.lock().machinesets, namespace.as_deref());
        let inner = Arc::clone(&self.inner);
        let ns = namespace.clone();
        watch_stream(initial, rx, namespace, move || {
            let inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            Self::relist(&inner.machinesets, ns.as_deref())
        })
    }

    fn watch_machines(&self, namespace: Option<&str>) -> WatchStream<Machine> {
        let rx = self.machines_tx.subscribe();
        let namespace = namespace.map(str::to_owned);
        let initial = Self::relist(&self.lock().machines, namespace.as_deref());
        let inner = Arc::clone(&self.inner);
        let ns = namespace.clone();
        watch_stream(initial, rx, namespace, move || {
            let inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            Self::relist(&inner.machines, ns.as_deref())
        })
    }

    fn watch_nodes(&self) -> WatchStream<Node> {
        let rx = self.nodes_tx.subscribe();
        let nodes = |inner: &Inner| inner.nodes.values().cloned().collect::<Vec<_>>();
        let initial = nodes(&*self.lock());
        let inner = Arc::clone(&self.inner);
        watch_stream(initial, rx, None, move || {
            nodes(&*inner.lock().unwrap_or_else(PoisonError::into_inner))
        })
    }
}

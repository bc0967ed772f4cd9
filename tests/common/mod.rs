#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use machineset_controller::cache::Cache;
use machineset_controller::controller::status::get_condition;
use machineset_controller::controller::{MachineSetReconciler, Outcome};
use machineset_controller::error::Error;
use machineset_controller::events::MemoryRecorder;
use machineset_controller::resources::{
    Condition, ConditionStatus, Machine, MachineSet, Node, NodeCondition, NodeConditionType,
    NodeReference, ObjectKey, Time,
};
use machineset_controller::store::{MemoryStore, ObjectStore, WatchStream};
use machineset_controller::utils;

pub const NAMESPACE: &str = "default";

/// A machineset selecting `foo=<selector>` with template labels `foo=<template>`.
pub fn machineset(name: &str, replicas: u32, selector: &str, template: &str) -> MachineSet {
    let manifest = format!(
        r#"
apiVersion: machine.openshift.io/v1beta1
kind: MachineSet
metadata:
  name: {name}
  namespace: {NAMESPACE}
spec:
  replicas: {replicas}
  selector:
    matchLabels:
      foo: {selector}
  template:
    metadata:
      labels:
        foo: {template}
    spec:
      providerSpec:
        value:
          instanceType: m5.large
"#
    );
    serde_yaml::from_str(&manifest).unwrap()
}

/// A machine with the given labels and creation time, owned by nobody.
pub fn orphan(name: &str, labels: &[(&str, &str)], created: Time) -> Machine {
    let mut machine = Machine::default();
    machine.metadata.namespace = NAMESPACE.to_owned();
    machine.metadata.name = name.to_owned();
    machine.metadata.creation_timestamp = Some(created);
    machine.metadata.labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    machine
}

pub fn ago(seconds: u64) -> Time {
    Time(utils::now().0 - Duration::from_secs(seconds))
}

pub fn node(name: &str, ready: bool, since: Time) -> Node {
    let mut node = Node::default();
    node.metadata.name = name.to_owned();
    node.status.conditions.push(NodeCondition {
        r#type: NodeConditionType::Ready,
        status: if ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        last_transition_time: Some(since),
        ..Default::default()
    });
    node
}

pub fn node_ref(name: &str) -> NodeReference {
    NodeReference {
        kind: "Node".to_owned(),
        name: name.to_owned(),
        ..Default::default()
    }
}

struct Informers {
    machinesets: WatchStream<MachineSet>,
    machines: WatchStream<Machine>,
    nodes: WatchStream<Node>,
}

pub struct Harness {
    pub store: MemoryStore,
    pub cache: Arc<Cache>,
    pub recorder: Arc<MemoryRecorder>,
    pub reconciler: MachineSetReconciler,
    informers: Mutex<Informers>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(|store| Arc::new(store) as Arc<dyn ObjectStore>)
    }

    /// A harness whose reconciler writes through `wrap(store)`.
    pub fn with_store(wrap: impl FnOnce(MemoryStore) -> Arc<dyn ObjectStore>) -> Self {
        let store = MemoryStore::new();
        let cache = Arc::new(Cache::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let informers = Informers {
            machinesets: store.watch_machinesets(Some(NAMESPACE)),
            machines: store.watch_machines(Some(NAMESPACE)),
            nodes: store.watch_nodes(),
        };
        let reconciler =
            MachineSetReconciler::new(wrap(store.clone()), cache.clone(), recorder.clone(), 10);
        Self {
            store,
            cache,
            recorder,
            reconciler,
            informers: Mutex::new(informers),
        }
    }

    /// Apply every watch event delivered so far to the cache.
    pub fn sync(&self) {
        let mut informers = self.informers.lock().unwrap();
        while let Some(Some(Ok(event))) =
            tokio::task::unconstrained(informers.machinesets.next()).now_or_never()
        {
            self.cache.apply_machineset(event);
        }
        while let Some(Some(Ok(event))) =
            tokio::task::unconstrained(informers.machines.next()).now_or_never()
        {
            self.cache.apply_machine(event);
        }
        while let Some(Some(Ok(event))) =
            tokio::task::unconstrained(informers.nodes.next()).now_or_never()
        {
            self.cache.apply_node(event);
        }
    }

    /// Sync the cache, then reconcile the machineset.
    pub async fn reconcile(&self, name: &str) -> Result<Outcome, Error> {
        self.sync();
        self.reconciler
            .reconcile(&ObjectKey::new(NAMESPACE, name))
            .await
    }

    pub fn create(&self, machineset: MachineSet) -> MachineSet {
        self.store.create_machineset(machineset).unwrap()
    }

    pub fn get(&self, name: &str) -> MachineSet {
        self.store.machineset(NAMESPACE, name).unwrap()
    }

    /// Machines controlled by the machineset that are not being deleted.
    pub fn owned(&self, name: &str) -> Vec<Machine> {
        let machineset = self.get(name);
        self.store
            .machines(NAMESPACE)
            .into_iter()
            .filter(|m| {
                m.metadata.is_controlled_by(&machineset.metadata) && !m.metadata.is_deleting()
            })
            .collect()
    }

    pub fn condition(&self, name: &str, cond_type: &str) -> Option<Condition> {
        get_condition(&self.get(name).status, cond_type).cloned()
    }

    /// Reconcile until the machineset is in sync or the attempts run out.
    pub async fn converge(&self, name: &str, attempts: usize) {
        for _ in 0..attempts {
            if self.reconcile(name).await.is_ok() {
                return;
            }
        }
        panic!("machineset {name} did not converge in {attempts} attempts");
    }
}

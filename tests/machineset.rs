use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use machineset_controller::controller::status::{PAUSED_CONDITION, REPLICA_FAILURE_CONDITION};
use machineset_controller::controller::util::DELETION_IN_PROGRESS_ANNOTATION;
use machineset_controller::controller::Outcome;
use machineset_controller::error::Error;
use machineset_controller::events::{reasons, EventType};
use machineset_controller::resources::{
    AuthoritativeApi, ConditionSeverity, ConditionStatus, LabelSelectorOperator,
    LabelSelectorRequirement, Machine, MachineSet, MachineStatus, Node, ObjectKey,
};
use machineset_controller::store::memory::{Mutation, Operation};
use machineset_controller::store::{MemoryStore, ObjectStore, StoreError, WatchStream};

use common::{ago, machineset, node, node_ref, orphan, Harness, NAMESPACE};

mod common;

fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

#[test_log::test(tokio::test)]
async fn scale_up_from_zero() {
    let h = Harness::new();
    h.create(machineset("workers", 2, "bar", "bar"));

    let outcome = h.reconcile("workers").await.unwrap();
    assert_eq!(outcome, Outcome::Synced);

    let owned = h.owned("workers");
    assert_eq!(owned.len(), 2);
    for machine in &owned {
        assert!(machine.metadata.name.starts_with("workers-"));
        assert_eq!(machine.metadata.labels["foo"], "bar");
        assert!(machine.spec.provider_spec.value.is_some());
    }
    let ms = h.get("workers");
    assert_eq!(ms.status.replicas, 2);
    assert_eq!(ms.status.fully_labeled_replicas, 2);
    assert_eq!(ms.status.observed_generation, ms.metadata.generation);
    assert_eq!(h.recorder.count(reasons::SUCCESSFUL_CREATE), 2);
    let paused = h.condition("workers", PAUSED_CONDITION).unwrap();
    assert_eq!(paused.status, ConditionStatus::False);
    assert_eq!(ms.status.authoritative_api, Some(AuthoritativeApi::MachineAPI));
}

#[test_log::test(tokio::test)]
async fn steady_state_writes_nothing() {
    let h = Harness::new();
    h.create(machineset("workers", 2, "bar", "bar"));
    h.converge("workers", 1).await;

    h.store.clear_mutations();
    h.reconcile("workers").await.unwrap();
    assert_eq!(h.store.mutations(), Vec::new());
}

#[test_log::test(tokio::test)]
async fn deleted_machine_is_replaced() {
    let h = Harness::new();
    h.create(machineset("workers", 2, "bar", "bar"));
    h.converge("workers", 1).await;

    let victim = h.owned("workers").remove(0);
    h.store.delete_machine(&victim).await.unwrap();
    assert_eq!(h.owned("workers").len(), 1);

    h.reconcile("workers").await.unwrap();
    let owned = h.owned("workers");
    assert_eq!(owned.len(), 2);
    assert!(owned.iter().all(|m| m.metadata.name != victim.metadata.name));
    assert_eq!(h.get("workers").status.replicas, 2);
    assert_eq!(h.recorder.count(reasons::SUCCESSFUL_CREATE), 3);
}

#[test_log::test(tokio::test)]
async fn terminating_machine_is_replaced_before_it_is_gone() {
    let h = Harness::new();
    h.store.set_machine_finalizer("machine.machine.openshift.io");
    h.create(machineset("workers", 1, "bar", "bar"));
    h.converge("workers", 1).await;

    let victim = h.owned("workers").remove(0);
    h.store.delete_machine(&victim).await.unwrap();
    let terminating = h.store.machine(NAMESPACE, &victim.metadata.name).unwrap();
    assert!(terminating.metadata.is_deleting());

    h.reconcile("workers").await.unwrap();
    assert_eq!(h.owned("workers").len(), 1);
    assert_eq!(h.store.machines(NAMESPACE).len(), 2);
    assert_eq!(h.get("workers").status.replicas, 1);

    h.store
        .remove_machine_finalizers(NAMESPACE, &victim.metadata.name)
        .unwrap();
    assert!(h.store.machine(NAMESPACE, &victim.metadata.name).is_none());
    h.store.clear_mutations();
    h.reconcile("workers").await.unwrap();
    assert!(h
        .store
        .mutations()
        .iter()
        .all(|m| !m.is_machine_mutation()));
}

#[test_log::test(tokio::test)]
async fn scale_down_oldest() {
    let h = Harness::new();
    for (name, age) in [("ten", 600), ("five", 300), ("one", 60)] {
        h.store
            .create_machine(&orphan(name, &[("foo", "bar")], ago(age)))
            .await
            .unwrap();
    }
    let mut ms = machineset("workers", 3, "bar", "bar");
    ms.spec.delete_policy = "Oldest".to_owned();
    h.create(ms);
    h.converge("workers", 1).await;
    assert_eq!(h.owned("workers").len(), 3);

    let mut ms = h.get("workers");
    ms.spec.replicas = Some(2);
    h.store.update_machineset(&ms).unwrap();
    h.reconcile("workers").await.unwrap();

    let mut names = h
        .owned("workers")
        .into_iter()
        .map(|m| m.metadata.name)
        .collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec!["five", "one"]);
    assert!(h.store.machine(NAMESPACE, "ten").is_none());
    assert_eq!(h.recorder.count(reasons::SUCCESSFUL_DELETE), 1);
    assert_eq!(h.get("workers").status.replicas, 2);
}

/// Delegates to the memory store, holding back the deletion of one machine.
struct SlowDeletes {
    inner: MemoryStore,
    slow: &'static str,
}

#[async_trait]
impl ObjectStore for SlowDeletes {
    async fn get_machineset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineSet>, StoreError> {
        self.inner.get_machineset(namespace, name).await
    }

    async fn update_machineset_status(
        &self,
        machineset: &MachineSet,
    ) -> Result<MachineSet, StoreError> {
        self.inner.update_machineset_status(machineset).await
    }

    async fn create_machine(&self, machine: &Machine) -> Result<Machine, StoreError> {
        self.inner.create_machine(machine).await
    }

    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError> {
        self.inner.update_machine(machine).await
    }

    async fn delete_machine(&self, machine: &Machine) -> Result<(), StoreError> {
        if machine.metadata.name == self.slow {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.inner.delete_machine(machine).await
    }

    fn watch_machinesets(&self, namespace: Option<&str>) -> WatchStream<MachineSet> {
        self.inner.watch_machinesets(namespace)
    }

    fn watch_machines(&self, namespace: Option<&str>) -> WatchStream<Machine> {
        self.inner.watch_machines(namespace)
    }

    fn watch_nodes(&self) -> WatchStream<Node> {
        self.inner.watch_nodes()
    }
}

#[test_log::test(tokio::test)]
async fn scale_to_zero_deletes_in_policy_order() {
    let h = Harness::with_store(|inner| {
        Arc::new(SlowDeletes { inner, slow: "ten" }) as Arc<dyn ObjectStore>
    });
    for (name, age) in [("ten", 600), ("five", 300), ("one", 60)] {
        h.store
            .create_machine(&orphan(name, &[("foo", "bar")], ago(age)))
            .await
            .unwrap();
    }
    let mut ms = machineset("workers", 3, "bar", "bar");
    ms.spec.delete_policy = "Oldest".to_owned();
    h.create(ms);
    h.converge("workers", 1).await;

    let mut ms = h.get("workers");
    ms.spec.replicas = Some(0);
    h.store.update_machineset(&ms).unwrap();
    h.reconcile("workers").await.unwrap();

    assert!(h.store.machines(NAMESPACE).is_empty());
    let deleted = h
        .recorder
        .events()
        .into_iter()
        .filter(|e| e.reason == reasons::SUCCESSFUL_DELETE)
        .map(|e| e.note)
        .collect::<Vec<_>>();
    assert_eq!(
        deleted,
        vec![
            "Deleted machine ten",
            "Deleted machine five",
            "Deleted machine one"
        ]
    );
}

#[test_log::test(tokio::test)]
async fn scale_down_skips_protected_machine() {
    let h = Harness::new();
    for (name, age) in [("ten", 600), ("five", 300), ("one", 60)] {
        h.store
            .create_machine(&orphan(name, &[("foo", "bar")], ago(age)))
            .await
            .unwrap();
    }
    let mut ms = machineset("workers", 3, "bar", "bar");
    ms.spec.delete_policy = "Newest".to_owned();
    h.create(ms);
    h.converge("workers", 1).await;

    let mut newest = h.store.machine(NAMESPACE, "one").unwrap();
    newest
        .metadata
        .annotations
        .insert(DELETION_IN_PROGRESS_ANNOTATION.to_owned(), String::new());
    h.store.update_machine(&newest).await.unwrap();

    let mut ms = h.get("workers");
    ms.spec.replicas = Some(2);
    h.store.update_machineset(&ms).unwrap();
    h.reconcile("workers").await.unwrap();

    assert!(h.store.machine(NAMESPACE, "one").is_some());
    assert!(h.store.machine(NAMESPACE, "five").is_none());
    assert!(h.store.machine(NAMESPACE, "ten").is_some());
}

#[test_log::test(tokio::test)]
async fn scale_down_reports_protected_shortfall() {
    let h = Harness::new();
    h.create(machineset("workers", 3, "bar", "bar"));
    h.converge("workers", 1).await;
    for mut machine in h.owned("workers") {
        machine
            .metadata
            .annotations
            .insert(DELETION_IN_PROGRESS_ANNOTATION.to_owned(), String::new());
        h.store.update_machine(&machine).await.unwrap();
    }

    let mut ms = h.get("workers");
    ms.spec.replicas = Some(1);
    h.store.update_machineset(&ms).unwrap();
    h.store.clear_mutations();
    let err = h.reconcile("workers").await.unwrap_err();

    assert!(matches!(
        err,
        Error::InsufficientDeleteCandidates {
            wanted: 2,
            available: 0
        }
    ));
    assert!(err.is_retryable());
    assert!(!h
        .store
        .mutations()
        .iter()
        .any(|m| matches!(m, Mutation::DeleteMachine(_))));
    assert_eq!(h.recorder.count(reasons::INSUFFICIENT_DELETE_CANDIDATES), 1);
    let failure = h.condition("workers", REPLICA_FAILURE_CONDITION).unwrap();
    assert_eq!(failure.status, ConditionStatus::True);
    assert_eq!(failure.reason.as_deref(), Some(reasons::FAILED_DELETE));
}

#[test_log::test(tokio::test)]
async fn paused_on_cluster_api() {
    let h = Harness::new();
    let mut ms = machineset("workers", 2, "bar", "bar");
    ms.status.authoritative_api = Some(AuthoritativeApi::ClusterAPI);
    h.create(ms);

    let outcome = h.reconcile("workers").await.unwrap();
    assert_eq!(outcome, Outcome::Paused(AuthoritativeApi::ClusterAPI));

    assert!(h.store.machines(NAMESPACE).is_empty());
    assert!(!h.store.mutations().iter().any(|m| m.is_machine_mutation()));
    assert_eq!(h.recorder.count(reasons::SUCCESSFUL_CREATE), 0);
    let paused = h.condition("workers", PAUSED_CONDITION).unwrap();
    assert_eq!(paused.status, ConditionStatus::True);
    assert_eq!(paused.reason.as_deref(), Some("AuthoritativeAPINotMachineAPI"));
    assert_eq!(h.get("workers").status.observed_generation, 0);
    assert_eq!(h.recorder.count(reasons::PAUSED), 1);

    // Staying paused publishes nothing new.
    h.reconcile("workers").await.unwrap();
    assert_eq!(h.recorder.count(reasons::PAUSED), 1);
}

#[test_log::test(tokio::test)]
async fn paused_while_migrating_and_resumes() {
    let h = Harness::new();
    let mut ms = machineset("workers", 1, "bar", "bar");
    ms.spec.authoritative_api = Some(AuthoritativeApi::Migrating);
    h.create(ms);

    let outcome = h.reconcile("workers").await.unwrap();
    assert_eq!(outcome, Outcome::Paused(AuthoritativeApi::Migrating));
    let ms = h.get("workers");
    assert_eq!(ms.status.authoritative_api, Some(AuthoritativeApi::Migrating));
    assert!(h.store.machines(NAMESPACE).is_empty());

    // The migration collaborator hands authority back.
    let mut ms = ms;
    ms.status.authoritative_api = Some(AuthoritativeApi::MachineAPI);
    h.store.update_machineset_status(&ms).await.unwrap();
    h.reconcile("workers").await.unwrap();
    assert_eq!(h.owned("workers").len(), 1);
    let paused = h.condition("workers", PAUSED_CONDITION).unwrap();
    assert_eq!(paused.status, ConditionStatus::False);
}

#[test_log::test(tokio::test)]
async fn selector_mismatch_is_reported() {
    let h = Harness::new();
    h.create(machineset("workers", 2, "bar", "baz"));

    let err = h.reconcile("workers").await.unwrap_err();
    assert!(matches!(err, Error::SelectorMismatch { .. }));
    assert!(!err.is_retryable());

    assert!(h.store.machines(NAMESPACE).is_empty());
    let warnings = h.recorder.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].reason, reasons::INVALID_CONFIGURATION);
    let ms = h.get("workers");
    assert_eq!(ms.status.error_reason.as_deref(), Some("InvalidConfiguration"));
    assert_eq!(ms.status.observed_generation, ms.metadata.generation);
    let failure = h.condition("workers", REPLICA_FAILURE_CONDITION).unwrap();
    assert_eq!(failure.status, ConditionStatus::True);
    assert_eq!(failure.severity, Some(ConditionSeverity::Error));

    // Fixing the template clears the failure.
    let mut ms = ms;
    ms.spec.template.metadata.labels.insert("foo".to_owned(), "bar".to_owned());
    h.store.update_machineset(&ms).unwrap();
    h.reconcile("workers").await.unwrap();
    let ms = h.get("workers");
    assert_eq!(ms.status.error_reason, None);
    assert!(h.condition("workers", REPLICA_FAILURE_CONDITION).is_none());
    assert_eq!(h.owned("workers").len(), 2);
}

#[test_log::test(tokio::test)]
async fn selector_change_is_refused() {
    let h = Harness::new();
    h.create(machineset("workers", 2, "bar", "bar"));
    h.converge("workers", 1).await;
    assert_eq!(h.get("workers").status.label_selector.as_deref(), Some("foo=bar"));

    let mut ms = h.get("workers");
    ms.spec.selector.match_labels.insert("foo".to_owned(), "baz".to_owned());
    ms.spec.template.metadata.labels.insert("foo".to_owned(), "baz".to_owned());
    h.store.update_machineset(&ms).unwrap();
    h.store.clear_mutations();

    let err = h.reconcile("workers").await.unwrap_err();
    assert!(matches!(err, Error::SelectorChanged { .. }));
    assert!(!err.is_retryable());

    assert!(!h.store.mutations().iter().any(|m| m.is_machine_mutation()));
    assert_eq!(h.owned("workers").len(), 2);
    let warnings = h.recorder.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].reason, reasons::INVALID_CONFIGURATION);
    let ms = h.get("workers");
    assert_eq!(ms.status.label_selector.as_deref(), Some("foo=bar"));
    assert_eq!(ms.status.replicas, 2);
    let failure = h.condition("workers", REPLICA_FAILURE_CONDITION).unwrap();
    assert_eq!(failure.status, ConditionStatus::True);
    assert_eq!(failure.severity, Some(ConditionSeverity::Error));
}

#[test_log::test(tokio::test)]
async fn invalid_selector_is_not_retried() {
    let h = Harness::new();
    let mut ms = machineset("workers", 1, "bar", "bar");
    ms.spec.selector.match_expressions.push(LabelSelectorRequirement {
        key: "zone".to_owned(),
        operator: LabelSelectorOperator::In,
        values: Vec::new(),
    });
    h.create(ms);

    let err = h.reconcile("workers").await.unwrap_err();
    assert!(matches!(err, Error::InvalidSelector(_)));
    assert!(!err.is_retryable());
    assert!(h.store.machines(NAMESPACE).is_empty());
}

#[test_log::test(tokio::test)]
async fn orphan_is_adopted() {
    let h = Harness::new();
    h.store
        .create_machine(&orphan("stray", &[("foo", "bar")], ago(60)))
        .await
        .unwrap();
    let ms = h.create(machineset("workers", 1, "bar", "bar"));
    h.store.clear_mutations();

    h.reconcile("workers").await.unwrap();

    let stray = h.store.machine(NAMESPACE, "stray").unwrap();
    let owner = stray.metadata.controller_ref().unwrap();
    assert_eq!(owner.uid, ms.metadata.uid);
    assert!(owner.block_owner_deletion);
    assert!(!h
        .store
        .mutations()
        .iter()
        .any(|m| matches!(m, Mutation::CreateMachine(_))));
    assert_eq!(h.recorder.count(reasons::SUCCESSFUL_ADOPT), 1);
    assert_eq!(h.get("workers").status.replicas, 1);
}

#[test_log::test(tokio::test)]
async fn adoption_read_failure_is_reported() {
    let h = Harness::new();
    h.store
        .create_machine(&orphan("stray", &[("foo", "bar")], ago(60)))
        .await
        .unwrap();
    h.create(machineset("workers", 1, "bar", "bar"));
    h.store.fail_next(
        Operation::GetMachineSet,
        StoreError::Forbidden("machinesets is forbidden".to_owned()),
    );
    h.store.clear_mutations();

    let err = h.reconcile("workers").await.unwrap_err();
    assert!(err.is_retryable());
    // The orphan may still be ours, so nothing is created in its place.
    assert!(!h.store.mutations().iter().any(|m| m.is_machine_mutation()));
    let stray = h.store.machine(NAMESPACE, "stray").unwrap();
    assert!(stray.metadata.controller_ref().is_none());
    let ms = h.get("workers");
    assert_eq!(ms.status.observed_generation, ms.metadata.generation);
    let failure = h.condition("workers", REPLICA_FAILURE_CONDITION).unwrap();
    assert_eq!(failure.reason.as_deref(), Some(reasons::FAILED_ADOPT));
    assert_eq!(failure.severity, Some(ConditionSeverity::Warning));

    h.reconcile("workers").await.unwrap();
    assert_eq!(h.owned("workers").len(), 1);
    assert!(h.condition("workers", REPLICA_FAILURE_CONDITION).is_none());
}

#[test_log::test(tokio::test)]
async fn overlapping_selectors_first_adopter_wins() {
    let h = Harness::new();
    h.store
        .create_machine(&orphan("stray", &[("foo", "bar")], ago(60)))
        .await
        .unwrap();
    let first = h.create(machineset("first", 1, "bar", "bar"));
    h.create(machineset("second", 1, "bar", "bar"));

    h.reconcile("first").await.unwrap();
    h.reconcile("second").await.unwrap();

    let stray = h.store.machine(NAMESPACE, "stray").unwrap();
    assert_eq!(stray.metadata.controller_ref().unwrap().uid, first.metadata.uid);
    assert_eq!(h.owned("first").len(), 1);
    assert_eq!(h.owned("second").len(), 1);
    for machine in h.store.machines(NAMESPACE) {
        let controllers = machine
            .metadata
            .owner_references
            .iter()
            .filter(|o| o.controller)
            .count();
        assert_eq!(controllers, 1);
    }
}

#[test_log::test(tokio::test)]
async fn relabelled_machine_is_released_and_replaced() {
    let h = Harness::new();
    h.create(machineset("workers", 1, "bar", "bar"));
    h.converge("workers", 1).await;

    let mut machine = h.owned("workers").remove(0);
    machine.metadata.labels.insert("foo".to_owned(), "other".to_owned());
    h.store.update_machine(&machine).await.unwrap();

    h.reconcile("workers").await.unwrap();

    let released = h.store.machine(NAMESPACE, &machine.metadata.name).unwrap();
    assert!(released.metadata.controller_ref().is_none());
    assert_eq!(h.recorder.count(reasons::SUCCESSFUL_RELEASE), 1);
    let owned = h.owned("workers");
    assert_eq!(owned.len(), 1);
    assert_ne!(owned[0].metadata.name, machine.metadata.name);
}

#[test_log::test(tokio::test)]
async fn partial_create_failure_is_retried() {
    let h = Harness::new();
    h.create(machineset("workers", 3, "bar", "bar"));
    h.store.fail_next(
        Operation::CreateMachine,
        StoreError::Transient("connection reset".to_owned()),
    );

    let err = h.reconcile("workers").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.owned("workers").len(), 2);
    assert_eq!(h.recorder.count(reasons::FAILED_CREATE), 1);
    let ms = h.get("workers");
    assert_eq!(ms.status.replicas, 2);
    let failure = h.condition("workers", REPLICA_FAILURE_CONDITION).unwrap();
    assert_eq!(failure.reason.as_deref(), Some(reasons::FAILED_CREATE));
    assert_eq!(failure.severity, Some(ConditionSeverity::Warning));

    h.reconcile("workers").await.unwrap();
    assert_eq!(h.owned("workers").len(), 3);
    assert!(h.condition("workers", REPLICA_FAILURE_CONDITION).is_none());
}

#[test_log::test(tokio::test)]
async fn status_conflict_is_retryable() {
    let h = Harness::new();
    h.create(machineset("workers", 1, "bar", "bar"));
    h.store.fail_next(
        Operation::UpdateMachineSetStatus,
        StoreError::Conflict("the object has been modified".to_owned()),
    );

    let err = h.reconcile("workers").await.unwrap_err();
    assert!(err.is_conflict());
    assert!(err.is_retryable());
    // Machine writes precede the status write and are not undone.
    assert_eq!(h.owned("workers").len(), 1);

    h.reconcile("workers").await.unwrap();
    assert_eq!(h.owned("workers").len(), 1);
    assert_eq!(h.get("workers").status.replicas, 1);
}

#[test_log::test(tokio::test)]
async fn unsynced_cache_is_retried() {
    let h = Harness::new();
    h.create(machineset("workers", 1, "bar", "bar"));
    let err = h.reconciler.reconcile(&key("workers")).await.unwrap_err();
    assert!(matches!(err, Error::CacheNotSynced));
    assert!(err.is_retryable());
    assert!(h.store.mutations().is_empty());
}

#[test_log::test(tokio::test)]
async fn stale_cache_does_not_repeat_creates() {
    let h = Harness::new();
    h.create(machineset("workers", 2, "bar", "bar"));
    h.reconcile("workers").await.unwrap();
    assert_eq!(h.recorder.count(reasons::SUCCESSFUL_CREATE), 2);

    // The cache has not seen the new machines yet.
    let outcome = h.reconciler.reconcile(&key("workers")).await.unwrap();
    assert_eq!(outcome, Outcome::Pending);
    assert_eq!(h.store.machines(NAMESPACE).len(), 2);

    let outcome = h.reconcile("workers").await.unwrap();
    assert_eq!(outcome, Outcome::Synced);
    assert_eq!(h.store.machines(NAMESPACE).len(), 2);
    assert_eq!(h.recorder.count(reasons::SUCCESSFUL_CREATE), 2);
}

#[test_log::test(tokio::test)]
async fn missing_machineset_is_a_no_op() {
    let h = Harness::new();
    let outcome = h.reconcile("gone").await.unwrap();
    assert_eq!(outcome, Outcome::NotFound);
    assert!(h.store.mutations().is_empty());
}

#[test_log::test(tokio::test)]
async fn deleting_machineset_is_left_to_garbage_collection() {
    let h = Harness::new();
    let mut ms = machineset("workers", 2, "bar", "bar");
    ms.metadata.finalizers.push("example.com/hold".to_owned());
    h.create(ms);
    h.converge("workers", 1).await;

    h.store.delete_machineset(NAMESPACE, "workers").unwrap();
    h.store.clear_mutations();
    let outcome = h.reconcile("workers").await.unwrap();
    assert_eq!(outcome, Outcome::Deleting);
    assert!(h.store.mutations().is_empty());
    assert_eq!(h.store.machines(NAMESPACE).len(), 2);
}

#[test_log::test(tokio::test)]
async fn deleting_machineset_garbage_collects_machines() {
    let h = Harness::new();
    h.create(machineset("workers", 2, "bar", "bar"));
    h.converge("workers", 1).await;
    h.store.delete_machineset(NAMESPACE, "workers").unwrap();
    assert!(h.store.machines(NAMESPACE).is_empty());
}

#[test_log::test(tokio::test)]
async fn ready_and_available_follow_nodes() {
    let h = Harness::new();
    let mut ms = machineset("workers", 2, "bar", "bar");
    ms.spec.min_ready_seconds = 300;
    h.create(ms);
    h.converge("workers", 1).await;

    let owned = h.owned("workers");
    for (machine, node_name) in owned.iter().zip(["node-a", "node-b"]) {
        h.store
            .set_machine_status(
                NAMESPACE,
                &machine.metadata.name,
                MachineStatus {
                    node_ref: Some(node_ref(node_name)),
                    ..Default::default()
                },
            )
            .unwrap();
    }
    h.store.put_node(node("node-a", true, ago(600)));
    h.store.put_node(node("node-b", true, ago(10)));

    h.reconcile("workers").await.unwrap();
    let status = h.get("workers").status;
    assert_eq!(status.replicas, 2);
    assert_eq!(status.ready_replicas, 2);
    assert_eq!(status.available_replicas, 1);

    h.store.put_node(node("node-a", false, ago(0)));
    h.reconcile("workers").await.unwrap();
    let status = h.get("workers").status;
    assert_eq!(status.ready_replicas, 1);
    assert_eq!(status.available_replicas, 0);
}

#[test_log::test(tokio::test)]
async fn observed_generation_tracks_spec_changes() {
    let h = Harness::new();
    h.create(machineset("workers", 1, "bar", "bar"));
    h.converge("workers", 1).await;
    assert_eq!(h.get("workers").status.observed_generation, 1);

    let mut ms = h.get("workers");
    ms.spec.replicas = Some(3);
    let updated = h.store.update_machineset(&ms).unwrap();
    assert_eq!(updated.metadata.generation, 2);

    h.reconcile("workers").await.unwrap();
    let ms = h.get("workers");
    assert_eq!(ms.status.observed_generation, 2);
    assert_eq!(ms.status.replicas, 3);
}

#[test_log::test(tokio::test)]
async fn events_name_the_machineset() {
    let h = Harness::new();
    h.create(machineset("workers", 1, "bar", "bar"));
    h.converge("workers", 1).await;
    let events = h.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].object, key("workers"));
    assert_eq!(events[0].type_, EventType::Normal);
}

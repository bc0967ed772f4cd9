//! The machineset reconciler.
//!
//! Each call re-derives the full picture from the informer cache: fetch, gate, validate,
//! partition, release and adopt, plan and execute, then write status. All writes go to the
//! store. Errors from the individual steps are aggregated, status is still written, and the
//! aggregate is returned to requeue the key.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use derivative::Derivative;
use futures::{stream, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::cache::{Cache, Snapshot};
use crate::controller::expectations::Expectations;
use crate::controller::ownership::{adopt, partition, release};
use crate::controller::planner::{plan, PlanAction};
use crate::controller::selector::{validate_template, Selector};
use crate::controller::status::{
    calculate_status, get_condition, new_condition, remove_condition, set_condition,
    update_machineset_status, INVALID_CONFIGURATION_REASON, PAUSED_CONDITION,
    REPLICA_FAILURE_CONDITION,
};
use crate::controller::util::get_machine_from_template;
use crate::error::Error;
use crate::events::{actions, reasons, EventRecorder, EventType};
use crate::resources::{
    AuthoritativeApi, ConditionSeverity, ConditionStatus, Machine, MachineSet, MachineSetStatus,
    Node, ObjectKey,
};
use crate::store::{ObjectStore, StoreError};
use crate::utils::now;

pub const PAUSED_REASON: &str = "AuthoritativeAPINotMachineAPI";
pub const NOT_PAUSED_REASON: &str = "AuthoritativeAPIMachineAPI";

/// How a successful reconcile ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The machineset no longer exists.
    NotFound,
    /// The machineset is being deleted, dependents are left to garbage collection.
    Deleting,
    /// Another API is authoritative.
    Paused(AuthoritativeApi),
    /// Earlier machine writes have not reached the cache yet, the watch will requeue the key.
    Pending,
    Synced,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    Paused(AuthoritativeApi),
    Deleting,
}

/// The authoritative API in status, initialised from the spec when unset.
pub fn authoritative_api(machineset: &MachineSet) -> AuthoritativeApi {
    machineset
        .status
        .authoritative_api
        .or(machineset.spec.authoritative_api)
        .unwrap_or_default()
}

pub fn gate(machineset: &MachineSet) -> Gate {
    if machineset.metadata.is_deleting() {
        return Gate::Deleting;
    }
    match authoritative_api(machineset) {
        AuthoritativeApi::MachineAPI => Gate::Proceed,
        api => Gate::Paused(api),
    }
}

fn paused_message(api: AuthoritativeApi) -> String {
    format!("The AuthoritativeAPI status is set to '{api}'")
}

/// Failures of this pass that surface as a ReplicaFailure condition.
#[derive(Debug, Default)]
struct Failure {
    config: Option<String>,
    replicas: Option<(&'static str, String)>,
}

impl Failure {
    /// Keep the first replica failure of the pass.
    fn replica(&mut self, reason: &'static str, message: String) {
        self.replicas.get_or_insert((reason, message));
    }
}

#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct MachineSetReconciler {
    #[derivative(Debug = "ignore")]
    store: Arc<dyn ObjectStore>,
    #[derivative(Debug = "ignore")]
    cache: Arc<Cache>,
    #[derivative(Debug = "ignore")]
    recorder: Arc<dyn EventRecorder>,
    expectations: Arc<Expectations>,
    max_concurrent_ops: usize,
}

impl MachineSetReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: Arc<Cache>,
        recorder: Arc<dyn EventRecorder>,
        max_concurrent_ops: usize,
    ) -> Self {
        Self {
            store,
            cache,
            recorder,
            expectations: Arc::new(Expectations::default()),
            max_concurrent_ops: max_concurrent_ops.max(1),
        }
    }

    #[instrument(skip(self), fields(machineset = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, Error> {
        let snapshot = self.cache.snapshot();
        if !snapshot.is_synced() {
            return Err(Error::CacheNotSynced);
        }
        let Some(machineset) = snapshot.machinesets.get(key).map(|ms| ms.as_ref().clone()) else {
            debug!("MachineSet not found, assuming deleted");
            self.expectations.forget(key);
            return Ok(Outcome::NotFound);
        };

        let api = authoritative_api(&machineset);
        match gate(&machineset) {
            Gate::Deleting => {
                debug!("MachineSet is being deleted, nothing to do");
                return Ok(Outcome::Deleting);
            }
            Gate::Paused(api) => {
                info!(%api, "Reconciliation paused");
                self.write_paused_status(&machineset, api).await?;
                return Ok(Outcome::Paused(api));
            }
            Gate::Proceed => {}
        }

        if !self.expectations.satisfied(key, &snapshot) {
            return Ok(Outcome::Pending);
        }

        let machines = snapshot
            .machines
            .in_namespace(&key.namespace)
            .map(|m| m.as_ref().clone())
            .collect::<Vec<_>>();

        let mut failure = Failure::default();
        let selector = match validate_template(&machineset) {
            Ok(selector) => selector,
            Err(e) => {
                warn!(error = %e, "Invalid machineset configuration");
                self.recorder
                    .publish(
                        &machineset,
                        EventType::Warning,
                        reasons::INVALID_CONFIGURATION,
                        actions::RECONCILE,
                        e.to_string(),
                    )
                    .await;
                failure.config = Some(e.to_string());
                let owned = machines
                    .into_iter()
                    .filter(|m| {
                        m.metadata.is_controlled_by(&machineset.metadata)
                            && !m.metadata.is_deleting()
                    })
                    .collect::<Vec<_>>();
                let written = self
                    .write_status(&machineset, api, None, &snapshot, &owned, &failure)
                    .await;
                return Err(match written {
                    Ok(()) => e,
                    Err(status_err) => Error::Aggregate(vec![e, status_err]),
                });
            }
        };

        let mut errors = Vec::new();
        let partition = partition(&machineset, &selector, &machines);

        for machine in &partition.to_release {
            if let Err(e) = self.release(&machineset, machine).await {
                failure.replica(reasons::FAILED_RELEASE, e.to_string());
                errors.push(e);
            }
        }

        let mut live: Vec<Machine> = partition.owned.iter().map(|m| (*m).clone()).collect();
        let mut manage = true;
        if !partition.to_adopt.is_empty() {
            match self.can_adopt(&machineset).await {
                Ok(true) => {
                    for machine in &partition.to_adopt {
                        match self.adopt(&machineset, machine).await {
                            Ok(Some(adopted)) => live.push(adopted),
                            Ok(None) => {}
                            Err(e) => {
                                failure.replica(reasons::FAILED_ADOPT, e.to_string());
                                errors.push(e);
                            }
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to re-read machineset before adoption");
                    // Unadopted orphans may be ours, the live count is unknown.
                    manage = false;
                    failure.replica(reasons::FAILED_ADOPT, e.to_string());
                    errors.push(e);
                }
            }
        }

        let mut deleted = BTreeSet::new();
        let mut created = Vec::new();
        if manage {
            let live_refs = live.iter().collect::<Vec<_>>();
            let plan = plan(&machineset, &live_refs, now());
            match plan.action {
                PlanAction::None => {}
                PlanAction::Create { count } => {
                    let (ok, failed) = self.create_machines(&machineset, count).await;
                    self.expectations.expect_creations(
                        key,
                        ok.iter().map(|m| m.metadata.name.clone()),
                    );
                    created = ok;
                    if let Some(first) = failed.first() {
                        failure.replica(reasons::FAILED_CREATE, first.to_string());
                    }
                    errors.extend(failed);
                }
                PlanAction::Delete { victims, shortfall } => {
                    let (ok, failed) = self.delete_machines(&machineset, &victims).await;
                    self.expectations.expect_deletions(
                        key,
                        victims
                            .iter()
                            .filter(|m| ok.contains(&m.metadata.name))
                            .map(|m| m.metadata.uid.clone()),
                    );
                    deleted = ok;
                    if let Some(first) = failed.first() {
                        failure.replica(reasons::FAILED_DELETE, first.to_string());
                    }
                    errors.extend(failed);
                    if shortfall > 0 {
                        let e = Error::InsufficientDeleteCandidates {
                            wanted: plan.live - plan.desired,
                            available: victims.len(),
                        };
                        warn!(error = %e, "Not enough machines can be deleted");
                        self.recorder
                            .publish(
                                &machineset,
                                EventType::Warning,
                                reasons::INSUFFICIENT_DELETE_CANDIDATES,
                                actions::DELETE,
                                e.to_string(),
                            )
                            .await;
                        failure.replica(reasons::FAILED_DELETE, e.to_string());
                        errors.push(e);
                    }
                }
            }
        }

        let observed = live
            .into_iter()
            .filter(|m| !deleted.contains(&m.metadata.name))
            .chain(created)
            .collect::<Vec<_>>();
        if let Err(e) = self
            .write_status(
                &machineset,
                api,
                Some(&selector),
                &snapshot,
                &observed,
                &failure,
            )
            .await
        {
            errors.push(e);
        }

        match Error::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(Outcome::Synced),
        }
    }

    async fn release(&self, machineset: &MachineSet, machine: &Machine) -> Result<(), Error> {
        let name = &machine.metadata.name;
        match self.store.update_machine(&release(machine, machineset)).await {
            Ok(_) => {
                info!(machine = %name, "Released machine");
                self.recorder
                    .publish(
                        machineset,
                        EventType::Normal,
                        reasons::SUCCESSFUL_RELEASE,
                        actions::RELEASE,
                        format!("Released machine {name}"),
                    )
                    .await;
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(machine = %name, error = %e, "Failed to release machine");
                self.recorder
                    .publish(
                        machineset,
                        EventType::Warning,
                        reasons::FAILED_RELEASE,
                        actions::RELEASE,
                        format!("Failed to release machine {name}: {e}"),
                    )
                    .await;
                Err(e.into())
            }
        }
    }

    /// Re-read the machineset before adopting, an old copy may have been deleted or replaced.
    async fn can_adopt(&self, machineset: &MachineSet) -> Result<bool, Error> {
        let fresh = self
            .store
            .get_machineset(&machineset.metadata.namespace, &machineset.metadata.name)
            .await?;
        let ok = match fresh {
            Some(fresh) => {
                fresh.metadata.uid == machineset.metadata.uid && !fresh.metadata.is_deleting()
            }
            None => false,
        };
        if !ok {
            debug!("MachineSet changed since it was read, not adopting");
        }
        Ok(ok)
    }

    async fn adopt(
        &self,
        machineset: &MachineSet,
        machine: &Machine,
    ) -> Result<Option<Machine>, Error> {
        let name = &machine.metadata.name;
        match self.store.update_machine(&adopt(machine, machineset)).await {
            Ok(adopted) => {
                info!(machine = %name, "Adopted machine");
                self.recorder
                    .publish(
                        machineset,
                        EventType::Normal,
                        reasons::SUCCESSFUL_ADOPT,
                        actions::ADOPT,
                        format!("Adopted machine {name}"),
                    )
                    .await;
                Ok(Some(adopted))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => {
                warn!(machine = %name, error = %e, "Failed to adopt machine");
                self.recorder
                    .publish(
                        machineset,
                        EventType::Warning,
                        reasons::FAILED_ADOPT,
                        actions::ADOPT,
                        format!("Failed to adopt machine {name}: {e}"),
                    )
                    .await;
                Err(e.into())
            }
        }
    }

    async fn create_machines(
        &self,
        machineset: &MachineSet,
        count: usize,
    ) -> (Vec<Machine>, Vec<Error>) {
        info!(count, "Creating machines");
        let results = stream::iter(0..count)
            .map(|_| {
                let machine = get_machine_from_template(machineset);
                async move { self.store.create_machine(&machine).await }
            })
            .buffer_unordered(self.max_concurrent_ops)
            .collect::<Vec<_>>()
            .await;

        let mut created = Vec::new();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(machine) => {
                    let name = &machine.metadata.name;
                    info!(machine = %name, "Created machine");
                    self.recorder
                        .publish(
                            machineset,
                            EventType::Normal,
                            reasons::SUCCESSFUL_CREATE,
                            actions::CREATE,
                            format!("Created machine {name}"),
                        )
                        .await;
                    created.push(machine);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to create machine");
                    self.recorder
                        .publish(
                            machineset,
                            EventType::Warning,
                            reasons::FAILED_CREATE,
                            actions::CREATE,
                            format!("Failed to create machine: {e}"),
                        )
                        .await;
                    errors.push(e.into());
                }
            }
        }
        (created, errors)
    }

    async fn delete_machines(
        &self,
        machineset: &MachineSet,
        victims: &[&Machine],
    ) -> (BTreeSet<String>, Vec<Error>) {
        info!(
            count = victims.len(),
            victims = ?victims.iter().map(|m| m.metadata.name.as_str()).collect::<Vec<_>>(),
            "Deleting machines"
        );
        let results = stream::iter(victims.iter().copied())
            .map(|machine| async move {
                let result = match self.store.delete_machine(machine).await {
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                };
                (machine.metadata.name.clone(), result)
            })
            .buffered(self.max_concurrent_ops)
            .boxed()
            .collect::<Vec<_>>()
            .await;

        let mut deleted = BTreeSet::new();
        let mut errors = Vec::new();
        for (name, result) in results {
            match result {
                Ok(()) => {
                    info!(machine = %name, "Deleted machine");
                    self.recorder
                        .publish(
                            machineset,
                            EventType::Normal,
                            reasons::SUCCESSFUL_DELETE,
                            actions::DELETE,
                            format!("Deleted machine {name}"),
                        )
                        .await;
                    deleted.insert(name);
                }
                Err(e) => {
                    warn!(machine = %name, error = %e, "Failed to delete machine");
                    self.recorder
                        .publish(
                            machineset,
                            EventType::Warning,
                            reasons::FAILED_DELETE,
                            actions::DELETE,
                            format!("Failed to delete machine {name}: {e}"),
                        )
                        .await;
                    errors.push(e.into());
                }
            }
        }
        (deleted, errors)
    }

    /// Recompute and write status. The recorded selector only moves with a valid `selector`.
    async fn write_status(
        &self,
        machineset: &MachineSet,
        api: AuthoritativeApi,
        selector: Option<&Selector>,
        snapshot: &Snapshot,
        machines: &[Machine],
        failure: &Failure,
    ) -> Result<(), Error> {
        let now = now();
        let refs = machines.iter().collect::<Vec<_>>();
        let mut status = calculate_status(machineset, &refs, &nodes_for(snapshot, machines), now);
        if let Some(selector) = selector {
            status.label_selector = Some(selector.to_query());
        }
        status.authoritative_api = Some(api);
        set_condition(
            &mut status,
            new_condition(
                PAUSED_CONDITION,
                ConditionStatus::False,
                None,
                NOT_PAUSED_REASON,
                paused_message(api),
                now,
            ),
        );

        match &failure.config {
            Some(message) => {
                status.error_reason = Some(INVALID_CONFIGURATION_REASON.to_owned());
                status.error_message = Some(message.clone());
                set_condition(
                    &mut status,
                    new_condition(
                        REPLICA_FAILURE_CONDITION,
                        ConditionStatus::True,
                        Some(ConditionSeverity::Error),
                        INVALID_CONFIGURATION_REASON,
                        message.clone(),
                        now,
                    ),
                );
            }
            None => {
                status.error_reason = None;
                status.error_message = None;
                match &failure.replicas {
                    Some((reason, message)) => set_condition(
                        &mut status,
                        new_condition(
                            REPLICA_FAILURE_CONDITION,
                            ConditionStatus::True,
                            Some(ConditionSeverity::Warning),
                            *reason,
                            message.clone(),
                            now,
                        ),
                    ),
                    None => remove_condition(&mut status, REPLICA_FAILURE_CONDITION),
                }
            }
        }

        self.store_status(machineset, status).await
    }

    async fn write_paused_status(
        &self,
        machineset: &MachineSet,
        api: AuthoritativeApi,
    ) -> Result<(), Error> {
        let was_paused = get_condition(&machineset.status, PAUSED_CONDITION)
            .map_or(false, |c| c.status == ConditionStatus::True);
        let mut status = machineset.status.clone();
        status.authoritative_api = Some(api);
        set_condition(
            &mut status,
            new_condition(
                PAUSED_CONDITION,
                ConditionStatus::True,
                None,
                PAUSED_REASON,
                paused_message(api),
                now(),
            ),
        );
        if status == machineset.status {
            return Ok(());
        }
        let mut updated = machineset.clone();
        updated.status = status;
        self.store.update_machineset_status(&updated).await?;
        if !was_paused {
            self.recorder
                .publish(
                    machineset,
                    EventType::Normal,
                    reasons::PAUSED,
                    actions::RECONCILE,
                    paused_message(api),
                )
                .await;
        }
        Ok(())
    }

    async fn store_status(
        &self,
        machineset: &MachineSet,
        status: MachineSetStatus,
    ) -> Result<(), Error> {
        let Some(updated) = update_machineset_status(machineset, status) else {
            debug!("Status up to date");
            return Ok(());
        };
        match self.store.update_machineset_status(&updated).await {
            Ok(_) => {
                debug!(
                    replicas = updated.status.replicas,
                    ready = updated.status.ready_replicas,
                    available = updated.status.available_replicas,
                    observed_generation = updated.status.observed_generation,
                    "Updated status"
                );
                Ok(())
            }
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The nodes backing `machines`, keyed by name.
fn nodes_for(snapshot: &Snapshot, machines: &[Machine]) -> BTreeMap<String, Node> {
    machines
        .iter()
        .filter_map(|m| m.node_name())
        .filter_map(|name| snapshot.nodes.get(&ObjectKey::new("", name)))
        .map(|node| (node.metadata.name.clone(), node.as_ref().clone()))
        .collect()
}

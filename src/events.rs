//! Kubernetes events emitted on machinesets.
//!
//! Publishing is fire and forget: a failure is logged and never fails the reconcile.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use derivative::Derivative;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event as KubeEvent, EventType as KubeEventType, Recorder, Reporter};
use kube::Client;
use tracing::{debug, warn};

use crate::resources::{MachineSet, ObjectKey};

pub mod reasons {
    pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
    pub const FAILED_CREATE: &str = "FailedCreate";
    pub const SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
    pub const FAILED_DELETE: &str = "FailedDelete";
    pub const SUCCESSFUL_ADOPT: &str = "SuccessfulAdopt";
    pub const FAILED_ADOPT: &str = "FailedAdopt";
    pub const SUCCESSFUL_RELEASE: &str = "SuccessfulRelease";
    pub const FAILED_RELEASE: &str = "FailedRelease";
    pub const INVALID_CONFIGURATION: &str = "InvalidConfiguration";
    pub const INSUFFICIENT_DELETE_CANDIDATES: &str = "InsufficientDeleteCandidates";
    pub const PAUSED: &str = "Paused";
}

pub mod actions {
    pub const CREATE: &str = "Create";
    pub const DELETE: &str = "Delete";
    pub const ADOPT: &str = "Adopt";
    pub const RELEASE: &str = "Release";
    pub const RECONCILE: &str = "Reconcile";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub object: ObjectKey,
    pub type_: EventType,
    pub reason: String,
    pub action: String,
    pub note: String,
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        machineset: &MachineSet,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    );
}

/// Publishes events to the api server.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct KubeEventRecorder {
    #[derivative(Debug = "ignore")]
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller: &str, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_owned(),
                instance,
            },
        }
    }
}

fn object_reference(machineset: &MachineSet) -> ObjectReference {
    ObjectReference {
        api_version: Some(MachineSet::GVK.api_version()),
        kind: Some(MachineSet::GVK.kind.to_owned()),
        name: Some(machineset.metadata.name.clone()),
        namespace: Some(machineset.metadata.namespace.clone()),
        uid: Some(machineset.metadata.uid.clone()),
        resource_version: Some(machineset.metadata.resource_version.clone()),
        ..Default::default()
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        machineset: &MachineSet,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            object_reference(machineset),
        );
        let event = KubeEvent {
            type_: match type_ {
                EventType::Normal => KubeEventType::Normal,
                EventType::Warning => KubeEventType::Warning,
            },
            reason: reason.to_owned(),
            note: Some(note),
            action: action.to_owned(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(
                machineset = %ObjectKey::of(machineset),
                reason,
                action,
                error = %e,
                "Failed to publish event"
            );
        }
    }
}

/// Keeps published events in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.reason == reason)
            .count()
    }

    pub fn warnings(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.type_ == EventType::Warning)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn publish(
        &self,
        machineset: &MachineSet,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        debug!(machineset = %ObjectKey::of(machineset), ?type_, reason, %note, "Recorded event");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Event {
                object: ObjectKey::of(machineset),
                type_,
                reason: reason.to_owned(),
                action: action.to_owned(),
                note,
            });
    }
}

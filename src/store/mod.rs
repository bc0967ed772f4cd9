//! The object store the controller reads from and writes to.
//!
//! Every call is an I/O suspension point that may fail transiently or with an optimistic
//! concurrency conflict. Writes carry the resource version of the object they were derived
//! from.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::resources::{Machine, MachineSet, Node};

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("request timed out")]
    Timeout,

    #[error("transient error: {0}")]
    Transient(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Invalid(_) | StoreError::Serialization(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// The watch was (re)established, the list is the complete current state.
    Restarted(Vec<T>),
}

pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>, StoreError>>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_machineset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MachineSet>, StoreError>;

    /// Write only the status of the machineset, guarded by its resource version.
    async fn update_machineset_status(
        &self,
        machineset: &MachineSet,
    ) -> Result<MachineSet, StoreError>;

    async fn create_machine(&self, machine: &Machine) -> Result<Machine, StoreError>;

    /// Write the metadata of a machine, guarded by its resource version.
    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError>;

    /// Request deletion of the machine, preconditioned on its uid.
    async fn delete_machine(&self, machine: &Machine) -> Result<(), StoreError>;

    fn watch_machinesets(&self, namespace: Option<&str>) -> WatchStream<MachineSet>;

    fn watch_machines(&self, namespace: Option<&str>) -> WatchStream<Machine>;

    fn watch_nodes(&self) -> WatchStream<Node>;
}

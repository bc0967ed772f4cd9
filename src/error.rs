//! Error types for the MachineSet controller.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    /// An object store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The selector itself cannot be evaluated.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    /// The template labels are not matched by the selector, created machines would be orphans.
    #[error("selector {selector:?} does not match template labels")]
    SelectorMismatch { selector: String },

    /// The selector differs from the one machines were last reconciled against.
    #[error("selector is immutable: changed from {recorded:?} to {current:?}")]
    SelectorChanged { recorded: String, current: String },

    /// The informer cache has not delivered its initial listing yet.
    #[error("informer cache not synced")]
    CacheNotSynced,

    /// Scale down could not find enough unprotected machines to delete.
    #[error("wanted to delete {wanted} machines but only {available} are eligible")]
    InsufficientDeleteCandidates { wanted: usize, available: usize },

    /// A reconcile panicked.
    #[error("reconcile panicked: {0}")]
    Panicked(String),

    #[error("{}", display_aggregate(.0))]
    Aggregate(Vec<Error>),
}

fn display_aggregate(errors: &[Error]) -> String {
    if errors.len() == 1 {
        return errors[0].to_string();
    }
    let joined = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]")
}

impl Error {
    /// Collapse a list of errors, `None` when there were none.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Aggregate(errors)),
        }
    }

    /// Whether requeueing the key could make progress. Invalid objects and configuration
    /// mistakes need an operator to fix the machineset first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(e) => e.is_retryable(),
            Error::InvalidSelector(_)
            | Error::SelectorMismatch { .. }
            | Error::SelectorChanged { .. } => false,
            Error::InsufficientDeleteCandidates { .. }
            | Error::CacheNotSynced
            | Error::Panicked(_) => true,
            Error::Aggregate(errors) => errors.iter().any(Error::is_retryable),
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Store(StoreError::Conflict(_)) => true,
            Error::Aggregate(errors) => errors.iter().any(Error::is_conflict),
            _ => false,
        }
    }

    /// Flatten nested aggregates.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Error> + '_> {
        match self {
            Error::Aggregate(errors) => Box::new(errors.iter().flat_map(|e| e.iter())),
            e => Box::new(std::iter::once(e)),
        }
    }
}

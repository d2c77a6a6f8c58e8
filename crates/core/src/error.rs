//! Error types for the sync engine

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure reported by an object store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Optimistic-concurrency check failed; the object changed since it was read.
    #[error("conflict on {0}: the object has been modified")]
    Conflict(String),

    /// The store rejected the object (name too long, bad field value, ...).
    #[error("invalid object {name}: {reason}")]
    Invalid { name: String, reason: String },

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// How the dispatch loop treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Requeue with backoff.
    Transient,
    /// Report and keep retrying with backoff.
    Persistent,
    /// Skip and report; a bug or tampering.
    Programming,
    /// Refuse outright.
    DataLoss,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Persistent => "persistent",
            ErrorClass::Programming => "programming",
            ErrorClass::DataLoss => "data_loss",
        }
    }

    fn severity(&self) -> u8 {
        match self {
            ErrorClass::Transient => 0,
            ErrorClass::Persistent => 1,
            ErrorClass::Programming => 2,
            ErrorClass::DataLoss => 3,
        }
    }
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Invalid { .. } => ErrorClass::Persistent,
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Main error type for sync engine operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Object cannot be represented on the target store.
    #[error("validation error: {0}")]
    Validation(String),

    /// A host object occupies the translated name without our marker.
    #[error("host object {physical} exists but is not managed by this virtual cluster")]
    Foreign { physical: String },

    #[error("mapper for {0} registered twice")]
    DuplicateMapper(String),

    #[error("syncer for {0} registered twice")]
    DuplicateSyncer(String),

    #[error("no mapper registered for {0}")]
    UnknownKind(String),

    #[error("ambiguous identity {identity}: claimed by host objects {claimants:?}")]
    AmbiguousIdentity { identity: String, claimants: Vec<String> },

    #[error("refusing to delete {physical}: not owned by this virtual cluster")]
    NotOwned { physical: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Both directions of a converge pass failed.
    #[error("forward: {forward}; backward: {backward}")]
    Converge { forward: Box<Error>, backward: Box<Error> },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Store(e) => e.class(),
            Error::Validation(_) | Error::Foreign { .. } | Error::Serialization(_) => ErrorClass::Persistent,
            Error::DuplicateMapper(_)
            | Error::DuplicateSyncer(_)
            | Error::UnknownKind(_)
            | Error::AmbiguousIdentity { .. }
            | Error::Config(_) => ErrorClass::Programming,
            Error::NotOwned { .. } => ErrorClass::DataLoss,
            Error::Converge { forward, backward } => {
                let (f, b) = (forward.class(), backward.class());
                if f.severity() >= b.severity() { f } else { b }
            }
        }
    }

    /// Conflicts mean the snapshot is stale and the pass must be redone from a fresh read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Store(StoreError::Conflict(_)))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

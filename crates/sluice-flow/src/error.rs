//! Error types for the orchestration domain.

use sluice_core::Did;

/// The result type used throughout sluice-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid action state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A DeltaFile was not found.
    #[error("DeltaFile not found: {did}")]
    DeltaFileNotFound {
        /// The DeltaFile ID that was not found.
        did: Did,
    },

    /// A named action was not found on a DeltaFile.
    #[error("action not found: {name} on {did}")]
    ActionNotFound {
        /// The action name that was looked up.
        name: String,
        /// The DeltaFile the lookup ran against.
        did: Did,
    },

    /// A DeltaFile save hit a concurrent modification.
    ///
    /// The caller's read is stale: re-read, re-apply, and save again.
    #[error("version conflict on {did}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The DeltaFile that was concurrently modified.
        did: Did,
        /// The version the caller read.
        expected: u64,
        /// The version found in the store.
        actual: u64,
    },

    /// A join entry upsert collided with an entry another writer holds locked.
    ///
    /// Resolved by poll-retry; surfaced only when the retry budget is spent.
    #[error("join entry locked: {id}")]
    JoinLockConflict {
        /// The contested join entry id.
        id: String,
    },

    /// A join lock could not be acquired within the configured timeout.
    #[error("timed out acquiring join entry {id} after {waited_ms}ms")]
    JoinLockTimeout {
        /// The contested join entry id.
        id: String,
        /// How long the caller polled before giving up.
        waited_ms: u64,
    },

    /// Splitter parameters cannot produce a valid chunk.
    #[error("split configuration error: {message}")]
    SplitConfiguration {
        /// Description of the configuration problem.
        message: String,
    },

    /// The queue backend is unreachable.
    #[error("queue unavailable: {message}")]
    QueueUnavailable {
        /// Description of the backend failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid configuration was provided.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from sluice-core.
    #[error("core error: {0}")]
    Core(#[from] sluice_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true if the error is transient and the operation should be
    /// retried with backoff.
    ///
    /// Transient errors never surface to operators as terminal failures
    /// unless the caller's retry budget is exhausted.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. }
                | Self::JoinLockConflict { .. }
                | Self::QueueUnavailable { .. }
                | Self::Storage { .. }
        )
    }
}

//! Error types for the sync engine.

use docsync_protocol::{CodecError, DocumentId, Namespace};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the data synchronizer.
///
/// Only [`SyncError::Configuration`], [`SyncError::LocalWrite`] and
/// [`SyncError::LocalStore`] are returned to callers. The remaining variants
/// describe per-document failures inside a sync pass and are delivered to the
/// namespace's error listener.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The synchronizer was used without the required configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A local write was rejected; nothing was marked pending.
    #[error("local write failed: {0}")]
    LocalWrite(LocalStoreError),

    /// A local read or durable configuration access failed.
    #[error("local store error: {0}")]
    LocalStore(#[from] LocalStoreError),

    /// The remote could not be reached; the work is retried by a later pass.
    #[error("remote temporarily unavailable: {0}")]
    RemoteTransient(String),

    /// A conflict handler failed or returned an unusable resolution.
    #[error("conflict resolution failed for {document_id} in {namespace}: {message}")]
    ConflictResolution {
        /// Namespace of the document.
        namespace: Namespace,
        /// Document that could not be resolved.
        document_id: DocumentId,
        /// Error message.
        message: String,
    },

    /// A document cannot be synchronized until it is unfrozen.
    #[error("unrecoverable sync error for {document_id} in {namespace}: {message}")]
    Unrecoverable {
        /// Namespace of the document.
        namespace: Namespace,
        /// Document that was frozen.
        document_id: DocumentId,
        /// Error message.
        message: String,
    },

    /// Document conversion failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl SyncError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns true if a later pass may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RemoteTransient(_) => true,
            SyncError::LocalWrite(e) | SyncError::LocalStore(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors reported by a [`LocalStore`](crate::LocalStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocalStoreError {
    /// The store cannot serve requests right now.
    #[error("local store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the operation.
    #[error("local store rejected operation: {0}")]
    Rejected(String),

    /// A stored record could not be encoded or decoded.
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

impl LocalStoreError {
    /// Returns true if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LocalStoreError::Unavailable(_))
    }
}

/// Errors reported by a [`RemoteService`](crate::RemoteService).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or service hiccup; the operation can be retried.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The remote state does not match the expected version.
    #[error("remote version conflict")]
    Conflict,

    /// The remote refused the operation permanently.
    #[error("remote rejected operation: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Result type for local store operations.
pub type LocalStoreResult<T> = Result<T, LocalStoreError>;

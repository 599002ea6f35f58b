//! Per-document synchronization state.

use crate::error::SyncResult;
use crate::synchronizer::Inner;
use docsync_protocol::{DocumentId, Namespace, VersionMarker};
use serde::{Deserialize, Serialize};
use std::sync::Weak;

/// A local write awaiting acknowledgement by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingWrite {
    /// The document must be created remotely.
    Insert,
    /// The remote document must be replaced with the local one.
    Update,
    /// The remote document must be deleted.
    Delete,
}

/// Synchronization state of one document.
///
/// A document is fully synchronized when it has no pending write and is not
/// frozen. At most one pending write exists at a time; further local writes
/// are coalesced into it (see [`DocumentSynchronizationConfig::pending_write`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSynchronizationConfig {
    namespace: Namespace,
    document_id: DocumentId,
    version: Option<VersionMarker>,
    remote_sequence: u64,
    pending: Option<PendingWrite>,
    frozen: bool,
    last_error: Option<String>,
}

impl DocumentSynchronizationConfig {
    pub(crate) fn new(namespace: Namespace, document_id: DocumentId) -> Self {
        Self {
            namespace,
            document_id,
            version: None,
            remote_sequence: 0,
            pending: None,
            frozen: false,
            last_error: None,
        }
    }

    /// Namespace of the document.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Identifier of the document.
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Last version marker known to match the remote, if any.
    pub fn version(&self) -> Option<VersionMarker> {
        self.version
    }

    /// Remote sequence of the newest remote state applied to this document.
    pub fn remote_sequence(&self) -> u64 {
        self.remote_sequence
    }

    /// The outstanding local write, if any.
    pub fn pending_write(&self) -> Option<PendingWrite> {
        self.pending
    }

    /// Whether synchronization of this document is suspended.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Message of the error that froze the document.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Returns true if nothing is pending and the document is not frozen.
    pub fn is_synchronized(&self) -> bool {
        self.pending.is_none() && !self.frozen
    }

    /// Coalesces a new local write into the pending write.
    ///
    /// Returns `false` when the document no longer needs tracking: it was
    /// inserted and deleted locally without the remote ever seeing it.
    pub(crate) fn record_local_write(&mut self, write: PendingWrite) -> bool {
        use PendingWrite::{Delete, Insert, Update};

        let next = match (self.pending, write) {
            (None, Insert) if self.version.is_some() => Update,
            (None, write) => write,
            (Some(Insert), Delete) if self.version.is_none() => {
                self.pending = None;
                return false;
            }
            (Some(Insert), Delete) => Delete,
            (Some(Insert), _) => Insert,
            (Some(Update), Delete) => Delete,
            (Some(Update), _) => Update,
            (Some(Delete), Delete) => Delete,
            (Some(Delete), _) => Update,
        };
        self.pending = Some(next);
        true
    }

    /// Records that local and remote agree on `version` as of `sequence`.
    pub(crate) fn mark_synced(&mut self, version: Option<VersionMarker>, sequence: u64) {
        self.version = version;
        self.observe_sequence(sequence);
        self.pending = None;
    }

    /// Records the remote state without touching the pending write.
    pub(crate) fn set_remote_state(&mut self, version: Option<VersionMarker>, sequence: u64) {
        self.version = version;
        self.observe_sequence(sequence);
    }

    pub(crate) fn observe_sequence(&mut self, sequence: u64) {
        self.remote_sequence = self.remote_sequence.max(sequence);
    }

    pub(crate) fn set_pending(&mut self, pending: Option<PendingWrite>) {
        self.pending = pending;
    }

    pub(crate) fn freeze(&mut self, message: impl Into<String>) {
        self.frozen = true;
        self.last_error = Some(message.into());
    }

    pub(crate) fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
        if !frozen {
            self.last_error = None;
        }
    }

    pub(crate) fn set_last_error(&mut self, message: Option<String>) {
        self.last_error = message;
    }
}

/// Handle to the synchronization state of one document.
///
/// Reads observe the synchronizer's live in-memory state. [`set_frozen`]
/// edits the durable copy only; the change takes effect after
/// [`DataSynchronizer::reload_config`](crate::DataSynchronizer::reload_config).
///
/// [`set_frozen`]: DocumentConfigHandle::set_frozen
#[derive(Clone)]
pub struct DocumentConfigHandle {
    inner: Weak<Inner>,
    namespace: Namespace,
    document_id: DocumentId,
}

impl DocumentConfigHandle {
    pub(crate) fn new(inner: Weak<Inner>, namespace: Namespace, document_id: DocumentId) -> Self {
        Self {
            inner,
            namespace,
            document_id,
        }
    }

    /// Namespace of the document.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Identifier of the document.
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Snapshot of the live state; `None` once the document is no longer tracked.
    pub fn config(&self) -> Option<DocumentSynchronizationConfig> {
        self.inner
            .upgrade()?
            .document_config(&self.namespace, &self.document_id)
    }

    /// Whether synchronization of this document is suspended.
    pub fn is_frozen(&self) -> bool {
        self.config().is_some_and(|config| config.is_frozen())
    }

    /// The outstanding local write, if any.
    pub fn pending_write(&self) -> Option<PendingWrite> {
        self.config().and_then(|config| config.pending_write())
    }

    /// Freezes or unfreezes the document in durable storage.
    ///
    /// Unfreezing also clears the stored error.
    pub fn set_frozen(&self, frozen: bool) -> SyncResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.set_document_frozen(&self.namespace, &self.document_id, frozen),
            None => Err(crate::SyncError::configuration(
                "synchronizer has been dropped",
            )),
        }
    }
}

impl std::fmt::Debug for DocumentConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentConfigHandle")
            .field("namespace", &self.namespace)
            .field("document_id", &self.document_id)
            .finish()
    }
}

//! Per-namespace synchronization state.

use crate::adapters::Subscription;
use crate::doc_config::{DocumentConfigHandle, DocumentSynchronizationConfig};
use crate::error::SyncResult;
use crate::handlers::{ErrorListener, NamespaceHandlers};
use crate::synchronizer::Inner;
use docsync_protocol::{DocumentId, Namespace};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// State the synchronizer keeps for one namespace.
pub(crate) struct NamespaceSynchronizationConfig {
    pub(crate) namespace: Namespace,
    pub(crate) handlers: Option<Arc<dyn NamespaceHandlers>>,
    pub(crate) error_listener: Option<Arc<dyn ErrorListener>>,
    pub(crate) documents: HashMap<DocumentId, DocumentSynchronizationConfig>,
    pub(crate) subscription: Option<Box<dyn Subscription>>,
    pub(crate) listen: ListenState,
}

/// Bookkeeping for opening the change stream.
#[derive(Debug, Default)]
pub(crate) struct ListenState {
    /// Set by `configure`; the stream should be open from then on.
    pub(crate) requested: bool,
    /// Failed attempts since the last success.
    pub(crate) failed_attempts: u32,
    /// Earliest time of the next attempt.
    pub(crate) next_attempt: Option<Instant>,
}

impl NamespaceSynchronizationConfig {
    pub(crate) fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            handlers: None,
            error_listener: None,
            documents: HashMap::new(),
            subscription: None,
            listen: ListenState::default(),
        }
    }

    pub(crate) fn is_configured(&self) -> bool {
        self.handlers.is_some()
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.subscription.is_some()
    }

    /// Returns true if a failed subscription should be retried now.
    pub(crate) fn listen_due(&self, now: Instant) -> bool {
        self.listen.requested
            && self.subscription.is_none()
            && self.listen.next_attempt.is_none_or(|at| at <= now)
    }

    pub(crate) fn close_subscription(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.close();
        }
    }
}

/// Handle to the synchronization state of a namespace.
#[derive(Clone)]
pub struct NamespaceConfigHandle {
    inner: Weak<Inner>,
    namespace: Namespace,
}

impl NamespaceConfigHandle {
    pub(crate) fn new(inner: Weak<Inner>, namespace: Namespace) -> Self {
        Self { inner, namespace }
    }

    /// The namespace.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Whether a conflict handler is registered.
    pub fn is_configured(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.with_namespace(&self.namespace, |ns| ns.is_configured()))
    }

    /// Whether the change stream is open.
    pub fn is_listening(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.with_namespace(&self.namespace, |ns| ns.is_listening()))
    }

    /// Ids of all tracked documents, sorted.
    pub fn synchronized_document_ids(&self) -> Vec<DocumentId> {
        let Some(inner) = self.inner.upgrade() else {
            return Vec::new();
        };
        let mut ids = inner.with_namespace(&self.namespace, |ns| {
            ns.documents.keys().cloned().collect::<Vec<_>>()
        });
        ids.sort();
        ids
    }

    /// Handles to all tracked documents, sorted by id.
    pub fn synchronized_documents(&self) -> Vec<DocumentConfigHandle> {
        self.synchronized_document_ids()
            .into_iter()
            .map(|id| DocumentConfigHandle::new(self.inner.clone(), self.namespace.clone(), id))
            .collect()
    }

    /// Handle to a tracked document.
    pub fn document(&self, id: &DocumentId) -> Option<DocumentConfigHandle> {
        let inner = self.inner.upgrade()?;
        let tracked = inner.with_namespace(&self.namespace, |ns| ns.documents.contains_key(id));
        tracked.then(|| {
            DocumentConfigHandle::new(self.inner.clone(), self.namespace.clone(), id.clone())
        })
    }

    /// Starts tracking a document; its remote state is fetched by the next pass.
    pub fn add_synchronized_document(&self, id: &DocumentId) -> SyncResult<DocumentConfigHandle> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| crate::SyncError::configuration("synchronizer has been dropped"))?;
        inner.add_synchronized_document(&self.namespace, id)?;
        Ok(DocumentConfigHandle::new(
            self.inner.clone(),
            self.namespace.clone(),
            id.clone(),
        ))
    }
}

impl std::fmt::Debug for NamespaceConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceConfigHandle")
            .field("namespace", &self.namespace)
            .finish()
    }
}

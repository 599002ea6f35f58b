//! Buffering of remote change events between sync passes.

use docsync_protocol::{ChangeEvent, Document, DocumentId, Namespace};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::warn;

type Buffers = Mutex<HashMap<Namespace, VecDeque<ChangeEvent<Document>>>>;

/// Per-namespace FIFO buffers of remote change events.
///
/// The buffer mutex is the only state shared with the delivery path; it is
/// never held while the synchronizer's configuration lock is acquired.
#[derive(Default)]
pub(crate) struct ChangeStreamIngestion {
    buffers: Arc<Buffers>,
}

impl ChangeStreamIngestion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a sink delivering into this namespace's buffer.
    pub(crate) fn sink(&self, namespace: &Namespace) -> ChangeEventSink {
        ChangeEventSink {
            namespace: namespace.clone(),
            buffers: Arc::downgrade(&self.buffers),
        }
    }

    /// Removes up to `max` events from the front of a namespace's buffer.
    pub(crate) fn drain(&self, namespace: &Namespace, max: usize) -> Vec<ChangeEvent<Document>> {
        let mut buffers = self.buffers.lock();
        match buffers.get_mut(namespace) {
            Some(queue) => {
                let count = queue.len().min(max);
                queue.drain(..count).collect()
            }
            None => Vec::new(),
        }
    }

    /// Puts undrained events back at the front, preserving their order.
    pub(crate) fn requeue_front(&self, namespace: &Namespace, events: Vec<ChangeEvent<Document>>) {
        if events.is_empty() {
            return;
        }
        let mut buffers = self.buffers.lock();
        let queue = buffers.entry(namespace.clone()).or_default();
        for event in events.into_iter().rev() {
            queue.push_front(event);
        }
    }

    /// Drops buffered events for a document at or below `sequence`.
    pub(crate) fn discard_through(
        &self,
        namespace: &Namespace,
        document_id: &DocumentId,
        sequence: u64,
    ) -> usize {
        self.retain(namespace, |event| {
            &event.document_key != document_id || event.sequence > sequence
        })
    }

    /// Drops every buffered event for a document.
    pub(crate) fn discard_document(&self, namespace: &Namespace, document_id: &DocumentId) -> usize {
        self.retain(namespace, |event| &event.document_key != document_id)
    }

    /// Number of buffered events for a namespace.
    pub(crate) fn pending_len(&self, namespace: &Namespace) -> usize {
        self.buffers.lock().get(namespace).map_or(0, VecDeque::len)
    }

    fn retain(
        &self,
        namespace: &Namespace,
        keep: impl Fn(&ChangeEvent<Document>) -> bool,
    ) -> usize {
        let mut buffers = self.buffers.lock();
        let Some(queue) = buffers.get_mut(namespace) else {
            return 0;
        };
        let before = queue.len();
        queue.retain(|event| keep(event));
        before - queue.len()
    }
}

/// Delivery endpoint handed to [`RemoteService::subscribe`](crate::RemoteService::subscribe).
///
/// A sink is bound to one namespace. Delivery never blocks on a sync pass and
/// becomes a no-op once the synchronizer is dropped.
#[derive(Clone)]
pub struct ChangeEventSink {
    namespace: Namespace,
    buffers: Weak<Buffers>,
}

impl ChangeEventSink {
    /// Namespace this sink accepts events for.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Buffers a remote event. Returns `false` if the event was dropped.
    pub fn deliver(&self, event: ChangeEvent<Document>) -> bool {
        if event.namespace != self.namespace {
            warn!(
                namespace = %self.namespace,
                event_namespace = %event.namespace,
                document_id = %event.document_key,
                "dropping change event for foreign namespace"
            );
            return false;
        }
        let Some(buffers) = self.buffers.upgrade() else {
            return false;
        };
        buffers
            .lock()
            .entry(self.namespace.clone())
            .or_default()
            .push_back(event.without_uncommitted_writes());
        true
    }

    /// Returns true once the receiving synchronizer is gone.
    pub fn is_closed(&self) -> bool {
        self.buffers.strong_count() == 0
    }
}

impl std::fmt::Debug for ChangeEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEventSink")
            .field("namespace", &self.namespace)
            .field("closed", &self.is_closed())
            .finish()
    }
}

//! Application callbacks and their type-erased form.

use crate::error::SyncError;
use docsync_protocol::{
    ChangeEvent, ConflictPolicy, ConflictResolution, Document, DocumentCodec, DocumentId,
    DocumentPassthrough,
};
use std::sync::Arc;

/// Error type returned by application callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Decides the outcome when a document changed both locally and remotely.
///
/// Called synchronously inside a sync pass, at most once per conflict.
pub trait ConflictHandler<T>: Send + Sync {
    /// Resolves a conflict between a local and a remote change.
    fn resolve_conflict(
        &self,
        document_id: &DocumentId,
        local_event: &ChangeEvent<T>,
        remote_event: &ChangeEvent<T>,
    ) -> Result<ConflictResolution<T>, HandlerError>;
}

impl<T, F> ConflictHandler<T> for F
where
    F: Fn(&DocumentId, &ChangeEvent<T>, &ChangeEvent<T>) -> Result<ConflictResolution<T>, HandlerError>
        + Send
        + Sync,
{
    fn resolve_conflict(
        &self,
        document_id: &DocumentId,
        local_event: &ChangeEvent<T>,
        remote_event: &ChangeEvent<T>,
    ) -> Result<ConflictResolution<T>, HandlerError> {
        self(document_id, local_event, remote_event)
    }
}

impl<T> ConflictHandler<T> for ConflictPolicy {
    fn resolve_conflict(
        &self,
        _document_id: &DocumentId,
        _local_event: &ChangeEvent<T>,
        _remote_event: &ChangeEvent<T>,
    ) -> Result<ConflictResolution<T>, HandlerError> {
        Ok(self.resolution())
    }
}

/// Observes changes applied to synchronized documents.
pub trait ChangeEventListener<T>: Send + Sync {
    /// Called after a change was applied locally.
    fn on_event(&self, document_id: &DocumentId, event: &ChangeEvent<T>);
}

impl<T, F> ChangeEventListener<T> for F
where
    F: Fn(&DocumentId, &ChangeEvent<T>) + Send + Sync,
{
    fn on_event(&self, document_id: &DocumentId, event: &ChangeEvent<T>) {
        self(document_id, event)
    }
}

/// Observes per-document synchronization failures.
pub trait ErrorListener: Send + Sync {
    /// Called when synchronizing a document failed.
    fn on_error(&self, document_id: &DocumentId, error: &SyncError);
}

impl<F> ErrorListener for F
where
    F: Fn(&DocumentId, &SyncError) + Send + Sync,
{
    fn on_error(&self, document_id: &DocumentId, error: &SyncError) {
        self(document_id, error)
    }
}

/// Callbacks registered for a namespace with
/// [`DataSynchronizer::configure`](crate::DataSynchronizer::configure).
pub struct SyncHandlers<T> {
    codec: Arc<dyn DocumentCodec<T>>,
    conflict_handler: Option<Arc<dyn ConflictHandler<T>>>,
    change_event_listener: Option<Arc<dyn ChangeEventListener<T>>>,
    error_listener: Option<Arc<dyn ErrorListener>>,
}

impl SyncHandlers<Document> {
    /// Handlers working on raw documents.
    pub fn documents() -> Self {
        Self::new(DocumentPassthrough)
    }
}

impl<T: 'static> SyncHandlers<T> {
    /// Creates handlers that convert documents with `codec`.
    pub fn new(codec: impl DocumentCodec<T> + 'static) -> Self {
        Self {
            codec: Arc::new(codec),
            conflict_handler: None,
            change_event_listener: None,
            error_listener: None,
        }
    }

    /// Sets the conflict handler.
    pub fn with_conflict_handler(mut self, handler: impl ConflictHandler<T> + 'static) -> Self {
        self.conflict_handler = Some(Arc::new(handler));
        self
    }

    /// Sets the change event listener.
    pub fn with_change_event_listener(
        mut self,
        listener: impl ChangeEventListener<T> + 'static,
    ) -> Self {
        self.change_event_listener = Some(Arc::new(listener));
        self
    }

    /// Sets the error listener.
    pub fn with_error_listener(mut self, listener: impl ErrorListener + 'static) -> Self {
        self.error_listener = Some(Arc::new(listener));
        self
    }

    /// Splits into the erased namespace callbacks and the error listener.
    ///
    /// Returns `None` when no conflict handler was set.
    pub(crate) fn into_erased(
        self,
    ) -> Option<(Arc<dyn NamespaceHandlers>, Option<Arc<dyn ErrorListener>>)> {
        let conflict_handler = self.conflict_handler?;
        let handlers = TypedHandlers {
            codec: self.codec,
            conflict_handler,
            change_event_listener: self.change_event_listener,
        };
        Some((Arc::new(handlers), self.error_listener))
    }
}

impl<T> std::fmt::Debug for SyncHandlers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandlers")
            .field("conflict_handler", &self.conflict_handler.is_some())
            .field("change_event_listener", &self.change_event_listener.is_some())
            .field("error_listener", &self.error_listener.is_some())
            .finish()
    }
}

/// Namespace callbacks with the document type erased.
pub(crate) trait NamespaceHandlers: Send + Sync {
    /// Decodes both events, runs the conflict handler and encodes its answer.
    fn resolve(
        &self,
        document_id: &DocumentId,
        local_event: &ChangeEvent<Document>,
        remote_event: &ChangeEvent<Document>,
    ) -> Result<ConflictResolution<Document>, String>;

    /// Decodes the event and passes it to the change event listener, if any.
    fn notify(&self, event: &ChangeEvent<Document>) -> Result<(), String>;
}

struct TypedHandlers<T> {
    codec: Arc<dyn DocumentCodec<T>>,
    conflict_handler: Arc<dyn ConflictHandler<T>>,
    change_event_listener: Option<Arc<dyn ChangeEventListener<T>>>,
}

impl<T> TypedHandlers<T> {
    fn decode(&self, event: &ChangeEvent<Document>) -> Result<ChangeEvent<T>, String> {
        event
            .clone()
            .try_map_document(|document| self.codec.decode(&document))
            .map_err(|e| e.to_string())
    }
}

impl<T> NamespaceHandlers for TypedHandlers<T> {
    fn resolve(
        &self,
        document_id: &DocumentId,
        local_event: &ChangeEvent<Document>,
        remote_event: &ChangeEvent<Document>,
    ) -> Result<ConflictResolution<Document>, String> {
        let local = self.decode(local_event)?;
        let remote = self.decode(remote_event)?;
        let resolution = self
            .conflict_handler
            .resolve_conflict(document_id, &local, &remote)
            .map_err(|e| e.to_string())?;

        match resolution {
            ConflictResolution::KeepLocal => Ok(ConflictResolution::KeepLocal),
            ConflictResolution::AcceptRemote => Ok(ConflictResolution::AcceptRemote),
            ConflictResolution::Merge(None) => Ok(ConflictResolution::Merge(None)),
            ConflictResolution::Merge(Some(merged)) => self
                .codec
                .encode(&merged)
                .map(|document| ConflictResolution::Merge(Some(document)))
                .map_err(|e| e.to_string()),
        }
    }

    fn notify(&self, event: &ChangeEvent<Document>) -> Result<(), String> {
        let Some(listener) = &self.change_event_listener else {
            return Ok(());
        };
        let event = self.decode(event)?;
        listener.on_event(&event.document_key, &event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{Namespace, SerdeCodec};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        #[serde(rename = "_id")]
        id: String,
        value: i64,
    }

    fn counter_event(sequence: u64, value: i64) -> ChangeEvent<Document> {
        let id = DocumentId::new("c");
        let document = Document::with_id(&id).field("value", value);
        ChangeEvent::replace(sequence, Namespace::new("app", "counters"), id, document)
    }

    #[test]
    fn typed_merge_is_encoded() {
        let handlers = SyncHandlers::new(SerdeCodec::<Counter>::new()).with_conflict_handler(
            |_id: &DocumentId,
             local: &ChangeEvent<Counter>,
             remote: &ChangeEvent<Counter>|
             -> Result<ConflictResolution<Counter>, HandlerError> {
                let local = local.full_document.clone().ok_or("local deleted")?;
                let remote = remote.full_document.clone().ok_or("remote deleted")?;
                Ok(ConflictResolution::Merge(Some(Counter {
                    id: local.id,
                    value: local.value + remote.value,
                })))
            },
        );
        let (erased, _) = handlers.into_erased().unwrap();

        let resolution = erased
            .resolve(
                &"c".into(),
                &counter_event(0, 2),
                &counter_event(5, 3),
            )
            .unwrap();
        let ConflictResolution::Merge(Some(merged)) = resolution else {
            panic!("expected merge");
        };
        assert_eq!(merged.get("value"), Some(&docsync_protocol::Value::from(5)));
        assert_eq!(merged.id(), Some("c".into()));
    }

    #[test]
    fn handler_errors_become_messages() {
        let handlers = SyncHandlers::documents().with_conflict_handler(
            |_id: &DocumentId,
             _local: &ChangeEvent<Document>,
             _remote: &ChangeEvent<Document>|
             -> Result<ConflictResolution<Document>, HandlerError> {
                Err("cannot decide".into())
            },
        );
        let (erased, _) = handlers.into_erased().unwrap();
        let err = erased
            .resolve(&"c".into(), &counter_event(0, 1), &counter_event(1, 2))
            .unwrap_err();
        assert!(err.contains("cannot decide"));
    }

    #[test]
    fn missing_conflict_handler_is_not_erasable() {
        assert!(SyncHandlers::documents().into_erased().is_none());
    }

    #[test]
    fn notify_decodes_for_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handlers = SyncHandlers::new(SerdeCodec::<Counter>::new())
            .with_conflict_handler(ConflictPolicy::ServerWins)
            .with_change_event_listener(move |_id: &DocumentId, event: &ChangeEvent<Counter>| {
                sink.lock().push(event.full_document.clone());
            });
        let (erased, _) = handlers.into_erased().unwrap();

        erased.notify(&counter_event(3, 9)).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![Some(Counter {
                id: "c".into(),
                value: 9
            })]
        );

        let undecodable = ChangeEvent::replace(
            4,
            Namespace::new("app", "counters"),
            "c".into(),
            Document::with_id(&"c".into()),
        );
        assert!(erased.notify(&undecodable).is_err());
    }

    #[test]
    fn policies_resolve_without_inspecting_events() {
        let local = counter_event(0, 1);
        let remote = counter_event(1, 2);
        assert_eq!(
            ConflictPolicy::ClientWins
                .resolve_conflict(&"c".into(), &local, &remote)
                .unwrap(),
            ConflictResolution::KeepLocal
        );
    }
}

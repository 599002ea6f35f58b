//! Collaborator interfaces consumed by the synchronizer.
//!
//! The engine never talks to storage, the network or the platform directly.
//! Everything outside the synchronization algorithm is reached through the
//! traits in this module, bundled in [`Adapters`].

use crate::doc_config::DocumentSynchronizationConfig;
use crate::error::{LocalStoreResult, RemoteResult};
use crate::ingestion::ChangeEventSink;
use docsync_protocol::{Document, DocumentId, Namespace, Value, VersionMarker};
use std::sync::Arc;

/// Selects documents in a local read.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every document in the namespace.
    All,
    /// The document with the given id.
    Id(DocumentId),
    /// Documents whose id is in the list.
    Ids(Vec<DocumentId>),
    /// Documents whose field equals the value.
    Eq(String, Value),
}

impl Filter {
    /// Creates a field equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    /// Returns true if the document is selected by this filter.
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Id(id) => document.id().as_ref() == Some(id),
            Filter::Ids(ids) => document.id().is_some_and(|id| ids.contains(&id)),
            Filter::Eq(field, value) => document.get(field) == Some(value),
        }
    }
}

/// The local document store plus durable storage for synchronization state.
pub trait LocalStore: Send + Sync {
    /// Inserts or replaces a document. The document must carry an `_id`.
    fn write(&self, namespace: &Namespace, document: &Document) -> LocalStoreResult<DocumentId>;

    /// Returns all documents matching the filter.
    fn find(&self, namespace: &Namespace, filter: &Filter) -> LocalStoreResult<Vec<Document>>;

    /// Returns a single document.
    fn find_by_id(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> LocalStoreResult<Option<Document>>;

    /// Deletes a document, returning whether it existed.
    fn delete(&self, namespace: &Namespace, id: &DocumentId) -> LocalStoreResult<bool>;

    /// Lists namespaces with durable synchronization state.
    fn load_namespaces(&self) -> LocalStoreResult<Vec<Namespace>>;

    /// Records that a namespace has synchronization state.
    fn save_namespace(&self, namespace: &Namespace) -> LocalStoreResult<()>;

    /// Loads every document config of a namespace.
    fn load_document_configs(
        &self,
        namespace: &Namespace,
    ) -> LocalStoreResult<Vec<DocumentSynchronizationConfig>>;

    /// Loads a single document config.
    fn load_document_config(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> LocalStoreResult<Option<DocumentSynchronizationConfig>>;

    /// Stores a document config, replacing any previous record.
    fn save_document_config(&self, config: &DocumentSynchronizationConfig) -> LocalStoreResult<()>;

    /// Removes a document config.
    fn remove_document_config(&self, namespace: &Namespace, id: &DocumentId)
        -> LocalStoreResult<()>;
}

/// Acknowledgement of a remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteWriteAck {
    /// Sequence the remote assigned to the write.
    pub sequence: u64,
}

/// A point-in-time read of a remote document.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    /// The document, `None` if it does not exist remotely.
    pub document: Option<Document>,
    /// Latest remote sequence at the time of the read.
    pub sequence: u64,
}

/// The remote document service.
///
/// Conditional writes compare the remote document's current version marker
/// with `expected` and fail with [`RemoteError::Conflict`](crate::RemoteError)
/// on mismatch. Inserting an id that already exists remotely is a conflict too.
pub trait RemoteService: Send + Sync {
    /// Inserts a new document.
    fn insert_one(&self, namespace: &Namespace, document: &Document)
        -> RemoteResult<RemoteWriteAck>;

    /// Replaces a document if its remote version matches `expected`.
    fn update_one(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        document: &Document,
        expected: &VersionMarker,
    ) -> RemoteResult<RemoteWriteAck>;

    /// Deletes a document. With `expected`, only if the remote version matches.
    fn delete_one(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        expected: Option<&VersionMarker>,
    ) -> RemoteResult<RemoteWriteAck>;

    /// Reads a document.
    fn find_one(&self, namespace: &Namespace, id: &DocumentId) -> RemoteResult<RemoteSnapshot>;

    /// Opens a change stream for the namespace, delivering events to `sink`.
    fn subscribe(
        &self,
        namespace: &Namespace,
        sink: ChangeEventSink,
    ) -> RemoteResult<Box<dyn Subscription>>;
}

/// A live change-stream subscription.
pub trait Subscription: Send + Sync {
    /// Stops delivering events. Closing twice is a no-op.
    fn close(&self);
}

/// Identifies a registered network state listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkListenerId(pub u64);

/// Receives connectivity changes.
pub trait NetworkStateListener: Send + Sync {
    /// Called when connectivity changes.
    fn on_network_state_changed(&self, connected: bool);
}

/// Reports device connectivity.
pub trait NetworkMonitor: Send + Sync {
    /// Returns true if the remote is reachable.
    fn is_connected(&self) -> bool;

    /// Registers a listener for connectivity changes.
    fn add_state_listener(&self, listener: Arc<dyn NetworkStateListener>) -> NetworkListenerId;

    /// Unregisters a listener.
    fn remove_state_listener(&self, id: NetworkListenerId);
}

/// Reports whether a user session exists.
pub trait AuthMonitor: Send + Sync {
    /// Returns true if remote calls can be authenticated.
    fn is_logged_in(&self) -> bool;
}

/// The collaborators a synchronizer is built from.
#[derive(Clone)]
pub struct Adapters {
    /// Local document store and durable config storage.
    pub local: Arc<dyn LocalStore>,
    /// Remote document service.
    pub remote: Arc<dyn RemoteService>,
    /// Connectivity source.
    pub network: Arc<dyn NetworkMonitor>,
    /// Session source.
    pub auth: Arc<dyn AuthMonitor>,
}

impl Adapters {
    /// Bundles the collaborators.
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
        network: Arc<dyn NetworkMonitor>,
        auth: Arc<dyn AuthMonitor>,
    ) -> Self {
        Self {
            local,
            remote,
            network,
            auth,
        }
    }
}

impl std::fmt::Debug for Adapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapters").finish_non_exhaustive()
    }
}

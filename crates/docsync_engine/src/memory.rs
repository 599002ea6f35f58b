//! In-memory collaborators for tests and embedding.
//!
//! [`MemoryLocalStore`] keeps documents in maps and stores document configs
//! CBOR-encoded, so every save and load goes through the same serialization a
//! durable store would use. [`MockRemoteService`] is a sequenced document
//! service with a change stream, failure injection and call accounting.

use crate::adapters::{
    AuthMonitor, Filter, LocalStore, NetworkListenerId, NetworkMonitor, NetworkStateListener,
    RemoteService, RemoteSnapshot, RemoteWriteAck, Subscription,
};
use crate::doc_config::DocumentSynchronizationConfig;
use crate::error::{LocalStoreError, LocalStoreResult, RemoteError, RemoteResult};
use crate::ingestion::ChangeEventSink;
use docsync_protocol::{ChangeEvent, Document, DocumentId, Namespace, VersionMarker};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Default)]
struct LocalState {
    documents: HashMap<Namespace, BTreeMap<DocumentId, Document>>,
    namespaces: BTreeSet<Namespace>,
    configs: BTreeMap<(Namespace, DocumentId), Vec<u8>>,
}

/// A local store backed by in-memory maps.
#[derive(Default)]
pub struct MemoryLocalStore {
    state: RwLock<LocalState>,
    fail_writes: AtomicBool,
    write_latency_ms: AtomicU64,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes document writes and deletes fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delays every document write and delete by `latency`.
    pub fn set_write_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.write_latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of documents in a namespace.
    pub fn document_count(&self, namespace: &Namespace) -> usize {
        self.state
            .read()
            .documents
            .get(namespace)
            .map_or(0, BTreeMap::len)
    }

    /// Number of stored document configs.
    pub fn stored_config_count(&self) -> usize {
        self.state.read().configs.len()
    }

    fn check_writable(&self) -> LocalStoreResult<()> {
        let latency = self.write_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            std::thread::sleep(Duration::from_millis(latency));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(LocalStoreError::Unavailable("writes disabled".into()))
        } else {
            Ok(())
        }
    }

    fn decode_config(bytes: &[u8]) -> LocalStoreResult<DocumentSynchronizationConfig> {
        ciborium::de::from_reader(bytes).map_err(|e| LocalStoreError::Corrupt(e.to_string()))
    }
}

impl LocalStore for MemoryLocalStore {
    fn write(&self, namespace: &Namespace, document: &Document) -> LocalStoreResult<DocumentId> {
        self.check_writable()?;
        let id = document
            .id()
            .ok_or_else(|| LocalStoreError::Rejected("document has no `_id`".into()))?;
        self.state
            .write()
            .documents
            .entry(namespace.clone())
            .or_default()
            .insert(id.clone(), document.clone());
        Ok(id)
    }

    fn find(&self, namespace: &Namespace, filter: &Filter) -> LocalStoreResult<Vec<Document>> {
        let state = self.state.read();
        Ok(state
            .documents
            .get(namespace)
            .map(|documents| {
                documents
                    .values()
                    .filter(|document| filter.matches(document))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn find_by_id(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> LocalStoreResult<Option<Document>> {
        Ok(self
            .state
            .read()
            .documents
            .get(namespace)
            .and_then(|documents| documents.get(id))
            .cloned())
    }

    fn delete(&self, namespace: &Namespace, id: &DocumentId) -> LocalStoreResult<bool> {
        self.check_writable()?;
        Ok(self
            .state
            .write()
            .documents
            .get_mut(namespace)
            .is_some_and(|documents| documents.remove(id).is_some()))
    }

    fn load_namespaces(&self) -> LocalStoreResult<Vec<Namespace>> {
        Ok(self.state.read().namespaces.iter().cloned().collect())
    }

    fn save_namespace(&self, namespace: &Namespace) -> LocalStoreResult<()> {
        self.state.write().namespaces.insert(namespace.clone());
        Ok(())
    }

    fn load_document_configs(
        &self,
        namespace: &Namespace,
    ) -> LocalStoreResult<Vec<DocumentSynchronizationConfig>> {
        let state = self.state.read();
        state
            .configs
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, bytes)| Self::decode_config(bytes))
            .collect()
    }

    fn load_document_config(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> LocalStoreResult<Option<DocumentSynchronizationConfig>> {
        let state = self.state.read();
        state
            .configs
            .get(&(namespace.clone(), id.clone()))
            .map(|bytes| Self::decode_config(bytes))
            .transpose()
    }

    fn save_document_config(&self, config: &DocumentSynchronizationConfig) -> LocalStoreResult<()> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(config, &mut bytes)
            .map_err(|e| LocalStoreError::Corrupt(e.to_string()))?;

        let mut state = self.state.write();
        state.namespaces.insert(config.namespace().clone());
        state.configs.insert(
            (config.namespace().clone(), config.document_id().clone()),
            bytes,
        );
        Ok(())
    }

    fn remove_document_config(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> LocalStoreResult<()> {
        self.state
            .write()
            .configs
            .remove(&(namespace.clone(), id.clone()));
        Ok(())
    }
}

/// A call received by [`MockRemoteService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    /// `insert_one`.
    InsertOne {
        /// Target namespace.
        namespace: Namespace,
        /// Inserted document.
        id: DocumentId,
    },
    /// `update_one`.
    UpdateOne {
        /// Target namespace.
        namespace: Namespace,
        /// Updated document.
        id: DocumentId,
    },
    /// `delete_one`.
    DeleteOne {
        /// Target namespace.
        namespace: Namespace,
        /// Deleted document.
        id: DocumentId,
    },
    /// `find_one`.
    FindOne {
        /// Target namespace.
        namespace: Namespace,
        /// Requested document.
        id: DocumentId,
    },
    /// `subscribe`.
    Subscribe {
        /// Target namespace.
        namespace: Namespace,
    },
}

impl RemoteCall {
    /// Returns true for calls that modify remote documents.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RemoteCall::InsertOne { .. } | RemoteCall::UpdateOne { .. } | RemoteCall::DeleteOne { .. }
        )
    }

    /// Document the call targets, if any.
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            RemoteCall::InsertOne { id, .. }
            | RemoteCall::UpdateOne { id, .. }
            | RemoteCall::DeleteOne { id, .. }
            | RemoteCall::FindOne { id, .. } => Some(id),
            RemoteCall::Subscribe { .. } => None,
        }
    }
}

#[derive(Default)]
struct RemoteState {
    sequence: u64,
    collections: HashMap<Namespace, BTreeMap<DocumentId, Document>>,
    subscribers: HashMap<Namespace, Vec<(u64, ChangeEventSink)>>,
    next_subscription: u64,
    calls: Vec<RemoteCall>,
    write_failures: VecDeque<RemoteError>,
    subscribe_failures: VecDeque<RemoteError>,
}

impl RemoteState {
    fn current_marker(&self, namespace: &Namespace, id: &DocumentId) -> Option<VersionMarker> {
        self.collections
            .get(namespace)
            .and_then(|documents| documents.get(id))
            .and_then(|document| document.version_marker().ok())
    }

    /// Applies a write, assigns it the next sequence and fans it out.
    fn commit(
        &mut self,
        namespace: &Namespace,
        id: &DocumentId,
        document: Option<Document>,
    ) -> u64 {
        self.sequence += 1;
        let sequence = self.sequence;
        let documents = self.collections.entry(namespace.clone()).or_default();

        let event = match document {
            Some(document) => {
                let existed = documents.insert(id.clone(), document.clone()).is_some();
                if existed {
                    ChangeEvent::replace(sequence, namespace.clone(), id.clone(), document)
                } else {
                    ChangeEvent::insert(sequence, namespace.clone(), id.clone(), document)
                }
            }
            None => {
                documents.remove(id);
                ChangeEvent::delete(sequence, namespace.clone(), id.clone())
            }
        };

        if let Some(subscribers) = self.subscribers.get(namespace) {
            for (_, sink) in subscribers {
                sink.deliver(event.clone());
            }
        }
        sequence
    }
}

/// A sequenced in-memory remote document service.
///
/// Every write, including the engine's own, is echoed to all subscribers of
/// the namespace with the sequence assigned to it.
pub struct MockRemoteService {
    state: Arc<Mutex<RemoteState>>,
    connected: AtomicBool,
    latency_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockRemoteService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemoteService {
    /// Creates an empty, reachable service.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState::default())),
            connected: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sets whether calls reach the service.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Makes the next write call fail with `error`.
    pub fn fail_next_write(&self, error: RemoteError) {
        self.state.lock().write_failures.push_back(error);
    }

    /// Makes the next subscribe call fail with `error`.
    pub fn fail_next_subscribe(&self, error: RemoteError) {
        self.state.lock().subscribe_failures.push_back(error);
    }

    /// Writes a document as another client would.
    pub fn external_write(&self, namespace: &Namespace, document: Document) -> u64 {
        let Some(id) = document.id() else {
            return self.sequence();
        };
        self.state.lock().commit(namespace, &id, Some(document))
    }

    /// Deletes a document as another client would.
    pub fn external_delete(&self, namespace: &Namespace, id: &DocumentId) -> u64 {
        self.state.lock().commit(namespace, id, None)
    }

    /// Current remote document.
    pub fn document(&self, namespace: &Namespace, id: &DocumentId) -> Option<Document> {
        self.state
            .lock()
            .collections
            .get(namespace)
            .and_then(|documents| documents.get(id))
            .cloned()
    }

    /// Latest assigned sequence.
    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    /// All calls received so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// Number of `insert_one` calls for a document.
    pub fn insert_count(&self, id: &DocumentId) -> usize {
        self.count_calls(|call| matches!(call, RemoteCall::InsertOne { id: c, .. } if c == id))
    }

    /// Number of write calls for a document.
    pub fn write_count(&self, id: &DocumentId) -> usize {
        self.count_calls(|call| call.is_write() && call.document_id() == Some(id))
    }

    /// Number of `subscribe` calls for a namespace.
    pub fn subscribe_count(&self, namespace: &Namespace) -> usize {
        self.count_calls(
            |call| matches!(call, RemoteCall::Subscribe { namespace: ns } if ns == namespace),
        )
    }

    /// Number of open subscriptions for a namespace.
    pub fn active_subscriptions(&self, namespace: &Namespace) -> usize {
        self.state
            .lock()
            .subscribers
            .get(namespace)
            .map_or(0, Vec::len)
    }

    /// Highest number of calls that were ever in flight at the same time.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn count_calls(&self, predicate: impl Fn(&RemoteCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Runs a call with latency and concurrency accounting.
    fn call<R>(
        &self,
        record: RemoteCall,
        f: impl FnOnce(&mut RemoteState) -> RemoteResult<R>,
    ) -> RemoteResult<R> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            std::thread::sleep(Duration::from_millis(latency));
        }

        let result = if self.connected.load(Ordering::SeqCst) {
            let mut state = self.state.lock();
            state.calls.push(record.clone());
            let injected = if record.is_write() {
                state.write_failures.pop_front()
            } else {
                None
            };
            match injected {
                Some(error) => Err(error),
                None => f(&mut state),
            }
        } else {
            Err(RemoteError::transient("remote unreachable"))
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl RemoteService for MockRemoteService {
    fn insert_one(
        &self,
        namespace: &Namespace,
        document: &Document,
    ) -> RemoteResult<RemoteWriteAck> {
        let id = document
            .id()
            .ok_or_else(|| RemoteError::rejected("document has no `_id`"))?;
        let record = RemoteCall::InsertOne {
            namespace: namespace.clone(),
            id: id.clone(),
        };
        self.call(record, |state| {
            if state.current_marker(namespace, &id).is_some() {
                return Err(RemoteError::Conflict);
            }
            let sequence = state.commit(namespace, &id, Some(document.clone()));
            Ok(RemoteWriteAck { sequence })
        })
    }

    fn update_one(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        document: &Document,
        expected: &VersionMarker,
    ) -> RemoteResult<RemoteWriteAck> {
        let record = RemoteCall::UpdateOne {
            namespace: namespace.clone(),
            id: id.clone(),
        };
        self.call(record, |state| {
            if state.current_marker(namespace, id).as_ref() != Some(expected) {
                return Err(RemoteError::Conflict);
            }
            let sequence = state.commit(namespace, id, Some(document.clone()));
            Ok(RemoteWriteAck { sequence })
        })
    }

    fn delete_one(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        expected: Option<&VersionMarker>,
    ) -> RemoteResult<RemoteWriteAck> {
        let record = RemoteCall::DeleteOne {
            namespace: namespace.clone(),
            id: id.clone(),
        };
        self.call(record, |state| {
            let current = state.current_marker(namespace, id);
            match (expected, current) {
                (None, None) => Ok(RemoteWriteAck {
                    sequence: state.sequence,
                }),
                (Some(_), None) => Err(RemoteError::Conflict),
                (Some(expected), Some(current)) if *expected != current => {
                    Err(RemoteError::Conflict)
                }
                _ => {
                    let sequence = state.commit(namespace, id, None);
                    Ok(RemoteWriteAck { sequence })
                }
            }
        })
    }

    fn find_one(&self, namespace: &Namespace, id: &DocumentId) -> RemoteResult<RemoteSnapshot> {
        let record = RemoteCall::FindOne {
            namespace: namespace.clone(),
            id: id.clone(),
        };
        self.call(record, |state| {
            let document = state
                .collections
                .get(namespace)
                .and_then(|documents| documents.get(id))
                .cloned();
            Ok(RemoteSnapshot {
                document,
                sequence: state.sequence,
            })
        })
    }

    fn subscribe(
        &self,
        namespace: &Namespace,
        sink: ChangeEventSink,
    ) -> RemoteResult<Box<dyn Subscription>> {
        let record = RemoteCall::Subscribe {
            namespace: namespace.clone(),
        };
        let weak_state = Arc::downgrade(&self.state);
        self.call(record, move |state| {
            if let Some(error) = state.subscribe_failures.pop_front() {
                return Err(error);
            }
            state.next_subscription += 1;
            let id = state.next_subscription;
            state
                .subscribers
                .entry(namespace.clone())
                .or_default()
                .push((id, sink));
            Ok(Box::new(MockSubscription {
                state: weak_state,
                namespace: namespace.clone(),
                id,
            }) as Box<dyn Subscription>)
        })
    }
}

struct MockSubscription {
    state: Weak<Mutex<RemoteState>>,
    namespace: Namespace,
    id: u64,
}

impl Subscription for MockSubscription {
    fn close(&self) {
        if let Some(state) = self.state.upgrade() {
            if let Some(subscribers) = state.lock().subscribers.get_mut(&self.namespace) {
                subscribers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// A network monitor whose state is set by hand.
pub struct StaticNetworkMonitor {
    connected: AtomicBool,
    next_listener: AtomicU64,
    listeners: Mutex<Vec<(NetworkListenerId, Arc<dyn NetworkStateListener>)>>,
}

impl StaticNetworkMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            next_listener: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Changes connectivity, notifying listeners if it changed.
    pub fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) == connected {
            return;
        }
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener.on_network_state_changed(connected);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Default for StaticNetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor for StaticNetworkMonitor {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn add_state_listener(&self, listener: Arc<dyn NetworkStateListener>) -> NetworkListenerId {
        let id = NetworkListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().push((id, listener));
        id
    }

    fn remove_state_listener(&self, id: NetworkListenerId) {
        self.listeners.lock().retain(|(listener_id, _)| *listener_id != id);
    }
}

/// An auth monitor whose state is set by hand.
pub struct StaticAuthMonitor {
    logged_in: AtomicBool,
}

impl StaticAuthMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(logged_in: bool) -> Self {
        Self {
            logged_in: AtomicBool::new(logged_in),
        }
    }

    /// Changes the session state.
    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
    }
}

impl Default for StaticAuthMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AuthMonitor for StaticAuthMonitor {
    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::ChangeStreamIngestion;

    fn ns() -> Namespace {
        Namespace::new("foo", "bar")
    }

    #[test]
    fn local_store_roundtrips_configs() {
        let store = MemoryLocalStore::new();
        let mut config = DocumentSynchronizationConfig::new(ns(), "X".into());
        config.record_local_write(crate::PendingWrite::Insert);

        store.save_document_config(&config).unwrap();
        assert_eq!(store.load_namespaces().unwrap(), vec![ns()]);
        assert_eq!(
            store.load_document_config(&ns(), &"X".into()).unwrap(),
            Some(config.clone())
        );
        assert_eq!(store.load_document_configs(&ns()).unwrap(), vec![config]);

        store.remove_document_config(&ns(), &"X".into()).unwrap();
        assert_eq!(store.stored_config_count(), 0);
    }

    #[test]
    fn local_store_write_failures() {
        let store = MemoryLocalStore::new();
        let doc = Document::with_id(&"a".into());

        store.set_fail_writes(true);
        assert!(store.write(&ns(), &doc).is_err());
        store.set_fail_writes(false);

        assert_eq!(store.write(&ns(), &doc).unwrap(), "a".into());
        assert_eq!(store.find(&ns(), &Filter::All).unwrap(), vec![doc]);
        assert!(store.delete(&ns(), &"a".into()).unwrap());
        assert!(!store.delete(&ns(), &"a".into()).unwrap());
        assert!(store.write(&ns(), &Document::new()).is_err(), "id required");
    }

    #[test]
    fn remote_conditional_writes() {
        let remote = MockRemoteService::new();
        let doc = Document::with_id(&"a".into()).field("n", 1);
        let marker = doc.version_marker().unwrap();

        let ack = remote.insert_one(&ns(), &doc).unwrap();
        assert_eq!(ack.sequence, 1);
        assert_eq!(remote.insert_one(&ns(), &doc), Err(RemoteError::Conflict));

        let stale = VersionMarker::from_bytes([0; 32]);
        let changed = doc.clone().field("n", 2);
        assert_eq!(
            remote.update_one(&ns(), &"a".into(), &changed, &stale),
            Err(RemoteError::Conflict)
        );
        assert_eq!(
            remote
                .update_one(&ns(), &"a".into(), &changed, &marker)
                .unwrap()
                .sequence,
            2
        );

        assert_eq!(
            remote.delete_one(&ns(), &"a".into(), Some(&marker)),
            Err(RemoteError::Conflict)
        );
        assert!(remote.delete_one(&ns(), &"a".into(), None).is_ok());
        assert_eq!(remote.document(&ns(), &"a".into()), None);
        assert_eq!(remote.insert_count(&"a".into()), 2);
    }

    #[test]
    fn remote_fans_out_writes() {
        let remote = MockRemoteService::new();
        let ingestion = ChangeStreamIngestion::new();
        let subscription = remote.subscribe(&ns(), ingestion.sink(&ns())).unwrap();

        remote.external_write(&ns(), Document::with_id(&"a".into()));
        remote.external_write(&ns(), Document::with_id(&"a".into()).field("n", 1));
        remote.external_delete(&ns(), &"a".into());

        let events = ingestion.drain(&ns(), 10);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(events[0].operation_type, docsync_protocol::OperationType::Insert);
        assert_eq!(events[1].operation_type, docsync_protocol::OperationType::Replace);
        assert_eq!(events[2].operation_type, docsync_protocol::OperationType::Delete);

        subscription.close();
        assert_eq!(remote.active_subscriptions(&ns()), 0);
        remote.external_write(&ns(), Document::with_id(&"b".into()));
        assert_eq!(ingestion.pending_len(&ns()), 0);
    }

    #[test]
    fn remote_failure_injection() {
        let remote = MockRemoteService::new();
        remote.fail_next_write(RemoteError::rejected("quota"));
        let doc = Document::with_id(&"a".into());
        assert_eq!(
            remote.insert_one(&ns(), &doc),
            Err(RemoteError::rejected("quota"))
        );
        assert!(remote.insert_one(&ns(), &doc).is_ok());

        remote.set_connected(false);
        assert!(matches!(
            remote.find_one(&ns(), &"a".into()),
            Err(RemoteError::Transient(_))
        ));
    }

    #[test]
    fn network_monitor_notifies_on_change() {
        struct Recorder(Mutex<Vec<bool>>);
        impl NetworkStateListener for Recorder {
            fn on_network_state_changed(&self, connected: bool) {
                self.0.lock().push(connected);
            }
        }

        let monitor = StaticNetworkMonitor::new(true);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let id = monitor.add_state_listener(Arc::clone(&recorder) as Arc<dyn NetworkStateListener>);

        monitor.set_connected(true);
        monitor.set_connected(false);
        monitor.set_connected(true);
        assert_eq!(*recorder.0.lock(), vec![false, true]);

        monitor.remove_state_listener(id);
        assert_eq!(monitor.listener_count(), 0);
    }
}

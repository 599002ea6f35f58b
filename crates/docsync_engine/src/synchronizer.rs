//! The data synchronizer.
//!
//! All namespace and document configs live behind one configuration lock.
//! Every public mutation and every per-document step of a sync pass runs
//! under it, so a pass never observes a half-updated config. Listener and
//! error notifications are collected while the lock is held and dispatched
//! after it is released.
//!
//! A pass runs in three phases:
//! 1. push pending local writes of unfrozen documents;
//! 2. apply buffered remote change events;
//! 3. fetch tracked documents whose remote version is unknown.
//!
//! Remote sequences make event application exactly-once: an event at or
//! below a document's applied remote sequence is skipped, which also
//! suppresses echoes of the engine's own writes.

use crate::adapters::{
    Adapters, Filter, LocalStore, NetworkListenerId, RemoteSnapshot, RemoteWriteAck,
};
use crate::config::SynchronizerConfig;
use crate::doc_config::{DocumentConfigHandle, DocumentSynchronizationConfig, PendingWrite};
use crate::error::{LocalStoreResult, RemoteError, RemoteResult, SyncError, SyncResult};
use crate::handlers::{ErrorListener, NamespaceHandlers, SyncHandlers};
use crate::ingestion::ChangeStreamIngestion;
use crate::ns_config::{NamespaceConfigHandle, NamespaceSynchronizationConfig};
use crate::runner::{LoopWaker, SyncLoop};
use docsync_protocol::{
    ChangeEvent, CodecError, Conflict, ConflictResolution, Document, DocumentId, Namespace,
    VersionMarker, ID_FIELD,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type DocKey = (Namespace, DocumentId);

/// Upper bound on the wait before reopening a failed change stream.
const MAX_LISTEN_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Statistics about synchronization.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync passes completed.
    pub passes_completed: u64,
    /// Passes that stopped early because the loop was stopped.
    pub passes_interrupted: u64,
    /// Total number of local writes acknowledged by the remote.
    pub documents_pushed: u64,
    /// Total number of remote changes applied locally.
    pub remote_events_applied: u64,
    /// Total number of conflicts passed to a conflict handler.
    pub conflicts_resolved: u64,
    /// Total number of times a document was frozen.
    pub documents_frozen: u64,
    /// Number of times the background loop was started.
    pub loop_starts: u64,
    /// Completion time of the last pass.
    pub last_pass_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a sync pass.
#[derive(Debug, Clone, Default)]
pub struct SyncPassReport {
    /// Local writes acknowledged by the remote.
    pub pushed: u64,
    /// Remote changes applied locally.
    pub applied: u64,
    /// Conflicts resolved during the pass.
    pub conflicts: Vec<Conflict>,
    /// Documents frozen during the pass.
    pub frozen: u64,
    /// Whether remote work was skipped because the remote was unavailable.
    pub remote_skipped: bool,
    /// Whether the pass stopped early because the loop was stopped.
    pub interrupted: bool,
    /// Duration of the pass.
    pub duration: Duration,
}

#[derive(Default)]
struct SyncState {
    namespaces: HashMap<Namespace, NamespaceSynchronizationConfig>,
    /// Documents whose durable config was edited through a handle since the
    /// last reload. Their durable `frozen` value wins over the in-memory one.
    stale: HashSet<DocKey>,
}

impl SyncState {
    fn namespace_mut(
        &mut self,
        namespace: &Namespace,
        local: &dyn LocalStore,
    ) -> &mut NamespaceSynchronizationConfig {
        self.namespaces
            .entry(namespace.clone())
            .or_insert_with(|| {
                if let Err(e) = local.save_namespace(namespace) {
                    warn!(namespace = %namespace, error = %e, "failed to persist namespace");
                }
                NamespaceSynchronizationConfig::new(namespace.clone())
            })
    }

    fn document(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> Option<&DocumentSynchronizationConfig> {
        self.namespaces.get(namespace)?.documents.get(id)
    }

    fn handlers(&self, namespace: &Namespace) -> Option<Arc<dyn NamespaceHandlers>> {
        self.namespaces.get(namespace)?.handlers.clone()
    }

    fn error_listener(&self, namespace: &Namespace) -> Option<Arc<dyn ErrorListener>> {
        self.namespaces.get(namespace)?.error_listener.clone()
    }

    fn is_stale(&self, namespace: &Namespace, id: &DocumentId) -> bool {
        self.stale.contains(&(namespace.clone(), id.clone()))
    }

    fn documents_where(
        &self,
        predicate: impl Fn(&DocumentSynchronizationConfig) -> bool,
    ) -> Vec<DocKey> {
        let mut keys: Vec<DocKey> = self
            .namespaces
            .values()
            .flat_map(|ns| ns.documents.values())
            .filter(|config| predicate(config))
            .map(|config| (config.namespace().clone(), config.document_id().clone()))
            .collect();
        keys.sort();
        keys
    }
}

enum Notification {
    Change {
        handlers: Arc<dyn NamespaceHandlers>,
        event: ChangeEvent<Document>,
    },
    Error {
        listener: Arc<dyn ErrorListener>,
        document_id: DocumentId,
        error: SyncError,
    },
}

/// Notifications collected under the configuration lock.
#[derive(Default)]
struct Outbox(Vec<Notification>);

impl Outbox {
    fn change(&mut self, handlers: Option<Arc<dyn NamespaceHandlers>>, event: ChangeEvent<Document>) {
        if let Some(handlers) = handlers {
            self.0.push(Notification::Change { handlers, event });
        }
    }

    fn error(&mut self, listener: Option<Arc<dyn ErrorListener>>, id: &DocumentId, error: SyncError) {
        if let Some(listener) = listener {
            self.0.push(Notification::Error {
                listener,
                document_id: id.clone(),
                error,
            });
        }
    }

    /// Must be called without the configuration lock held.
    fn dispatch(&mut self) {
        for notification in self.0.drain(..) {
            match notification {
                Notification::Change { handlers, event } => {
                    if let Err(message) = handlers.notify(&event) {
                        warn!(
                            namespace = %event.namespace,
                            document_id = %event.document_key,
                            error = %message,
                            "change event could not be decoded for listener"
                        );
                    }
                }
                Notification::Error {
                    listener,
                    document_id,
                    error,
                } => listener.on_error(&document_id, &error),
            }
        }
    }
}

fn marker_of(document: Option<&Document>) -> Result<Option<VersionMarker>, CodecError> {
    document.map(Document::version_marker).transpose()
}

fn snapshot_event(namespace: &Namespace, id: &DocumentId, snapshot: RemoteSnapshot) -> ChangeEvent<Document> {
    settled_event(namespace, id, snapshot.sequence, snapshot.document)
}

fn settled_event(
    namespace: &Namespace,
    id: &DocumentId,
    sequence: u64,
    document: Option<Document>,
) -> ChangeEvent<Document> {
    match document {
        Some(document) => ChangeEvent::replace(sequence, namespace.clone(), id.clone(), document),
        None => ChangeEvent::delete(sequence, namespace.clone(), id.clone()),
    }
}

fn local_event(
    config: &DocumentSynchronizationConfig,
    document: Option<Document>,
) -> ChangeEvent<Document> {
    let namespace = config.namespace().clone();
    let id = config.document_id().clone();
    let event = match (document, config.pending_write()) {
        (Some(document), Some(PendingWrite::Insert)) => {
            ChangeEvent::insert(0, namespace, id, document)
        }
        (Some(document), _) => ChangeEvent::update(0, namespace, id, document),
        (None, _) => ChangeEvent::delete(0, namespace, id),
    };
    event.with_uncommitted_writes()
}

/// Shared state behind every [`DataSynchronizer`] clone.
pub(crate) struct Inner {
    config: SynchronizerConfig,
    adapters: Adapters,
    state: Mutex<SyncState>,
    pass_lock: Mutex<()>,
    ingestion: ChangeStreamIngestion,
    sync_loop: SyncLoop,
    stats: RwLock<SyncStats>,
    network_listener: Mutex<Option<NetworkListenerId>>,
}

impl Inner {
    fn remote_available(&self) -> bool {
        self.adapters.network.is_connected() && self.adapters.auth.is_logged_in()
    }

    fn record_error(&self, message: impl Into<String>) {
        self.stats.write().last_error = Some(message.into());
    }

    // ---- durable state --------------------------------------------------

    /// Persists and installs a document config.
    fn store(&self, state: &mut SyncState, config: DocumentSynchronizationConfig) {
        let namespace = config.namespace().clone();
        let id = config.document_id().clone();

        let result = if state.is_stale(&namespace, &id) {
            self.persist_keeping_durable_freeze(&config)
        } else {
            self.adapters.local.save_document_config(&config)
        };
        if let Err(e) = result {
            warn!(namespace = %namespace, document_id = %id, error = %e, "failed to persist document config");
        }

        state
            .namespace_mut(&namespace, self.adapters.local.as_ref())
            .documents
            .insert(id, config);
    }

    fn persist_keeping_durable_freeze(
        &self,
        config: &DocumentSynchronizationConfig,
    ) -> LocalStoreResult<()> {
        let mut record = config.clone();
        let durable = self
            .adapters
            .local
            .load_document_config(config.namespace(), config.document_id())?;
        if let Some(durable) = durable {
            record.set_frozen(durable.is_frozen());
            record.set_last_error(durable.last_error().map(str::to_owned));
        }
        self.adapters.local.save_document_config(&record)
    }

    /// Stops tracking a document, in memory and durably.
    fn forget(&self, state: &mut SyncState, namespace: &Namespace, id: &DocumentId) -> bool {
        let removed = state
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.documents.remove(id))
            .is_some();
        state.stale.remove(&(namespace.clone(), id.clone()));
        if let Err(e) = self.adapters.local.remove_document_config(namespace, id) {
            warn!(namespace = %namespace, document_id = %id, error = %e, "failed to remove document config");
        }
        removed
    }

    fn record_local_write(
        &self,
        state: &mut SyncState,
        namespace: &Namespace,
        id: &DocumentId,
        write: PendingWrite,
    ) {
        state.namespace_mut(namespace, self.adapters.local.as_ref());
        let mut config = state
            .document(namespace, id)
            .cloned()
            .unwrap_or_else(|| DocumentSynchronizationConfig::new(namespace.clone(), id.clone()));

        if config.record_local_write(write) {
            debug!(namespace = %namespace, document_id = %id, pending = ?config.pending_write(), "recorded local write");
            self.store(state, config);
        } else {
            debug!(namespace = %namespace, document_id = %id, "local insert deleted before reaching remote");
            self.forget(state, namespace, id);
        }
    }

    pub(crate) fn document_config(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> Option<DocumentSynchronizationConfig> {
        self.state.lock().document(namespace, id).cloned()
    }

    pub(crate) fn with_namespace<R: Default>(
        &self,
        namespace: &Namespace,
        f: impl FnOnce(&NamespaceSynchronizationConfig) -> R,
    ) -> R {
        self.state.lock().namespaces.get(namespace).map(f).unwrap_or_default()
    }

    pub(crate) fn add_synchronized_document(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.document(namespace, id).is_some() {
            return Ok(());
        }
        let config = DocumentSynchronizationConfig::new(namespace.clone(), id.clone());
        self.store(&mut state, config);
        debug!(namespace = %namespace, document_id = %id, "document added to synchronization");
        Ok(())
    }

    pub(crate) fn set_document_frozen(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        frozen: bool,
    ) -> SyncResult<()> {
        let mut state = self.state.lock();
        let durable = self.adapters.local.load_document_config(namespace, id)?;
        let Some(mut record) = durable.or_else(|| state.document(namespace, id).cloned()) else {
            return Err(SyncError::configuration(format!(
                "document {id} is not synchronized in {namespace}"
            )));
        };

        record.set_frozen(frozen);
        self.adapters.local.save_document_config(&record)?;
        state.stale.insert((namespace.clone(), id.clone()));
        info!(namespace = %namespace, document_id = %id, frozen, "durable freeze state changed");
        Ok(())
    }

    fn reload_config(&self) -> SyncResult<()> {
        let mut state = self.state.lock();

        let mut loaded = Vec::new();
        for namespace in self.adapters.local.load_namespaces()? {
            let configs = self.adapters.local.load_document_configs(&namespace)?;
            loaded.push((namespace, configs));
        }

        for ns in state.namespaces.values_mut() {
            ns.documents.clear();
        }
        let mut document_count = 0;
        for (namespace, configs) in loaded {
            document_count += configs.len();
            let ns = state
                .namespaces
                .entry(namespace.clone())
                .or_insert_with(|| NamespaceSynchronizationConfig::new(namespace));
            ns.documents = configs
                .into_iter()
                .map(|config| (config.document_id().clone(), config))
                .collect();
        }
        state.stale.clear();

        info!(
            namespaces = state.namespaces.len(),
            documents = document_count,
            "synchronization config reloaded"
        );
        Ok(())
    }

    // ---- subscriptions --------------------------------------------------

    fn open_subscription(&self, ns: &mut NamespaceSynchronizationConfig) -> bool {
        if ns.subscription.is_some() {
            return false;
        }
        let sink = self.ingestion.sink(&ns.namespace);
        match self.adapters.remote.subscribe(&ns.namespace, sink) {
            Ok(subscription) => {
                ns.subscription = Some(subscription);
                ns.listen.failed_attempts = 0;
                ns.listen.next_attempt = None;
                info!(namespace = %ns.namespace, "listening to namespace");
                true
            }
            Err(e) => {
                ns.listen.failed_attempts = ns.listen.failed_attempts.saturating_add(1);
                let delay = self
                    .config
                    .listen_retry
                    .delay_for_attempt(ns.listen.failed_attempts);
                ns.listen.next_attempt =
                    Instant::now().checked_add(delay.min(MAX_LISTEN_BACKOFF));
                warn!(
                    namespace = %ns.namespace,
                    error = %e,
                    attempts = ns.listen.failed_attempts,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "failed to open change stream"
                );
                false
            }
        }
    }

    fn retry_subscriptions(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let retry = &self.config.listen_retry;
        for ns in state.namespaces.values_mut() {
            if ns.listen_due(now) && retry.allows_attempt(ns.listen.failed_attempts) {
                self.open_subscription(ns);
            }
        }
    }

    // ---- sync pass ------------------------------------------------------

    pub(crate) fn run_loop_pass(&self, keep_running: &dyn Fn() -> bool) {
        let report = self.sync_pass(keep_running);
        debug!(
            pushed = report.pushed,
            applied = report.applied,
            conflicts = report.conflicts.len(),
            frozen = report.frozen,
            remote_skipped = report.remote_skipped,
            interrupted = report.interrupted,
            "background sync pass finished"
        );
    }

    fn sync_pass(&self, keep_running: &dyn Fn() -> bool) -> SyncPassReport {
        let mut outbox = Outbox::default();
        let report = {
            let _pass = self.pass_lock.lock();
            self.run_phases(keep_running, &mut outbox)
        };
        // The pass lock must be released first: a listener may stop the
        // loop, which joins a thread that could be waiting for this lock.
        outbox.dispatch();
        report
    }

    fn run_phases(
        &self,
        keep_running: &dyn Fn() -> bool,
        outbox: &mut Outbox,
    ) -> SyncPassReport {
        let started = Instant::now();
        let mut report = SyncPassReport::default();

        if self.remote_available() {
            self.retry_subscriptions();
            let completed = self.push_pending(keep_running, &mut report, outbox)
                && self.apply_remote_events(keep_running, &mut report, outbox)
                && self.fetch_unknown_versions(keep_running, &mut report, outbox);
            report.interrupted = !completed;
        } else {
            debug!("remote unavailable, skipping remote work");
            report.remote_skipped = true;
        }

        report.duration = started.elapsed();
        let mut stats = self.stats.write();
        stats.passes_completed += 1;
        if report.interrupted {
            stats.passes_interrupted += 1;
        }
        stats.documents_pushed += report.pushed;
        stats.remote_events_applied += report.applied;
        stats.last_pass_time = Some(Instant::now());
        report
    }

    /// Phase 1. Returns false if interrupted.
    fn push_pending(
        &self,
        keep_running: &dyn Fn() -> bool,
        report: &mut SyncPassReport,
        outbox: &mut Outbox,
    ) -> bool {
        let targets = self
            .state
            .lock()
            .documents_where(|config| config.pending_write().is_some() && !config.is_frozen());

        for (namespace, id) in targets {
            if !keep_running() {
                return false;
            }
            self.push_document(&namespace, &id, report, outbox);
        }
        true
    }

    fn push_document(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        report: &mut SyncPassReport,
        outbox: &mut Outbox,
    ) {
        let mut state = self.state.lock();
        let Some(config) = state.document(namespace, id).cloned() else {
            return;
        };
        if config.is_frozen() || config.pending_write().is_none() {
            return;
        }

        let local = match self.adapters.local.find_by_id(namespace, id) {
            Ok(local) => local,
            Err(e) => {
                warn!(namespace = %namespace, document_id = %id, error = %e, "failed to read local document");
                self.record_error(e.to_string());
                return;
            }
        };

        debug!(namespace = %namespace, document_id = %id, pending = ?config.pending_write(), "pushing local write");
        match self.write_remote(namespace, id, local.as_ref(), config.version()) {
            Ok(ack) => self.acknowledge(&mut state, config, local.as_ref(), ack, report, outbox),
            Err(RemoteError::Conflict) => match self.adapters.remote.find_one(namespace, id) {
                Ok(snapshot) => {
                    let remote_event = snapshot_event(namespace, id, snapshot);
                    self.resolve_conflict(&mut state, config, local, remote_event, report, outbox);
                }
                Err(e) => self.remote_failure(&mut state, config, e, report, outbox),
            },
            Err(e) => self.remote_failure(&mut state, config, e, report, outbox),
        }
    }

    /// Issues the remote write that makes the remote match `local`.
    fn write_remote(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        local: Option<&Document>,
        version: Option<VersionMarker>,
    ) -> RemoteResult<RemoteWriteAck> {
        let remote = &self.adapters.remote;
        match (local, version) {
            (Some(document), Some(expected)) => remote.update_one(namespace, id, document, &expected),
            (Some(document), None) => remote.insert_one(namespace, document),
            (None, expected) => remote.delete_one(namespace, id, expected.as_ref()),
        }
    }

    fn acknowledge(
        &self,
        state: &mut SyncState,
        mut config: DocumentSynchronizationConfig,
        local: Option<&Document>,
        ack: RemoteWriteAck,
        report: &mut SyncPassReport,
        outbox: &mut Outbox,
    ) {
        let namespace = config.namespace().clone();
        let id = config.document_id().clone();
        report.pushed += 1;
        self.ingestion.discard_through(&namespace, &id, ack.sequence);
        debug!(namespace = %namespace, document_id = %id, sequence = ack.sequence, "remote acknowledged write");

        match marker_of(local) {
            Ok(None) if !config.is_frozen() => {
                self.forget(state, &namespace, &id);
            }
            Ok(version) => {
                config.mark_synced(version, ack.sequence);
                self.store(state, config);
            }
            Err(e) => {
                let error = SyncError::Codec(e);
                self.freeze(state, config, error, report, outbox);
            }
        }
    }

    fn remote_failure(
        &self,
        state: &mut SyncState,
        config: DocumentSynchronizationConfig,
        error: RemoteError,
        report: &mut SyncPassReport,
        outbox: &mut Outbox,
    ) {
        let namespace = config.namespace().clone();
        let id = config.document_id().clone();
        match error {
            RemoteError::Transient(message) => {
                debug!(namespace = %namespace, document_id = %id, error = %message, "transient remote failure, keeping pending write");
                self.record_error(SyncError::RemoteTransient(message).to_string());
                self.store(state, config);
            }
            RemoteError::Conflict => {
                debug!(namespace = %namespace, document_id = %id, "remote changed again, resolving next pass");
                self.store(state, config);
            }
            RemoteError::Rejected(message) => {
                let error = SyncError::Unrecoverable {
                    namespace,
                    document_id: id,
                    message,
                };
                self.freeze(state, config, error, report, outbox);
            }
        }
    }

    fn freeze(
        &self,
        state: &mut SyncState,
        mut config: DocumentSynchronizationConfig,
        error: SyncError,
        report: &mut SyncPassReport,
        outbox: &mut Outbox,
    ) {
        let namespace = config.namespace().clone();
        let id = config.document_id().clone();
        warn!(namespace = %namespace, document_id = %id, error = %error, "freezing document");

        config.freeze(error.to_string());
        report.frozen += 1;
        {
            let mut stats = self.stats.write();
            stats.documents_frozen += 1;
            stats.last_error = Some(error.to_string());
        }
        outbox.error(state.error_listener(&namespace), &id, error);
        self.store(state, config);
    }

    /// Invokes the conflict handler once and settles the outcome.
    fn resolve_conflict(
        &self,
        state: &mut SyncState,
        mut config: DocumentSynchronizationConfig,
        local: Option<Document>,
        remote_event: ChangeEvent<Document>,
        report: &mut SyncPassReport,
        outbox: &mut Outbox,
    ) {
        let namespace = config.namespace().clone();
        let id = config.document_id().clone();

        let Some(handlers) = state.handlers(&namespace) else {
            let error = SyncError::configuration(format!(
                "no conflict handler configured for {namespace}"
            ));
            return self.freeze(state, config, error, report, outbox);
        };

        let remote = remote_event.full_document.clone();
        let remote_sequence = remote_event.sequence;
        let (local_version, remote_version) =
            match (marker_of(local.as_ref()), marker_of(remote.as_ref())) {
                (Ok(local_version), Ok(remote_version)) => (local_version, remote_version),
                (Err(e), _) | (_, Err(e)) => {
                    return self.freeze(state, config, SyncError::Codec(e), report, outbox);
                }
            };

        debug!(namespace = %namespace, document_id = %id, sequence = remote_sequence, "resolving conflict");
        let local_event = local_event(&config, local.clone());
        let resolution = match handlers.resolve(&id, &local_event, &remote_event) {
            Ok(resolution) => resolution,
            Err(message) => {
                let error = SyncError::ConflictResolution {
                    namespace,
                    document_id: id,
                    message,
                };
                return self.freeze(state, config, error, report, outbox);
            }
        };

        let kind = resolution.kind();
        let winner = match resolution {
            ConflictResolution::KeepLocal => local,
            ConflictResolution::AcceptRemote => remote.clone(),
            ConflictResolution::Merge(None) => None,
            ConflictResolution::Merge(Some(mut merged)) => {
                if merged.get(ID_FIELD).is_none() {
                    merged.set_id(&id);
                }
                if merged.id().as_ref() != Some(&id) {
                    let error = SyncError::ConflictResolution {
                        namespace,
                        document_id: id,
                        message: "merged document has a different `_id`".into(),
                    };
                    return self.freeze(state, config, error, report, outbox);
                }
                Some(merged)
            }
        };

        report.conflicts.push(Conflict {
            namespace: namespace.clone(),
            document_id: id.clone(),
            local_version,
            remote_version,
            resolution: kind,
        });
        self.stats.write().conflicts_resolved += 1;

        let winner_version = match marker_of(winner.as_ref()) {
            Ok(version) => version,
            Err(e) => return self.freeze(state, config, SyncError::Codec(e), report, outbox),
        };

        let applied = match &winner {
            Some(document) => self.adapters.local.write(&namespace, document).map(|_| ()),
            None => self.adapters.local.delete(&namespace, &id).map(|_| ()),
        };
        if let Err(e) = applied {
            warn!(namespace = %namespace, document_id = %id, error = %e, "failed to apply conflict resolution locally");
            self.record_error(e.to_string());
            return;
        }

        self.ingestion.discard_through(&namespace, &id, remote_sequence);
        let mut settled_sequence = remote_sequence;

        if winner_version == remote_version {
            config.mark_synced(remote_version, remote_sequence);
            if winner.is_none() && !config.is_frozen() {
                self.forget(state, &namespace, &id);
            } else {
                self.store(state, config);
            }
        } else {
            let pending = match (&winner, &remote) {
                (Some(_), Some(_)) => PendingWrite::Update,
                (Some(_), None) => PendingWrite::Insert,
                (None, _) => PendingWrite::Delete,
            };
            config.set_remote_state(remote_version, remote_sequence);
            config.set_pending(Some(pending));
            debug!(namespace = %namespace, document_id = %id, pending = ?pending, "pushing conflict winner");

            match self.write_remote(&namespace, &id, winner.as_ref(), remote_version) {
                Ok(ack) => {
                    settled_sequence = ack.sequence;
                    self.acknowledge(state, config, winner.as_ref(), ack, report, outbox);
                }
                Err(e) => self.remote_failure(state, config, e, report, outbox),
            }
        }

        let mut event = settled_event(&namespace, &id, settled_sequence, winner);
        event.has_uncommitted_writes = state
            .document(&namespace, &id)
            .is_some_and(|config| config.pending_write().is_some());
        outbox.change(Some(handlers), event);
    }

    /// Phase 2. Returns false if interrupted.
    fn apply_remote_events(
        &self,
        keep_running: &dyn Fn() -> bool,
        report: &mut SyncPassReport,
        outbox: &mut Outbox,
    ) -> bool {
        let mut namespaces: Vec<Namespace> = self.state.lock().namespaces.keys().cloned().collect();
        namespaces.sort();

        for namespace in namespaces {
            let buffered = self.ingestion.pending_len(&namespace);
            if buffered == 0 {
                continue;
            }
            debug!(namespace = %namespace, buffered, "applying remote events");

            let mut events = self
                .ingestion
                .drain(&namespace, self.config.max_events_per_pass)
                .into_iter();
            while let Some(event) = events.next() {
                if !keep_running() {
                    let unprocessed = std::iter::once(event).chain(events).collect();
                    self.ingestion.requeue_front(&namespace, unprocessed);
                    return false;
                }
                self.apply_remote_event(event, report, outbox);
            }
        }
        true
    }

    fn apply_remote_event(
        &self,
        event: ChangeEvent<Document>,
        report: &mut SyncPassReport,
        outbox: &mut Outbox,
    ) {
        let mut state = self.state.lock();
        let namespace = event.namespace.clone();
        let id = event.document_key.clone();
        let sequence = event.sequence;

        let version = match event.version_marker() {
            Ok(version) => version,
            Err(e) => {
                warn!(namespace = %namespace, document_id = %id, sequence, error = %e, "dropping undecodable remote event");
                return;
            }
        };
        let handlers = state.handlers(&namespace);

        let Some(mut config) = state.document(&namespace, &id).cloned() else {
            if let Err(e) = self.apply_locally(&namespace, &id, event.full_document.as_ref()) {
                warn!(namespace = %namespace, document_id = %id, sequence, error = %e, "failed to apply remote event locally");
                self.record_error(e.to_string());
                if event.full_document.is_some() {
                    // Track with an unknown version so the document is fetched again.
                    let config = DocumentSynchronizationConfig::new(namespace, id);
                    self.store(&mut state, config);
                }
                return;
            }
            if event.full_document.is_some() {
                let mut config = DocumentSynchronizationConfig::new(namespace, id);
                config.mark_synced(version, sequence);
                self.store(&mut state, config);
            }
            report.applied += 1;
            outbox.change(handlers, event);
            return;
        };

        if sequence <= config.remote_sequence() {
            debug!(namespace = %namespace, document_id = %id, sequence, "skipping already applied event");
            return;
        }

        match config.pending_write() {
            Some(_) if config.is_frozen() => {
                debug!(namespace = %namespace, document_id = %id, sequence, "frozen document has pending write, reporting event only");
                outbox.change(handlers, event);
            }
            Some(_) if version == config.version() => {
                config.observe_sequence(sequence);
                self.store(&mut state, config);
            }
            Some(_) => match self.adapters.local.find_by_id(&namespace, &id) {
                Ok(local) => self.resolve_conflict(&mut state, config, local, event, report, outbox),
                Err(e) => {
                    warn!(namespace = %namespace, document_id = %id, error = %e, "failed to read local document");
                    self.record_error(e.to_string());
                }
            },
            None => {
                if let Err(e) = self.apply_locally(&namespace, &id, event.full_document.as_ref()) {
                    warn!(namespace = %namespace, document_id = %id, sequence, error = %e, "failed to apply remote event locally");
                    self.record_error(e.to_string());
                    let remote_sequence = config.remote_sequence();
                    config.set_remote_state(None, remote_sequence);
                    self.store(&mut state, config);
                    return;
                }
                if version.is_none() && !config.is_frozen() {
                    self.forget(&mut state, &namespace, &id);
                } else {
                    config.mark_synced(version, sequence);
                    self.store(&mut state, config);
                }
                debug!(namespace = %namespace, document_id = %id, sequence, "applied remote event");
                report.applied += 1;
                outbox.change(handlers, event);
            }
        }
    }

    fn apply_locally(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        document: Option<&Document>,
    ) -> LocalStoreResult<()> {
        match document {
            Some(document) => self.adapters.local.write(namespace, document).map(|_| ()),
            None => self.adapters.local.delete(namespace, id).map(|_| ()),
        }
    }

    /// Phase 3. Returns false if interrupted.
    fn fetch_unknown_versions(
        &self,
        keep_running: &dyn Fn() -> bool,
        report: &mut SyncPassReport,
        outbox: &mut Outbox,
    ) -> bool {
        let targets = self.state.lock().documents_where(|config| {
            config.version().is_none() && config.pending_write().is_none() && !config.is_frozen()
        });

        for (namespace, id) in targets {
            if !keep_running() {
                return false;
            }
            self.fetch_document(&namespace, &id, report, outbox);
        }
        true
    }

    fn fetch_document(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        report: &mut SyncPassReport,
        outbox: &mut Outbox,
    ) {
        let mut state = self.state.lock();
        let Some(mut config) = state.document(namespace, id).cloned() else {
            return;
        };
        if config.version().is_some() || config.pending_write().is_some() || config.is_frozen() {
            return;
        }

        let snapshot = match self.adapters.remote.find_one(namespace, id) {
            Ok(snapshot) => snapshot,
            Err(e) => return self.remote_failure(&mut state, config, e, report, outbox),
        };
        self.ingestion.discard_through(namespace, id, snapshot.sequence);

        match snapshot.document {
            Some(document) => {
                let version = match document.version_marker() {
                    Ok(version) => version,
                    Err(e) => return self.freeze(&mut state, config, SyncError::Codec(e), report, outbox),
                };
                if let Err(e) = self.adapters.local.write(namespace, &document) {
                    warn!(namespace = %namespace, document_id = %id, error = %e, "failed to store fetched document");
                    self.record_error(e.to_string());
                    return;
                }
                config.mark_synced(Some(version), snapshot.sequence);
                self.store(&mut state, config);
                report.applied += 1;
                debug!(namespace = %namespace, document_id = %id, sequence = snapshot.sequence, "fetched remote document");
                outbox.change(
                    state.handlers(namespace),
                    ChangeEvent::replace(snapshot.sequence, namespace.clone(), id.clone(), document),
                );
            }
            None => match self.adapters.local.find_by_id(namespace, id) {
                Ok(Some(_)) => {
                    config.observe_sequence(snapshot.sequence);
                    config.record_local_write(PendingWrite::Insert);
                    self.store(&mut state, config);
                    debug!(namespace = %namespace, document_id = %id, "document only exists locally, scheduling insert");
                }
                Ok(None) => {
                    self.forget(&mut state, namespace, id);
                    debug!(namespace = %namespace, document_id = %id, "document exists nowhere, no longer tracked");
                }
                Err(e) => {
                    warn!(namespace = %namespace, document_id = %id, error = %e, "failed to read local document");
                    self.record_error(e.to_string());
                }
            },
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.sync_loop.stop();
        for ns in self.state.get_mut().namespaces.values_mut() {
            ns.close_subscription();
        }
        if let Some(id) = self.network_listener.get_mut().take() {
            self.adapters.network.remove_state_listener(id);
        }
    }
}

/// Keeps a local document store synchronized with a remote service.
///
/// Cheap to clone; clones share state. The background loop and the
/// change-stream subscriptions end when the last clone is dropped.
///
/// Listeners run on the thread that triggered them, after the
/// synchronizer's locks are released. Notifications produced by a sync
/// pass are delivered once the pass has finished. Listeners may call back
/// into the synchronizer, including [`stop`](Self::stop) and
/// [`do_sync_pass`](Self::do_sync_pass).
#[derive(Clone)]
pub struct DataSynchronizer {
    inner: Arc<Inner>,
}

impl DataSynchronizer {
    /// Creates a synchronizer and loads its durable configuration.
    pub fn new(config: SynchronizerConfig, adapters: Adapters) -> SyncResult<Self> {
        let inner = Arc::new(Inner {
            config,
            adapters,
            state: Mutex::new(SyncState::default()),
            pass_lock: Mutex::new(()),
            ingestion: ChangeStreamIngestion::new(),
            sync_loop: SyncLoop::new(),
            stats: RwLock::new(SyncStats::default()),
            network_listener: Mutex::new(None),
        });
        inner.reload_config()?;

        let waker = Arc::new(LoopWaker::new(inner.sync_loop.signal()));
        let listener_id = inner.adapters.network.add_state_listener(waker);
        *inner.network_listener.lock() = Some(listener_id);

        Ok(Self { inner })
    }

    /// Registers the handlers of a namespace and starts synchronizing it.
    ///
    /// Fails with [`SyncError::Configuration`] if no conflict handler is set,
    /// leaving the namespace unchanged. The change stream of a namespace is
    /// opened once for the lifetime of the synchronizer; configuring again
    /// only replaces the handlers. A failure to open the stream is retried by
    /// later passes.
    pub fn configure<T: 'static>(
        &self,
        namespace: &Namespace,
        handlers: SyncHandlers<T>,
    ) -> SyncResult<()> {
        let Some((handlers, error_listener)) = handlers.into_erased() else {
            return Err(SyncError::configuration(format!(
                "a conflict handler is required to synchronize {namespace}"
            )));
        };

        {
            let mut state = self.inner.state.lock();
            let ns = state.namespace_mut(namespace, self.inner.adapters.local.as_ref());
            ns.handlers = Some(handlers);
            ns.error_listener = error_listener;
            if !ns.listen.requested {
                ns.listen.requested = true;
                self.inner.open_subscription(ns);
            }
        }
        info!(namespace = %namespace, "namespace configured");

        self.start();
        Ok(())
    }

    /// Inserts a document locally and schedules it for the remote.
    ///
    /// A missing `_id` is generated. Returns the document's id.
    pub fn insert_one_and_sync(
        &self,
        namespace: &Namespace,
        document: Document,
    ) -> SyncResult<DocumentId> {
        let mut document = document;
        let id = match document.id() {
            Some(id) => id,
            None if document.get(ID_FIELD).is_some() => {
                return Err(SyncError::Codec(CodecError::MissingId));
            }
            None => {
                let id = DocumentId::generate();
                document.set_id(&id);
                id
            }
        };

        let mut outbox = Outbox::default();
        {
            let mut state = self.inner.state.lock();
            self.inner
                .adapters
                .local
                .write(namespace, &document)
                .map_err(SyncError::LocalWrite)?;
            self.inner
                .record_local_write(&mut state, namespace, &id, PendingWrite::Insert);
            let event = ChangeEvent::insert(0, namespace.clone(), id.clone(), document);
            outbox.change(state.handlers(namespace), event.with_uncommitted_writes());
        }
        outbox.dispatch();
        Ok(id)
    }

    /// Merges `update` into a local document and schedules it for the remote.
    ///
    /// Returns `false` if the document does not exist locally.
    pub fn update_one_by_id(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
        update: &Document,
    ) -> SyncResult<bool> {
        let mut outbox = Outbox::default();
        {
            let mut state = self.inner.state.lock();
            let Some(mut document) = self.inner.adapters.local.find_by_id(namespace, id)? else {
                return Ok(false);
            };
            document.merge(update);
            self.inner
                .adapters
                .local
                .write(namespace, &document)
                .map_err(SyncError::LocalWrite)?;
            self.inner
                .record_local_write(&mut state, namespace, id, PendingWrite::Update);
            let event = ChangeEvent::update(0, namespace.clone(), id.clone(), document);
            outbox.change(state.handlers(namespace), event.with_uncommitted_writes());
        }
        outbox.dispatch();
        Ok(true)
    }

    /// Deletes a local document and schedules the delete for the remote.
    ///
    /// Returns `false` if the document does not exist locally.
    pub fn delete_one_by_id(&self, namespace: &Namespace, id: &DocumentId) -> SyncResult<bool> {
        let mut outbox = Outbox::default();
        {
            let mut state = self.inner.state.lock();
            let deleted = self
                .inner
                .adapters
                .local
                .delete(namespace, id)
                .map_err(SyncError::LocalWrite)?;
            if !deleted {
                return Ok(false);
            }
            self.inner
                .record_local_write(&mut state, namespace, id, PendingWrite::Delete);
            let event = ChangeEvent::delete(0, namespace.clone(), id.clone());
            outbox.change(state.handlers(namespace), event.with_uncommitted_writes());
        }
        outbox.dispatch();
        Ok(true)
    }

    /// Reads local documents.
    pub fn find(&self, namespace: &Namespace, filter: &Filter) -> SyncResult<Vec<Document>> {
        Ok(self.inner.adapters.local.find(namespace, filter)?)
    }

    /// Reads a local document.
    pub fn find_one_by_id(
        &self,
        namespace: &Namespace,
        id: &DocumentId,
    ) -> SyncResult<Option<Document>> {
        Ok(self.inner.adapters.local.find_by_id(namespace, id)?)
    }

    /// Stops synchronizing a document and removes its local copy.
    ///
    /// Returns whether the document was tracked.
    pub fn desync_document(&self, namespace: &Namespace, id: &DocumentId) -> SyncResult<bool> {
        let mut state = self.inner.state.lock();
        let tracked = self.inner.forget(&mut state, namespace, id);
        self.inner.ingestion.discard_document(namespace, id);
        self.inner.adapters.local.delete(namespace, id)?;
        debug!(namespace = %namespace, document_id = %id, tracked, "document desynchronized");
        Ok(tracked)
    }

    /// Runs one reconciliation pass.
    ///
    /// Passes never overlap: a call made while another pass is running waits
    /// for it and then runs its own.
    pub fn do_sync_pass(&self) -> SyncPassReport {
        self.inner.sync_pass(&|| true)
    }

    /// Replaces the in-memory configuration with the durable one.
    ///
    /// Registered handlers and open subscriptions are kept.
    pub fn reload_config(&self) -> SyncResult<()> {
        self.inner.reload_config()
    }

    /// Starts the background loop. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let name = format!("docsync-{}", self.inner.config.instance_key);
        let started = self.inner.sync_loop.start(
            Arc::downgrade(&self.inner),
            name,
            self.inner.config.sync_interval,
        );
        if started {
            self.inner.stats.write().loop_starts += 1;
        }
        started
    }

    /// Stops the background loop. Returns `false` if it was not running.
    ///
    /// Change-stream subscriptions stay open.
    pub fn stop(&self) -> bool {
        self.inner.sync_loop.stop()
    }

    /// Whether the background loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.sync_loop.is_running()
    }

    /// Requests a background pass as soon as possible.
    pub fn wake(&self) {
        self.inner.sync_loop.signal().wake();
    }

    /// Whether any namespace has a conflict handler.
    pub fn is_configured(&self) -> bool {
        self.inner
            .state
            .lock()
            .namespaces
            .values()
            .any(NamespaceSynchronizationConfig::is_configured)
    }

    /// Handle to a namespace's configuration, created if absent.
    pub fn get_namespace_config(&self, namespace: &Namespace) -> NamespaceConfigHandle {
        self.inner
            .state
            .lock()
            .namespace_mut(namespace, self.inner.adapters.local.as_ref());
        NamespaceConfigHandle::new(Arc::downgrade(&self.inner), namespace.clone())
    }

    /// Handles to every tracked document of a namespace.
    pub fn get_synchronized_documents(&self, namespace: &Namespace) -> Vec<DocumentConfigHandle> {
        self.get_namespace_config(namespace).synchronized_documents()
    }

    /// Opens the namespace's change stream if it is not open.
    ///
    /// Returns `true` if the stream was opened by this call.
    pub fn trigger_listening_to_namespace(&self, namespace: &Namespace) -> bool {
        let mut state = self.inner.state.lock();
        let ns = state.namespace_mut(namespace, self.inner.adapters.local.as_ref());
        ns.listen.requested = true;
        self.inner.open_subscription(ns)
    }

    /// Current statistics.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }
}

impl std::fmt::Debug for DataSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSynchronizer")
            .field("instance_key", &self.inner.config.instance_key)
            .field("running", &self.is_running())
            .finish()
    }
}

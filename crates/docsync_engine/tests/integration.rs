//! Integration tests for the synchronizer against in-memory adapters.

use docsync_engine::{
    Adapters, DataSynchronizer, HandlerError, MemoryLocalStore, MockRemoteService, PendingWrite,
    RemoteError, RetryConfig, StaticAuthMonitor, StaticNetworkMonitor, SyncError, SyncHandlers,
    SynchronizerConfig,
};
use docsync_protocol::{
    ChangeEvent, ConflictPolicy, ConflictResolution, Document, DocumentId, Namespace,
    OperationType, ResolutionKind, SerdeCodec, Value,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

struct Harness {
    local: Arc<MemoryLocalStore>,
    remote: Arc<MockRemoteService>,
    network: Arc<StaticNetworkMonitor>,
    auth: Arc<StaticAuthMonitor>,
    sync: DataSynchronizer,
}

fn harness_with(config: SynchronizerConfig) -> Harness {
    let local = Arc::new(MemoryLocalStore::new());
    let remote = Arc::new(MockRemoteService::new());
    let network = Arc::new(StaticNetworkMonitor::new(true));
    let auth = Arc::new(StaticAuthMonitor::new(true));
    let adapters = Adapters::new(local.clone(), remote.clone(), network.clone(), auth.clone());
    let sync = DataSynchronizer::new(config, adapters).unwrap();
    Harness {
        local,
        remote,
        network,
        auth,
        sync,
    }
}

/// Background passes are effectively disabled; tests drive passes by hand.
fn harness() -> Harness {
    harness_with(SynchronizerConfig::new("test").with_sync_interval(Duration::from_secs(3600)))
}

fn ns() -> Namespace {
    Namespace::new("foo", "bar")
}

fn doc(id: &str, value: &str) -> Document {
    Document::with_id(&id.into()).field("v", value)
}

fn server_wins() -> SyncHandlers<Document> {
    SyncHandlers::documents().with_conflict_handler(ConflictPolicy::ServerWins)
}

fn field(document: &Document, name: &str) -> Option<String> {
    match document.get(name)? {
        Value::Text(text) => Some(text.clone()),
        _ => None,
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn configure_is_idempotent() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    h.sync.configure(&ns(), server_wins()).unwrap();

    assert_eq!(h.remote.subscribe_count(&ns()), 1);
    assert_eq!(h.remote.active_subscriptions(&ns()), 1);
    assert_eq!(h.sync.stats().loop_starts, 1);
    assert!(h.sync.is_running());
    assert!(h.sync.is_configured());
    assert!(h.sync.get_namespace_config(&ns()).is_listening());
}

#[test]
fn configure_without_conflict_handler_fails() {
    let h = harness();
    let err = h.sync.configure(&ns(), SyncHandlers::documents()).unwrap_err();

    assert!(matches!(err, SyncError::Configuration(_)));
    assert!(!h.sync.is_configured());
    assert!(!h.sync.is_running());
    assert_eq!(h.remote.subscribe_count(&ns()), 0);
}

#[test]
fn failed_subscription_is_retried_by_a_pass() {
    let h = harness_with(
        SynchronizerConfig::new("retry")
            .with_sync_interval(Duration::from_secs(3600))
            .with_listen_retry(RetryConfig::immediate()),
    );
    h.remote.fail_next_subscribe(RemoteError::transient("stream unavailable"));
    h.sync.configure(&ns(), server_wins()).unwrap();
    assert!(!h.sync.get_namespace_config(&ns()).is_listening());

    h.sync.do_sync_pass();
    assert!(h.sync.get_namespace_config(&ns()).is_listening());
    assert_eq!(h.remote.subscribe_count(&ns()), 2);
    assert_eq!(h.remote.active_subscriptions(&ns()), 1);
}

#[test]
fn unbounded_listen_backoff_waits_without_overflow() {
    let h = harness_with(
        SynchronizerConfig::new("backoff")
            .with_sync_interval(Duration::from_secs(3600))
            .with_listen_retry(
                RetryConfig::new(0)
                    .with_initial_delay(Duration::MAX)
                    .with_max_delay(Duration::MAX),
            ),
    );
    h.remote.fail_next_subscribe(RemoteError::transient("stream unavailable"));
    h.sync.configure(&ns(), server_wins()).unwrap();
    assert!(!h.sync.get_namespace_config(&ns()).is_listening());

    h.sync.do_sync_pass();
    assert_eq!(h.remote.subscribe_count(&ns()), 1, "retry waits for the backoff");

    assert!(h.sync.trigger_listening_to_namespace(&ns()));
    assert!(h.sync.get_namespace_config(&ns()).is_listening());
}

#[test]
fn stop_is_idempotent_and_restartable() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();

    assert!(h.sync.stop());
    assert!(!h.sync.stop());
    assert!(!h.sync.is_running());
    assert_eq!(h.remote.active_subscriptions(&ns()), 1, "stop keeps subscriptions");

    assert!(h.sync.start());
    assert!(!h.sync.start());
    assert_eq!(h.sync.stats().loop_starts, 2);
}

// ============================================================================
// Local writes
// ============================================================================

#[test]
fn local_insert_is_pending_until_pushed() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();

    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();
    assert_eq!(handle.pending_write(), Some(PendingWrite::Insert));
    assert_eq!(handle.config().unwrap().version(), None);

    let report = h.sync.do_sync_pass();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.applied, 0);

    let config = handle.config().unwrap();
    assert_eq!(config.pending_write(), None);
    let remote = h.remote.document(&ns(), &id).unwrap();
    assert_eq!(config.version(), Some(remote.version_marker().unwrap()));
    assert!(config.is_synchronized());
}

#[test]
fn frozen_document_is_not_pushed_until_unfrozen() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();
    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();

    handle.set_frozen(true).unwrap();
    h.sync.reload_config().unwrap();
    assert!(handle.is_frozen());

    h.sync.do_sync_pass();
    assert_eq!(h.remote.insert_count(&id), 0);
    assert_eq!(handle.pending_write(), Some(PendingWrite::Insert));

    handle.set_frozen(false).unwrap();
    h.sync.reload_config().unwrap();
    h.sync.do_sync_pass();
    assert_eq!(h.remote.insert_count(&id), 1);
    assert!(h.remote.document(&ns(), &id).is_some());

    h.sync.do_sync_pass();
    assert_eq!(h.remote.insert_count(&id), 1);
}

#[test]
fn local_write_failure_records_nothing() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    h.local.set_fail_writes(true);

    let err = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap_err();
    assert!(matches!(err, SyncError::LocalWrite(_)));
    assert!(h.sync.get_synchronized_documents(&ns()).is_empty());

    h.sync.do_sync_pass();
    assert!(h.remote.calls().iter().all(|call| !call.is_write()));
}

#[test]
fn local_delete_reaches_remote_and_untracks() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();
    h.sync.do_sync_pass();

    assert!(h.sync.delete_one_by_id(&ns(), &id).unwrap());
    assert!(!h.sync.delete_one_by_id(&ns(), &id).unwrap());
    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();
    assert_eq!(handle.pending_write(), Some(PendingWrite::Delete));

    h.sync.do_sync_pass();
    assert!(h.remote.document(&ns(), &id).is_none());
    assert!(h.sync.get_namespace_config(&ns()).document(&id).is_none());
}

#[test]
fn insert_then_delete_offline_never_reaches_remote() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();
    h.sync.delete_one_by_id(&ns(), &id).unwrap();

    assert!(h.sync.get_synchronized_documents(&ns()).is_empty());
    h.sync.do_sync_pass();
    assert_eq!(h.remote.write_count(&id), 0);
}

#[test]
fn update_merges_into_local_document() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();
    h.sync.do_sync_pass();

    let updated = h
        .sync
        .update_one_by_id(&ns(), &id, &Document::new().field("extra", "yes"))
        .unwrap();
    assert!(updated);
    assert!(!h
        .sync
        .update_one_by_id(&ns(), &"missing".into(), &Document::new())
        .unwrap());

    h.sync.do_sync_pass();
    let remote = h.remote.document(&ns(), &id).unwrap();
    assert_eq!(field(&remote, "v").as_deref(), Some("one"));
    assert_eq!(field(&remote, "extra").as_deref(), Some("yes"));
}

// ============================================================================
// Remote failures
// ============================================================================

#[test]
fn transient_failure_keeps_pending_write() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    h.remote.fail_next_write(RemoteError::transient("timeout"));
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();

    let report = h.sync.do_sync_pass();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.frozen, 0);
    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();
    assert_eq!(handle.pending_write(), Some(PendingWrite::Insert));
    assert!(h.sync.stats().last_error.is_some());

    let report = h.sync.do_sync_pass();
    assert_eq!(report.pushed, 1);
    assert_eq!(handle.pending_write(), None);
}

#[test]
fn rejected_write_freezes_and_notifies() {
    let h = harness();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    h.sync
        .configure(
            &ns(),
            server_wins().with_error_listener(move |id: &DocumentId, error: &SyncError| {
                sink.lock().push((id.clone(), error.to_string()));
            }),
        )
        .unwrap();
    h.remote.fail_next_write(RemoteError::rejected("schema violation"));
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();

    let report = h.sync.do_sync_pass();
    assert_eq!(report.frozen, 1);
    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();
    assert!(handle.is_frozen());
    assert!(handle
        .config()
        .unwrap()
        .last_error()
        .unwrap()
        .contains("schema violation"));

    let errors = errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, id);

    h.sync.do_sync_pass();
    assert_eq!(h.remote.insert_count(&id), 1, "frozen documents are not retried");
}

#[test]
fn offline_pass_skips_remote_work() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    h.sync.stop();
    h.network.set_connected(false);
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();

    let report = h.sync.do_sync_pass();
    assert!(report.remote_skipped);
    assert_eq!(h.remote.write_count(&id), 0);

    h.network.set_connected(true);
    h.auth.set_logged_in(false);
    assert!(h.sync.do_sync_pass().remote_skipped);

    h.auth.set_logged_in(true);
    let report = h.sync.do_sync_pass();
    assert!(!report.remote_skipped);
    assert!(h.remote.document(&ns(), &id).is_some());
}

// ============================================================================
// Conflicts
// ============================================================================

fn conflicting_harness(
    handler: impl Fn(
            &DocumentId,
            &ChangeEvent<Document>,
            &ChangeEvent<Document>,
        ) -> Result<ConflictResolution<Document>, HandlerError>
        + Send
        + Sync
        + 'static,
) -> (Harness, DocumentId) {
    let h = harness();
    h.sync
        .configure(&ns(), SyncHandlers::documents().with_conflict_handler(handler))
        .unwrap();
    h.remote.external_write(&ns(), doc("X", "remote"));
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "local")).unwrap();
    (h, id)
}

#[test]
fn conflict_handler_runs_once_per_conflict() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let (h, id) = conflicting_harness(move |_id, local, remote| {
        counter.fetch_add(1, Ordering::SeqCst);
        assert!(local.has_uncommitted_writes);
        assert!(!remote.has_uncommitted_writes);
        Ok(ConflictResolution::AcceptRemote)
    });

    let report = h.sync.do_sync_pass();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution, ResolutionKind::AcceptRemote);

    let local = h.sync.find_one_by_id(&ns(), &id).unwrap().unwrap();
    assert_eq!(field(&local, "v").as_deref(), Some("remote"));
    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();
    assert_eq!(handle.pending_write(), None);

    h.sync.do_sync_pass();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.sync.stats().conflicts_resolved, 1);
}

#[test]
fn keep_local_pushes_local_version() {
    let (h, id) = conflicting_harness(|_id, _local, _remote| Ok(ConflictResolution::KeepLocal));

    let report = h.sync.do_sync_pass();
    assert_eq!(report.conflicts[0].resolution, ResolutionKind::KeepLocal);

    let remote = h.remote.document(&ns(), &id).unwrap();
    assert_eq!(field(&remote, "v").as_deref(), Some("local"));
    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();
    assert_eq!(handle.pending_write(), None);
    assert_eq!(
        handle.config().unwrap().version(),
        Some(remote.version_marker().unwrap())
    );
}

#[test]
fn merge_result_is_applied_on_both_sides() {
    let (h, id) = conflicting_harness(|_id, local, remote| {
        let local = local.full_document.as_ref().ok_or("local deleted")?;
        let remote = remote.full_document.as_ref().ok_or("remote deleted")?;
        let merged = Document::new()
            .field("v", "merged")
            .field("from_local", local.get("v").cloned().unwrap_or(Value::Null))
            .field("from_remote", remote.get("v").cloned().unwrap_or(Value::Null));
        Ok(ConflictResolution::Merge(Some(merged)))
    });

    h.sync.do_sync_pass();
    let remote = h.remote.document(&ns(), &id).unwrap();
    let local = h.sync.find_one_by_id(&ns(), &id).unwrap().unwrap();
    assert_eq!(remote, local);
    assert_eq!(field(&remote, "v").as_deref(), Some("merged"));
    assert_eq!(field(&remote, "from_local").as_deref(), Some("local"));
    assert_eq!(remote.id(), Some(id));
}

#[test]
fn failing_conflict_handler_freezes_document() {
    let (h, id) = conflicting_harness(|_id, _local, _remote| Err("cannot decide".into()));

    let report = h.sync.do_sync_pass();
    assert_eq!(report.frozen, 1);
    assert!(report.conflicts.is_empty());
    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();
    assert!(handle.is_frozen());
    assert_eq!(handle.pending_write(), Some(PendingWrite::Insert));
}

#[test]
fn buffered_remote_change_conflicting_with_pending_write_is_resolved_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let h = harness();
    h.sync
        .configure(
            &ns(),
            SyncHandlers::documents().with_conflict_handler(
                move |_id: &DocumentId,
                      local: &ChangeEvent<Document>,
                      remote: &ChangeEvent<Document>|
                      -> Result<ConflictResolution<Document>, HandlerError> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert!(local.has_uncommitted_writes);
                    let remote = remote.full_document.as_ref().ok_or("remote deleted")?;
                    assert_eq!(field(remote, "v").as_deref(), Some("remote"));
                    Ok(ConflictResolution::AcceptRemote)
                },
            ),
        )
        .unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();
    h.sync.do_sync_pass();

    // The push fails, so the buffered remote change meets the pending write.
    h.sync
        .update_one_by_id(&ns(), &id, &Document::new().field("v", "local"))
        .unwrap();
    h.remote.external_write(&ns(), doc("X", "remote"));
    h.remote.fail_next_write(RemoteError::transient("timeout"));

    let report = h.sync.do_sync_pass();
    assert_eq!(report.pushed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution, ResolutionKind::AcceptRemote);

    let local = h.sync.find_one_by_id(&ns(), &id).unwrap().unwrap();
    assert_eq!(field(&local, "v").as_deref(), Some("remote"));
    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();
    assert_eq!(handle.pending_write(), None);
    let remote = h.remote.document(&ns(), &id).unwrap();
    assert_eq!(
        handle.config().unwrap().version(),
        Some(remote.version_marker().unwrap())
    );

    h.sync.do_sync_pass();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_passes_do_not_overlap() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();
    h.remote.set_latency(Duration::from_millis(20));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let sync = h.sync.clone();
            thread::spawn(move || sync.do_sync_pass())
        })
        .collect();
    let pushed: u64 = workers.into_iter().map(|w| w.join().unwrap().pushed).sum();

    assert_eq!(pushed, 1);
    assert_eq!(h.remote.insert_count(&id), 1);
    assert!(h.remote.max_concurrent_calls() <= 1);
}

// ============================================================================
// Remote changes
// ============================================================================

#[test]
fn remote_changes_are_applied_and_reported() {
    let h = harness();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    h.sync
        .configure(
            &ns(),
            server_wins().with_change_event_listener(
                move |id: &DocumentId, event: &ChangeEvent<Document>| {
                    sink.lock()
                        .push((id.clone(), event.operation_type, event.has_uncommitted_writes));
                },
            ),
        )
        .unwrap();

    h.remote.external_write(&ns(), doc("Y", "remote"));
    let report = h.sync.do_sync_pass();
    assert_eq!(report.applied, 1);

    let local = h.sync.find_one_by_id(&ns(), &"Y".into()).unwrap().unwrap();
    assert_eq!(field(&local, "v").as_deref(), Some("remote"));
    assert_eq!(
        *events.lock(),
        vec![(DocumentId::new("Y"), OperationType::Insert, false)]
    );
    assert!(h.sync.get_namespace_config(&ns()).document(&"Y".into()).is_some());

    h.remote.external_delete(&ns(), &"Y".into());
    h.sync.do_sync_pass();
    assert!(h.sync.find_one_by_id(&ns(), &"Y".into()).unwrap().is_none());
    assert!(h.sync.get_namespace_config(&ns()).document(&"Y".into()).is_none());
    assert_eq!(events.lock().len(), 2);
}

#[test]
fn own_writes_are_not_applied_twice() {
    let h = harness();
    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    h.sync
        .configure(
            &ns(),
            server_wins().with_change_event_listener(
                move |_id: &DocumentId, _event: &ChangeEvent<Document>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            ),
        )
        .unwrap();

    h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();
    assert_eq!(events.load(Ordering::SeqCst), 1, "local write is reported");

    let report = h.sync.do_sync_pass();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(events.load(Ordering::SeqCst), 1, "echo is suppressed");
}

#[test]
fn frozen_document_without_pending_write_follows_remote() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();
    h.sync.do_sync_pass();
    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();
    handle.set_frozen(true).unwrap();
    h.sync.reload_config().unwrap();

    h.remote.external_write(&ns(), doc("X", "remote"));
    let report = h.sync.do_sync_pass();
    assert_eq!(report.applied, 1);
    let local = h.sync.find_one_by_id(&ns(), &id).unwrap().unwrap();
    assert_eq!(field(&local, "v").as_deref(), Some("remote"));
    assert!(handle.is_frozen());
    assert_eq!(
        handle.config().unwrap().version(),
        Some(local.version_marker().unwrap())
    );

    h.remote.external_delete(&ns(), &id);
    let report = h.sync.do_sync_pass();
    assert_eq!(report.applied, 1);
    assert!(h.sync.find_one_by_id(&ns(), &id).unwrap().is_none());
    assert!(handle.is_frozen(), "frozen documents stay tracked");
    assert_eq!(handle.config().unwrap().version(), None);
}

#[test]
fn frozen_document_with_pending_write_only_reports_remote_changes() {
    let h = harness();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    h.sync
        .configure(
            &ns(),
            server_wins().with_change_event_listener(
                move |id: &DocumentId, event: &ChangeEvent<Document>| {
                    let value = event.full_document.as_ref().and_then(|d| field(d, "v"));
                    sink.lock().push((id.clone(), value));
                },
            ),
        )
        .unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "local")).unwrap();
    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();
    handle.set_frozen(true).unwrap();
    h.sync.reload_config().unwrap();
    events.lock().clear();

    h.remote.external_write(&ns(), doc("X", "remote"));
    let report = h.sync.do_sync_pass();
    assert_eq!(report.applied, 0);
    assert!(report.conflicts.is_empty());
    assert_eq!(*events.lock(), vec![(id.clone(), Some("remote".to_string()))]);

    let local = h.sync.find_one_by_id(&ns(), &id).unwrap().unwrap();
    assert_eq!(field(&local, "v").as_deref(), Some("local"));
    assert!(handle.is_frozen());
    assert_eq!(handle.pending_write(), Some(PendingWrite::Insert));
    assert_eq!(h.remote.insert_count(&id), 0);

    h.sync.do_sync_pass();
    assert_eq!(events.lock().len(), 1);
}

#[test]
fn remote_events_per_pass_are_limited() {
    let h = harness_with(
        SynchronizerConfig::new("limit")
            .with_sync_interval(Duration::from_secs(3600))
            .with_max_events_per_pass(2),
    );
    h.sync.configure(&ns(), server_wins()).unwrap();
    for id in ["A", "B", "C", "D", "E"] {
        h.remote.external_write(&ns(), doc(id, "remote"));
    }

    let applied: Vec<u64> = (0..4).map(|_| h.sync.do_sync_pass().applied).collect();
    assert_eq!(applied, vec![2, 2, 1, 0]);
    assert_eq!(h.local.document_count(&ns()), 5);
}

#[test]
fn added_document_is_fetched_from_remote() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    let id = DocumentId::new("Z");

    // Written before the engine tracks it, then buffered events dropped.
    h.remote.external_write(&ns(), doc("Z", "remote"));
    h.sync.desync_document(&ns(), &id).unwrap();

    let handle = h
        .sync
        .get_namespace_config(&ns())
        .add_synchronized_document(&id)
        .unwrap();
    h.sync.do_sync_pass();

    let local = h.sync.find_one_by_id(&ns(), &id).unwrap().unwrap();
    assert_eq!(field(&local, "v").as_deref(), Some("remote"));
    assert!(handle.config().unwrap().version().is_some());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    #[serde(rename = "_id")]
    id: String,
    text: String,
}

#[test]
fn typed_listener_receives_decoded_documents() {
    let h = harness();
    let notes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notes);
    h.sync
        .configure(
            &ns(),
            SyncHandlers::new(SerdeCodec::<Note>::new())
                .with_conflict_handler(ConflictPolicy::ServerWins)
                .with_change_event_listener(move |_id: &DocumentId, event: &ChangeEvent<Note>| {
                    sink.lock().extend(event.full_document.clone());
                }),
        )
        .unwrap();

    h.remote
        .external_write(&ns(), Document::with_id(&"n1".into()).field("text", "hello"));
    h.sync.do_sync_pass();

    assert_eq!(
        *notes.lock(),
        vec![Note {
            id: "n1".into(),
            text: "hello".into()
        }]
    );
}

// ============================================================================
// Durable config
// ============================================================================

#[test]
fn reload_restores_durable_state_and_keeps_handlers() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();
    let handle = h.sync.get_namespace_config(&ns()).document(&id).unwrap();

    handle.set_frozen(true).unwrap();
    assert!(!handle.is_frozen());
    h.sync.reload_config().unwrap();

    assert!(handle.is_frozen());
    assert!(h.sync.is_configured());
    assert!(h.sync.get_namespace_config(&ns()).is_listening());
}

#[test]
fn new_synchronizer_resumes_pending_writes() {
    let local = Arc::new(MemoryLocalStore::new());
    let remote = Arc::new(MockRemoteService::new());
    let adapters = || {
        Adapters::new(
            local.clone(),
            remote.clone(),
            Arc::new(StaticNetworkMonitor::new(true)),
            Arc::new(StaticAuthMonitor::new(true)),
        )
    };
    let config = SynchronizerConfig::new("resume").with_sync_interval(Duration::from_secs(3600));

    let first = DataSynchronizer::new(config.clone(), adapters()).unwrap();
    let id = first.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();
    drop(first);

    let second = DataSynchronizer::new(config, adapters()).unwrap();
    second.configure(&ns(), server_wins()).unwrap();
    let report = second.do_sync_pass();
    assert_eq!(report.pushed, 1);
    assert!(remote.document(&ns(), &id).is_some());
}

#[test]
fn desync_removes_tracking_and_local_copy() {
    let h = harness();
    h.sync.configure(&ns(), server_wins()).unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();
    h.sync.do_sync_pass();

    assert!(h.sync.desync_document(&ns(), &id).unwrap());
    assert!(!h.sync.desync_document(&ns(), &id).unwrap());
    assert!(h.sync.find_one_by_id(&ns(), &id).unwrap().is_none());
    assert!(h.sync.get_synchronized_documents(&ns()).is_empty());
    assert!(h.remote.document(&ns(), &id).is_some());
}

// ============================================================================
// Background loop
// ============================================================================

#[test]
fn background_loop_eventually_syncs() {
    let h = harness_with(
        SynchronizerConfig::new("loop").with_sync_interval(Duration::from_millis(20)),
    );
    h.sync.configure(&ns(), server_wins()).unwrap();
    let id = h.sync.insert_one_and_sync(&ns(), doc("X", "one")).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.remote.document(&ns(), &id).is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(h.remote.document(&ns(), &id).is_some());
    assert!(h.sync.stats().passes_completed >= 1);

    assert!(h.sync.stop());
    assert_eq!(h.network.listener_count(), 1);
    drop(h.sync);
    assert_eq!(h.network.listener_count(), 0);
}

#[test]
fn stopping_loop_mid_pass_requeues_unapplied_events() {
    let h = harness_with(
        SynchronizerConfig::new("interrupt").with_sync_interval(Duration::from_millis(10)),
    );
    h.sync.configure(&ns(), server_wins()).unwrap();
    assert!(h.sync.stop());
    for i in 0..5 {
        h.remote.external_write(&ns(), doc(&format!("D{i}"), "remote"));
    }
    h.local.set_write_latency(Duration::from_millis(100));

    assert!(h.sync.start());
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.local.document_count(&ns()) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(h.sync.stop());

    let applied_by_loop = h.local.document_count(&ns());
    assert!(applied_by_loop >= 1 && applied_by_loop < 5, "applied {applied_by_loop}");
    assert_eq!(h.sync.stats().passes_interrupted, 1);

    h.local.set_write_latency(Duration::ZERO);
    let report = h.sync.do_sync_pass();
    assert_eq!(report.applied as usize, 5 - applied_by_loop);
    assert_eq!(h.local.document_count(&ns()), 5);
    assert_eq!(h.sync.stats().remote_events_applied, 5);
}

#[test]
fn listener_can_stop_loop_waiting_on_explicit_pass() {
    let h = harness_with(
        SynchronizerConfig::new("reentrant").with_sync_interval(Duration::from_millis(10)),
    );
    let slot: Arc<Mutex<Option<DataSynchronizer>>> = Arc::new(Mutex::new(None));
    let stopper = Arc::clone(&slot);
    h.sync
        .configure(
            &ns(),
            server_wins().with_change_event_listener(
                move |id: &DocumentId, _event: &ChangeEvent<Document>| {
                    if *id != DocumentId::new("Y") {
                        return;
                    }
                    let sync = stopper.lock().take();
                    if let Some(sync) = sync {
                        sync.stop();
                    }
                },
            ),
        )
        .unwrap();
    assert!(h.sync.stop());

    let pending = h.sync.insert_one_and_sync(&ns(), doc("Z", "local")).unwrap();
    h.remote.external_write(&ns(), doc("Y", "remote"));
    h.remote.set_latency(Duration::from_millis(300));
    *slot.lock() = Some(h.sync.clone());

    let (tx, rx) = mpsc::channel();
    let sync = h.sync.clone();
    let pass = thread::spawn(move || {
        let _ = tx.send(sync.do_sync_pass());
    });

    // The loop wakes while the explicit pass holds the pass lock.
    thread::sleep(Duration::from_millis(50));
    assert!(h.sync.start());
    h.sync.wake();

    let report = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("explicit pass finished");
    pass.join().unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.applied, 1);
    assert!(slot.lock().is_none(), "listener ran");
    assert!(!h.sync.is_running());
    assert!(h.remote.document(&ns(), &pending).is_some());
}

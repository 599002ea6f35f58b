//! # docsync engine
//!
//! Offline-first synchronization of documents between a local store and a
//! remote document service.
//!
//! This crate provides:
//! - `DataSynchronizer`, the engine that reconciles both sides
//! - Per-namespace and per-document synchronization configs
//! - Pluggable local store, remote service, network and auth adapters
//! - Conflict handlers, change event listeners and error listeners
//! - In-memory adapters for tests and embedding
//!
//! ## Architecture
//!
//! Local writes go to the local store first and are recorded as a pending
//! write on the document's config. A sync pass pushes pending writes, applies
//! buffered remote change events and fetches documents whose remote version
//! is unknown. A background thread runs a pass every `sync_interval`.
//!
//! ## Key Invariants
//!
//! - Every remote change is applied at most once
//! - At most one sync pass runs at a time
//! - Frozen documents are never pushed
//! - A conflict handler is invoked once per conflict
//! - Configs are persisted before the write they describe is acknowledged

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapters;
mod config;
mod doc_config;
mod error;
mod handlers;
mod ingestion;
mod memory;
mod ns_config;
mod runner;
mod synchronizer;

pub use adapters::{
    Adapters, AuthMonitor, Filter, LocalStore, NetworkListenerId, NetworkMonitor,
    NetworkStateListener, RemoteService, RemoteSnapshot, RemoteWriteAck, Subscription,
};
pub use config::{RetryConfig, SynchronizerConfig};
pub use doc_config::{DocumentConfigHandle, DocumentSynchronizationConfig, PendingWrite};
pub use error::{
    LocalStoreError, LocalStoreResult, RemoteError, RemoteResult, SyncError, SyncResult,
};
pub use handlers::{ChangeEventListener, ConflictHandler, ErrorListener, HandlerError, SyncHandlers};
pub use ingestion::ChangeEventSink;
pub use memory::{
    MemoryLocalStore, MockRemoteService, RemoteCall, StaticAuthMonitor, StaticNetworkMonitor,
};
pub use ns_config::NamespaceConfigHandle;
pub use synchronizer::{DataSynchronizer, SyncPassReport, SyncStats};

//! Conflict records and resolutions.

use crate::document::{DocumentId, VersionMarker};
use crate::namespace::Namespace;

/// Outcome chosen by a conflict handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution<T> {
    /// Keep the local state and overwrite the remote.
    KeepLocal,
    /// Accept the remote state and overwrite the local copy.
    AcceptRemote,
    /// Use the given merged document. `None` means the document is deleted.
    Merge(Option<T>),
}

impl<T> ConflictResolution<T> {
    /// Returns the kind of this resolution without its payload.
    pub fn kind(&self) -> ResolutionKind {
        match self {
            ConflictResolution::KeepLocal => ResolutionKind::KeepLocal,
            ConflictResolution::AcceptRemote => ResolutionKind::AcceptRemote,
            ConflictResolution::Merge(_) => ResolutionKind::Merge,
        }
    }

    /// Converts the merged document, if any.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ConflictResolution<U> {
        match self {
            ConflictResolution::KeepLocal => ConflictResolution::KeepLocal,
            ConflictResolution::AcceptRemote => ConflictResolution::AcceptRemote,
            ConflictResolution::Merge(merged) => ConflictResolution::Merge(merged.map(f)),
        }
    }
}

/// Payload-free view of a [`ConflictResolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionKind {
    /// Local state won.
    KeepLocal,
    /// Remote state won.
    AcceptRemote,
    /// A merged document won.
    Merge,
}

/// Built-in resolution policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Remote state always wins.
    #[default]
    ServerWins,
    /// Local state always wins.
    ClientWins,
}

impl ConflictPolicy {
    /// Returns the resolution this policy picks for any conflict.
    pub fn resolution<T>(&self) -> ConflictResolution<T> {
        match self {
            ConflictPolicy::ServerWins => ConflictResolution::AcceptRemote,
            ConflictPolicy::ClientWins => ConflictResolution::KeepLocal,
        }
    }
}

/// A resolved conflict, as reported by a sync pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Namespace of the document.
    pub namespace: Namespace,
    /// Identifier of the document.
    pub document_id: DocumentId,
    /// Marker of the local state, `None` if deleted locally.
    pub local_version: Option<VersionMarker>,
    /// Marker of the remote state, `None` if deleted remotely.
    pub remote_version: Option<VersionMarker>,
    /// Resolution that was applied.
    pub resolution: ResolutionKind,
}

impl Conflict {
    /// Returns true if both sides hold a document.
    pub fn is_update_conflict(&self) -> bool {
        self.local_version.is_some() && self.remote_version.is_some()
    }

    /// Returns true if exactly one side deleted the document.
    pub fn is_update_delete_conflict(&self) -> bool {
        self.local_version.is_some() != self.remote_version.is_some()
    }
}

//! Change events observed on documents.

use crate::document::{Document, DocumentId, VersionMarker};
use crate::error::CodecResult;
use crate::namespace::Namespace;

/// Kind of mutation a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Document was inserted.
    Insert,
    /// Document fields were updated.
    Update,
    /// Document was replaced as a whole.
    Replace,
    /// Document was deleted.
    Delete,
}

impl OperationType {
    /// Returns true if the operation leaves a document behind.
    pub fn carries_document(&self) -> bool {
        !matches!(self, OperationType::Delete)
    }

    /// Returns the name used by change streams for this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
        }
    }

    /// Parses a change-stream operation name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "insert" => Some(OperationType::Insert),
            "update" => Some(OperationType::Update),
            "replace" => Some(OperationType::Replace),
            "delete" => Some(OperationType::Delete),
            _ => None,
        }
    }
}

/// A single observed mutation of a document.
///
/// Remote events carry the sequence the remote assigned to the write; it
/// increases monotonically within a namespace. Events describing local writes
/// that the remote has not acknowledged yet have `has_uncommitted_writes` set
/// and a sequence of zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    /// Remote sequence of the write (0 for local events).
    pub sequence: u64,
    /// Type of change.
    pub operation_type: OperationType,
    /// Namespace of the document.
    pub namespace: Namespace,
    /// Identifier of the changed document.
    pub document_key: DocumentId,
    /// The document after the change. `None` for deletes.
    pub full_document: Option<T>,
    /// Whether this describes a local write not yet acknowledged remotely.
    pub has_uncommitted_writes: bool,
}

impl<T> ChangeEvent<T> {
    /// Creates an insert event.
    pub fn insert(
        sequence: u64,
        namespace: Namespace,
        document_key: DocumentId,
        document: T,
    ) -> Self {
        Self {
            sequence,
            operation_type: OperationType::Insert,
            namespace,
            document_key,
            full_document: Some(document),
            has_uncommitted_writes: false,
        }
    }

    /// Creates an update event.
    pub fn update(
        sequence: u64,
        namespace: Namespace,
        document_key: DocumentId,
        document: T,
    ) -> Self {
        Self {
            operation_type: OperationType::Update,
            ..Self::insert(sequence, namespace, document_key, document)
        }
    }

    /// Creates a replace event.
    pub fn replace(
        sequence: u64,
        namespace: Namespace,
        document_key: DocumentId,
        document: T,
    ) -> Self {
        Self {
            operation_type: OperationType::Replace,
            ..Self::insert(sequence, namespace, document_key, document)
        }
    }

    /// Creates a delete event.
    pub fn delete(sequence: u64, namespace: Namespace, document_key: DocumentId) -> Self {
        Self {
            sequence,
            operation_type: OperationType::Delete,
            namespace,
            document_key,
            full_document: None,
            has_uncommitted_writes: false,
        }
    }

    /// Marks this event as describing an unacknowledged local write.
    pub fn with_uncommitted_writes(mut self) -> Self {
        self.has_uncommitted_writes = true;
        self
    }

    /// Returns a copy of this event with the uncommitted writes flag cleared.
    pub fn without_uncommitted_writes(mut self) -> Self {
        self.has_uncommitted_writes = false;
        self
    }

    /// Converts the carried document with an infallible mapping.
    pub fn map_document<U>(self, f: impl FnOnce(T) -> U) -> ChangeEvent<U> {
        ChangeEvent {
            sequence: self.sequence,
            operation_type: self.operation_type,
            namespace: self.namespace,
            document_key: self.document_key,
            full_document: self.full_document.map(f),
            has_uncommitted_writes: self.has_uncommitted_writes,
        }
    }

    /// Converts the carried document with a fallible mapping.
    pub fn try_map_document<U, E>(
        self,
        f: impl FnOnce(T) -> Result<U, E>,
    ) -> Result<ChangeEvent<U>, E> {
        let full_document = self.full_document.map(f).transpose()?;
        Ok(ChangeEvent {
            sequence: self.sequence,
            operation_type: self.operation_type,
            namespace: self.namespace,
            document_key: self.document_key,
            full_document,
            has_uncommitted_writes: self.has_uncommitted_writes,
        })
    }
}

impl ChangeEvent<Document> {
    /// Returns the version marker of the carried document, `None` for deletes.
    pub fn version_marker(&self) -> CodecResult<Option<VersionMarker>> {
        self.full_document
            .as_ref()
            .map(Document::version_marker)
            .transpose()
    }
}

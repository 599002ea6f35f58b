//! # docsync protocol
//!
//! Data types shared by the docsync engine and its collaborators.
//!
//! This crate provides:
//! - `Namespace`, `DocumentId`, `Document` and `VersionMarker`
//! - `ChangeEvent` for observed mutations
//! - `ConflictResolution`, `ConflictPolicy` and `Conflict`
//! - `DocumentCodec` implementations for raw documents and serde types
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_event;
mod codec;
mod conflict;
mod document;
mod error;
mod namespace;

pub use change_event::{ChangeEvent, OperationType};
pub use codec::{DocumentCodec, DocumentPassthrough, SerdeCodec};
pub use conflict::{Conflict, ConflictPolicy, ConflictResolution, ResolutionKind};
pub use document::{Document, DocumentId, VersionMarker, ID_FIELD};
pub use error::{CodecError, CodecResult};
pub use namespace::Namespace;

/// Re-export of the CBOR value type documents are made of.
pub use ciborium::Value;

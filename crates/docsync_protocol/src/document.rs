//! Documents, document identifiers and version markers.

use crate::error::{CodecError, CodecResult};
use ciborium::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the identifier field every synchronized document carries.
pub const ID_FIELD: &str = "_id";

/// Identifier of a document, unique within its namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Creates an identifier from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A document: an ordered map from field names to CBOR values.
///
/// Fields are kept sorted by name, so two documents with the same content
/// always encode to the same bytes regardless of the order fields were set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: BTreeMap<String, Value>,
}

impl Document {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a document holding only an `_id` field.
    pub fn with_id(id: &DocumentId) -> Self {
        let mut document = Self::new();
        document.set_id(id);
        document
    }

    /// Builder-style field setter.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Returns the document identifier if `_id` holds text.
    pub fn id(&self) -> Option<DocumentId> {
        self.fields
            .get(ID_FIELD)
            .and_then(Value::as_text)
            .map(DocumentId::new)
    }

    /// Sets the `_id` field.
    pub fn set_id(&mut self, id: &DocumentId) {
        self.fields
            .insert(ID_FIELD.to_string(), Value::Text(id.as_str().to_string()));
    }

    /// Sets a field, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    /// Returns a field value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Removes a field, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Overwrites fields with those of `update`. The `_id` field is never changed.
    pub fn merge(&mut self, update: &Document) {
        for (name, value) in &update.fields {
            if name != ID_FIELD {
                self.fields.insert(name.clone(), value.clone());
            }
        }
    }

    /// Iterates over fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Converts a CBOR map value into a document.
    pub fn from_value(value: Value) -> CodecResult<Self> {
        let pairs = value
            .into_map()
            .map_err(|_| CodecError::invalid_structure("expected map for document"))?;

        let mut fields = BTreeMap::new();
        for (key, value) in pairs {
            let Value::Text(name) = key else {
                return Err(CodecError::invalid_structure("document keys must be text"));
            };
            fields.insert(name, value);
        }
        Ok(Self { fields })
    }

    /// Converts this document into a CBOR map value.
    pub fn into_value(self) -> Value {
        Value::Map(
            self.fields
                .into_iter()
                .map(|(name, value)| (Value::Text(name), value))
                .collect(),
        )
    }

    /// Encodes to CBOR bytes.
    pub fn to_cbor(&self) -> CodecResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR bytes.
    pub fn from_cbor(bytes: &[u8]) -> CodecResult<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
    }

    /// Computes the version marker of this document's current content.
    pub fn version_marker(&self) -> CodecResult<VersionMarker> {
        Ok(VersionMarker::of_bytes(&self.to_cbor()?))
    }
}

/// Opaque token identifying a document state.
///
/// The marker is the SHA-256 digest of the document's CBOR encoding, so equal
/// documents have equal markers and any change yields a different one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionMarker([u8; 32]);

impl VersionMarker {
    /// Creates a marker from raw digest bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Computes the marker of an encoded document.
    pub fn of_bytes(encoded: &[u8]) -> Self {
        Self(Sha256::digest(encoded).into())
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for VersionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for VersionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionMarker({:.8})", self.to_string())
    }
}

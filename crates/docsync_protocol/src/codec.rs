//! Conversion between application types and documents.

use crate::document::Document;
use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Converts between an application type and a [`Document`].
pub trait DocumentCodec<T>: Send + Sync {
    /// Encodes a value into a document.
    fn encode(&self, value: &T) -> CodecResult<Document>;

    /// Decodes a document into a value.
    fn decode(&self, document: &Document) -> CodecResult<T>;
}

/// Identity codec for raw documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentPassthrough;

impl DocumentCodec<Document> for DocumentPassthrough {
    fn encode(&self, value: &Document) -> CodecResult<Document> {
        Ok(value.clone())
    }

    fn decode(&self, document: &Document) -> CodecResult<Document> {
        Ok(document.clone())
    }
}

/// Codec for any serde type whose serialized form is a map.
///
/// The `_id` field must be part of the type (for example a field renamed
/// with `#[serde(rename = "_id")]`) for ids to survive a round trip.
pub struct SerdeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeCodec<T> {
    /// Creates the codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for SerdeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SerdeCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerdeCodec")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> DocumentCodec<T> for SerdeCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> CodecResult<Document> {
        let value = ciborium::Value::serialized(value)
            .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
        Document::from_value(value)
    }

    fn decode(&self, document: &Document) -> CodecResult<T> {
        document
            .clone()
            .into_value()
            .deserialized()
            .map_err(|e| CodecError::decoding_failed(e.to_string()))
    }
}

//! Namespace identifiers.

use crate::error::{CodecError, CodecResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a remote collection: a database name plus a collection name.
///
/// Namespaces are immutable once created and display as `database.collection`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    /// Creates a namespace from its two parts.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parses a `database.collection` string.
    ///
    /// The database name ends at the first dot; the collection name may
    /// itself contain dots.
    pub fn parse(value: &str) -> CodecResult<Self> {
        match value.split_once('.') {
            Some((database, collection)) if !database.is_empty() && !collection.is_empty() => {
                Ok(Self::new(database, collection))
            }
            _ => Err(CodecError::InvalidNamespace {
                value: value.to_string(),
            }),
        }
    }

    /// Returns the database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let ns = Namespace::new("foo", "bar");
        assert_eq!(ns.to_string(), "foo.bar");
        assert_eq!(Namespace::parse("foo.bar").unwrap(), ns);
    }

    #[test]
    fn parse_keeps_dotted_collection() {
        let ns = Namespace::parse("chat.messages.archive").unwrap();
        assert_eq!(ns.database(), "chat");
        assert_eq!(ns.collection(), "messages.archive");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Namespace::parse("nodot").is_err());
        assert!(Namespace::parse(".coll").is_err());
        assert!(Namespace::parse("db.").is_err());
    }
}

//! Error types for chainstore
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Errors fall into a handful of families that the drivers treat differently:
//! decode and handler failures, lineage failures, provider failures (some of
//! which are retried), storage consistency failures, and crash-recovery
//! failures. Everything except an oversized provider response is fatal to the
//! driver that hits it.

use serde::Serialize;
use std::io;
use thiserror::Error;

/// Result type alias for chainstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for chainstore
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A raw key component contained a reserved separator
    #[error("Invalid key component: {0}")]
    InvalidKey(String),

    /// Malformed sortable encoding
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Durable data is inconsistent (index entry without an entity, bad checksum)
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Block lineage could not be resolved (missing parent, deep reorg)
    #[error("Lineage error: {0}")]
    Lineage(String),

    /// Log or block payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// An event handler failed while processing a log
    #[error("Handler error: {}", .0.message)]
    Handler(Box<StructuredError>),

    /// Block or log provider failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider refused a log query because the response would be too large
    #[error("Log response too large for blocks {from_block}..={to_block}")]
    ResponseTooLarge {
        /// First block of the rejected range
        from_block: u64,
        /// Last block of the rejected range
        to_block: u64,
    },

    /// The store has never been finalized
    #[error("No finalized block in store, run backfill first")]
    MissingFinalizedBlock,

    /// Downloaded logs are missing for an indexer
    #[error("Missing logs for {0}, run fetch")]
    MissingLogs(String),

    /// Entity type is not registered
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Index is not defined on the entity type
    #[error("Unknown index {index} on entity type {entity}")]
    UnknownIndex {
        /// Entity type name
        entity: String,
        /// Index name
        index: String,
    },

    /// No indexer registered under the name
    #[error("Unknown indexer: {0}")]
    UnknownIndexer(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Failure injected by a test storage wrapper
    #[error("Injected failure: {0}")]
    InjectedFailure(String),
}

impl Error {
    /// Returns true if the error is a failure injected by a test wrapper.
    pub fn is_injected(&self) -> bool {
        matches!(self, Error::InjectedFailure(_))
    }

    /// Returns true if a retry with a smaller request may succeed.
    pub fn is_response_too_large(&self) -> bool {
        matches!(self, Error::ResponseTooLarge { .. })
    }

    /// Structured payload of a handler failure, if this is one.
    pub fn structured(&self) -> Option<&StructuredError> {
        match self {
            Error::Handler(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// An entity read through a handle while the failing log was processed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedEntity {
    /// Entity type name
    pub entity_type: String,
    /// Entity id
    pub id: String,
    /// Value observed by the handler, `null` if absent
    pub value: serde_json::Value,
}

/// Full context of a failed log dispatch.
///
/// Serialized as JSON by the CLI so the failing log can be replayed by hand.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredError {
    /// Underlying failure message
    pub message: String,
    /// Event signature the log was decoded against
    pub event: Option<String>,
    /// The raw log
    pub log: serde_json::Value,
    /// Decoded event arguments, `null` if decoding failed
    pub args: serde_json::Value,
    /// Entities loaded by the handler before it failed
    pub loaded_entities: Vec<LoadedEntity>,
}

impl StructuredError {
    /// Wrap into an [`Error::Handler`].
    pub fn into_error(self) -> Error {
        Error::Handler(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_error_display_response_too_large() {
        let err = Error::ResponseTooLarge {
            from_block: 10,
            to_block: 20,
        };
        let msg = err.to_string();
        assert!(msg.contains("10..=20"));
        assert!(err.is_response_too_large());
    }

    #[test]
    fn test_error_display_missing_finalized() {
        let msg = Error::MissingFinalizedBlock.to_string();
        assert!(msg.contains("run backfill first"));
    }

    #[test]
    fn test_handler_error_carries_payload() {
        let err = StructuredError {
            message: "balance underflow".to_string(),
            event: Some("Transfer(address,address,uint256)".to_string()),
            log: serde_json::json!({"blockNumber": 3}),
            args: serde_json::Value::Null,
            loaded_entities: vec![LoadedEntity {
                entity_type: "Account".to_string(),
                id: "0xabc".to_string(),
                value: serde_json::Value::Null,
            }],
        }
        .into_error();

        assert_eq!(err.to_string(), "Handler error: balance underflow");
        let payload = err.structured().unwrap();
        assert_eq!(payload.loaded_entities.len(), 1);
        let json = serde_json::to_value(payload).unwrap();
        assert_eq!(json["log"]["blockNumber"], 3);
    }

    #[test]
    fn test_from_serde_json_error() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}

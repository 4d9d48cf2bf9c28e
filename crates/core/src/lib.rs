//! Core types for chainstore
//!
//! This crate defines the foundational types used throughout the system:
//! - Error: Error type hierarchy and structured handler failures
//! - BlockIdentifier / EntityRef: identity of blocks and entities
//! - encoding: order-preserving integer encoding for index keys
//! - key: the durable key namespace
//! - entity: entity definitions, index functions and the value codec
//! - query: index query arguments

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
pub mod entity;
pub mod error;
pub mod key;
pub mod query;
pub mod types;

pub use encoding::{
    decode_decimal, decode_natural, encode_decimal, encode_descending, encode_descending_decimal,
    encode_natural, encode_signed,
};
pub use entity::{Entity, EntityDefinition, EntityDefinitions, IndexDefinition, TypedIndex};
pub use error::{Error, LoadedEntity, Result, StructuredError};
pub use key::compound_key;
pub use query::{IndexQueryArgs, ResolvedIndexQuery};
pub use types::{BlockIdentifier, EntityRef, IndexedEntity, StagedEntities};

//! Entity definitions and codec
//!
//! An entity type is a serde record with a registered name and zero or more
//! named indexes. Each index is a pure function from the record to a sortable
//! string key (see [`crate::encoding`] for numbers).
//!
//! The storage-neutral representation of a record is a [`serde_json::Value`];
//! the durable representation is its JSON bytes. Definitions are collected
//! once at startup into an [`EntityDefinitions`] registry and shared by every
//! component that needs to derive index entries.

use crate::error::{Error, Result};
use crate::key;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Computes a sortable index key from an entity value.
pub type IndexFn = Arc<dyn Fn(&Value) -> Result<String> + Send + Sync>;

/// A typed record stored by the entity store.
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Account { owner: String, tokens_owned: u64 }
///
/// impl Entity for Account {
///     const NAME: &'static str = "Account";
///
///     fn indexes() -> Vec<TypedIndex<Self>> {
///         vec![TypedIndex::new("byTokens", |a| Ok(encode_natural(a.tokens_owned)))]
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Registered entity type name
    const NAME: &'static str;

    /// Named index functions
    fn indexes() -> Vec<TypedIndex<Self>> {
        Vec::new()
    }
}

/// An index over a typed record.
pub struct TypedIndex<T> {
    name: &'static str,
    key_fn: fn(&T) -> Result<String>,
}

impl<T> TypedIndex<T> {
    /// Create a named index.
    pub fn new(name: &'static str, key_fn: fn(&T) -> Result<String>) -> Self {
        Self { name, key_fn }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Convert a typed record to its storage-neutral value.
pub fn to_value<T: Serialize>(record: &T) -> Result<Value> {
    Ok(serde_json::to_value(record)?)
}

/// Convert a storage-neutral value back to a typed record.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Durable bytes of a value.
pub fn to_bytes(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Value from durable bytes.
pub fn from_bytes(bytes: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(bytes)?)
}

// ============================================================================
// Definitions
// ============================================================================

/// One named index on an entity type.
#[derive(Clone)]
pub struct IndexDefinition {
    name: String,
    key_fn: IndexFn,
}

impl IndexDefinition {
    /// Create an index from a function over raw values.
    pub fn new<F>(name: impl Into<String>, key_fn: F) -> Self
    where
        F: Fn(&Value) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            key_fn: Arc::new(key_fn),
        }
    }

    /// Index name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compute the sortable key for a value.
    pub fn compute(&self, value: &Value) -> Result<String> {
        (self.key_fn)(value)
    }
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDefinition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A named record type with its indexes.
#[derive(Debug, Clone)]
pub struct EntityDefinition {
    name: String,
    indexes: Vec<IndexDefinition>,
}

impl EntityDefinition {
    /// Untyped definition with no indexes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    /// Add an index computed from raw values.
    pub fn with_index<F>(mut self, name: impl Into<String>, key_fn: F) -> Self
    where
        F: Fn(&Value) -> Result<String> + Send + Sync + 'static,
    {
        self.indexes.push(IndexDefinition::new(name, key_fn));
        self
    }

    /// Definition derived from an [`Entity`] implementation.
    pub fn of<T: Entity>() -> Self {
        let mut def = Self::new(T::NAME);
        for TypedIndex { name, key_fn } in T::indexes() {
            def = def.with_index(name, move |value: &Value| {
                let record: T = from_value(value.clone())?;
                key_fn(&record)
            });
        }
        def
    }

    /// Entity type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All indexes
    pub fn indexes(&self) -> &[IndexDefinition] {
        &self.indexes
    }

    /// Look up one index by name.
    pub fn index(&self, index_name: &str) -> Result<&IndexDefinition> {
        self.indexes
            .iter()
            .find(|idx| idx.name == index_name)
            .ok_or_else(|| Error::UnknownIndex {
                entity: self.name.clone(),
                index: index_name.to_string(),
            })
    }

    /// Full storage keys of every index entry derived from `value`.
    pub fn index_entries(&self, id: &str, value: &Value) -> Result<Vec<String>> {
        self.indexes
            .iter()
            .map(|idx| key::index_key(&self.name, &idx.name, &idx.compute(value)?, id))
            .collect()
    }
}

/// Registry of every entity type known to the process.
#[derive(Debug, Clone, Default)]
pub struct EntityDefinitions {
    definitions: BTreeMap<String, EntityDefinition>,
}

impl EntityDefinitions {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed entity.
    pub fn register<T: Entity>(self) -> Self {
        self.with_definition(EntityDefinition::of::<T>())
    }

    /// Register an untyped definition, replacing any with the same name.
    pub fn with_definition(mut self, definition: EntityDefinition) -> Self {
        self.definitions
            .insert(definition.name.clone(), definition);
        self
    }

    /// Look up a definition by entity type name.
    pub fn get(&self, entity_type: &str) -> Result<&EntityDefinition> {
        self.definitions
            .get(entity_type)
            .ok_or_else(|| Error::UnknownEntity(entity_type.to_string()))
    }

    /// All registered definitions, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = &EntityDefinition> {
        self.definitions.values()
    }
}

//! Block and entity identity types
//!
//! - [`BlockIdentifier`]: `(number, hash)` pair naming one block on one fork
//! - [`EntityRef`]: `(entity type, id)` pair naming one entity
//! - [`StagedEntities`]: writes buffered for a single block

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies a block on a specific fork.
///
/// Ordered by number first; the hash only disambiguates blocks at the same
/// height on different forks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockIdentifier {
    /// Block height
    pub block_number: u64,
    /// Block hash
    pub hash: String,
}

impl BlockIdentifier {
    /// Create a new block identifier
    pub fn new(block_number: u64, hash: impl Into<String>) -> Self {
        Self {
            block_number,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for BlockIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.block_number, self.hash)
    }
}

/// Names one entity: its registered type and its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// Registered entity type name
    pub entity_type: String,
    /// Entity id, unique within the type
    pub id: String,
}

impl EntityRef {
    /// Create a new entity reference
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// Entity writes buffered for one block.
///
/// `None` is a tombstone: the entity was deleted in this block.
pub type StagedEntities = BTreeMap<EntityRef, Option<serde_json::Value>>;

/// One entity returned from an indexed read.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedEntity {
    /// Entity id
    pub id: String,
    /// Computed index key (without the storage prefix)
    pub index_key: String,
    /// Current value
    pub value: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_identifier_orders_by_number_first() {
        let a = BlockIdentifier::new(2, "0xff");
        let b = BlockIdentifier::new(10, "0x00");
        assert!(a < b);
    }

    #[test]
    fn test_block_identifier_serde_camel_case() {
        let block = BlockIdentifier::new(7, "0x7");
        let json = serde_json::to_string(&block).unwrap();
        assert_eq!(json, r#"{"blockNumber":7,"hash":"0x7"}"#);
        let back: BlockIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_entity_ref_display() {
        assert_eq!(EntityRef::new("Account", "0x1").to_string(), "Account:0x1");
    }
}

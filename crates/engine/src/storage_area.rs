//! In-memory fork tracker
//!
//! A [`StorageArea`] holds everything the follower knows that is not yet
//! durable:
//!
//! - the finalized block (the store's finalized pointer)
//! - the tip, the block reads resolve against
//! - lineage: block hash to parent block
//! - staging: block hash to the entity writes made while processing it
//!
//! Staged writes are attributed to the block that made them, so a read as of
//! some block walks lineage back to the finalized block and only sees writes
//! on its own fork.

use chainstore_core::error::{Error, Result};
use chainstore_core::{BlockIdentifier, EntityRef, StagedEntities};
use chainstore_storage::EntityStore;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// A storage area shared between the follower (writer) and readers.
pub type SharedStorageArea = Arc<RwLock<StorageArea>>;

/// Finalized pointer, tip, lineage and per-block staged writes.
#[derive(Debug, Clone)]
pub struct StorageArea {
    /// Newest block whose writes are durable
    pub finalized: BlockIdentifier,
    /// Highest processed block, `None` until the first block is processed
    pub tip: Option<BlockIdentifier>,
    /// Block hash to parent block
    pub parents: FxHashMap<String, BlockIdentifier>,
    /// Block hash to writes staged while processing that block
    pub staging: FxHashMap<String, StagedEntities>,
}

impl StorageArea {
    /// Empty area rooted at `finalized`.
    pub fn new(finalized: BlockIdentifier) -> Self {
        Self {
            finalized,
            tip: None,
            parents: FxHashMap::default(),
            staging: FxHashMap::default(),
        }
    }

    /// Area rooted at the store's finalized block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingFinalizedBlock`] if the store was never
    /// finalized (backfill has not run).
    pub fn initial(store: &dyn EntityStore) -> Result<Self> {
        let finalized = store
            .get_finalized_block()?
            .ok_or(Error::MissingFinalizedBlock)?;
        debug!(target: "chainstore::follower", finalized = %finalized, "Initial storage area");
        Ok(Self::new(finalized))
    }

    /// Wrap for sharing.
    pub fn shared(self) -> SharedStorageArea {
        Arc::new(RwLock::new(self))
    }

    /// Block reads resolve against: the tip, or the finalized block before
    /// anything was processed.
    pub fn latest_block(&self) -> &BlockIdentifier {
        self.tip.as_ref().unwrap_or(&self.finalized)
    }

    /// Record `parent` as the parent of `block_hash`.
    pub fn add_parent(&mut self, block_hash: impl Into<String>, parent: BlockIdentifier) {
        self.parents.insert(block_hash.into(), parent);
    }

    /// Blocks from `from` back to the finalized block (exclusive).
    pub fn path_to_finalized(&self, from: &BlockIdentifier) -> Result<Vec<BlockIdentifier>> {
        path_between(from, &self.finalized, &self.parents)
    }

    /// The nearest staged value for `entity` along `path`.
    ///
    /// The outer `Option` is whether any block on the path staged the entity;
    /// the inner one is `None` for a tombstone.
    pub fn staged_value<'a>(
        &'a self,
        path: &[BlockIdentifier],
        entity: &EntityRef,
    ) -> Option<&'a Option<Value>> {
        path.iter()
            .filter_map(|block| self.staging.get(&block.hash))
            .find_map(|staged| staged.get(entity))
    }

    /// Stage a write (or tombstone) for the block `block_hash`.
    pub fn stage(&mut self, block_hash: &str, entity: EntityRef, value: Option<Value>) {
        self.staging
            .entry(block_hash.to_string())
            .or_default()
            .insert(entity, value);
    }

    /// Mark `block` finalized and drop its lineage and staged writes.
    ///
    /// Returns the writes that were staged for it.
    pub fn finalize(&mut self, block: &BlockIdentifier) -> StagedEntities {
        self.finalized = block.clone();
        self.parents.remove(&block.hash);
        self.staging.remove(&block.hash).unwrap_or_default()
    }

    /// Drop lineage and staging of abandoned blocks at or below the finalized
    /// height. Returns the number of blocks pruned.
    pub fn prune_below_finalized(&mut self) -> usize {
        let height = self.finalized.block_number;
        let orphaned: Vec<String> = self
            .parents
            .iter()
            .filter(|(_, parent)| parent.block_number < height)
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in &orphaned {
            self.parents.remove(hash);
            self.staging.remove(hash);
        }
        orphaned.len()
    }
}

/// Walk lineage from `from` (inclusive) back to `to` (exclusive).
///
/// # Errors
///
/// Returns [`Error::Lineage`] if `to` is above `from`, if the walk reaches
/// `to`'s height on a different hash, or if a parent is missing.
pub fn path_between(
    from: &BlockIdentifier,
    to: &BlockIdentifier,
    parents: &FxHashMap<String, BlockIdentifier>,
) -> Result<Vec<BlockIdentifier>> {
    if to.block_number > from.block_number {
        return Err(Error::Lineage(format!(
            "path end {} is above path start {}",
            to, from
        )));
    }

    let mut path = Vec::new();
    let mut block = from.clone();
    loop {
        if block.block_number == to.block_number {
            if block.hash != to.hash {
                return Err(Error::Lineage(format!(
                    "found path to height {} but hash mismatch: {} != {}",
                    to.block_number, block.hash, to.hash
                )));
            }
            return Ok(path);
        }

        let parent = parents
            .get(&block.hash)
            .ok_or_else(|| Error::Lineage(format!("cannot find parent of block {}", block)))?
            .clone();
        path.push(block);
        block = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block(n: u64, hash: &str) -> BlockIdentifier {
        BlockIdentifier::new(n, hash)
    }

    fn chain() -> StorageArea {
        let mut area = StorageArea::new(block(0, "0x0"));
        area.add_parent("0x1", block(0, "0x0"));
        area.add_parent("0x2", block(1, "0x1"));
        area.add_parent("0x3", block(2, "0x2"));
        area.add_parent("0x3b", block(2, "0x2"));
        area
    }

    #[test]
    fn test_path_between_excludes_end() {
        let area = chain();
        let path = area.path_to_finalized(&block(3, "0x3")).unwrap();
        assert_eq!(path, vec![block(3, "0x3"), block(2, "0x2"), block(1, "0x1")]);

        assert!(area.path_to_finalized(&block(0, "0x0")).unwrap().is_empty());
    }

    #[test]
    fn test_path_between_errors() {
        let area = chain();
        assert!(matches!(
            path_between(&block(1, "0x1"), &block(2, "0x2"), &area.parents),
            Err(Error::Lineage(_))
        ));
        assert!(matches!(
            path_between(&block(3, "0x3"), &block(1, "0xother"), &area.parents),
            Err(Error::Lineage(_))
        ));
        assert!(matches!(
            path_between(&block(5, "0x5"), &block(0, "0x0"), &area.parents),
            Err(Error::Lineage(_))
        ));
    }

    #[test]
    fn test_staged_value_respects_fork() {
        let mut area = chain();
        let account = EntityRef::new("Account", "a");
        area.stage("0x2", account.clone(), Some(json!({"tokens": 2})));
        area.stage("0x3", account.clone(), Some(json!({"tokens": 3})));
        area.stage("0x3b", account.clone(), None);

        let main = area.path_to_finalized(&block(3, "0x3")).unwrap();
        assert_eq!(area.staged_value(&main, &account), Some(&Some(json!({"tokens": 3}))));

        let fork = area.path_to_finalized(&block(3, "0x3b")).unwrap();
        assert_eq!(area.staged_value(&fork, &account), Some(&None));

        let early = area.path_to_finalized(&block(1, "0x1")).unwrap();
        assert_eq!(area.staged_value(&early, &account), None);
    }

    #[test]
    fn test_finalize_then_prune_orphans() {
        let mut area = chain();
        area.stage("0x1", EntityRef::new("Account", "a"), Some(json!({})));
        area.stage("0x3b", EntityRef::new("Account", "b"), Some(json!({})));

        assert_eq!(area.finalize(&block(1, "0x1")).len(), 1);
        assert_eq!(area.finalize(&block(2, "0x2")).len(), 0);
        area.finalize(&block(3, "0x3"));
        assert_eq!(area.prune_below_finalized(), 1);

        assert!(area.parents.is_empty());
        assert!(area.staging.is_empty());
        assert_eq!(area.finalized, block(3, "0x3"));
    }
}

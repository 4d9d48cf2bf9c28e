//! Reads that merge staged writes with the durable store
//!
//! A [`Reader`] answers queries as of one block (the tip by default). Writes
//! staged on that block's fork shadow durable values:
//!
//! - **Point read**: the nearest staged value on the lineage path wins
//!   (a tombstone reads as absent); otherwise the store is consulted.
//! - **Index read**: staged candidates are collected into a min-heap keyed by
//!   full index key and merged with a lazy store scan. Every staged id is
//!   marked visited (even when its key falls before the starting key or it
//!   was deleted) so the store never yields a stale copy of it. Output is
//!   strictly ascending and stops at the first key outside the prefix.
//!
//! The storage area lock is only held while staged candidates are collected;
//! the durable scan runs unlocked.

use crate::storage_area::SharedStorageArea;
use chainstore_core::entity::from_value;
use chainstore_core::error::{Error, Result};
use chainstore_core::{
    key, BlockIdentifier, Entity, EntityDefinitions, EntityRef, IndexQueryArgs, IndexedEntity,
};
use chainstore_storage::{EntityIter, EntityStore};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

// ============================================================================
// Reader
// ============================================================================

/// Query facade over a storage area and a store.
#[derive(Clone)]
pub struct Reader<'a> {
    store: &'a dyn EntityStore,
    area: &'a SharedStorageArea,
    definitions: &'a EntityDefinitions,
    block: Option<BlockIdentifier>,
}

impl<'a> Reader<'a> {
    /// Reader resolving against the storage area's tip at each call.
    pub fn new(
        store: &'a dyn EntityStore,
        area: &'a SharedStorageArea,
        definitions: &'a EntityDefinitions,
    ) -> Self {
        Self {
            store,
            area,
            definitions,
            block: None,
        }
    }

    /// Pin reads to `block` instead of the tip.
    pub fn at(mut self, block: BlockIdentifier) -> Self {
        self.block = Some(block);
        self
    }

    /// Registered entity definitions
    pub fn definitions(&self) -> &'a EntityDefinitions {
        self.definitions
    }

    /// The block reads resolve against.
    pub fn latest_block(&self) -> BlockIdentifier {
        match &self.block {
            Some(block) => block.clone(),
            None => self.area.read().latest_block().clone(),
        }
    }

    /// Current value of one entity as of the reader's block.
    pub fn get_entity(&self, entity_type: &str, id: &str) -> Result<Option<Value>> {
        self.definitions.get(entity_type)?;
        let entity = EntityRef::new(entity_type, id);

        {
            let area = self.area.read();
            let block = self.block.as_ref().unwrap_or_else(|| area.latest_block());
            let path = area.path_to_finalized(block)?;
            if let Some(staged) = area.staged_value(&path, &entity) {
                return Ok(staged.clone());
            }
        }

        self.store.get_entity(entity_type, id)
    }

    /// Entities of one index in ascending key order.
    ///
    /// # Errors
    ///
    /// Fails up front on an unknown entity type or index, or a lineage error.
    /// Store failures surface as `Err` items.
    pub fn get_entities_by_index(
        &self,
        entity_type: &str,
        index_name: &str,
        query: &IndexQueryArgs,
    ) -> Result<IndexMerge<'a>> {
        let definition = self.definitions.get(entity_type)?;
        let index = definition.index(index_name)?;
        let resolved = query.resolve(entity_type, index_name)?;

        let mut staged = BinaryHeap::new();
        let mut visited = HashSet::new();
        {
            let area = self.area.read();
            let block = self.block.as_ref().unwrap_or_else(|| area.latest_block());
            for block in area.path_to_finalized(block)? {
                let Some(entities) = area.staging.get(&block.hash) else {
                    continue;
                };
                for (entity, value) in entities {
                    if entity.entity_type != entity_type || !visited.insert(entity.id.clone()) {
                        continue;
                    }
                    let Some(value) = value else {
                        continue;
                    };
                    let storage_key =
                        key::index_key(entity_type, index_name, &index.compute(value)?, &entity.id)?;
                    if storage_key < resolved.starting_key {
                        continue;
                    }
                    staged.push(Reverse(HeapEntry {
                        storage_key,
                        id: entity.id.clone(),
                        value: value.clone(),
                        source: Source::Staged,
                    }));
                }
            }
        }

        let durable = self
            .store
            .get_entities(entity_type, index_name, query, visited)?;

        let mut merge = IndexMerge {
            heap: staged,
            durable,
            entity_type: entity_type.to_string(),
            index_name: index_name.to_string(),
            index_prefix: resolved.index_prefix,
            done: false,
            pending_error: None,
        };
        merge.pull_durable();
        Ok(merge)
    }

    /// Typed point read.
    pub fn get<T: Entity>(&self, id: &str) -> Result<Option<T>> {
        self.get_entity(T::NAME, id)?.map(from_value).transpose()
    }

    /// Typed index read yielding `(id, record)` pairs.
    pub fn entities_by_index<T: Entity>(
        &self,
        index_name: &str,
        query: &IndexQueryArgs,
    ) -> Result<impl Iterator<Item = Result<(String, T)>> + 'a> {
        Ok(self
            .get_entities_by_index(T::NAME, index_name, query)?
            .map(|entry| {
                let entry = entry?;
                Ok((entry.id, from_value(entry.value)?))
            }))
    }
}

// ============================================================================
// Index merge
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Staged,
    Durable,
}

#[derive(Debug)]
struct HeapEntry {
    storage_key: String,
    id: String,
    value: Value,
    source: Source,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.storage_key == other.storage_key
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.storage_key.cmp(&other.storage_key)
    }
}

/// Lazy merge of staged index candidates with a durable index scan.
///
/// At most one durable entry is buffered in the heap at a time.
pub struct IndexMerge<'a> {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    durable: EntityIter<'a>,
    entity_type: String,
    index_name: String,
    index_prefix: String,
    done: bool,
    pending_error: Option<Error>,
}

impl IndexMerge<'_> {
    fn pull_durable(&mut self) {
        match self.durable.next() {
            None => {}
            Some(Err(e)) => self.pending_error = Some(e),
            Some(Ok(entry)) => {
                match key::index_key(&self.entity_type, &self.index_name, &entry.index_key, &entry.id)
                {
                    Ok(storage_key) => self.heap.push(Reverse(HeapEntry {
                        storage_key,
                        id: entry.id,
                        value: entry.value,
                        source: Source::Durable,
                    })),
                    Err(e) => self.pending_error = Some(e),
                }
            }
        }
    }
}

impl Iterator for IndexMerge<'_> {
    type Item = Result<IndexedEntity>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.pending_error.take() {
            self.done = true;
            return Some(Err(e));
        }

        let Reverse(entry) = self.heap.pop()?;
        if !entry.storage_key.starts_with(&self.index_prefix) {
            self.done = true;
            return None;
        }
        if entry.source == Source::Durable {
            self.pull_durable();
        }

        let indexed = entry.into_indexed();
        if indexed.is_err() {
            self.done = true;
        }
        Some(indexed)
    }
}

impl HeapEntry {
    fn into_indexed(self) -> Result<IndexedEntity> {
        let index_key = key::computed_index_key(&self.storage_key)
            .ok_or_else(|| Error::Corruption(format!("malformed index key {}", self.storage_key)))?
            .to_string();
        Ok(IndexedEntity {
            id: self.id,
            index_key,
            value: self.value,
        })
    }
}

// ============================================================================
// Cached reader
// ============================================================================

/// Memoizes point reads of a [`Reader`] for the lifetime of one request.
///
/// Index reads pass through uncached.
pub struct CachedReader<'a> {
    reader: Reader<'a>,
    cache: Mutex<FxHashMap<EntityRef, Option<Value>>>,
}

impl<'a> CachedReader<'a> {
    /// Wrap a reader.
    pub fn new(reader: Reader<'a>) -> Self {
        Self {
            reader,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Point read, served from the cache after the first call.
    pub fn get_entity(&self, entity_type: &str, id: &str) -> Result<Option<Value>> {
        let entity = EntityRef::new(entity_type, id);
        if let Some(hit) = self.cache.lock().get(&entity) {
            return Ok(hit.clone());
        }
        let value = self.reader.get_entity(entity_type, id)?;
        self.cache.lock().insert(entity, value.clone());
        Ok(value)
    }

    /// Typed cached point read.
    pub fn get<T: Entity>(&self, id: &str) -> Result<Option<T>> {
        self.get_entity(T::NAME, id)?.map(from_value).transpose()
    }

    /// Uncached index read.
    pub fn get_entities_by_index(
        &self,
        entity_type: &str,
        index_name: &str,
        query: &IndexQueryArgs,
    ) -> Result<IndexMerge<'a>> {
        self.reader.get_entities_by_index(entity_type, index_name, query)
    }

    /// The block reads resolve against.
    pub fn latest_block(&self) -> BlockIdentifier {
        self.reader.latest_block()
    }

    /// Number of distinct entities cached so far.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

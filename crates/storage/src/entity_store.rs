//! Durable entity store with an undo log
//!
//! [`KvEntityStore`] implements [`EntityStore`] once for every
//! [`KeyValueStorage`] backend.
//!
//! # Flush protocol
//!
//! Finalizing a block writes many keys (entity values, index entries, the
//! finalized-block pointer). Backends only guarantee atomicity per batch, so
//! each physical mutation is committed in its own batch together with an undo
//! entry `undoLog|<seq> = {key, previous value}`. Once every mutation has
//! committed, the undo entries are deleted in ascending order.
//!
//! # Recovery
//!
//! On open, if undo entry 0 exists (or the rollback marker is set) a flush
//! was interrupted before it completed: the marker is set, every undo entry
//! is replayed newest first (restoring or deleting its key in the same batch
//! that deletes the entry), and the marker is cleared. If entry 0 is absent
//! but later entries remain, the flush completed and only its cleanup was
//! interrupted, so the leftovers are simply deleted.

use crate::kv::{KeyValueStorage, Mutation, RangeScan, DEFAULT_PAGE_SIZE};
use crate::updates::{updates_for_entities, READ_BATCH_SIZE};
use chainstore_core::entity::from_bytes;
use chainstore_core::error::{Error, Result};
use chainstore_core::key::{
    self, undo_log_key, FINALIZED_BLOCK_KEY, ROLLBACK_MARKER_KEY, UNDO_LOG_PREFIX,
};
use chainstore_core::{
    BlockIdentifier, EntityDefinitions, IndexQueryArgs, IndexedEntity, StagedEntities,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, Write};
use tracing::{debug, info, warn};

/// Lazy sequence of index query results.
pub type EntityIter<'a> = Box<dyn Iterator<Item = Result<IndexedEntity>> + Send + 'a>;

/// Durable entity persistence.
pub trait EntityStore: Send + Sync {
    /// Current durable value of one entity.
    fn get_entity(&self, entity_type: &str, id: &str) -> Result<Option<Value>>;

    /// Entities of one index in key order, skipping ids in `visited`.
    ///
    /// # Errors
    ///
    /// Items are [`Error::Corruption`] if an index entry points at a missing
    /// entity.
    fn get_entities<'a>(
        &'a self,
        entity_type: &str,
        index_name: &str,
        query: &IndexQueryArgs,
        visited: HashSet<String>,
    ) -> Result<EntityIter<'a>>;

    /// The last block whose writes are durable.
    fn get_finalized_block(&self) -> Result<Option<BlockIdentifier>>;

    /// Durably apply `changes` and move the finalized pointer to `block`.
    fn flush_updates(
        &self,
        block: &BlockIdentifier,
        definitions: &EntityDefinitions,
        changes: &StagedEntities,
    ) -> Result<()>;
}

/// What recovery found on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No undo log present
    Clean,
    /// A completed flush left this many undo entries behind
    ClearedUndoLog(usize),
    /// An interrupted flush was rolled back through this many undo entries
    RolledBack(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UndoEntry {
    key: String,
    previous_value: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DumpRecord {
    key: String,
    value: String,
}

/// [`EntityStore`] over any ordered key-value backend.
#[derive(Debug)]
pub struct KvEntityStore<S> {
    storage: S,
}

impl<S: KeyValueStorage> KvEntityStore<S> {
    /// Open the store, recovering from any interrupted flush first.
    pub fn open(storage: S) -> Result<Self> {
        let store = Self { storage };
        store.ensure_consistent_state()?;
        Ok(store)
    }

    /// The underlying backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Unwrap the backend.
    pub fn into_inner(self) -> S {
        self.storage
    }

    /// Bring durable state back to the last completed flush.
    pub fn ensure_consistent_state(&self) -> Result<RecoveryOutcome> {
        let first = self.storage.get(&undo_log_key(0))?;
        let marker = self.storage.get(ROLLBACK_MARKER_KEY)?;

        if first.is_none() && marker.is_none() {
            let leftovers: Vec<String> = RangeScan::new(
                &self.storage,
                UNDO_LOG_PREFIX,
                UNDO_LOG_PREFIX,
                DEFAULT_PAGE_SIZE,
            )
            .map(|entry| entry.map(|(k, _)| k))
            .collect::<Result<_>>()?;
            if leftovers.is_empty() {
                return Ok(RecoveryOutcome::Clean);
            }
            self.delete_keys(&leftovers)?;
            info!(
                target: "chainstore::store",
                entries = leftovers.len(),
                "Cleared undo log of a completed flush"
            );
            return Ok(RecoveryOutcome::ClearedUndoLog(leftovers.len()));
        }

        warn!(target: "chainstore::store", "Interrupted flush detected, rolling back");
        self.storage.put(ROLLBACK_MARKER_KEY, b"1")?;

        let entries = self.undo_entries()?;
        for (undo_key, entry) in entries.iter().rev() {
            let restore = match &entry.previous_value {
                Some(value) => Mutation::put(entry.key.clone(), value.clone()),
                None => Mutation::delete(entry.key.clone()),
            };
            self.storage
                .apply_batch(&[restore, Mutation::delete(undo_key.clone())])?;
        }

        self.storage.delete(ROLLBACK_MARKER_KEY)?;
        info!(
            target: "chainstore::store",
            entries = entries.len(),
            "Rolled back interrupted flush"
        );
        Ok(RecoveryOutcome::RolledBack(entries.len()))
    }

    fn undo_entries(&self) -> Result<Vec<(String, UndoEntry)>> {
        RangeScan::new(
            &self.storage,
            UNDO_LOG_PREFIX,
            UNDO_LOG_PREFIX,
            DEFAULT_PAGE_SIZE,
        )
        .map(|entry| {
            let (key, bytes) = entry?;
            let undo: UndoEntry = bincode::deserialize(&bytes)?;
            Ok((key, undo))
        })
        .collect()
    }

    fn delete_keys(&self, keys: &[String]) -> Result<()> {
        for chunk in keys.chunks(READ_BATCH_SIZE) {
            let deletes: Vec<Mutation> = chunk.iter().map(|k| Mutation::delete(k.clone())).collect();
            self.storage.apply_batch(&deletes)?;
        }
        Ok(())
    }

    fn load_indexed(
        &self,
        entity_type: &str,
        storage_key: &str,
        id: String,
    ) -> Result<IndexedEntity> {
        let value = self.get_entity(entity_type, &id)?.ok_or_else(|| {
            Error::Corruption(format!("index value not found for {}", storage_key))
        })?;
        let index_key = key::computed_index_key(storage_key)
            .ok_or_else(|| Error::Corruption(format!("malformed index key {}", storage_key)))?
            .to_string();
        Ok(IndexedEntity {
            id,
            index_key,
            value,
        })
    }

    // ========================================================================
    // Dump / load
    // ========================================================================

    /// Write every durable key as JSON lines `{"key": .., "value": ..}`.
    ///
    /// Undo log entries are transient and not exported. Returns the number of
    /// records written.
    pub fn dump<W: Write>(&self, mut out: W) -> Result<usize> {
        let mut count = 0;
        for entry in RangeScan::new(&self.storage, "", "", DEFAULT_PAGE_SIZE) {
            let (key, bytes) = entry?;
            if key.starts_with(UNDO_LOG_PREFIX) || key == ROLLBACK_MARKER_KEY {
                continue;
            }
            let value = String::from_utf8(bytes)
                .map_err(|_| Error::Corruption(format!("value of {} is not UTF-8", key)))?;
            serde_json::to_writer(&mut out, &DumpRecord { key, value })?;
            out.write_all(b"\n")?;
            count += 1;
        }
        out.flush()?;
        Ok(count)
    }

    /// Replace the store's contents with records written by [`Self::dump`].
    ///
    /// Returns the number of records loaded.
    pub fn load<R: BufRead>(&self, input: R) -> Result<usize> {
        self.storage.clear()?;

        let mut batch = Vec::with_capacity(READ_BATCH_SIZE);
        let mut count = 0;
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: DumpRecord = serde_json::from_str(&line)?;
            batch.push(Mutation::put(record.key, record.value.into_bytes()));
            count += 1;
            if batch.len() == READ_BATCH_SIZE {
                self.storage.apply_batch(&batch)?;
                batch.clear();
            }
        }
        self.storage.apply_batch(&batch)?;

        info!(target: "chainstore::store", records = count, "Loaded store contents");
        Ok(count)
    }
}

impl<S: KeyValueStorage> EntityStore for KvEntityStore<S> {
    fn get_entity(&self, entity_type: &str, id: &str) -> Result<Option<Value>> {
        match self.storage.get(&key::entity_key(entity_type, id)?)? {
            Some(bytes) => Ok(Some(from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_entities<'a>(
        &'a self,
        entity_type: &str,
        index_name: &str,
        query: &IndexQueryArgs,
        visited: HashSet<String>,
    ) -> Result<EntityIter<'a>> {
        let resolved = query.resolve(entity_type, index_name)?;
        let entity_type = entity_type.to_string();
        let scan = RangeScan::new(
            &self.storage,
            &resolved.starting_key,
            &resolved.index_prefix,
            DEFAULT_PAGE_SIZE,
        );

        Ok(Box::new(scan.filter_map(move |entry| {
            let (storage_key, id_bytes) = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let id = match String::from_utf8(id_bytes) {
                Ok(id) => id,
                Err(_) => {
                    return Some(Err(Error::Corruption(format!(
                        "index entry {} holds a non UTF-8 id",
                        storage_key
                    ))))
                }
            };
            if visited.contains(&id) {
                return None;
            }
            Some(self.load_indexed(&entity_type, &storage_key, id))
        })))
    }

    fn get_finalized_block(&self) -> Result<Option<BlockIdentifier>> {
        match self.storage.get(FINALIZED_BLOCK_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn flush_updates(
        &self,
        block: &BlockIdentifier,
        definitions: &EntityDefinitions,
        changes: &StagedEntities,
    ) -> Result<()> {
        let mutations = updates_for_entities(&self.storage, block, definitions, changes)?;

        // Value of each touched key as of the mutation about to be applied.
        let mut current: HashMap<String, Option<Vec<u8>>> = HashMap::new();

        for (chunk_idx, chunk) in mutations.chunks(READ_BATCH_SIZE).enumerate() {
            let unread: Vec<String> = chunk
                .iter()
                .map(|m| m.key().to_string())
                .filter(|k| !current.contains_key(k))
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            let values = self.storage.get_many(&unread)?;
            current.extend(unread.into_iter().zip(values));

            for (offset, mutation) in chunk.iter().enumerate() {
                let seq = (chunk_idx * READ_BATCH_SIZE + offset) as u64;
                let key = mutation.key().to_string();
                let undo = UndoEntry {
                    previous_value: current.get(&key).cloned().flatten(),
                    key: key.clone(),
                };
                self.storage.apply_batch(&[
                    mutation.clone(),
                    Mutation::put(undo_log_key(seq), bincode::serialize(&undo)?),
                ])?;
                current.insert(key, mutation.value().map(<[u8]>::to_vec));
            }
        }

        let undo_keys: Vec<String> = (0..mutations.len() as u64).map(undo_log_key).collect();
        self.delete_keys(&undo_keys)?;

        debug!(
            target: "chainstore::store",
            block = block.block_number,
            hash = %block.hash,
            entities = changes.len(),
            mutations = mutations.len(),
            "Flushed block"
        );
        Ok(())
    }
}

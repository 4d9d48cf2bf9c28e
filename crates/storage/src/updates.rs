//! Physical mutations for finalizing a block
//!
//! Turns a block's changed entities into the ordered list of key mutations
//! that [`crate::entity_store::KvEntityStore::flush_updates`] applies:
//!
//! 1. for each changed entity, write (or delete) its value, retract index
//!    entries derived from the old value that the new value no longer has,
//!    and insert index entries derived from the new value
//! 2. finally move the finalized-block pointer to the block

use crate::kv::{KeyValueStorage, Mutation};
use chainstore_core::entity::{from_bytes, to_bytes};
use chainstore_core::error::Result;
use chainstore_core::key::{self, FINALIZED_BLOCK_KEY};
use chainstore_core::{BlockIdentifier, EntityDefinitions, StagedEntities};
use std::collections::HashSet;

/// Keys read from storage per round trip.
pub const READ_BATCH_SIZE: usize = 128;

/// Compute the mutations that move durable state to the end of `block`.
///
/// Reads the current value of every changed entity to find the index
/// entries it must retract. No mutation is applied.
pub fn updates_for_entities<S: KeyValueStorage + ?Sized>(
    storage: &S,
    block: &BlockIdentifier,
    definitions: &EntityDefinitions,
    changes: &StagedEntities,
) -> Result<Vec<Mutation>> {
    let entity_keys = changes
        .keys()
        .map(|r| key::entity_key(&r.entity_type, &r.id))
        .collect::<Result<Vec<_>>>()?;

    let mut old_values = Vec::with_capacity(entity_keys.len());
    for chunk in entity_keys.chunks(READ_BATCH_SIZE) {
        old_values.extend(storage.get_many(chunk)?);
    }

    let mut mutations = Vec::new();
    for (((entity, new_value), entity_key), old_value) in
        changes.iter().zip(entity_keys).zip(old_values)
    {
        let definition = definitions.get(&entity.entity_type)?;

        let new_entries = match new_value {
            Some(value) => definition.index_entries(&entity.id, value)?,
            None => Vec::new(),
        };
        let old_entries = match old_value {
            Some(bytes) => definition.index_entries(&entity.id, &from_bytes(&bytes)?)?,
            None => Vec::new(),
        };
        let kept: HashSet<&String> = new_entries.iter().collect();

        mutations.push(match new_value {
            Some(value) => Mutation::put(entity_key, to_bytes(value)?),
            None => Mutation::delete(entity_key),
        });
        for stale in old_entries.iter().filter(|k| !kept.contains(k)) {
            mutations.push(Mutation::delete(stale.clone()));
        }
        for entry in new_entries {
            mutations.push(Mutation::put(entry, entity.id.as_bytes()));
        }
    }

    mutations.push(Mutation::put(
        FINALIZED_BLOCK_KEY,
        serde_json::to_vec(block)?,
    ));
    Ok(mutations)
}

//! Storage handles passed to event handlers
//!
//! Handlers read and write entities through [`EntityHandle`]. Two
//! implementations exist:
//!
//! - [`BlockStorageHandle`]: used while following the chain; reads resolve as
//!   of the block being processed and writes land in that block's staging map
//! - [`StagingStorageHandle`]: used by backfill; one plain staging map in front
//!   of the store
//!
//! Neither ever writes to the durable store. Both record every entity they
//! loaded so a failing handler can be reported with its inputs.

use crate::reader::Reader;
use crate::storage_area::SharedStorageArea;
use chainstore_core::entity::{from_value, to_value};
use chainstore_core::error::Result;
use chainstore_core::{
    key, BlockIdentifier, Entity, EntityDefinitions, EntityRef, LoadedEntity, StagedEntities,
};
use chainstore_storage::EntityStore;
use serde_json::Value;

/// Read/write access to entities for one event handler invocation.
pub trait EntityHandle {
    /// Current value of one entity, including writes staged so far.
    fn get_entity(&mut self, entity_type: &str, id: &str) -> Result<Option<Value>>;

    /// Stage a new value for one entity.
    fn save_entity(&mut self, entity_type: &str, id: &str, value: Value) -> Result<()>;

    /// Stage a deletion of one entity.
    fn delete_entity(&mut self, entity_type: &str, id: &str) -> Result<()>;

    /// Every entity loaded through this handle, in load order.
    fn loaded_entities(&self) -> &[LoadedEntity];
}

impl<'h> dyn EntityHandle + 'h {
    /// Typed read.
    pub fn get<T: Entity>(&mut self, id: &str) -> Result<Option<T>> {
        self.get_entity(T::NAME, id)?.map(from_value).transpose()
    }

    /// Typed write.
    pub fn save<T: Entity>(&mut self, id: &str, record: &T) -> Result<()> {
        self.save_entity(T::NAME, id, to_value(record)?)
    }

    /// Typed delete.
    pub fn delete<T: Entity>(&mut self, id: &str) -> Result<()> {
        self.delete_entity(T::NAME, id)
    }
}

fn checked_ref(definitions: &EntityDefinitions, entity_type: &str, id: &str) -> Result<EntityRef> {
    definitions.get(entity_type)?;
    key::entity_key(entity_type, id)?;
    Ok(EntityRef::new(entity_type, id))
}

fn record_load(loaded: &mut Vec<LoadedEntity>, entity_type: &str, id: &str, value: &Option<Value>) {
    loaded.push(LoadedEntity {
        entity_type: entity_type.to_string(),
        id: id.to_string(),
        value: value.clone().unwrap_or(Value::Null),
    });
}

// ============================================================================
// BlockStorageHandle
// ============================================================================

/// Handle scoped to the block being processed by the follower.
pub struct BlockStorageHandle<'a> {
    reader: Reader<'a>,
    area: &'a SharedStorageArea,
    block: BlockIdentifier,
    loaded: Vec<LoadedEntity>,
}

impl<'a> BlockStorageHandle<'a> {
    /// Handle writing into `block`'s staging map.
    ///
    /// `block`'s parent must already be recorded in the storage area.
    pub fn new(
        store: &'a dyn EntityStore,
        area: &'a SharedStorageArea,
        definitions: &'a EntityDefinitions,
        block: BlockIdentifier,
    ) -> Self {
        Self {
            reader: Reader::new(store, area, definitions).at(block.clone()),
            area,
            block,
            loaded: Vec::new(),
        }
    }

    /// The block writes are attributed to.
    pub fn block(&self) -> &BlockIdentifier {
        &self.block
    }

    /// Consume the handle, keeping what it loaded.
    pub fn into_loaded(self) -> Vec<LoadedEntity> {
        self.loaded
    }
}

impl EntityHandle for BlockStorageHandle<'_> {
    fn get_entity(&mut self, entity_type: &str, id: &str) -> Result<Option<Value>> {
        let value = self.reader.get_entity(entity_type, id)?;
        record_load(&mut self.loaded, entity_type, id, &value);
        Ok(value)
    }

    fn save_entity(&mut self, entity_type: &str, id: &str, value: Value) -> Result<()> {
        let entity = checked_ref(self.reader.definitions(), entity_type, id)?;
        self.area.write().stage(&self.block.hash, entity, Some(value));
        Ok(())
    }

    fn delete_entity(&mut self, entity_type: &str, id: &str) -> Result<()> {
        let entity = checked_ref(self.reader.definitions(), entity_type, id)?;
        self.area.write().stage(&self.block.hash, entity, None);
        Ok(())
    }

    fn loaded_entities(&self) -> &[LoadedEntity] {
        &self.loaded
    }
}

// ============================================================================
// StagingStorageHandle
// ============================================================================

/// Handle over a single staging map in front of the store.
pub struct StagingStorageHandle<'a> {
    staging: &'a mut StagedEntities,
    store: &'a dyn EntityStore,
    definitions: &'a EntityDefinitions,
    loaded: Vec<LoadedEntity>,
}

impl<'a> StagingStorageHandle<'a> {
    /// Handle writing into `staging`.
    pub fn new(
        staging: &'a mut StagedEntities,
        store: &'a dyn EntityStore,
        definitions: &'a EntityDefinitions,
    ) -> Self {
        Self {
            staging,
            store,
            definitions,
            loaded: Vec::new(),
        }
    }

    /// Consume the handle, keeping what it loaded.
    pub fn into_loaded(self) -> Vec<LoadedEntity> {
        self.loaded
    }
}

impl EntityHandle for StagingStorageHandle<'_> {
    fn get_entity(&mut self, entity_type: &str, id: &str) -> Result<Option<Value>> {
        let entity = checked_ref(self.definitions, entity_type, id)?;
        let value = match self.staging.get(&entity) {
            Some(staged) => staged.clone(),
            None => self.store.get_entity(entity_type, id)?,
        };
        record_load(&mut self.loaded, entity_type, id, &value);
        Ok(value)
    }

    fn save_entity(&mut self, entity_type: &str, id: &str, value: Value) -> Result<()> {
        let entity = checked_ref(self.definitions, entity_type, id)?;
        self.staging.insert(entity, Some(value));
        Ok(())
    }

    fn delete_entity(&mut self, entity_type: &str, id: &str) -> Result<()> {
        let entity = checked_ref(self.definitions, entity_type, id)?;
        self.staging.insert(entity, None);
        Ok(())
    }

    fn loaded_entities(&self) -> &[LoadedEntity] {
        &self.loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_area::StorageArea;
    use chainstore_core::{Error, TypedIndex};
    use chainstore_storage::{KvEntityStore, MemoryStorage};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Account {
        tokens_owned: u64,
    }

    impl Entity for Account {
        const NAME: &'static str = "Account";

        fn indexes() -> Vec<TypedIndex<Self>> {
            vec![TypedIndex::new("byTokens", |a: &Account| {
                Ok(chainstore_core::encode_natural(a.tokens_owned))
            })]
        }
    }

    fn finalized_store() -> KvEntityStore<MemoryStorage> {
        let store = KvEntityStore::open(MemoryStorage::new()).unwrap();
        store
            .flush_updates(
                &BlockIdentifier::new(0, "0x0"),
                &EntityDefinitions::new().register::<Account>(),
                &StagedEntities::new(),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_block_handle_writes_only_to_its_block() {
        let store = finalized_store();
        let defs = EntityDefinitions::new().register::<Account>();
        let area = StorageArea::initial(&store).unwrap().shared();
        let one = BlockIdentifier::new(1, "0x1");
        area.write().add_parent("0x1", BlockIdentifier::new(0, "0x0"));

        let mut handle = BlockStorageHandle::new(&store, &area, &defs, one.clone());
        let handle: &mut dyn EntityHandle = &mut handle;
        assert_eq!(handle.get::<Account>("x").unwrap(), None);
        handle.save("x", &Account { tokens_owned: 4 }).unwrap();
        assert_eq!(handle.get::<Account>("x").unwrap(), Some(Account { tokens_owned: 4 }));
        assert_eq!(handle.loaded_entities().len(), 2);

        assert!(store.get_entity("Account", "x").unwrap().is_none());
        let area = area.read();
        assert_eq!(area.staging["0x1"].len(), 1);
    }

    #[test]
    fn test_staging_handle_records_loads_and_tombstones() {
        let store = finalized_store();
        let defs = EntityDefinitions::new().register::<Account>();
        let mut staging = StagedEntities::new();

        let loaded = {
            let mut handle = StagingStorageHandle::new(&mut staging, &store, &defs);
            let dyn_handle: &mut dyn EntityHandle = &mut handle;
            dyn_handle.save("a", &Account { tokens_owned: 1 }).unwrap();
            dyn_handle.delete::<Account>("a").unwrap();
            assert_eq!(dyn_handle.get::<Account>("a").unwrap(), None);
            handle.into_loaded()
        };

        assert_eq!(loaded.len(), 1);
        assert_eq!(staging[&EntityRef::new("Account", "a")], None);
    }

    #[test]
    fn test_unknown_type_and_reserved_id_rejected() {
        let store = finalized_store();
        let defs = EntityDefinitions::new().register::<Account>();
        let mut staging = StagedEntities::new();
        let mut handle = StagingStorageHandle::new(&mut staging, &store, &defs);

        assert!(matches!(
            handle.save_entity("Proposal", "1", Value::Null),
            Err(Error::UnknownEntity(_))
        ));
        assert!(matches!(
            handle.save_entity("Account", "a|b", Value::Null),
            Err(Error::InvalidKey(_))
        ));
    }
}

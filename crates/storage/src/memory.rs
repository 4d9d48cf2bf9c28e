//! In-process object store backend
//!
//! One ordered map behind a lock. Every batch is applied under the write
//! lock, so readers never observe half a batch. Clones share the same map.

use crate::kv::{collect_page, range_bounds, KeyValueStorage, Mutation, ScanStart};
use chainstore_core::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

type Map = BTreeMap<String, Vec<u8>>;

/// In-memory store; nothing survives the process.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<Map>>,
}

impl MemoryStorage {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn commit(&self, replace: bool, mutations: &[Mutation]) {
        let mut data = self.data.write();
        if replace {
            data.clear();
        }
        for mutation in mutations {
            match mutation {
                Mutation::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                Mutation::Delete { key } => {
                    data.remove(key);
                }
            }
        }
        debug!(
            target: "chainstore::storage",
            replace,
            mutations = mutations.len(),
            keys = data.len(),
            "Committed in-memory batch"
        );
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let data = self.data.read();
        Ok(keys.iter().map(|k| data.get(k).cloned()).collect())
    }

    fn apply_batch(&self, mutations: &[Mutation]) -> Result<()> {
        if !mutations.is_empty() {
            self.commit(false, mutations);
        }
        Ok(())
    }

    fn scan_page(
        &self,
        start: ScanStart<'_>,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.read();
        Ok(collect_page(data.range(range_bounds(start)), prefix, limit))
    }

    fn clear(&self) -> Result<()> {
        self.commit(true, &[]);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("keys", &self.data.read().len())
            .finish()
    }
}

//! Embedded transactional backend on redb
//!
//! One `&str -> &[u8]` table holds every key. Each batch is one redb write
//! transaction, so a batch is either fully committed or not visible at all.

use crate::kv::{KeyValueStorage, Mutation, ScanStart};
use chainstore_core::error::{Error, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::info;

const ENTITIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("chainstore");

/// Default database file name inside a data directory.
pub const REDB_FILE_NAME: &str = "chainstore.redb";

fn redb_error(e: impl Into<redb::Error>) -> Error {
    Error::Storage(e.into().to_string())
}

/// redb-backed key-value store.
#[derive(Debug)]
pub struct RedbStorage {
    db: Database,
    path: PathBuf,
}

impl RedbStorage {
    /// Create or open the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Open existing database without truncating, create if missing.
        let db = if path.exists() {
            Database::open(&path).map_err(redb_error)?
        } else {
            Database::create(&path).map_err(redb_error)?
        };

        let write_txn = db.begin_write().map_err(redb_error)?;
        {
            write_txn.open_table(ENTITIES_TABLE).map_err(redb_error)?;
        }
        write_txn.commit().map_err(redb_error)?;

        info!(target: "chainstore::storage", path = %path.display(), "Opened redb store");
        Ok(Self { db, path })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStorage for RedbStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().map_err(redb_error)?;
        let table = read_txn.open_table(ENTITIES_TABLE).map_err(redb_error)?;
        let value = table.get(key).map_err(redb_error)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let read_txn = self.db.begin_read().map_err(redb_error)?;
        let table = read_txn.open_table(ENTITIES_TABLE).map_err(redb_error)?;
        keys.iter()
            .map(|key| {
                let value = table.get(key.as_str()).map_err(redb_error)?;
                Ok(value.map(|v| v.value().to_vec()))
            })
            .collect()
    }

    fn apply_batch(&self, mutations: &[Mutation]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(redb_error)?;
        {
            let mut table = write_txn.open_table(ENTITIES_TABLE).map_err(redb_error)?;
            for mutation in mutations {
                match mutation {
                    Mutation::Put { key, value } => {
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(redb_error)?;
                    }
                    Mutation::Delete { key } => {
                        table.remove(key.as_str()).map_err(redb_error)?;
                    }
                }
            }
        }
        write_txn.commit().map_err(redb_error)
    }

    fn scan_page(
        &self,
        start: ScanStart<'_>,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read().map_err(redb_error)?;
        let table = read_txn.open_table(ENTITIES_TABLE).map_err(redb_error)?;

        let lower = match start {
            ScanStart::Inclusive(key) => Bound::Included(key),
            ScanStart::Exclusive(key) => Bound::Excluded(key),
        };
        let range = table
            .range::<&str>((lower, Bound::Unbounded))
            .map_err(redb_error)?;

        let mut page = Vec::new();
        for entry in range {
            let (key, value) = entry.map_err(redb_error)?;
            let key = key.value();
            if !key.starts_with(prefix) || page.len() >= limit {
                break;
            }
            page.push((key.to_string(), value.value().to_vec()));
        }
        Ok(page)
    }

    fn clear(&self) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(redb_error)?;
        {
            write_txn.delete_table(ENTITIES_TABLE).map_err(redb_error)?;
            write_txn.open_table(ENTITIES_TABLE).map_err(redb_error)?;
        }
        write_txn.commit().map_err(redb_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_batch_commit_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(REDB_FILE_NAME);
        {
            let store = RedbStorage::open(&path).unwrap();
            store
                .apply_batch(&[
                    Mutation::put("a", b"1".to_vec()),
                    Mutation::put("b", b"2".to_vec()),
                    Mutation::delete("a"),
                ])
                .unwrap();
        }

        let store = RedbStorage::open(&path).unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_scan_page_respects_prefix_and_bounds() {
        let dir = TempDir::new().unwrap();
        let store = RedbStorage::open(dir.path().join(REDB_FILE_NAME)).unwrap();
        for key in ["p|1", "p|2", "p|3", "q|1"] {
            store.put(key, key.as_bytes()).unwrap();
        }

        let page = store.scan_page(ScanStart::Exclusive("p|1"), "p|", 10).unwrap();
        let keys: Vec<&str> = page.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["p|2", "p|3"]);

        let page = store.scan_page(ScanStart::Inclusive("p|"), "p|", 2).unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = TempDir::new().unwrap();
        let store = RedbStorage::open(dir.path().join(REDB_FILE_NAME)).unwrap();
        store.put("a", b"1").unwrap();
        store.clear().unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert!(store.scan_page(ScanStart::Inclusive(""), "", 10).unwrap().is_empty());
    }
}

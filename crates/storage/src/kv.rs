//! Ordered key-value storage seam
//!
//! Every entity store backend implements [`KeyValueStorage`]: point reads,
//! ordered prefix scans in pages, and an atomic multi-key batch. The undo-log
//! protocol in [`crate::entity_store`] is written once against this trait, so
//! all backends recover from a crash identically.

use chainstore_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Default number of entries fetched per scan page.
pub const DEFAULT_PAGE_SIZE: usize = 128;

/// One physical key mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Set `key` to `value`
    Put {
        /// Storage key
        key: String,
        /// New value
        value: Vec<u8>,
    },
    /// Remove `key`
    Delete {
        /// Storage key
        key: String,
    },
}

impl Mutation {
    /// Put mutation
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Mutation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Delete mutation
    pub fn delete(key: impl Into<String>) -> Self {
        Mutation::Delete { key: key.into() }
    }

    /// Key touched by this mutation
    pub fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } => key,
        }
    }

    /// Value after this mutation is applied
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Mutation::Put { value, .. } => Some(value),
            Mutation::Delete { .. } => None,
        }
    }
}

/// Where a scan page starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStart<'a> {
    /// At `key` or the first key after it
    Inclusive(&'a str),
    /// At the first key strictly after `key`
    Exclusive(&'a str),
}

/// Ordered key-value storage with atomic batches.
pub trait KeyValueStorage: Send + Sync {
    /// Read one key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read several keys; results are in input order.
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Apply all mutations atomically, in order.
    fn apply_batch(&self, mutations: &[Mutation]) -> Result<()>;

    /// Up to `limit` entries in key order from `start`, stopping at the
    /// first key that does not start with `prefix`.
    fn scan_page(
        &self,
        start: ScanStart<'_>,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>>;

    /// Remove every key.
    fn clear(&self) -> Result<()>;

    /// Write one key.
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.apply_batch(&[Mutation::put(key, value)])
    }

    /// Delete one key.
    fn delete(&self, key: &str) -> Result<()> {
        self.apply_batch(&[Mutation::delete(key)])
    }
}

impl<S: KeyValueStorage + ?Sized> KeyValueStorage for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        (**self).get_many(keys)
    }

    fn apply_batch(&self, mutations: &[Mutation]) -> Result<()> {
        (**self).apply_batch(mutations)
    }

    fn scan_page(
        &self,
        start: ScanStart<'_>,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        (**self).scan_page(start, prefix, limit)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}

/// Lazy ordered scan over a prefix, fetched one page at a time.
///
/// The scan does not hold any lock between pages; entries committed after the
/// scan started may or may not be observed.
pub struct RangeScan<'a, S: ?Sized> {
    storage: &'a S,
    prefix: String,
    cursor: String,
    inclusive: bool,
    page_size: usize,
    buffer: VecDeque<(String, Vec<u8>)>,
    exhausted: bool,
}

impl<'a, S: KeyValueStorage + ?Sized> RangeScan<'a, S> {
    /// Scan keys `>= starting_key` that start with `prefix`.
    pub fn new(storage: &'a S, starting_key: &str, prefix: &str, page_size: usize) -> Self {
        Self {
            storage,
            prefix: prefix.to_string(),
            cursor: starting_key.to_string(),
            inclusive: true,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let start = if self.inclusive {
            ScanStart::Inclusive(&self.cursor)
        } else {
            ScanStart::Exclusive(&self.cursor)
        };
        let page = self.storage.scan_page(start, &self.prefix, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.cursor = last.clone();
            self.inclusive = false;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<S: KeyValueStorage + ?Sized> Iterator for RangeScan<'_, S> {
    type Item = Result<(String, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Cut an ordered iterator of entries down to one scan page.
///
/// Shared by the in-memory backends, whose maps already iterate in key order.
pub(crate) fn collect_page<'k, I>(entries: I, prefix: &str, limit: usize) -> Vec<(String, Vec<u8>)>
where
    I: Iterator<Item = (&'k String, &'k Vec<u8>)>,
{
    entries
        .take_while(|(k, _)| k.starts_with(prefix))
        .take(limit)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Bounds for a `BTreeMap::range` call starting at `start`.
pub(crate) fn range_bounds(start: ScanStart<'_>) -> (std::ops::Bound<String>, std::ops::Bound<String>) {
    use std::ops::Bound;
    match start {
        ScanStart::Inclusive(s) => (Bound::Included(s.to_string()), Bound::Unbounded),
        ScanStart::Exclusive(s) => (Bound::Excluded(s.to_string()), Bound::Unbounded),
    }
}

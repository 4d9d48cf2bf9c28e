//! Crash harness for testing flush recovery
//!
//! [`FailableStorage`] wraps any backend and consults a [`CrashSchedule`]
//! before every operation. When the schedule says so, the operation fails
//! with [`Error::InjectedFailure`] without touching the inner backend,
//! which is how a process dying between two writes looks to the store.
//!
//! # Example
//!
//! ```ignore
//! use chainstore_storage::testing::{CrashSchedule, FailableStorage};
//!
//! let backend = Arc::new(MemoryStorage::new());
//! let failing = FailableStorage::new(backend.clone(), CrashSchedule::crash_after(7));
//! // flush through `failing`, then reopen on `backend` to observe recovery
//! ```

use crate::kv::{KeyValueStorage, Mutation, ScanStart};
use chainstore_core::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Decides, per operation, whether it fails.
pub struct CrashSchedule {
    should_fail: Box<dyn Iterator<Item = bool> + Send>,
}

impl CrashSchedule {
    /// Schedule from an explicit sequence; operations past its end succeed.
    pub fn from_sequence<I>(schedule: I) -> Self
    where
        I: IntoIterator<Item = bool>,
        I::IntoIter: Send + 'static,
    {
        Self {
            should_fail: Box::new(schedule.into_iter()),
        }
    }

    /// First `ops` operations succeed, every later one fails.
    pub fn crash_after(ops: usize) -> Self {
        Self::from_sequence((0..).map(move |i| i >= ops))
    }

    /// Never fail.
    pub fn never() -> Self {
        Self::from_sequence(std::iter::empty())
    }

    fn should_fail_next(&mut self) -> bool {
        self.should_fail.next().unwrap_or(false)
    }
}

/// Backend wrapper that fails operations on a schedule.
pub struct FailableStorage<S> {
    inner: S,
    schedule: Mutex<CrashSchedule>,
    ops: AtomicU64,
}

impl<S: KeyValueStorage> FailableStorage<S> {
    /// Wrap `inner`.
    pub fn new(inner: S, schedule: CrashSchedule) -> Self {
        Self {
            inner,
            schedule: Mutex::new(schedule),
            ops: AtomicU64::new(0),
        }
    }

    /// Operations attempted so far, including failed ones.
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Unwrap the backend.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn check(&self, op: &str) -> Result<&S> {
        let n = self.ops.fetch_add(1, Ordering::Relaxed);
        if self.schedule.lock().should_fail_next() {
            return Err(Error::InjectedFailure(format!("{} (operation {})", op, n)));
        }
        Ok(&self.inner)
    }
}

impl<S: KeyValueStorage> KeyValueStorage for FailableStorage<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check("get")?.get(key)
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check("get_many")?.get_many(keys)
    }

    fn apply_batch(&self, mutations: &[Mutation]) -> Result<()> {
        self.check("apply_batch")?.apply_batch(mutations)
    }

    fn scan_page(
        &self,
        start: ScanStart<'_>,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        self.check("scan_page")?.scan_page(start, prefix, limit)
    }

    fn clear(&self) -> Result<()> {
        self.check("clear")?.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;

    #[test]
    fn test_crash_after_fails_later_operations() {
        let failing = FailableStorage::new(MemoryStorage::new(), CrashSchedule::crash_after(2));
        failing.put("a", b"1").unwrap();
        failing.put("b", b"2").unwrap();
        let err = failing.put("c", b"3").unwrap_err();
        assert!(err.is_injected());
        assert_eq!(failing.ops(), 3);

        let inner = failing.into_inner();
        assert_eq!(inner.get("b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(inner.get("c").unwrap(), None);
    }

    #[test]
    fn test_explicit_schedule() {
        let failing = FailableStorage::new(
            MemoryStorage::new(),
            CrashSchedule::from_sequence(vec![false, true]),
        );
        assert!(failing.get("a").is_ok());
        assert!(failing.get("a").is_err());
        assert!(failing.get("a").is_ok());
    }
}

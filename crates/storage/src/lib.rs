//! Storage layer for chainstore
//!
//! This crate implements durable entity persistence:
//! - KeyValueStorage: ordered key-value seam with atomic batches and paged scans
//! - LogStructuredStorage: ordered map replayed from a CRC-framed append-only segment
//! - RedbStorage: embedded transactional store
//! - MemoryStorage: in-process object store shared by clones
//! - KvEntityStore: entity values, index entries and the finalized pointer,
//!   flushed through an undo log and recovered on open
//! - testing: failure injection for crash recovery tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entity_store;
pub mod kv;
pub mod log_store;
pub mod memory;
pub mod redb_store;
pub mod segment;
pub mod testing;
pub mod updates;

pub use entity_store::{EntityIter, EntityStore, KvEntityStore, RecoveryOutcome};
pub use kv::{KeyValueStorage, Mutation, RangeScan, ScanStart};
pub use log_store::{LogStoreOptions, LogStructuredStorage};
pub use memory::MemoryStorage;
pub use redb_store::RedbStorage;
pub use updates::updates_for_entities;

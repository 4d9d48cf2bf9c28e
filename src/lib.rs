//! chainstore - fork-aware entity store for indexing blockchain event logs
//!
//! Event handlers turn contract logs into typed entities. Recent blocks are
//! staged in memory per block so a chain reorganization can be undone; blocks
//! deeper than the reorg margin are flushed to durable storage with an undo
//! log that makes every flush atomic across crashes.
//!
//! # Quick Start
//!
//! ```ignore
//! use chainstore::{ChainFollower, EntityDefinitions, FakeChain, KvEntityStore, MemoryStorage};
//!
//! let store = Arc::new(KvEntityStore::open(MemoryStorage::new())?);
//! let area = StorageArea::initial(store.as_ref())?.shared();
//! let mut follower = ChainFollower::new(chain, store, area, definitions, indexers, Default::default());
//! while follower.step().await? != FollowStep::Tip {}
//! ```
//!
//! # Architecture
//!
//! - `chainstore-core`: keys, sortable encodings, entity definitions, errors
//! - `chainstore-storage`: key-value backends and the durable entity store
//! - `chainstore-engine`: staging, reads, the chain follower and the drivers

pub use chainstore_core::*;
pub use chainstore_engine::*;
pub use chainstore_storage::*;

//! Indexing engine for chainstore
//!
//! This crate turns chain data into entity writes on top of
//! `chainstore-storage`:
//! - storage_area / handle / reader: fork-aware staging in front of the store
//! - abi / indexer: event decoding and handler dispatch
//! - provider: block and log sources, including an in-memory fake chain
//! - follower: the block-by-block state machine with finalization and reorgs
//! - log_storage / fetch / backfill / tail: the offline and live drivers
//! - config: `chainstore.toml`
//!
//! Provider calls are async; everything touching storage is synchronous.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod abi;
pub mod backfill;
pub mod config;
pub mod fetch;
pub mod follower;
pub mod handle;
pub mod indexer;
pub mod log_storage;
pub mod provider;
pub mod reader;
pub mod storage_area;
pub mod tail;

pub use abi::{AbiValue, EventAbi, EventArgs, ParamType};
pub use backfill::{backfill, highest_common_block, BackfillReport};
pub use config::{BackendKind, ChainstoreConfig, IndexerConfig, CONFIG_FILE_NAME};
pub use fetch::{fetch, FetchOptions, FetchReport, LogPage, LogPages, PageOptions};
pub use follower::{is_result_final, make_logs_cache, ChainFollower, FollowStep, FollowerOptions};
pub use handle::{BlockStorageHandle, EntityHandle, StagingStorageHandle};
pub use indexer::{EventHandler, IndexerDefinition, Indexers};
pub use log_storage::{LogAppender, LogStorage, MergedLogs};
pub use provider::{
    merge_topic_filters, Block, BlockProvider, BlockSpec, FakeChain, Log, LogFilter, LogProvider,
    RawEvent, TopicFilter,
};
pub use reader::{CachedReader, IndexMerge, Reader};
pub use storage_area::{path_between, SharedStorageArea, StorageArea};
pub use tail::{tail, TailOptions, TailReport};

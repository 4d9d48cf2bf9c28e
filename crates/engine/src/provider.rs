//! Block and log sources
//!
//! The engine depends on a chain only through [`BlockProvider`] and
//! [`LogProvider`]. [`FakeChain`] implements both in memory for tests and
//! supports reorganizing its own tail.

use alloy_primitives::{hex, keccak256, Address, Bytes, B256};
use async_trait::async_trait;
use chainstore_core::error::{Error, Result};
use chainstore_core::BlockIdentifier;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Chain data
// ============================================================================

/// A block header as far as the indexer cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Block height
    pub number: u64,
    /// Block hash
    pub hash: String,
    /// Hash of the parent block
    pub parent_hash: String,
}

impl Block {
    /// Identifier of this block.
    pub fn identifier(&self) -> BlockIdentifier {
        BlockIdentifier::new(self.number, self.hash.clone())
    }

    /// Identifier of the parent block.
    pub fn parent_identifier(&self) -> BlockIdentifier {
        BlockIdentifier::new(self.number.saturating_sub(1), self.parent_hash.clone())
    }
}

/// An event log emitted by a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Emitting contract
    pub address: Address,
    /// Indexed topics; the first is the event selector
    pub topics: Vec<B256>,
    /// ABI encoded non-indexed arguments
    pub data: Bytes,
    /// Block height
    pub block_number: u64,
    /// Block hash
    pub block_hash: String,
    /// Transaction position in the block
    pub transaction_index: u64,
    /// Log position in the block
    pub log_index: u64,
    /// Transaction hash, if the source provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<B256>,
}

impl Log {
    /// Block this log was emitted in.
    pub fn block(&self) -> BlockIdentifier {
        BlockIdentifier::new(self.block_number, self.block_hash.clone())
    }

    /// Position of this log in the chain.
    pub fn ordinal(&self) -> (u64, u64, u64) {
        (self.block_number, self.transaction_index, self.log_index)
    }
}

/// Which blocks a log query covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSpec {
    /// Inclusive block number range
    Range {
        /// First block
        from_block: u64,
        /// Last block
        to_block: u64,
    },
    /// One block by hash
    Hash(String),
}

/// Address and topic restrictions of a log query.
///
/// `topics[i]` lists the accepted values of topic `i`; an empty list (or a
/// missing position) accepts anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicFilter {
    /// Accepted emitting addresses; empty accepts any
    pub address: Vec<Address>,
    /// Accepted topics by position
    pub topics: Vec<Vec<B256>>,
}

impl TopicFilter {
    /// Union of two filters: addresses are concatenated and topic positions
    /// merged pairwise.
    pub fn combine(mut self, other: &TopicFilter) -> Self {
        self.address.extend(other.address.iter().copied());
        self.topics = merge_topic_filters(&self.topics, &other.topics);
        self
    }

    /// True if `log` passes the filter.
    pub fn matches(&self, log: &Log) -> bool {
        if !self.address.is_empty() && !self.address.contains(&log.address) {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, accepted)| {
            accepted.is_empty() || log.topics.get(i).is_some_and(|t| accepted.contains(t))
        })
    }
}

/// Merge topic filters position by position.
pub fn merge_topic_filters(a: &[Vec<B256>], b: &[Vec<B256>]) -> Vec<Vec<B256>> {
    (0..a.len().max(b.len()))
        .map(|i| {
            let mut merged = a.get(i).cloned().unwrap_or_default();
            for topic in b.get(i).into_iter().flatten() {
                if !merged.contains(topic) {
                    merged.push(*topic);
                }
            }
            merged
        })
        .collect()
}

/// A complete log query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    /// Blocks covered
    pub blocks: BlockSpec,
    /// Address and topic restrictions
    pub topics: TopicFilter,
}

impl LogFilter {
    /// Query over an inclusive block range.
    pub fn range(topics: TopicFilter, from_block: u64, to_block: u64) -> Self {
        Self {
            blocks: BlockSpec::Range {
                from_block,
                to_block,
            },
            topics,
        }
    }

    /// Query over one block by hash.
    pub fn block_hash(topics: TopicFilter, hash: impl Into<String>) -> Self {
        Self {
            blocks: BlockSpec::Hash(hash.into()),
            topics,
        }
    }
}

// ============================================================================
// Provider traits
// ============================================================================

/// Source of block headers.
#[async_trait]
pub trait BlockProvider: Send + Sync {
    /// Block with the given hash.
    ///
    /// # Errors
    ///
    /// [`Error::Provider`] if the hash is unknown.
    async fn get_block_by_hash(&self, hash: &str) -> Result<Block>;

    /// Canonical block at `number`, `None` if beyond the head.
    async fn get_block_by_number(&self, number: u64) -> Result<Option<Block>>;

    /// Current head of the chain.
    async fn get_latest_block(&self) -> Result<Block>;
}

/// Source of event logs.
#[async_trait]
pub trait LogProvider: Send + Sync {
    /// Logs matching `filter`, in ascending `(block, tx index, log index)`
    /// order.
    ///
    /// # Errors
    ///
    /// [`Error::ResponseTooLarge`] if a range query should be split.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>>;
}

#[async_trait]
impl<P: BlockProvider + ?Sized> BlockProvider for Arc<P> {
    async fn get_block_by_hash(&self, hash: &str) -> Result<Block> {
        (**self).get_block_by_hash(hash).await
    }

    async fn get_block_by_number(&self, number: u64) -> Result<Option<Block>> {
        (**self).get_block_by_number(number).await
    }

    async fn get_latest_block(&self) -> Result<Block> {
        (**self).get_latest_block().await
    }
}

#[async_trait]
impl<P: LogProvider + ?Sized> LogProvider for Arc<P> {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        (**self).get_logs(filter).await
    }
}

// ============================================================================
// FakeChain
// ============================================================================

/// An event to be placed in a [`FakeChain`] block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Emitting contract
    pub address: Address,
    /// Topics, selector first
    pub topics: Vec<B256>,
    /// ABI encoded data
    pub data: Bytes,
}

#[derive(Debug)]
struct FakeChainState {
    blocks: Vec<(Block, Vec<Log>)>,
    orphans: Vec<(Block, Vec<Log>)>,
    forks: u64,
    max_logs_per_response: Option<usize>,
}

/// In-memory chain starting at a genesis block numbered 0.
///
/// Cheap to clone; clones share the chain. Block hashes are derived from the
/// parent hash, the height and a fork counter, so a reorganized tail gets
/// fresh hashes.
#[derive(Debug, Clone)]
pub struct FakeChain {
    state: Arc<RwLock<FakeChainState>>,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChain {
    /// Chain holding only the genesis block.
    pub fn new() -> Self {
        let genesis = Block {
            number: 0,
            hash: "0x0".to_string(),
            parent_hash: "0x".to_string(),
        };
        Self {
            state: Arc::new(RwLock::new(FakeChainState {
                blocks: vec![(genesis, Vec::new())],
                orphans: Vec::new(),
                forks: 0,
                max_logs_per_response: None,
            })),
        }
    }

    /// Append a block holding `events`, one transaction per event.
    pub fn append_block(&self, events: Vec<RawEvent>) -> Block {
        let mut state = self.state.write();
        let parent = state.blocks[state.blocks.len() - 1].0.clone();
        let number = parent.number + 1;
        let seed = format!("{}:{}:{}", parent.hash, number, state.forks);
        let block = Block {
            number,
            hash: hex::encode_prefixed(keccak256(seed.as_bytes())),
            parent_hash: parent.hash,
        };
        let logs = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| Log {
                address: event.address,
                topics: event.topics,
                data: event.data,
                block_number: number,
                block_hash: block.hash.clone(),
                transaction_index: i as u64,
                log_index: i as u64,
                transaction_hash: None,
            })
            .collect();
        state.blocks.push((block.clone(), logs));
        block
    }

    /// Append `count` blocks without events.
    pub fn append_empty_blocks(&self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.append_block(Vec::new())).collect()
    }

    /// Number of the newest canonical block.
    pub fn height(&self) -> u64 {
        let state = self.state.read();
        state.blocks.last().map_or(0, |(b, _)| b.number)
    }

    /// Drop every block above `number`; later appends start a new fork.
    ///
    /// Dropped blocks stay reachable by hash, the way a node still serves
    /// headers of abandoned blocks.
    pub fn rewind_to(&self, number: u64) {
        let mut state = self.state.write();
        let keep = state
            .blocks
            .iter()
            .position(|(b, _)| b.number > number)
            .unwrap_or(state.blocks.len());
        let dropped: Vec<(Block, Vec<Log>)> = state.blocks.drain(keep..).collect();
        state.orphans.extend(dropped);
        state.forks += 1;
    }

    /// Make range log queries returning more than `max` logs fail with
    /// [`Error::ResponseTooLarge`].
    pub fn set_max_logs_per_response(&self, max: Option<usize>) {
        self.state.write().max_logs_per_response = max;
    }

    fn find_by_hash<'s>(state: &'s FakeChainState, hash: &str) -> Option<&'s (Block, Vec<Log>)> {
        state
            .blocks
            .iter()
            .chain(state.orphans.iter())
            .find(|(b, _)| b.hash == hash)
    }
}

#[async_trait]
impl BlockProvider for FakeChain {
    async fn get_block_by_hash(&self, hash: &str) -> Result<Block> {
        let state = self.state.read();
        Self::find_by_hash(&state, hash)
            .map(|(b, _)| b.clone())
            .ok_or_else(|| Error::Provider(format!("unknown block hash {}", hash)))
    }

    async fn get_block_by_number(&self, number: u64) -> Result<Option<Block>> {
        let state = self.state.read();
        Ok(state
            .blocks
            .iter()
            .find(|(b, _)| b.number == number)
            .map(|(b, _)| b.clone()))
    }

    async fn get_latest_block(&self) -> Result<Block> {
        let state = self.state.read();
        state
            .blocks
            .last()
            .map(|(b, _)| b.clone())
            .ok_or_else(|| Error::Provider("no blocks".to_string()))
    }
}

#[async_trait]
impl LogProvider for FakeChain {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        let state = self.state.read();
        let logs: Vec<Log> = match &filter.blocks {
            BlockSpec::Range {
                from_block,
                to_block,
            } => {
                let logs: Vec<Log> = state
                    .blocks
                    .iter()
                    .filter(|(b, _)| b.number >= *from_block && b.number <= *to_block)
                    .flat_map(|(_, logs)| logs.iter())
                    .filter(|log| filter.topics.matches(log))
                    .cloned()
                    .collect();
                if let Some(max) = state.max_logs_per_response {
                    if logs.len() > max {
                        return Err(Error::ResponseTooLarge {
                            from_block: *from_block,
                            to_block: *to_block,
                        });
                    }
                }
                logs
            }
            BlockSpec::Hash(hash) => {
                let (_, logs) = Self::find_by_hash(&state, hash)
                    .ok_or_else(|| Error::Provider(format!("unknown block hash {}", hash)))?;
                logs.iter()
                    .filter(|log| filter.topics.matches(log))
                    .cloned()
                    .collect()
            }
        };
        Ok(logs)
    }
}

//! Chain follower
//!
//! [`ChainFollower::step`] advances the indexed chain by one block:
//!
//! 1. If the next block is above the provider's latest block, report
//!    [`FollowStep::Tip`], unless the provider's head differs from the tip.
//!    Then a reorg replaced the newest blocks and the new head is processed.
//! 2. Fetch the block and its logs. If its parent is unknown (a reorg, or
//!    blocks we skipped), walk back by hash until a known block and process
//!    the missing ancestors oldest first.
//! 3. Record the block's parent and run every log through the indexers. All
//!    writes land in the block's staging map.
//! 4. Move the tip, then flush every block deeper than `max_reorg_depth` to
//!    the store, oldest first, and prune abandoned forks.
//!
//! Only the follower mutates the storage area. Readers may run concurrently
//! between lock acquisitions.

use crate::handle::BlockStorageHandle;
use crate::indexer::Indexers;
use crate::provider::{Block, BlockProvider, Log, LogFilter, LogProvider, TopicFilter};
use crate::reader::Reader;
use crate::storage_area::{path_between, SharedStorageArea};
use chainstore_core::error::{Error, Result};
use chainstore_core::{BlockIdentifier, EntityDefinitions};
use chainstore_storage::EntityStore;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Tuning of a [`ChainFollower`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerOptions {
    /// Blocks deeper than this below the latest block are final
    pub max_reorg_depth: u64,
    /// Flush final blocks to the store; disabled followers only stage
    pub finalization_enabled: bool,
}

impl Default for FollowerOptions {
    fn default() -> Self {
        Self {
            max_reorg_depth: 10,
            finalization_enabled: true,
        }
    }
}

/// Outcome of one [`ChainFollower::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowStep {
    /// Caught up with the provider's latest block
    Tip,
    /// A block was processed and more may follow
    More {
        /// Latest block number minus the processed block number
        depth: u64,
        /// Number of the block the next step will process
        next_block: u64,
    },
}

/// Drives indexers along the chain one block at a time.
pub struct ChainFollower<P> {
    provider: P,
    store: Arc<dyn EntityStore>,
    area: SharedStorageArea,
    definitions: Arc<EntityDefinitions>,
    indexers: Arc<Indexers>,
    filter: TopicFilter,
    options: FollowerOptions,
    next_block: u64,
}

impl<P: BlockProvider + LogProvider> ChainFollower<P> {
    /// Follower continuing from the storage area's finalized block.
    pub fn new(
        provider: P,
        store: Arc<dyn EntityStore>,
        area: SharedStorageArea,
        definitions: Arc<EntityDefinitions>,
        indexers: Arc<Indexers>,
        options: FollowerOptions,
    ) -> Self {
        let next_block = area.read().finalized.block_number + 1;
        let filter = indexers.topic_filter();
        Self {
            provider,
            store,
            area,
            definitions,
            indexers,
            filter,
            options,
            next_block,
        }
    }

    /// The storage area this follower writes to.
    pub fn storage_area(&self) -> &SharedStorageArea {
        &self.area
    }

    /// Reader resolving against the current tip.
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(&*self.store, &self.area, &self.definitions)
    }

    /// Number of the block the next step will process.
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// True if the chain cannot move past `step` without a reorg deeper
    /// than the configured margin.
    pub fn is_result_final(&self, step: &FollowStep) -> bool {
        is_result_final(step, self.options.max_reorg_depth)
    }

    /// Process the next block.
    ///
    /// # Errors
    ///
    /// Fails on provider errors, handler failures ([`Error::Handler`]) and
    /// lineage conflicts with the finalized block ([`Error::Lineage`]). The
    /// follower must not be stepped again after an error.
    pub async fn step(&mut self) -> Result<FollowStep> {
        let latest = self.provider.get_latest_block().await?;
        if self.next_block > latest.number {
            return self.follow_replaced_head(latest).await;
        }

        let block = self
            .provider
            .get_block_by_number(self.next_block)
            .await?
            .ok_or_else(|| Error::Provider(format!("block {} not found", self.next_block)))?;

        let logs = self
            .provider
            .get_logs(&LogFilter::range(self.filter.clone(), block.number, block.number))
            .await?;
        let mut logs_cache = make_logs_cache(logs, std::slice::from_ref(&block))?;
        let logs = logs_cache.remove(&block.hash).unwrap_or_default();

        self.apply_block(&block, &logs, latest.number, false).await?;

        self.next_block = block.number + 1;
        let depth = latest.number.saturating_sub(block.number);
        debug!(
            target: "chainstore::follower",
            block = block.number,
            hash = %block.hash,
            logs = logs.len(),
            depth,
            "Processed block"
        );

        Ok(FollowStep::More {
            depth,
            next_block: self.next_block,
        })
    }

    /// Called once the follower has caught up: if the provider's head is no
    /// longer the tip, a reorg replaced the last blocks without making the
    /// chain longer. Process the new head and move the tip to it.
    async fn follow_replaced_head(&mut self, head: Block) -> Result<FollowStep> {
        let replaced = {
            let area = self.area.read();
            match &area.tip {
                Some(tip) => tip.hash != head.hash && head.number > area.finalized.block_number,
                None => false,
            }
        };
        if !replaced {
            return Ok(FollowStep::Tip);
        }

        info!(
            target: "chainstore::follower",
            block = head.number,
            hash = %head.hash,
            "Chain head replaced"
        );
        let logs = self
            .provider
            .get_logs(&LogFilter::block_hash(self.filter.clone(), head.hash.clone()))
            .await?;
        self.apply_block(&head, &logs, head.number, true).await?;

        self.next_block = head.number + 1;
        Ok(FollowStep::More {
            depth: 0,
            next_block: self.next_block,
        })
    }

    /// Process `block` unless it already is in the lineage map, move the tip
    /// and finalize.
    ///
    /// The tip moves to any block at or above its height, or to `block`
    /// unconditionally when it is the provider's replaced head. It moves
    /// before finalization so concurrent readers always find a path from the
    /// tip to the finalized block.
    async fn apply_block(
        &self,
        block: &Block,
        logs: &[Log],
        latest: u64,
        replaces_head: bool,
    ) -> Result<()> {
        let known = self.area.read().parents.contains_key(&block.hash);
        if !known {
            self.ensure_parents_available(block.parent_identifier()).await?;
            self.area.write().add_parent(block.hash.clone(), block.parent_identifier());
            self.process_block(block, logs)?;
        }

        {
            let mut area = self.area.write();
            let advances = area
                .tip
                .as_ref()
                .map_or(true, |tip| block.number >= tip.block_number);
            if advances || replaces_head {
                area.tip = Some(block.identifier());
            }
        }

        if self.options.finalization_enabled {
            self.promote_finalized_blocks(latest, &block.identifier())?;
        }
        Ok(())
    }

    /// Make sure `parent` and all its ancestors down to the finalized block
    /// are in the lineage map, fetching and processing any that are not.
    async fn ensure_parents_available(&self, parent: BlockIdentifier) -> Result<()> {
        let mut missing: Vec<Block> = Vec::new();
        let mut cursor = parent;
        loop {
            {
                let area = self.area.read();
                let finalized = &area.finalized;
                if cursor.block_number == finalized.block_number {
                    if cursor.hash != finalized.hash {
                        return Err(Error::Lineage(format!(
                            "reorg deeper than {} blocks: {} conflicts with finalized {}",
                            self.options.max_reorg_depth, cursor, finalized
                        )));
                    }
                    break;
                }
                if cursor.block_number < finalized.block_number {
                    return Err(Error::Lineage(format!(
                        "block {} is below finalized {}",
                        cursor, finalized
                    )));
                }
                if area.parents.contains_key(&cursor.hash) {
                    break;
                }
            }

            let block = self.provider.get_block_by_hash(&cursor.hash).await?;
            cursor = block.parent_identifier();
            missing.push(block);
        }

        if !missing.is_empty() {
            info!(
                target: "chainstore::follower",
                count = missing.len(),
                from = missing[missing.len() - 1].number,
                "Processing missing ancestors"
            );
        }

        for block in missing.into_iter().rev() {
            let logs = self
                .provider
                .get_logs(&LogFilter::block_hash(self.filter.clone(), block.hash.clone()))
                .await?;
            self.area.write().add_parent(block.hash.clone(), block.parent_identifier());
            self.process_block(&block, &logs)?;
        }
        Ok(())
    }

    fn process_block(&self, block: &Block, logs: &[Log]) -> Result<()> {
        let mut handle = BlockStorageHandle::new(
            &*self.store,
            &self.area,
            &self.definitions,
            block.identifier(),
        );
        for log in logs {
            self.indexers.process_log(&mut handle, log)?;
        }
        Ok(())
    }

    /// Flush every block on the path from `block` whose depth below
    /// `latest` exceeds the reorg margin.
    fn promote_finalized_blocks(&self, latest: u64, block: &BlockIdentifier) -> Result<()> {
        let path = self.area.read().path_to_finalized(block)?;
        let max_depth = self.options.max_reorg_depth;

        let mut flushed = 0;
        for ancestor in path
            .iter()
            .rev()
            .filter(|b| latest.saturating_sub(b.block_number) > max_depth)
        {
            let changes = self
                .area
                .read()
                .staging
                .get(&ancestor.hash)
                .cloned()
                .unwrap_or_default();
            self.store.flush_updates(ancestor, &self.definitions, &changes)?;
            self.area.write().finalize(ancestor);
            flushed += 1;
        }

        if flushed > 0 {
            let pruned = self.area.write().prune_below_finalized();
            if pruned > 0 {
                info!(
                    target: "chainstore::follower",
                    pruned,
                    "Dropped abandoned fork blocks"
                );
            }
            debug!(
                target: "chainstore::follower",
                flushed,
                finalized = %self.area.read().finalized,
                "Finalized blocks"
            );
        }
        Ok(())
    }
}

/// True for [`FollowStep::Tip`] and for steps no deeper than
/// `max_reorg_depth`.
pub fn is_result_final(step: &FollowStep, max_reorg_depth: u64) -> bool {
    match step {
        FollowStep::Tip => true,
        FollowStep::More { depth, .. } => *depth <= max_reorg_depth,
    }
}

/// Group `logs` by block hash.
///
/// Every block in `blocks` gets an entry, empty if it has no logs, so a
/// lookup hit means the block's logs need not be fetched again.
///
/// # Errors
///
/// Returns [`Error::Lineage`] if `blocks` do not form one chain from the last
/// back to the first.
pub fn make_logs_cache(logs: Vec<Log>, blocks: &[Block]) -> Result<FxHashMap<String, Vec<Log>>> {
    if let (Some(first), Some(last)) = (blocks.first(), blocks.last()) {
        let parents: FxHashMap<String, BlockIdentifier> = blocks
            .iter()
            .map(|b| (b.hash.clone(), b.parent_identifier()))
            .collect();
        path_between(&last.identifier(), &first.identifier(), &parents)?;
    }

    let mut cache: FxHashMap<String, Vec<Log>> = blocks
        .iter()
        .map(|b| (b.hash.clone(), Vec::new()))
        .collect();
    for log in logs {
        cache.entry(log.block_hash.clone()).or_default().push(log);
    }
    Ok(cache)
}

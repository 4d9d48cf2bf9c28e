//! Bulk replay of downloaded logs
//!
//! Backfill never touches the network. It merges every indexer's log file in
//! chain order, replays the logs block by block against a staging map and
//! flushes each block as one transaction. It finishes by moving the
//! finalized pointer to the last block it covered, which is what the chain
//! follower starts from.

use crate::handle::StagingStorageHandle;
use crate::indexer::Indexers;
use crate::log_storage::LogStorage;
use crate::provider::Log;
use chainstore_core::error::{Error, Result};
use chainstore_core::{BlockIdentifier, EntityDefinitions, StagedEntities};
use chainstore_storage::EntityStore;
use tracing::{debug, info};

/// Blocks between progress events.
const PROGRESS_INTERVAL: u64 = 10_000;

/// What a backfill run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    /// Finalized block after the run
    pub finalized: BlockIdentifier,
    /// Blocks flushed (only blocks that had logs)
    pub blocks: usize,
    /// Logs replayed
    pub logs: usize,
}

/// Lowest block every indexer's logs are complete up to.
///
/// # Errors
///
/// Returns [`Error::MissingLogs`] for the first indexer never fetched.
pub fn highest_common_block(
    indexers: &Indexers,
    storage: &LogStorage,
) -> Result<Option<BlockIdentifier>> {
    let mut lowest: Option<BlockIdentifier> = None;
    for indexer in indexers.iter() {
        let index = storage
            .load_last_index(&indexer.name)?
            .ok_or_else(|| Error::MissingLogs(indexer.name.clone()))?;
        if lowest.as_ref().map_or(true, |l| index.block_number < l.block_number) {
            lowest = Some(index);
        }
    }
    Ok(lowest)
}

/// Replay downloaded logs into `store` up to the highest common block, or
/// `cap` if that is lower.
///
/// Blocks at or below the store's finalized block are skipped, so an
/// interrupted backfill can simply be run again.
///
/// # Errors
///
/// Returns [`Error::MissingLogs`] if an indexer was never fetched, and
/// [`Error::Handler`] if a log fails to decode or its handler fails.
pub fn backfill(
    store: &dyn EntityStore,
    indexers: &Indexers,
    definitions: &EntityDefinitions,
    storage: &LogStorage,
    cap: Option<&BlockIdentifier>,
) -> Result<Option<BackfillReport>> {
    let Some(common) = highest_common_block(indexers, storage)? else {
        return Ok(None);
    };
    let last = match cap {
        Some(cap) if cap.block_number < common.block_number => cap.clone(),
        _ => common,
    };

    let finalized = store.get_finalized_block()?;
    if let Some(finalized) = &finalized {
        if finalized.block_number >= last.block_number {
            info!(
                target: "chainstore::backfill",
                finalized = %finalized,
                "Store already finalized past backfill target"
            );
            return Ok(None);
        }
    }
    let skip_through = finalized.as_ref().map(|f| f.block_number);

    info!(
        target: "chainstore::backfill",
        from = ?skip_through,
        to = %last,
        "Backfilling"
    );

    let mut report = BackfillReport {
        finalized: last.clone(),
        blocks: 0,
        logs: 0,
    };
    let mut next_progress = PROGRESS_INTERVAL;

    let merged = storage.merged_logs(indexers.iter().map(|i| i.name.as_str()))?;
    let mut batch: Vec<Log> = Vec::new();
    for log in merged {
        let log = log?;
        if skip_through.is_some_and(|f| log.block_number <= f) {
            continue;
        }
        if log.block_number > last.block_number {
            break;
        }
        if batch.first().is_some_and(|first| first.block_number != log.block_number) {
            report.logs += flush_block(store, indexers, definitions, &batch)?;
            report.blocks += 1;
            batch.clear();
        }
        if log.block_number >= next_progress {
            info!(
                target: "chainstore::backfill",
                block = log.block_number,
                target_block = last.block_number,
                "Backfill progress"
            );
            next_progress = log.block_number + PROGRESS_INTERVAL;
        }
        batch.push(log);
    }
    if !batch.is_empty() {
        report.logs += flush_block(store, indexers, definitions, &batch)?;
        report.blocks += 1;
    }

    store.flush_updates(&last, definitions, &StagedEntities::new())?;
    info!(
        target: "chainstore::backfill",
        finalized = %last,
        blocks = report.blocks,
        logs = report.logs,
        "Backfill complete"
    );
    Ok(Some(report))
}

/// Replay one block's logs and flush the result.
fn flush_block(
    store: &dyn EntityStore,
    indexers: &Indexers,
    definitions: &EntityDefinitions,
    logs: &[Log],
) -> Result<usize> {
    let Some(first) = logs.first() else {
        return Ok(0);
    };

    let mut staging = StagedEntities::new();
    for log in logs {
        let mut handle = StagingStorageHandle::new(&mut staging, store, definitions);
        indexers.process_log(&mut handle, log)?;
    }

    let block = first.block();
    store.flush_updates(&block, definitions, &staging)?;
    debug!(
        target: "chainstore::backfill",
        block = block.block_number,
        logs = logs.len(),
        entities = staging.len(),
        "Flushed block"
    );
    Ok(logs.len())
}

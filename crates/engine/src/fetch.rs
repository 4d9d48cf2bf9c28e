//! Log download
//!
//! `fetch` appends each indexer's logs, up to the last block considered safe
//! from reorgs, to its file in [`LogStorage`]. It resumes after whatever the
//! file already holds.
//!
//! Providers cap how many logs one query may return. [`LogPages`] walks a
//! block range page by page and halves the page whenever the provider answers
//! [`Error::ResponseTooLarge`], giving up after a bounded number of
//! consecutive halvings.

use crate::indexer::{IndexerDefinition, Indexers};
use crate::log_storage::LogStorage;
use crate::provider::{BlockProvider, Log, LogFilter, LogProvider, TopicFilter};
use chainstore_core::error::{Error, Result};
use chainstore_core::BlockIdentifier;
use tracing::{debug, info, warn};

/// Page sizing for range log queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOptions {
    /// Blocks per query before any halving
    pub initial_page_size: u64,
    /// Consecutive halvings allowed before giving up
    pub max_page_halvings: u32,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            initial_page_size: 2000,
            max_page_halvings: 12,
        }
    }
}

/// One successful range query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPage {
    /// First block covered
    pub from_block: u64,
    /// Last block covered
    pub to_block: u64,
    /// Logs in the range
    pub logs: Vec<Log>,
}

/// Pages of logs over an inclusive block range.
pub struct LogPages<'a, P: ?Sized> {
    provider: &'a P,
    topics: TopicFilter,
    next_block: u64,
    to_block: u64,
    page_size: u64,
    halvings: u32,
    options: PageOptions,
}

impl<'a, P: LogProvider + ?Sized> LogPages<'a, P> {
    /// Pages of logs matching `topics` in `from_block..=to_block`.
    pub fn new(
        provider: &'a P,
        topics: TopicFilter,
        from_block: u64,
        to_block: u64,
        options: PageOptions,
    ) -> Self {
        Self {
            provider,
            topics,
            next_block: from_block,
            to_block,
            page_size: options.initial_page_size.max(1),
            halvings: 0,
            options,
        }
    }

    /// The next page, `None` once the range is covered.
    ///
    /// # Errors
    ///
    /// Returns the provider's [`Error::ResponseTooLarge`] once the halving
    /// budget is spent, and any other provider error immediately.
    pub async fn next_page(&mut self) -> Result<Option<LogPage>> {
        loop {
            if self.next_block > self.to_block {
                return Ok(None);
            }

            let from_block = self.next_block;
            let to_block = from_block
                .saturating_add(self.page_size - 1)
                .min(self.to_block);
            let filter = LogFilter::range(self.topics.clone(), from_block, to_block);

            match self.provider.get_logs(&filter).await {
                Ok(logs) => {
                    self.next_block = to_block + 1;
                    self.halvings = 0;
                    self.page_size = self
                        .page_size
                        .saturating_mul(2)
                        .min(self.options.initial_page_size.max(1));
                    return Ok(Some(LogPage {
                        from_block,
                        to_block,
                        logs,
                    }));
                }
                Err(e) if e.is_response_too_large() => {
                    if self.halvings >= self.options.max_page_halvings || self.page_size == 1 {
                        return Err(e);
                    }
                    self.halvings += 1;
                    self.page_size = (self.page_size / 2).max(1);
                    warn!(
                        target: "chainstore::fetch",
                        from_block,
                        to_block,
                        page_size = self.page_size,
                        halvings = self.halvings,
                        "Log response too large, shrinking page"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Every remaining log in one vector.
    pub async fn collect_all(mut self) -> Result<Vec<Log>> {
        let mut logs = Vec::new();
        while let Some(page) = self.next_page().await? {
            logs.extend(page.logs);
        }
        Ok(logs)
    }
}

// ============================================================================
// Fetch driver
// ============================================================================

/// Options of a fetch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Blocks this close to the latest block are left for the follower
    pub max_reorg_depth: u64,
    /// Range query paging
    pub page: PageOptions,
}

/// What one indexer's fetch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    /// Indexer name
    pub indexer: String,
    /// First block queried
    pub from_block: u64,
    /// Block the log file is now complete up to
    pub end_block: BlockIdentifier,
    /// Logs appended
    pub logs_written: usize,
}

/// Download logs for one indexer (`only`) or all of them.
///
/// # Errors
///
/// Returns [`Error::UnknownIndexer`] if `only` names no indexer, and any
/// provider or file error.
pub async fn fetch<P>(
    provider: &P,
    indexers: &Indexers,
    only: Option<&str>,
    storage: &LogStorage,
    options: &FetchOptions,
) -> Result<Vec<FetchReport>>
where
    P: BlockProvider + LogProvider + ?Sized,
{
    let selected: Vec<&IndexerDefinition> = match only {
        Some(name) => vec![indexers.get(name)?],
        None => indexers.iter().collect(),
    };

    let latest = provider.get_latest_block().await?;
    let safe_number = latest.number.saturating_sub(options.max_reorg_depth);
    let end = provider
        .get_block_by_number(safe_number)
        .await?
        .ok_or_else(|| Error::Provider(format!("block {} not found", safe_number)))?
        .identifier();

    let mut reports = Vec::with_capacity(selected.len());
    for indexer in selected {
        reports.push(fetch_indexer(provider, indexer, storage, &end, options).await?);
    }
    Ok(reports)
}

async fn fetch_indexer<P>(
    provider: &P,
    indexer: &IndexerDefinition,
    storage: &LogStorage,
    end: &BlockIdentifier,
    options: &FetchOptions,
) -> Result<FetchReport>
where
    P: LogProvider + ?Sized,
{
    let after_log = storage
        .load_last_log(&indexer.name)?
        .map(|log| log.block_number + 1);
    let after_index = storage
        .load_last_index(&indexer.name)?
        .map(|block| block.block_number + 1);
    let from_block = after_log
        .into_iter()
        .chain(after_index)
        .max()
        .unwrap_or(indexer.starting_block)
        .max(indexer.starting_block);

    info!(
        target: "chainstore::fetch",
        indexer = %indexer.name,
        from_block,
        to_block = end.block_number,
        "Fetching logs"
    );

    let mut appender = storage.appender(&indexer.name)?;
    let mut pages = LogPages::new(
        provider,
        indexer.topic_filter(),
        from_block,
        end.block_number,
        options.page,
    );
    while let Some(page) = pages.next_page().await? {
        for log in &page.logs {
            appender.append(log)?;
        }
        debug!(
            target: "chainstore::fetch",
            indexer = %indexer.name,
            block = page.to_block,
            target_block = end.block_number,
            logs = page.logs.len(),
            "Fetched page"
        );
    }
    let logs_written = appender.finish()?;
    storage.write_index(&indexer.name, end)?;

    info!(
        target: "chainstore::fetch",
        indexer = %indexer.name,
        logs = logs_written,
        end = %end,
        "Fetch complete"
    );

    Ok(FetchReport {
        indexer: indexer.name.clone(),
        from_block,
        end_block: end.clone(),
        logs_written,
    })
}

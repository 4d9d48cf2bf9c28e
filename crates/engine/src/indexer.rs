//! Indexer registry
//!
//! An [`IndexerDefinition`] binds a contract address to the events it emits
//! and one handler per event. [`Indexers`] is the closed set the drivers run
//! with; it builds the combined log filter and routes each log to its
//! handler.

use crate::abi::{EventAbi, EventArgs};
use crate::handle::EntityHandle;
use crate::provider::{Log, TopicFilter};
use alloy_primitives::{Address, B256};
use chainstore_core::error::{Error, Result};
use chainstore_core::StructuredError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Handler invoked once per decoded log.
pub type EventHandler =
    Arc<dyn Fn(&mut dyn EntityHandle, &EventArgs, &Log) -> Result<()> + Send + Sync>;

/// One contract and the events it is indexed by.
#[derive(Clone)]
pub struct IndexerDefinition {
    /// Name used for log files and on the command line
    pub name: String,
    /// Contract address
    pub address: Address,
    /// First block worth fetching (usually the deployment block)
    pub starting_block: u64,
    events: BTreeMap<B256, (EventAbi, EventHandler)>,
}

impl fmt::Debug for IndexerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexerDefinition")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("starting_block", &self.starting_block)
            .field(
                "events",
                &self.events.values().map(|(abi, _)| abi.to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl IndexerDefinition {
    /// Indexer with no events yet.
    pub fn new(name: impl Into<String>, address: Address, starting_block: u64) -> Self {
        Self {
            name: name.into(),
            address,
            starting_block,
            events: BTreeMap::new(),
        }
    }

    /// Register `handler` for the event `signature`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the signature does not parse.
    pub fn with_handler<F>(mut self, signature: &str, handler: F) -> Result<Self>
    where
        F: Fn(&mut dyn EntityHandle, &EventArgs, &Log) -> Result<()> + Send + Sync + 'static,
    {
        let abi = EventAbi::parse(signature)?;
        self.events.insert(abi.selector(), (abi, Arc::new(handler)));
        Ok(self)
    }

    /// Parsed events in selector order.
    pub fn events(&self) -> impl Iterator<Item = &EventAbi> {
        self.events.values().map(|(abi, _)| abi)
    }

    /// The event whose selector is `topic0`, with its handler.
    pub fn event(&self, topic0: &B256) -> Option<(&EventAbi, &EventHandler)> {
        self.events.get(topic0).map(|(abi, handler)| (abi, handler))
    }

    /// Filter matching every log this indexer handles.
    pub fn topic_filter(&self) -> TopicFilter {
        TopicFilter {
            address: vec![self.address],
            topics: vec![self.events.keys().copied().collect()],
        }
    }
}

/// The registered indexers.
#[derive(Debug, Clone, Default)]
pub struct Indexers {
    indexers: Vec<IndexerDefinition>,
}

impl Indexers {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an indexer (builder style).
    pub fn with(mut self, indexer: IndexerDefinition) -> Self {
        self.indexers.push(indexer);
        self
    }

    /// Indexer named `name`.
    pub fn get(&self, name: &str) -> Result<&IndexerDefinition> {
        self.indexers
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| Error::UnknownIndexer(name.to_string()))
    }

    /// All indexers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexerDefinition> {
        self.indexers.iter()
    }

    /// Number of indexers
    pub fn len(&self) -> usize {
        self.indexers.len()
    }

    /// True if no indexer is registered
    pub fn is_empty(&self) -> bool {
        self.indexers.is_empty()
    }

    /// Union of all indexers' filters.
    pub fn topic_filter(&self) -> TopicFilter {
        self.indexers
            .iter()
            .fold(TopicFilter::default(), |acc, i| acc.combine(&i.topic_filter()))
    }

    /// Decode `log` and run every handler registered for it.
    ///
    /// # Errors
    ///
    /// Any decode or handler failure is returned as [`Error::Handler`] with
    /// the log, the event signature, the decoded arguments and the entities
    /// loaded through `handle`. A log no handler is registered for is an
    /// [`Error::Handler`] too: it means the log filter and the registry
    /// disagree, and skipping it would lose writes.
    pub fn process_log(&self, handle: &mut dyn EntityHandle, log: &Log) -> Result<()> {
        let Some(topic0) = log.topics.first() else {
            return Err(structured(
                Error::Decode(format!("log {} has no topics", log_position(log))),
                None,
                log,
                Value::Null,
                &*handle,
            ));
        };

        let mut matched_address = false;
        let mut handled = false;
        for indexer in self.indexers.iter().filter(|i| i.address == log.address) {
            matched_address = true;
            let Some((abi, handler)) = indexer.event(topic0) else {
                continue;
            };
            handled = true;
            let args = abi
                .decode(log)
                .map_err(|e| structured(e, Some(abi), log, Value::Null, &*handle))?;
            handler(&mut *handle, &args, log)
                .map_err(|e| structured(e, Some(abi), log, args.to_json(), &*handle))?;
        }

        if handled {
            return Ok(());
        }
        let message = if matched_address {
            format!(
                "no event with selector {} registered for {} (log {})",
                topic0,
                log.address,
                log_position(log)
            )
        } else {
            format!("no indexer found for {} (log {})", log.address, log_position(log))
        };
        Err(structured(Error::Decode(message), None, log, Value::Null, &*handle))
    }
}

fn log_position(log: &Log) -> String {
    format!("{} in block {}", log.log_index, log.block_number)
}

fn structured(
    error: Error,
    abi: Option<&EventAbi>,
    log: &Log,
    args: Value,
    handle: &dyn EntityHandle,
) -> Error {
    // A nested handler error already carries its own context.
    if let Error::Handler(_) = error {
        return error;
    }
    StructuredError {
        message: error.to_string(),
        event: abi.map(ToString::to_string),
        log: serde_json::to_value(log).unwrap_or(Value::Null),
        args,
        loaded_entities: handle.loaded_entities().to_vec(),
    }
    .into_error()
}

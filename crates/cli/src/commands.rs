//! Clap command tree and subcommand dispatch.
//!
//! Global flags resolve into a [`Context`] (data directory plus the merged
//! `chainstore.toml`); each subcommand then opens only what it needs.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use chainstore_engine::{
    backfill, fetch, tail, BlockProvider, ChainFollower, ChainstoreConfig, Indexers, LogStorage,
    StorageArea, CONFIG_FILE_NAME,
};
use chainstore_storage::{EntityStore, KeyValueStorage, KvEntityStore};
use clap::{value_parser, Arg, ArgMatches, Command};
use tokio::sync::watch;
use tracing::info;

use crate::deployment;
use crate::rpc::JsonRpcProvider;

const DEFAULT_DATA_DIR: &str = ".chainstore";
const DUMP_FILE_NAME: &str = "dump.jsonl";

type Store = KvEntityStore<Arc<dyn KeyValueStorage>>;

/// Build the complete CLI command tree.
pub fn build_cli() -> Command {
    Command::new("chainstore")
        .about("Fork-aware entity store for indexing blockchain event logs")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .help("Data directory (default: .chainstore)")
                .global(true),
        )
        .arg(
            Arg::new("rpc-url")
                .long("rpc-url")
                .help("JSON-RPC endpoint, overrides rpc_url from the config file")
                .global(true),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .help("Storage backend, overrides backend from the config file")
                .value_parser(["log", "redb", "memory"])
                .global(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .help("Config file (default: <data-dir>/chainstore.toml)")
                .global(true),
        )
        .subcommand(
            Command::new("fetch")
                .about("Download logs of every indexer up to the reorg margin")
                .arg(Arg::new("indexer").help("Only fetch this indexer")),
        )
        .subcommand(
            Command::new("backfill")
                .about("Replay downloaded logs into the store and finalize")
                .arg(
                    Arg::new("block-cap")
                        .help("Stop after this block number")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("tail")
                .about("Follow the chain head live")
                .arg(
                    Arg::new("max-iterations")
                        .long("max-iterations")
                        .help("Stop after this many follower steps")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("dump")
                .about("Export the store as JSON lines")
                .arg(file_arg()),
        )
        .subcommand(
            Command::new("load")
                .about("Replace the store's contents with a dump")
                .arg(file_arg()),
        )
}

fn file_arg() -> Arg {
    Arg::new("file")
        .long("file")
        .help("Dump file (default: <data-dir>/dump.jsonl)")
}

// =========================================================================
// Context
// =========================================================================

/// Resolved global settings.
pub struct Context {
    data_dir: PathBuf,
    config: ChainstoreConfig,
}

impl Context {
    /// Resolve the data directory and config file, then apply flag overrides.
    ///
    /// The default config file is created on first use; an explicit
    /// `--config` path must already exist.
    pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        let data_dir = matches
            .get_one::<String>("data-dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let config_path = match matches.get_one::<String>("config") {
            Some(path) => PathBuf::from(path),
            None => {
                let path = data_dir.join(CONFIG_FILE_NAME);
                ChainstoreConfig::write_default_if_missing(&path)?;
                path
            }
        };
        let mut config = ChainstoreConfig::from_file(&config_path)?;

        if let Some(url) = matches.get_one::<String>("rpc-url") {
            config.rpc_url = Some(url.clone());
        }
        if let Some(backend) = matches.get_one::<String>("backend") {
            config.backend = backend.clone();
            config.backend_kind()?;
        }

        Ok(Self { data_dir, config })
    }

    fn provider(&self) -> anyhow::Result<JsonRpcProvider> {
        let url = self.config.rpc_url.as_deref().ok_or_else(|| {
            anyhow!("no RPC endpoint: pass --rpc-url or set rpc_url in {}", CONFIG_FILE_NAME)
        })?;
        Ok(JsonRpcProvider::new(url))
    }

    fn open_store(&self) -> anyhow::Result<Store> {
        let storage = self.config.open_storage(&self.data_dir)?;
        Ok(KvEntityStore::open(storage)?)
    }

    fn log_storage(&self) -> LogStorage {
        LogStorage::new(&self.data_dir)
    }

    fn indexers(&self) -> anyhow::Result<Indexers> {
        let indexers = deployment::indexers(&self.config)?;
        if indexers.is_empty() {
            bail!("no indexers configured; add [[indexers]] to {}", CONFIG_FILE_NAME);
        }
        Ok(indexers)
    }

    fn dump_path(&self, matches: &ArgMatches) -> PathBuf {
        matches
            .get_one::<String>("file")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir.join(DUMP_FILE_NAME))
    }
}

// =========================================================================
// Dispatch
// =========================================================================

/// Run the selected subcommand.
pub async fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let ctx = Context::from_matches(matches)?;
    match matches.subcommand() {
        Some(("fetch", sub)) => run_fetch(&ctx, sub).await,
        Some(("backfill", sub)) => run_backfill(&ctx, sub).await,
        Some(("tail", sub)) => run_tail(&ctx, sub).await,
        Some(("dump", sub)) => run_dump(&ctx, sub),
        Some(("load", sub)) => run_load(&ctx, sub),
        Some((other, _)) => bail!("unknown command {}", other),
        None => bail!("no command given"),
    }
}

async fn run_fetch(ctx: &Context, matches: &ArgMatches) -> anyhow::Result<()> {
    let provider = ctx.provider()?;
    let indexers = ctx.indexers()?;
    let only = matches.get_one::<String>("indexer").map(String::as_str);

    let reports = fetch(
        &provider,
        &indexers,
        only,
        &ctx.log_storage(),
        &ctx.config.fetch_options(),
    )
    .await?;
    for report in reports {
        println!(
            "{}: {} logs from block {} through {}",
            report.indexer, report.logs_written, report.from_block, report.end_block
        );
    }
    Ok(())
}

async fn run_backfill(ctx: &Context, matches: &ArgMatches) -> anyhow::Result<()> {
    let cap = match matches.get_one::<u64>("block-cap") {
        Some(&number) => {
            let block = ctx
                .provider()?
                .get_block_by_number(number)
                .await?
                .ok_or_else(|| anyhow!("block {} is beyond the chain head", number))?;
            Some(block.identifier())
        }
        None => None,
    };

    let indexers = ctx.indexers()?;
    let definitions = deployment::entity_definitions();
    let store = ctx.open_store()?;
    match backfill(&store, &indexers, &definitions, &ctx.log_storage(), cap.as_ref())? {
        Some(report) => println!(
            "finalized {} after {} blocks and {} logs",
            report.finalized, report.blocks, report.logs
        ),
        None => println!("nothing to backfill"),
    }
    Ok(())
}

async fn run_tail(ctx: &Context, matches: &ArgMatches) -> anyhow::Result<()> {
    let store: Arc<dyn EntityStore> = Arc::new(ctx.open_store()?);
    let area = StorageArea::initial(store.as_ref())?.shared();
    let indexers = Arc::new(ctx.indexers()?);
    let definitions = Arc::new(deployment::entity_definitions());
    let provider = ctx.provider()?;

    let mut follower = ChainFollower::new(
        provider,
        store,
        area,
        definitions,
        indexers,
        ctx.config.follower_options(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "chainstore::tail", "Received SIGINT, stopping");
            let _ = shutdown_tx.send(true);
        }
    });

    let options = ctx
        .config
        .tail_options(matches.get_one::<u64>("max-iterations").copied());
    let report = tail(&mut follower, &options, shutdown_rx).await?;
    println!(
        "processed {} blocks in {} steps",
        report.blocks, report.iterations
    );
    Ok(())
}

fn run_dump(ctx: &Context, matches: &ArgMatches) -> anyhow::Result<()> {
    let path = ctx.dump_path(matches);
    let store = ctx.open_store()?;
    let file = File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    let count = store.dump(&mut out)?;
    out.flush()?;
    println!("dumped {} records to {}", count, path.display());
    Ok(())
}

fn run_load(ctx: &Context, matches: &ArgMatches) -> anyhow::Result<()> {
    let path = ctx.dump_path(matches);
    let file = open_dump(&path)?;
    let store = ctx.open_store()?;
    let count = store.load(BufReader::new(file))?;
    println!("loaded {} records from {}", count, path.display());
    Ok(())
}

fn open_dump(path: &Path) -> anyhow::Result<File> {
    File::open(path).with_context(|| format!("failed to open {}", path.display()))
}

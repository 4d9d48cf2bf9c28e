//! Fetch, backfill and tail driver tests
//!
//! Two token contracts emit transfers on a `FakeChain`. The drivers run in
//! the order an operator would use them:
//! - fetch downloads logs up to the reorg margin
//! - backfill replays them into the store and finalizes
//! - tail follows the remaining blocks live

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use chainstore_core::{BlockIdentifier, EntityDefinitions, Error, StagedEntities, TypedIndex};
use chainstore_engine::{
    backfill, fetch, tail, AbiValue, BlockProvider, ChainFollower, EntityHandle, EventAbi,
    FakeChain, FetchOptions, FollowerOptions, IndexerDefinition, Indexers, LogStorage,
    PageOptions, RawEvent, StorageArea, TailOptions,
};
use chainstore_storage::{EntityStore, KvEntityStore, MemoryStorage};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::watch;

// ============================================================================
// Helper Functions
// ============================================================================

const TRANSFER: &str = "event Transfer(address indexed from, address indexed to, uint256 value)";
const MAX_REORG_DEPTH: u64 = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Account {
    tokens_owned: u64,
}

impl chainstore_core::Entity for Account {
    const NAME: &'static str = "Account";

    fn indexes() -> Vec<TypedIndex<Self>> {
        Vec::new()
    }
}

fn token_a() -> Address {
    Address::repeat_byte(0xaa)
}

fn token_b() -> Address {
    Address::repeat_byte(0xbb)
}

fn holder() -> Address {
    Address::repeat_byte(0x02)
}

fn mint(token: Address, to: Address) -> RawEvent {
    EventAbi::parse(TRANSFER)
        .unwrap()
        .encode(
            token,
            &[
                AbiValue::Address(Address::ZERO),
                AbiValue::Address(to),
                AbiValue::Uint(U256::from(1)),
            ],
        )
        .unwrap()
}

/// Block `n` mints one token A, and one token B if `n` is even.
fn append_blocks(chain: &FakeChain, count: u64) {
    for _ in 0..count {
        let n = chain.height() + 1;
        let mut events = vec![mint(token_a(), holder())];
        if n % 2 == 0 {
            events.push(mint(token_b(), holder()));
        }
        chain.append_block(events);
    }
}

/// Tokens minted in blocks `1..=n`.
fn minted_through(n: u64) -> u64 {
    n + n / 2
}

fn handler(handle: &mut dyn EntityHandle, to: Address) -> chainstore_core::Result<()> {
    let id = to.to_string();
    let mut account = handle.get::<Account>(&id)?.unwrap_or_default();
    account.tokens_owned += 1;
    handle.save(&id, &account)
}

fn indexers() -> Indexers {
    let make = |name: &str, address: Address| {
        IndexerDefinition::new(name, address, 0)
            .with_handler(TRANSFER, |handle, args, _log| handler(handle, args.address(1)?))
            .unwrap()
    };
    Indexers::new()
        .with(make("tokenA", token_a()))
        .with(make("tokenB", token_b()))
}

fn fetch_options() -> FetchOptions {
    FetchOptions {
        max_reorg_depth: MAX_REORG_DEPTH,
        page: PageOptions {
            initial_page_size: 4,
            max_page_halvings: 3,
        },
    }
}

struct Env {
    _dir: TempDir,
    chain: FakeChain,
    logs: LogStorage,
    store: Arc<KvEntityStore<MemoryStorage>>,
    definitions: Arc<EntityDefinitions>,
    indexers: Arc<Indexers>,
}

fn env() -> Env {
    let dir = TempDir::new().unwrap();
    Env {
        logs: LogStorage::new(dir.path()),
        _dir: dir,
        chain: FakeChain::new(),
        store: Arc::new(KvEntityStore::open(MemoryStorage::new()).unwrap()),
        definitions: Arc::new(EntityDefinitions::new().register::<Account>()),
        indexers: Arc::new(indexers()),
    }
}

fn durable_tokens(env: &Env) -> u64 {
    env.store
        .get_entity("Account", &holder().to_string())
        .unwrap()
        .map(|v| v["tokens_owned"].as_u64().unwrap())
        .unwrap_or(0)
}

// ============================================================================
// Fetch
// ============================================================================

#[tokio::test]
async fn test_fetch_stops_at_reorg_margin_and_resumes() {
    let env = env();
    append_blocks(&env.chain, 20);

    let reports = fetch(&env.chain, &env.indexers, None, &env.logs, &fetch_options())
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].end_block.block_number, 15);
    assert_eq!(reports[0].logs_written, 15);
    assert_eq!(reports[1].logs_written, 7);
    assert_eq!(
        env.logs.load_last_index("tokenA").unwrap(),
        Some(reports[0].end_block.clone())
    );

    append_blocks(&env.chain, 5);
    let reports = fetch(&env.chain, &env.indexers, Some("tokenA"), &env.logs, &fetch_options())
        .await
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].from_block, 16);
    assert_eq!(reports[0].logs_written, 5);
    assert_eq!(env.logs.read_logs("tokenA").unwrap().count(), 20);
}

#[tokio::test]
async fn test_fetch_survives_response_limits() {
    let env = env();
    append_blocks(&env.chain, 20);
    env.chain.set_max_logs_per_response(Some(2));

    let reports = fetch(&env.chain, &env.indexers, None, &env.logs, &fetch_options())
        .await
        .unwrap();
    assert_eq!(reports[0].logs_written, 15);
}

#[tokio::test]
async fn test_fetch_unknown_indexer() {
    let env = env();
    let err = fetch(&env.chain, &env.indexers, Some("nope"), &env.logs, &fetch_options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownIndexer(_)));
}

// ============================================================================
// Backfill
// ============================================================================

#[tokio::test]
async fn test_backfill_replays_merged_logs() {
    let env = env();
    append_blocks(&env.chain, 20);
    fetch(&env.chain, &env.indexers, None, &env.logs, &fetch_options())
        .await
        .unwrap();

    let report = backfill(
        env.store.as_ref(),
        &env.indexers,
        &env.definitions,
        &env.logs,
        None,
    )
    .unwrap()
    .unwrap();

    assert_eq!(report.finalized.block_number, 15);
    assert_eq!(report.blocks, 15);
    assert_eq!(report.logs as u64, minted_through(15));
    assert_eq!(durable_tokens(&env), minted_through(15));
    assert_eq!(env.store.get_finalized_block().unwrap(), Some(report.finalized));
}

#[tokio::test]
async fn test_backfill_honors_cap_and_resumes() {
    let env = env();
    append_blocks(&env.chain, 20);
    fetch(&env.chain, &env.indexers, None, &env.logs, &fetch_options())
        .await
        .unwrap();
    let cap = env.chain.get_block_by_number(10).await.unwrap().unwrap();

    let first = backfill(
        env.store.as_ref(),
        &env.indexers,
        &env.definitions,
        &env.logs,
        Some(&cap.identifier()),
    )
    .unwrap()
    .unwrap();
    assert_eq!(first.finalized, cap.identifier());
    assert_eq!(durable_tokens(&env), minted_through(10));

    let second = backfill(env.store.as_ref(), &env.indexers, &env.definitions, &env.logs, None)
        .unwrap()
        .unwrap();
    assert_eq!(second.blocks, 5);
    assert_eq!(durable_tokens(&env), minted_through(15));

    let third = backfill(env.store.as_ref(), &env.indexers, &env.definitions, &env.logs, None)
        .unwrap();
    assert!(third.is_none());
}

#[tokio::test]
async fn test_backfill_requires_every_indexer_fetched() {
    let env = env();
    append_blocks(&env.chain, 10);
    fetch(&env.chain, &env.indexers, Some("tokenA"), &env.logs, &fetch_options())
        .await
        .unwrap();

    let err = backfill(env.store.as_ref(), &env.indexers, &env.definitions, &env.logs, None)
        .unwrap_err();
    assert!(matches!(err, Error::MissingLogs(name) if name == "tokenB"));
}

// ============================================================================
// Tail
// ============================================================================

#[tokio::test]
async fn test_fetch_backfill_then_tail() {
    let env = env();
    append_blocks(&env.chain, 20);
    fetch(&env.chain, &env.indexers, None, &env.logs, &fetch_options())
        .await
        .unwrap();
    backfill(env.store.as_ref(), &env.indexers, &env.definitions, &env.logs, None).unwrap();

    let area = StorageArea::initial(env.store.as_ref()).unwrap().shared();
    let mut follower = ChainFollower::new(
        env.chain.clone(),
        env.store.clone() as Arc<dyn EntityStore>,
        area,
        env.definitions.clone(),
        env.indexers.clone(),
        FollowerOptions {
            max_reorg_depth: MAX_REORG_DEPTH,
            finalization_enabled: true,
        },
    );

    let (_tx, rx) = watch::channel(false);
    let options = TailOptions {
        poll_interval: Duration::from_millis(1),
        max_iterations: Some(8),
    };
    let report = tail(&mut follower, &options, rx).await.unwrap();

    assert_eq!(report.iterations, 8);
    assert_eq!(report.blocks, 5);
    let at_tip = follower
        .reader()
        .get::<Account>(&holder().to_string())
        .unwrap()
        .unwrap();
    assert_eq!(at_tip.tokens_owned, minted_through(20));
    // Blocks 16..=20 are all within the reorg margin.
    assert_eq!(durable_tokens(&env), minted_through(15));
}

#[tokio::test]
async fn test_tail_stops_on_shutdown() {
    let env = env();
    env.store
        .flush_updates(
            &BlockIdentifier::new(0, "0x0"),
            &env.definitions,
            &StagedEntities::new(),
        )
        .unwrap();
    let area = StorageArea::initial(env.store.as_ref()).unwrap().shared();
    let mut follower = ChainFollower::new(
        env.chain.clone(),
        env.store.clone() as Arc<dyn EntityStore>,
        area,
        env.definitions.clone(),
        env.indexers.clone(),
        FollowerOptions::default(),
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
    });

    let options = TailOptions {
        poll_interval: Duration::from_secs(60),
        max_iterations: None,
    };
    let report = tokio::time::timeout(Duration::from_secs(5), tail(&mut follower, &options, rx))
        .await
        .expect("tail should stop on shutdown")
        .unwrap();
    assert_eq!(report.iterations, 1);
    assert_eq!(report.blocks, 0);
}

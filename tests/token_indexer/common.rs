//! Shared fixtures: the token indexer, a scripted chain and on-disk stores.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use chainstore::{
    encode_descending, AbiValue, ChainFollower, Entity, EntityDefinitions, EntityHandle,
    EntityStore, Error, EventAbi, FakeChain, FollowStep, FollowerOptions, IndexerDefinition,
    Indexers, KvEntityStore, LogStorage, LogStoreOptions, LogStructuredStorage, RawEvent,
    StorageArea, TypedIndex,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

pub const TRANSFER: &str =
    "event Transfer(address indexed from, address indexed to, uint256 value)";

pub const MAX_REORG_DEPTH: u64 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Holder {
    pub balance: u64,
}

impl Entity for Holder {
    const NAME: &'static str = "Holder";

    fn indexes() -> Vec<TypedIndex<Self>> {
        vec![TypedIndex::new("byBalance", |h: &Holder| {
            Ok(encode_descending(h.balance))
        })]
    }
}

pub fn token() -> Address {
    Address::repeat_byte(0x70)
}

pub fn alice() -> Address {
    Address::repeat_byte(0x0a)
}

pub fn bob() -> Address {
    Address::repeat_byte(0x0b)
}

pub fn transfer(from: Address, to: Address, value: u64) -> RawEvent {
    EventAbi::parse(TRANSFER)
        .unwrap()
        .encode(
            token(),
            &[
                AbiValue::Address(from),
                AbiValue::Address(to),
                AbiValue::Uint(U256::from(value)),
            ],
        )
        .unwrap()
}

fn add(handle: &mut dyn EntityHandle, owner: Address, delta: i64) -> chainstore::Result<()> {
    let id = owner.to_string();
    let mut holder = handle.get::<Holder>(&id)?.unwrap_or_default();
    holder.balance = holder
        .balance
        .checked_add_signed(delta)
        .ok_or_else(|| Error::Decode(format!("balance of {} would go negative", owner)))?;
    handle.save(&id, &holder)
}

pub fn indexers() -> Indexers {
    let token = IndexerDefinition::new("token", token(), 1)
        .with_handler(TRANSFER, |handle, args, _log| {
            let value = u64::try_from(args.uint(2)?)
                .map_err(|_| Error::Decode("value exceeds u64".to_string()))?;
            let from = args.address(0)?;
            if from != Address::ZERO {
                add(handle, from, -(value as i64))?;
            }
            add(handle, args.address(1)?, value as i64)
        })
        .unwrap();
    Indexers::new().with(token)
}

/// Block `n` mints `n` tokens to alice; every third block she sends bob one.
pub fn scripted_events(n: u64) -> Vec<RawEvent> {
    let mut events = vec![transfer(Address::ZERO, alice(), n)];
    if n % 3 == 0 {
        events.push(transfer(alice(), bob(), 1));
    }
    events
}

/// Balances after blocks `1..=n` of [`scripted_events`].
pub fn expected_balances(n: u64) -> (u64, u64) {
    let minted: u64 = (1..=n).sum();
    let sent = n / 3;
    (minted - sent, sent)
}

pub fn append_scripted(chain: &FakeChain, count: u64) {
    for _ in 0..count {
        let n = chain.height() + 1;
        chain.append_block(scripted_events(n));
    }
}

pub type DiskStore = KvEntityStore<LogStructuredStorage>;

pub struct TestEnv {
    pub dir: TempDir,
    pub chain: FakeChain,
    pub definitions: Arc<EntityDefinitions>,
    pub indexers: Arc<Indexers>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            chain: FakeChain::new(),
            definitions: Arc::new(EntityDefinitions::new().register::<Holder>()),
            indexers: Arc::new(indexers()),
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.dir.path().join("store")
    }

    pub fn open_store(&self) -> Arc<DiskStore> {
        let storage = LogStructuredStorage::open(
            self.store_dir(),
            LogStoreOptions { sync_writes: false },
        )
        .unwrap();
        Arc::new(KvEntityStore::open(storage).unwrap())
    }

    pub fn log_storage(&self) -> LogStorage {
        LogStorage::new(self.dir.path())
    }

    pub fn follower(&self, store: Arc<DiskStore>) -> ChainFollower<FakeChain> {
        let area = StorageArea::initial(store.as_ref()).unwrap().shared();
        ChainFollower::new(
            self.chain.clone(),
            store as Arc<dyn EntityStore>,
            area,
            self.definitions.clone(),
            self.indexers.clone(),
            FollowerOptions {
                max_reorg_depth: MAX_REORG_DEPTH,
                finalization_enabled: true,
            },
        )
    }
}

pub async fn step_to_tip(follower: &mut ChainFollower<FakeChain>) -> usize {
    let mut steps = 0;
    while follower.step().await.unwrap() != FollowStep::Tip {
        steps += 1;
    }
    steps
}

pub fn balance_at_tip(follower: &ChainFollower<FakeChain>, owner: Address) -> u64 {
    follower
        .reader()
        .get::<Holder>(&owner.to_string())
        .unwrap()
        .unwrap_or_default()
        .balance
}

pub fn durable_balance(store: &dyn EntityStore, owner: Address) -> Option<u64> {
    store
        .get_entity(Holder::NAME, &owner.to_string())
        .unwrap()
        .map(|v| v["balance"].as_u64().unwrap())
}

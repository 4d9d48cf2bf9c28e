//! Moving a store between backends with dump and load.

use std::collections::HashSet;

use chainstore::{
    backfill, fetch, Entity, EntityStore, FetchOptions, IndexQueryArgs, KvEntityStore, RedbStorage,
};

use crate::common::*;

fn ranked_ids(store: &dyn EntityStore) -> Vec<String> {
    store
        .get_entities(Holder::NAME, "byBalance", &IndexQueryArgs::all(), HashSet::new())
        .unwrap()
        .map(|entry| entry.unwrap().id)
        .collect()
}

#[tokio::test]
async fn test_dump_from_log_store_load_into_redb() {
    let env = TestEnv::new();
    append_scripted(&env.chain, 15);
    let options = FetchOptions {
        max_reorg_depth: MAX_REORG_DEPTH,
        ..FetchOptions::default()
    };
    fetch(&env.chain, &env.indexers, None, &env.log_storage(), &options)
        .await
        .unwrap();

    let source = env.open_store();
    backfill(
        source.as_ref(),
        &env.indexers,
        &env.definitions,
        &env.log_storage(),
        None,
    )
    .unwrap()
    .unwrap();

    let mut dump = Vec::new();
    let dumped = source.dump(&mut dump).unwrap();
    assert!(dumped > 0);

    let target =
        KvEntityStore::open(RedbStorage::open(env.dir.path().join("store.redb")).unwrap()).unwrap();
    let loaded = target.load(dump.as_slice()).unwrap();
    assert_eq!(loaded, dumped);

    assert_eq!(
        target.get_finalized_block().unwrap(),
        source.get_finalized_block().unwrap()
    );
    for owner in [alice(), bob()] {
        assert_eq!(
            durable_balance(&target, owner),
            durable_balance(source.as_ref(), owner)
        );
    }
    assert_eq!(ranked_ids(&target), ranked_ids(source.as_ref()));
    assert_eq!(ranked_ids(&target), vec![alice().to_string(), bob().to_string()]);
}

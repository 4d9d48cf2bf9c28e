//! Fetch, backfill and live following over the same data directory.

use std::time::Duration;

use chainstore::{
    backfill, fetch, tail, EntityStore, FetchOptions, IndexQueryArgs, PageOptions, TailOptions,
};
use tokio::sync::watch;

use crate::common::*;

fn fetch_options() -> FetchOptions {
    FetchOptions {
        max_reorg_depth: MAX_REORG_DEPTH,
        page: PageOptions {
            initial_page_size: 8,
            max_page_halvings: 4,
        },
    }
}

#[tokio::test]
async fn test_backfill_then_tail_then_reorg() {
    let env = TestEnv::new();
    append_scripted(&env.chain, 30);

    fetch(&env.chain, &env.indexers, None, &env.log_storage(), &fetch_options())
        .await
        .unwrap();
    let store = env.open_store();
    let report = backfill(
        store.as_ref(),
        &env.indexers,
        &env.definitions,
        &env.log_storage(),
        None,
    )
    .unwrap()
    .unwrap();
    assert_eq!(report.finalized.block_number, 27);
    assert_eq!(durable_balance(store.as_ref(), alice()), Some(expected_balances(27).0));
    assert_eq!(durable_balance(store.as_ref(), bob()), Some(expected_balances(27).1));

    let mut follower = env.follower(store.clone());
    assert_eq!(follower.next_block(), 28);
    let (_tx, rx) = watch::channel(false);
    let options = TailOptions {
        poll_interval: Duration::from_millis(1),
        max_iterations: Some(4),
    };
    let tailed = tail(&mut follower, &options, rx).await.unwrap();
    assert_eq!(tailed.blocks, 3);
    assert_eq!(balance_at_tip(&follower, alice()), expected_balances(30).0);
    assert_eq!(balance_at_tip(&follower, bob()), expected_balances(30).1);

    // Blocks 29 and 30 are replaced by a longer fork of plain transfers.
    env.chain.rewind_to(28);
    for _ in 0..3 {
        env.chain.append_block(vec![transfer(alice(), bob(), 5)]);
    }
    step_to_tip(&mut follower).await;

    let (alice_28, bob_28) = expected_balances(28);
    assert_eq!(balance_at_tip(&follower, alice()), alice_28 - 15);
    assert_eq!(balance_at_tip(&follower, bob()), bob_28 + 15);
    assert_eq!(store.get_finalized_block().unwrap().unwrap().block_number, 27);

    let ranked: Vec<String> = follower
        .reader()
        .entities_by_index::<Holder>("byBalance", &IndexQueryArgs::all())
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(ranked, vec![alice().to_string(), bob().to_string()]);
}

#[tokio::test]
async fn test_backfill_resumes_after_later_fetch() {
    let env = TestEnv::new();
    let store = env.open_store();
    append_scripted(&env.chain, 20);

    fetch(&env.chain, &env.indexers, None, &env.log_storage(), &fetch_options())
        .await
        .unwrap();
    let first = backfill(
        store.as_ref(),
        &env.indexers,
        &env.definitions,
        &env.log_storage(),
        None,
    )
    .unwrap()
    .unwrap();
    assert_eq!(first.finalized.block_number, 17);

    append_scripted(&env.chain, 10);
    fetch(&env.chain, &env.indexers, None, &env.log_storage(), &fetch_options())
        .await
        .unwrap();
    let second = backfill(
        store.as_ref(),
        &env.indexers,
        &env.definitions,
        &env.log_storage(),
        None,
    )
    .unwrap()
    .unwrap();

    assert_eq!(second.finalized.block_number, 27);
    assert_eq!(second.blocks, 10);
    assert_eq!(durable_balance(store.as_ref(), alice()), Some(expected_balances(27).0));
}

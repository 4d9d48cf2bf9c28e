//! Restarting on the log-structured backend.

use chainstore::{BlockProvider, EntityStore, StagedEntities};

use crate::common::*;

#[tokio::test]
async fn test_follower_resumes_from_durable_state() {
    let env = TestEnv::new();
    {
        let store = env.open_store();
        let genesis = env.chain.get_block_by_number(0).await.unwrap().unwrap();
        store
            .flush_updates(&genesis.identifier(), &env.definitions, &StagedEntities::new())
            .unwrap();

        append_scripted(&env.chain, 12);
        let mut follower = env.follower(store.clone());
        assert_eq!(step_to_tip(&mut follower).await, 12);
        assert_eq!(balance_at_tip(&follower, alice()), expected_balances(12).0);
        assert_eq!(durable_balance(store.as_ref(), alice()), Some(expected_balances(8).0));
    }

    // Staged blocks 9..=12 were lost with the process.
    let store = env.open_store();
    let finalized = store.get_finalized_block().unwrap().unwrap();
    assert_eq!(finalized.block_number, 8);
    assert_eq!(
        finalized.hash,
        env.chain.get_block_by_number(8).await.unwrap().unwrap().hash
    );

    let mut follower = env.follower(store.clone());
    assert_eq!(follower.next_block(), 9);
    assert_eq!(step_to_tip(&mut follower).await, 4);
    assert_eq!(balance_at_tip(&follower, alice()), expected_balances(12).0);
    assert_eq!(balance_at_tip(&follower, bob()), expected_balances(12).1);

    append_scripted(&env.chain, 2);
    step_to_tip(&mut follower).await;
    assert_eq!(durable_balance(store.as_ref(), alice()), Some(expected_balances(10).0));
    assert_eq!(durable_balance(store.as_ref(), bob()), Some(expected_balances(10).1));
}

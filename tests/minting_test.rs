use std::{thread, time::Duration};

use log::LevelFilter;
use raft_chain::types::data_types::AccountAddress;

mod common;

use crate::common::{
    logging::setup_logger,
    node::{bootstrap_cluster, submit_everywhere, transaction, wait_for_leader, wait_until},
};

#[test]
fn idle_cluster_mints_nothing_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Bootstrap 3 nodes and wait for them to agree on a leader.
    let dir = tempfile::tempdir().unwrap();
    let (_cluster, nodes) = bootstrap_cluster(3, dir.path());
    let leader = wait_for_leader(&nodes);

    // 2. Give the leader plenty of block times to mint, with an empty pool.
    thread::sleep(Duration::from_millis(500));

    // 3. No node minted or inserted anything.
    for node in &nodes {
        assert!(node.minted().is_empty());
        assert_eq!(node.chain.head_number(), 0);
    }
    assert!(nodes[leader].api().node_info().applied_index > 0);
}

#[test]
fn transactions_are_minted_once_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Bootstrap 3 nodes and wait for them to agree on a leader.
    let dir = tempfile::tempdir().unwrap();
    let (_cluster, nodes) = bootstrap_cluster(3, dir.path());
    let leader = wait_for_leader(&nodes);

    // 2. Submit a transaction to every pool, as gossip would, and wait until every chain has it.
    log::debug!("Submitting a transaction to every node.");
    submit_everywhere(&nodes, &transaction(1, 0));
    let sender = AccountAddress::new([1; 20]);
    wait_until(Duration::from_secs(10), "every chain includes the transaction", || {
        nodes.iter().all(|node| node.chain.nonce_of(&sender) == 1)
    });

    // 3. Submit a run of transactions from a second sender.
    log::debug!("Submitting 5 more transactions.");
    for nonce in 0..5 {
        submit_everywhere(&nodes, &transaction(2, nonce));
    }
    let second_sender = AccountAddress::new([2; 20]);
    wait_until(Duration::from_secs(10), "every chain includes the run", || {
        nodes.iter().all(|node| node.chain.nonce_of(&second_sender) == 5)
    });

    // 4. Only the leader minted, every chain holds the same blocks, and no transaction appears
    //    twice.
    let canonical = nodes[leader].chain.canonical_blocks();
    for (i, node) in nodes.iter().enumerate() {
        if i != leader {
            assert!(node.minted().is_empty());
        }
        let blocks = node.chain.canonical_blocks();
        assert_eq!(
            blocks.iter().map(|block| block.hash()).collect::<Vec<_>>(),
            canonical.iter().map(|block| block.hash()).collect::<Vec<_>>()
        );
    }
    let included: usize = canonical.iter().map(|block| block.transactions.len()).sum();
    assert_eq!(included, 6);
    for block in &canonical {
        assert!(nodes[leader].minted().contains(&block.hash()));
    }
}

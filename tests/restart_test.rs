use std::time::Duration;

use log::LevelFilter;
use raft_chain::{
    persistence::{
        file_kv_store::FileKVStore,
        pluggables::{KVGet, KVStore, WriteBatch},
    },
    types::data_types::AccountAddress,
};

mod common;

use crate::common::{
    logging::setup_logger,
    node::{bootstrap_cluster, submit_everywhere, transaction, wait_for_leader, wait_until},
};

#[test]
fn restarted_follower_catches_up_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Bootstrap 3 nodes and mint a block.
    let dir = tempfile::tempdir().unwrap();
    let (_cluster, mut nodes) = bootstrap_cluster(3, dir.path());
    let leader = wait_for_leader(&nodes);
    let follower = (leader + 1) % nodes.len();
    submit_everywhere(&nodes, &transaction(1, 0));
    wait_until(Duration::from_secs(10), "the first block is minted", || {
        nodes.iter().all(|node| node.chain.head_number() == 1)
    });

    // 2. Stop a follower and keep minting without it.
    log::debug!("Stopping member {}.", nodes[follower].raft_id);
    nodes[follower].stop();
    for nonce in 1..4 {
        submit_everywhere(&nodes, &transaction(1, nonce));
    }
    wait_until(Duration::from_secs(10), "the rest of the cluster mints", || {
        nodes[leader].chain.nonce_of(&AccountAddress::new([1; 20])) == 4
    });

    // 3. Restart the follower from its write-ahead log. It rejoins without any membership change
    //    and catches up.
    log::debug!("Restarting member {}.", nodes[follower].raft_id);
    nodes[follower].start();
    let leader_head = nodes[leader].chain.head_number();
    wait_until(Duration::from_secs(10), "the restarted member catches up", || {
        nodes[follower].chain.head_number() == leader_head
    });
    assert_eq!(
        nodes[follower].chain.canonical_blocks().last().map(|block| block.hash()),
        nodes[leader].chain.canonical_blocks().last().map(|block| block.hash())
    );
    assert_eq!(nodes[follower].api().node_info().cluster_size, 3);
}

#[test]
fn applied_index_ahead_of_log_is_rolled_back_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Bootstrap 3 nodes and mint a block.
    let dir = tempfile::tempdir().unwrap();
    let (_cluster, mut nodes) = bootstrap_cluster(3, dir.path());
    let leader = wait_for_leader(&nodes);
    let follower = (leader + 1) % nodes.len();
    submit_everywhere(&nodes, &transaction(1, 0));
    wait_until(Duration::from_secs(10), "the first block is minted", || {
        nodes.iter().all(|node| node.chain.head_number() == 1)
    });

    // 2. Stop a follower and record an applied index far beyond anything it has durably committed.
    nodes[follower].stop();
    {
        let mut kv_store = FileKVStore::open(nodes[follower].applied_index_path()).unwrap();
        let mut wb = <FileKVStore as KVStore>::WriteBatch::new();
        wb.set(b"applied", &1000u64.to_le_bytes());
        kv_store.write(wb).unwrap();
        assert_eq!(kv_store.applied_index().unwrap(), Some(1000));
    }

    // 3. On restart the applied index is rolled back to the committed index, and the member keeps
    //    inserting new blocks.
    nodes[follower].start();
    assert!(nodes[follower].api().node_info().applied_index < 1000);

    submit_everywhere(&nodes, &transaction(1, 1));
    wait_until(Duration::from_secs(10), "the restarted member inserts the next block", || {
        nodes[follower].chain.head_number() == 2
    });
    assert!(nodes[follower].api().node_info().applied_index < 1000);
}

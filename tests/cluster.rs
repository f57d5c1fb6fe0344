//! End-to-end cluster scenarios (spec section 8, "Scenarios"): election,
//! replication, follower forwarding, compaction, catch-up after a join, and
//! weakened-role preference. The ten-minute chaos soak (S6) is left to an
//! external harness; everything here finishes in a few seconds.

use std::net::TcpListener;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use raftkv::{bootstrap, Address, Command, CommandResult, Config, NodeHandle};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn addr(port: u16) -> Address {
    format!("/ip4/127.0.0.1/tcp/{}", port).parse().unwrap()
}

/// Every node in these tests runs in-memory (no sled) with test-sized
/// timeouts so elections and heartbeats settle in milliseconds rather than
/// the production defaults.
fn test_config(id: Address, peers: Vec<Address>) -> Config {
    let mut config = Config::new(id, peers, PathBuf::from("/unused"));
    config.persist = false;
    config.min_election_timeout = Duration::from_millis(40);
    config.heartbeat_interval = Duration::from_millis(10);
    config.rpc_timeout = Duration::from_millis(500);
    config.connection_timeout = Duration::from_millis(500);
    config
}

fn start_cluster(n: usize) -> Vec<NodeHandle> {
    let members: Vec<Address> = (0..n).map(|_| addr(free_port())).collect();
    members
        .iter()
        .map(|id| bootstrap(test_config(id.clone(), members.clone())).expect("bootstrap"))
        .collect()
}

fn wait_for_leader(nodes: &[NodeHandle], timeout: Duration) -> NodeHandle {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        for n in nodes {
            if n.status().role == "leader" {
                return n.clone();
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("no leader elected within {:?}", timeout);
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn put(node: &NodeHandle, key: &str, value: &str) {
    let result = node
        .submit(
            Command::Put {
                key: key.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
            },
            Duration::from_secs(2),
        )
        .expect("put succeeds");
    assert!(matches!(result, CommandResult::Ok));
}

fn get(node: &NodeHandle, key: &str) -> Option<Vec<u8>> {
    match node
        .submit(Command::Get { key: key.as_bytes().to_vec() }, Duration::from_secs(2))
        .expect("get succeeds")
    {
        CommandResult::Value(v) => v,
        other => panic!("unexpected get result: {:?}", other),
    }
}

/// S1: a cluster of three nodes elects exactly one leader, and it stays
/// stable (no further elections) once the cluster is quiet.
#[test]
fn s1_election_converges_to_a_single_stable_leader() {
    let nodes = start_cluster(3);
    let leader = wait_for_leader(&nodes, Duration::from_secs(5));
    let term = leader.status().term;

    std::thread::sleep(Duration::from_millis(300));

    let leaders: Vec<_> = nodes.iter().filter(|n| n.status().role == "leader").collect();
    assert_eq!(leaders.len(), 1);
    assert_eq!(leaders[0].address(), leader.address());
    assert_eq!(leaders[0].status().term, term, "no re-election should have occurred");
}

/// S2: a write committed through the leader is visible to a subsequent
/// read, including one submitted through a follower (which forwards the
/// `get` to the leader for a read-index confirmation).
#[test]
fn s2_writes_replicate_and_are_read_back_consistently() {
    let nodes = start_cluster(3);
    let leader = wait_for_leader(&nodes, Duration::from_secs(5));

    put(&leader, "foo", "bar");
    assert_eq!(get(&leader, "foo"), Some(b"bar".to_vec()));

    let follower = nodes.iter().find(|n| n.address() != leader.address()).unwrap();
    assert_eq!(get(follower, "foo"), Some(b"bar".to_vec()));
}

/// S3: a write submitted directly to a follower is transparently forwarded
/// to the leader and still commits.
#[test]
fn s3_follower_forwards_writes_to_the_leader() {
    let nodes = start_cluster(3);
    let leader = wait_for_leader(&nodes, Duration::from_secs(5));
    let follower = nodes
        .iter()
        .find(|n| n.address() != leader.address())
        .unwrap()
        .clone();

    put(&follower, "k1", "v1");

    assert_eq!(get(&leader, "k1"), Some(b"v1".to_vec()));
    assert_eq!(get(&follower, "k1"), Some(b"v1".to_vec()));
}

/// S4 + S5: once the leader has compacted its log past what a newly
/// joining node has, the join is caught up via `InstallSnapshot` rather
/// than a full replay, and the joined node ends up with the same applied
/// state as the rest of the cluster.
#[test]
fn s4_compaction_then_s5_join_catches_up_via_snapshot() {
    let members: Vec<Address> = (0..3).map(|_| addr(free_port())).collect();
    let nodes: Vec<NodeHandle> = members
        .iter()
        .map(|id| {
            let mut config = test_config(id.clone(), members.clone());
            config.max_log_retention = 2;
            bootstrap(config).expect("bootstrap")
        })
        .collect();

    let leader = wait_for_leader(&nodes, Duration::from_secs(5));
    for i in 0..10 {
        put(&leader, &format!("k{}", i), &format!("v{}", i));
    }

    assert!(
        wait_until(Duration::from_secs(2), || nodes
            .iter()
            .all(|n| n.status().last_applied >= 10)),
        "all original members should apply every write"
    );

    // The joining node is configured with the cluster's post-join
    // membership up front and a long election timeout, so it never tries
    // to elect itself before the real leader's AppendEntries/InstallSnapshot
    // reach it.
    let new_addr = addr(free_port());
    let mut joined_members = members.clone();
    joined_members.push(new_addr.clone());
    let mut joiner_config = test_config(new_addr.clone(), joined_members);
    joiner_config.min_election_timeout = Duration::from_secs(30);
    let joiner = bootstrap(joiner_config).expect("bootstrap joiner");

    let join_result = leader
        .submit(Command::Join(new_addr.clone()), Duration::from_secs(2))
        .expect("join commits");
    assert!(matches!(join_result, CommandResult::Ok));

    assert!(
        wait_until(Duration::from_secs(5), || joiner.status().last_applied >= 10),
        "joining node should catch up to the rest of the cluster"
    );
}

/// S7: weakening every follower but one causes that one to become leader
/// well within the weakening duration.
#[test]
fn s7_weakened_followers_yield_leadership_to_the_unweakened_peer() {
    let nodes = start_cluster(3);
    let original_leader = wait_for_leader(&nodes, Duration::from_secs(5));

    let preferred = nodes
        .iter()
        .find(|n| n.address() != original_leader.address())
        .unwrap()
        .clone();

    for n in &nodes {
        if n.address() != preferred.address() {
            n.weaken(Duration::from_millis(1100));
        }
    }

    assert!(
        wait_until(Duration::from_secs(5), || preferred.status().role == "leader"),
        "the unweakened node should become leader"
    );
}

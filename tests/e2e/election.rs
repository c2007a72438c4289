use super::{eventually, TestCluster};

use std::time::Duration;

/// Three servers with no prior state converge on the highest node ID as
/// leader.
#[test]
fn three_server_election() {
    let tc = TestCluster::run(3);
    let expected = tc.id(3);

    // Discovery plus the election should settle well within a few seconds.
    // Only the leader answers WHO_IS_LEADER, so a successful discovery names
    // the node actually serving.
    let leader = eventually(Duration::from_secs(15), "leader convergence", || {
        let mut client = tc.client();
        client.discover_leader(Duration::from_secs(2)).ok().filter(|leader| leader == &expected)
    });
    assert_eq!(leader, expected);

    // And it stays settled.
    std::thread::sleep(Duration::from_secs(1));
    let mut client = tc.client();
    assert_eq!(client.discover_leader(Duration::from_secs(2)).unwrap(), expected);
}

/// A higher node joining during the initial election takes over leadership,
/// and no stale leader keeps answering.
#[test]
fn membership_churn_during_election() {
    let mut tc = TestCluster::run(3);
    // Inject the fourth node while the first three are still electing.
    tc.start(4);
    let expected = tc.id(4);

    let leader = eventually(Duration::from_secs(15), "leader convergence on joiner", || {
        let mut client = tc.client();
        client.discover_leader(Duration::from_secs(2)).ok().filter(|leader| leader == &expected)
    });
    assert_eq!(leader, expected);

    // Past the election timeout, nobody else claims leadership anymore.
    std::thread::sleep(Duration::from_secs(3));
    let mut client = tc.client();
    assert_eq!(client.discover_leader(Duration::from_secs(2)).unwrap(), expected);
}

/// A single server is its own leader, immediately.
#[test]
fn single_server_is_leader() {
    let tc = TestCluster::run(1);
    let mut client = tc.client();
    assert_eq!(client.discover_leader(Duration::from_secs(5)).unwrap(), tc.id(1));
}

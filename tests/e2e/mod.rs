//! End-to-end tests for toyvote. These spin up in-process clusters of
//! servers on localhost UDP ports, with a private multicast port per cluster
//! so concurrently running tests don't hear each other.

mod election;
mod failover;
mod testcluster;
mod vote;

use testcluster::TestCluster;

use std::time::{Duration, Instant};
use toyvote::message::GroupEvent;
use toyvote::Client;

/// Polls the given closure until it returns Some, panicking on timeout.
fn eventually<T>(timeout: Duration, what: &str, mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = f() {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Waits until the client observes a vote result for the given vote,
/// skipping over other group events, and returns (counts, winner).
fn await_result(
    client: &mut Client,
    vote_id: toyvote::message::VoteId,
    timeout: Duration,
) -> (Vec<u64>, String) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let Some((_, event)) = client.poll_event(Duration::from_millis(200)).expect("poll failed")
        else {
            continue;
        };
        if let GroupEvent::VoteResult { vote_id: id, counts, winner } = event {
            if id == vote_id {
                return (counts, winner);
            }
        }
    }
    panic!("timed out waiting for the result of vote {vote_id}");
}

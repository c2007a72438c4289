use super::{await_result, eventually, TestCluster};

use std::time::Duration;
use toyvote::error::Error;
use toyvote::message::{GroupEvent, ServiceError};

/// Waits for the cluster's expected leader to take over before clients
/// connect, so tests don't race the initial election.
fn settled(tc: &TestCluster, leader: u16) {
    let expected = tc.id(leader);
    eventually(Duration::from_secs(15), "leader convergence", || {
        let mut client = tc.client();
        client.discover_leader(Duration::from_secs(2)).ok().filter(|l| l == &expected)
    });
}

/// A full single-group, single-vote flow: register, group membership, vote,
/// unanimous ballots, result delivery to every member.
#[test]
fn single_group_single_vote() {
    let tc = TestCluster::run(3);
    settled(&tc, 3);

    let mut c1 = tc.registered_client();
    let mut c2 = tc.registered_client();

    c1.create_group("g").unwrap();
    c2.join_group("g").unwrap();

    let (vote_id, _) = c1.start_vote("g", "q?", vec!["a".into(), "b".into(), "c".into()], 30).unwrap();
    assert!(!c1.cast_ballot(vote_id, 1).unwrap());
    assert!(!c2.cast_ballot(vote_id, 1).unwrap());

    // Everyone voted, so the result arrives without waiting out the
    // 30-second deadline.
    let (counts, winner) = await_result(&mut c1, vote_id, Duration::from_secs(5));
    assert_eq!((counts, winner.as_str()), (vec![0, 2, 0], "b"));
    let (counts, winner) = await_result(&mut c2, vote_id, Duration::from_secs(5));
    assert_eq!((counts, winner.as_str()), (vec![0, 2, 0], "b"));
}

/// Vote events arrive in FIFO order: the open, each counted ballot, then
/// the result, with no gaps or duplicates.
#[test]
fn group_events_are_fifo_ordered() {
    let tc = TestCluster::run(2);
    settled(&tc, 2);

    let mut c1 = tc.registered_client();
    let mut c2 = tc.registered_client();
    c1.create_group("g").unwrap();
    c2.join_group("g").unwrap();

    let (vote_id, _) = c1.start_vote("g", "q?", vec!["a".into(), "b".into()], 30).unwrap();
    assert!(!c1.cast_ballot(vote_id, 0).unwrap());
    assert!(!c2.cast_ballot(vote_id, 1).unwrap());

    // Both clients observe the same event sequence in the same order.
    for client in [&mut c1, &mut c2] {
        let mut events = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while events.len() < 4 && std::time::Instant::now() < deadline {
            if let Some((group, event)) = client.poll_event(Duration::from_millis(200)).unwrap() {
                assert_eq!(group, "g");
                events.push(event);
            }
        }
        assert_eq!(events.len(), 4, "expected 4 events, got {events:?}");
        assert!(
            matches!(events[0], GroupEvent::VoteOpen { vote_id: id, .. } if id == vote_id),
            "expected VoteOpen first, got {events:?}"
        );
        assert!(matches!(events[1], GroupEvent::BallotCounted { ballots: 1, .. }));
        assert!(matches!(events[2], GroupEvent::BallotCounted { ballots: 2, .. }));
        assert!(
            matches!(events[3], GroupEvent::VoteResult { .. }),
            "expected VoteResult last, got {events:?}"
        );
    }
}

/// A second ballot from the same client is acknowledged as a duplicate and
/// doesn't change the tally.
#[test]
fn duplicate_ballot_counts_once() {
    let tc = TestCluster::run(2);
    settled(&tc, 2);

    let mut c1 = tc.registered_client();
    let mut c2 = tc.registered_client();
    c1.create_group("g").unwrap();
    c2.join_group("g").unwrap();

    let (vote_id, _) = c1.start_vote("g", "q?", vec!["a".into(), "b".into()], 30).unwrap();
    assert!(!c1.cast_ballot(vote_id, 0).unwrap());
    assert!(c1.cast_ballot(vote_id, 0).unwrap());
    assert!(c1.cast_ballot(vote_id, 1).unwrap());
    assert!(!c2.cast_ballot(vote_id, 1).unwrap());

    let (counts, winner) = await_result(&mut c1, vote_id, Duration::from_secs(5));
    assert_eq!((counts, winner.as_str()), (vec![1, 1], "a"));
}

/// Group bookkeeping: listings, membership errors, duplicate names.
#[test]
fn group_management() {
    let tc = TestCluster::run(1);
    settled(&tc, 1);

    let mut c1 = tc.registered_client();
    let mut c2 = tc.registered_client();

    c1.create_group("alpha").unwrap();
    c1.create_group("beta").unwrap();
    assert!(matches!(
        c2.create_group("alpha"),
        Err(Error::Service(ServiceError::NameTaken(_)))
    ));

    c2.join_group("alpha").unwrap();
    assert_eq!(c2.list_groups().unwrap(), vec!["alpha".to_string(), "beta".to_string()]);
    assert_eq!(c2.joined_groups().unwrap(), vec!["alpha".to_string()]);

    c2.leave_group("alpha").unwrap();
    assert_eq!(c2.joined_groups().unwrap(), Vec::<String>::new());
    assert!(matches!(
        c2.leave_group("alpha"),
        Err(Error::Service(ServiceError::NotMember(_)))
    ));
    assert!(matches!(
        c2.join_group("nope"),
        Err(Error::Service(ServiceError::NoSuchGroup(_)))
    ));

    // A vote from a non-member is rejected.
    assert!(matches!(
        c2.start_vote("beta", "q?", vec!["a".into()], 30),
        Err(Error::Service(ServiceError::NotMember(_)))
    ));
}

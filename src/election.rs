//! Hirschberg-Sinclair leader election over the ring.
//!
//! Every node starts as a candidate and probes both neighbours with
//! exponentially growing reach: in phase p a probe travels 2^p hops before
//! turning around as a reply. A node receiving a probe from a lower origin
//! swallows it (and campaigns itself if it hasn't yet); a probe from a higher
//! origin knocks the receiver out of candidacy and is relayed. A candidate
//! that gets both replies back advances a phase; once its surviving
//! neighbourhood spans the ring, or its own probe travels all the way around,
//! it declares victory and circulates a coordinator announcement. The highest
//! live node ID therefore always wins.
//!
//! Rounds are numbered so that stale traffic from earlier rounds can be
//! dropped. A node that sees a probe for a newer round joins that round;
//! rounds that fail to converge (e.g. a participant died mid-round) restart
//! with a higher number after a timeout.

use crate::cluster::Ring;
use crate::config::Ticks;
use crate::error::Result;
use crate::message::{Address, Direction, Envelope, Message, NodeId};

use crossbeam::channel::Sender;
use log::{debug, info};

/// The Hirschberg-Sinclair election state machine. Driven by step() for
/// inbound messages and tick() for timeouts; outbound messages are sent via
/// the given channel. The caller watches leader() for role changes.
pub struct Election {
    /// The local node, which is also its election priority.
    id: NodeId,
    /// The current election round. Monotonically increasing; messages from
    /// older rounds are dropped.
    round: u64,
    /// The probe reach exponent within the current round.
    phase: u32,
    /// Whether the local node is still in the running this round.
    candidate: bool,
    /// Whether the local node has launched its own probes this round. A node
    /// that merely relays traffic for a higher origin has not.
    started: bool,
    /// Which probe replies are still outstanding for the current phase.
    awaiting_left: bool,
    awaiting_right: bool,
    /// The elected leader, if any. Cleared when a new round begins.
    leader: Option<NodeId>,
    /// Ticks since the current round began.
    ticks: Ticks,
    /// Outbound message channel.
    tx: Sender<Envelope>,
}

impl Election {
    pub fn new(id: NodeId, tx: Sender<Envelope>) -> Self {
        Self {
            id,
            round: 0,
            phase: 0,
            candidate: false,
            started: false,
            awaiting_left: true,
            awaiting_right: true,
            leader: None,
            ticks: 0,
            tx,
        }
    }

    /// The current leader, if one has been elected.
    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    /// The current election round.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Starts a new election round, e.g. on a membership change. A node that
    /// is alone in the ring wins immediately.
    pub fn campaign(&mut self, ring: &Ring) -> Result<()> {
        self.round += 1;
        self.begin(ring)
    }

    /// Launches the local node's probes for the current round.
    fn begin(&mut self, ring: &Ring) -> Result<()> {
        info!("Starting election round {} at {}", self.round, self.id);
        self.phase = 0;
        self.candidate = true;
        self.started = true;
        self.awaiting_left = true;
        self.awaiting_right = true;
        self.leader = None;
        self.ticks = 0;
        if ring.is_alone() {
            return self.win(ring);
        }
        self.probe(ring)
    }

    /// Adopts a newer round observed on the wire, resetting all round state.
    fn adopt(&mut self, round: u64) {
        debug!("Adopting election round {round}");
        self.round = round;
        self.phase = 0;
        self.candidate = true;
        self.started = false;
        self.awaiting_left = true;
        self.awaiting_right = true;
        self.leader = None;
        self.ticks = 0;
    }

    /// Sends probes with the current phase's reach in both directions.
    fn probe(&mut self, ring: &Ring) -> Result<()> {
        let hops = 1u64 << self.phase;
        debug!("Probing {} hops in both directions (round {}, phase {})", hops, self.round, self.phase);
        for dir in [Direction::Left, Direction::Right] {
            let origin = self.id.clone();
            let probe = Message::Probe { origin, dir, hops, phase: self.phase };
            self.send(ring.neighbour(dir), self.round, probe)?;
        }
        Ok(())
    }

    /// Declares the local node the winner and circulates the announcement
    /// around the ring.
    fn win(&mut self, ring: &Ring) -> Result<()> {
        info!("Won election round {}, announcing leadership of {}", self.round, self.id);
        self.leader = Some(self.id.clone());
        self.candidate = false;
        if !ring.is_alone() {
            self.send(ring.left(), self.round, Message::Coordinator { leader: self.id.clone() })?;
        }
        Ok(())
    }

    /// Processes an election message. The caller is expected to check
    /// leader() afterwards for role changes.
    pub fn step(&mut self, ring: &Ring, envelope: Envelope) -> Result<()> {
        let round = envelope.term;
        match envelope.message {
            Message::Probe { origin, dir, hops, phase } => {
                self.step_probe(ring, round, origin, dir, hops, phase)
            }
            Message::ProbeReply { origin, dir, phase } => {
                self.step_reply(ring, round, origin, dir, phase)
            }
            Message::Coordinator { leader } => self.step_coordinator(ring, round, leader),
            message => {
                debug!("Ignoring non-election message {message:?}");
                Ok(())
            }
        }
    }

    fn step_probe(
        &mut self,
        ring: &Ring,
        round: u64,
        origin: NodeId,
        dir: Direction,
        hops: u64,
        phase: u32,
    ) -> Result<()> {
        if round < self.round {
            debug!("Dropping probe from stale round {round}");
            return Ok(());
        }
        if round > self.round {
            self.adopt(round);
        }
        match origin.cmp(&self.id) {
            // A lower origin is swallowed. If we haven't campaigned in this
            // round yet, its probe tells us an election is on: join in.
            std::cmp::Ordering::Less => {
                debug!("Swallowing probe from lower origin {origin}");
                if !self.started {
                    self.begin(ring)?;
                }
                Ok(())
            }
            // Our own probe made it all the way around the ring: every other
            // node let it pass, so we are the highest.
            std::cmp::Ordering::Equal => self.win(ring),
            // A higher origin knocks us out of candidacy. Relay the probe
            // while it has hops left, otherwise turn it around as a reply.
            std::cmp::Ordering::Greater => {
                self.candidate = false;
                if hops > 1 {
                    let probe = Message::Probe { origin, dir, hops: hops - 1, phase };
                    self.send(ring.neighbour(dir), round, probe)
                } else {
                    let dir = dir.opposite();
                    self.send(ring.neighbour(dir), round, Message::ProbeReply { origin, dir, phase })
                }
            }
        }
    }

    fn step_reply(
        &mut self,
        ring: &Ring,
        round: u64,
        origin: NodeId,
        dir: Direction,
        phase: u32,
    ) -> Result<()> {
        if round < self.round {
            debug!("Dropping reply from stale round {round}");
            return Ok(());
        }
        // Replies travel back towards their origin; relay anything that isn't
        // ours for the current phase. Our own replies from an earlier phase
        // are already accounted for and would circulate forever if relayed.
        if origin != self.id {
            return self.send(ring.neighbour(dir), round, Message::ProbeReply { origin, dir, phase });
        }
        if round != self.round || phase != self.phase || !self.started {
            debug!("Dropping own reply from stale phase {phase}");
            return Ok(());
        }
        match dir {
            Direction::Left => self.awaiting_left = false,
            Direction::Right => self.awaiting_right = false,
        }
        if self.awaiting_left || self.awaiting_right || !self.candidate {
            return Ok(());
        }
        // Both probes survived: we are the highest within 2^phase hops both
        // ways. Advance, and declare victory once that neighbourhood covers
        // the whole ring.
        self.phase += 1;
        if (1u64 << self.phase) + 1 >= ring.len() as u64 {
            return self.win(ring);
        }
        self.awaiting_left = true;
        self.awaiting_right = true;
        self.probe(ring)
    }

    fn step_coordinator(&mut self, ring: &Ring, round: u64, leader: NodeId) -> Result<()> {
        if round < self.round {
            debug!("Dropping coordinator announcement from stale round {round}");
            return Ok(());
        }
        self.round = round;
        if self.leader.as_ref() == Some(&leader) {
            return Ok(());
        }
        info!("Leader elected: {leader}");
        self.leader = Some(leader.clone());
        self.candidate = false;
        // Pass the announcement on around the ring until it would reach the
        // winner again.
        if self.id != leader && ring.left() != &leader {
            self.send(ring.left(), round, Message::Coordinator { leader })?;
        }
        Ok(())
    }

    /// Advances time by one tick. A round that hasn't converged within the
    /// timeout restarts with a higher round number, so elections survive
    /// participants dying mid-round.
    pub fn tick(&mut self, ring: &Ring, timeout: Ticks) -> Result<()> {
        if self.leader.is_some() || !self.started {
            return Ok(());
        }
        self.ticks += 1;
        if self.ticks >= timeout {
            info!("Election round {} timed out, restarting", self.round);
            self.campaign(ring)?;
        }
        Ok(())
    }

    fn send(&self, to: &NodeId, term: u64, message: Message) -> Result<()> {
        self.tx.send(Envelope {
            from: self.id.clone(),
            to: Address::Node(to.clone()),
            term,
            seq: 0,
            message,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemberSet;

    use crossbeam::channel::Receiver;
    use std::collections::{HashMap, VecDeque};

    fn id(port: u16) -> NodeId {
        NodeId::new("127.0.0.1", port)
    }

    /// Builds an election and ring for the given node among the given peers.
    fn setup(own: u16, peers: &[u16]) -> (Election, Ring, Receiver<Envelope>) {
        let mut members = MemberSet::new(id(own));
        for port in peers {
            members.observe(id(*port));
        }
        let ring = Ring::new(&members);
        let (tx, rx) = crossbeam::channel::unbounded();
        (Election::new(id(own), tx), ring, rx)
    }

    fn drain(rx: &Receiver<Envelope>) -> Vec<Envelope> {
        rx.try_iter().collect()
    }

    #[test]
    fn alone_wins_immediately() {
        let (mut election, ring, rx) = setup(1, &[]);
        election.campaign(&ring).unwrap();
        assert_eq!(election.leader(), Some(&id(1)));
        // Nobody to announce to.
        assert_eq!(drain(&rx), vec![]);
    }

    #[test]
    fn campaign_probes_both_neighbours() {
        let (mut election, ring, rx) = setup(2, &[1, 3]);
        election.campaign(&ring).unwrap();
        let sent = drain(&rx);
        assert_eq!(
            sent,
            vec![
                Envelope {
                    from: id(2),
                    to: Address::Node(id(1)),
                    term: 1,
                    seq: 0,
                    message: Message::Probe { origin: id(2), dir: Direction::Left, hops: 1, phase: 0 },
                },
                Envelope {
                    from: id(2),
                    to: Address::Node(id(3)),
                    term: 1,
                    seq: 0,
                    message: Message::Probe { origin: id(2), dir: Direction::Right, hops: 1, phase: 0 },
                },
            ]
        );
    }

    #[test]
    fn lower_origin_is_swallowed_and_triggers_campaign() {
        let (mut election, ring, rx) = setup(3, &[1, 2]);
        election
            .step(
                &ring,
                Envelope {
                    from: id(1),
                    to: Address::Node(id(3)),
                    term: 1,
                    seq: 0,
                    message: Message::Probe { origin: id(1), dir: Direction::Left, hops: 2, phase: 1 },
                },
            )
            .unwrap();
        // The probe is not forwarded; instead we campaign in the same round.
        let sent = drain(&rx);
        assert_eq!(sent.len(), 2);
        for envelope in &sent {
            assert_eq!(envelope.term, 1);
            assert!(matches!(envelope.message, Message::Probe { ref origin, hops: 1, phase: 0, .. } if origin == &id(3)));
        }
    }

    #[test]
    fn higher_origin_is_relayed_with_decremented_hops() {
        let (mut election, ring, rx) = setup(2, &[1, 3, 4]);
        election
            .step(
                &ring,
                Envelope {
                    from: id(3),
                    to: Address::Node(id(2)),
                    term: 1,
                    seq: 0,
                    message: Message::Probe { origin: id(4), dir: Direction::Left, hops: 2, phase: 1 },
                },
            )
            .unwrap();
        // Relayed leftward (from 2, left is 1) with one hop spent.
        assert_eq!(
            drain(&rx),
            vec![Envelope {
                from: id(2),
                to: Address::Node(id(1)),
                term: 1,
                seq: 0,
                message: Message::Probe { origin: id(4), dir: Direction::Left, hops: 1, phase: 1 },
            }]
        );
    }

    #[test]
    fn exhausted_probe_turns_around() {
        let (mut election, ring, rx) = setup(2, &[1, 3, 4]);
        election
            .step(
                &ring,
                Envelope {
                    from: id(3),
                    to: Address::Node(id(2)),
                    term: 1,
                    seq: 0,
                    message: Message::Probe { origin: id(4), dir: Direction::Left, hops: 1, phase: 1 },
                },
            )
            .unwrap();
        // The reply travels back to the right, towards the origin.
        assert_eq!(
            drain(&rx),
            vec![Envelope {
                from: id(2),
                to: Address::Node(id(3)),
                term: 1,
                seq: 0,
                message: Message::ProbeReply { origin: id(4), dir: Direction::Right, phase: 1 },
            }]
        );
    }

    #[test]
    fn foreign_reply_is_relayed() {
        let (mut election, ring, rx) = setup(2, &[1, 3, 4]);
        election
            .step(
                &ring,
                Envelope {
                    from: id(1),
                    to: Address::Node(id(2)),
                    term: 1,
                    seq: 0,
                    message: Message::ProbeReply { origin: id(4), dir: Direction::Right, phase: 0 },
                },
            )
            .unwrap();
        assert_eq!(
            drain(&rx),
            vec![Envelope {
                from: id(2),
                to: Address::Node(id(3)),
                term: 1,
                seq: 0,
                message: Message::ProbeReply { origin: id(4), dir: Direction::Right, phase: 0 },
            }]
        );
    }

    #[test]
    fn own_looped_probe_wins() {
        let (mut election, ring, rx) = setup(3, &[1, 2]);
        election.campaign(&ring).unwrap();
        drain(&rx);
        election
            .step(
                &ring,
                Envelope {
                    from: id(1),
                    to: Address::Node(id(3)),
                    term: 1,
                    seq: 0,
                    message: Message::Probe { origin: id(3), dir: Direction::Left, hops: 1, phase: 2 },
                },
            )
            .unwrap();
        assert_eq!(election.leader(), Some(&id(3)));
        // The coordinator announcement circulates to the left.
        assert_eq!(
            drain(&rx),
            vec![Envelope {
                from: id(3),
                to: Address::Node(id(2)),
                term: 1,
                seq: 0,
                message: Message::Coordinator { leader: id(3) },
            }]
        );
    }

    #[test]
    fn two_node_election() {
        let (mut election, ring, rx) = setup(2, &[1]);
        election.campaign(&ring).unwrap();
        drain(&rx);
        // Both probes come back as replies (the single peer turns them
        // around). The second reply advances the phase, whose neighbourhood
        // now covers the two-node ring, so we win.
        election
            .step(
                &ring,
                Envelope {
                    from: id(1),
                    to: Address::Node(id(2)),
                    term: 1,
                    seq: 0,
                    message: Message::ProbeReply { origin: id(2), dir: Direction::Right, phase: 0 },
                },
            )
            .unwrap();
        assert_eq!(election.leader(), None);
        election
            .step(
                &ring,
                Envelope {
                    from: id(1),
                    to: Address::Node(id(2)),
                    term: 1,
                    seq: 0,
                    message: Message::ProbeReply { origin: id(2), dir: Direction::Left, phase: 0 },
                },
            )
            .unwrap();
        assert_eq!(election.leader(), Some(&id(2)));
        assert_eq!(
            drain(&rx),
            vec![Envelope {
                from: id(2),
                to: Address::Node(id(1)),
                term: 1,
                seq: 0,
                message: Message::Coordinator { leader: id(2) },
            }]
        );
    }

    #[test]
    fn non_candidate_does_not_advance_on_replies() {
        let (mut election, ring, rx) = setup(2, &[1, 3]);
        election.campaign(&ring).unwrap();
        drain(&rx);
        // A probe from 3 knocks 2 out of candidacy.
        election
            .step(
                &ring,
                Envelope {
                    from: id(3),
                    to: Address::Node(id(2)),
                    term: 1,
                    seq: 0,
                    message: Message::Probe { origin: id(3), dir: Direction::Left, hops: 1, phase: 0 },
                },
            )
            .unwrap();
        drain(&rx);
        // Even with both replies in, a non-candidate stays put.
        for dir in [Direction::Left, Direction::Right] {
            election
                .step(
                    &ring,
                    Envelope {
                        from: id(1),
                        to: Address::Node(id(2)),
                        term: 1,
                        seq: 0,
                        message: Message::ProbeReply { origin: id(2), dir, phase: 0 },
                    },
                )
                .unwrap();
        }
        assert_eq!(election.leader(), None);
        assert_eq!(drain(&rx), vec![]);
    }

    #[test]
    fn stale_round_is_dropped() {
        let (mut election, ring, rx) = setup(2, &[1, 3]);
        election.campaign(&ring).unwrap();
        election.campaign(&ring).unwrap();
        assert_eq!(election.round(), 2);
        drain(&rx);
        election
            .step(
                &ring,
                Envelope {
                    from: id(3),
                    to: Address::Node(id(2)),
                    term: 1,
                    seq: 0,
                    message: Message::Probe { origin: id(3), dir: Direction::Left, hops: 3, phase: 1 },
                },
            )
            .unwrap();
        assert_eq!(drain(&rx), vec![]);
    }

    #[test]
    fn newer_round_is_adopted() {
        let (mut election, ring, rx) = setup(3, &[1, 2]);
        election.campaign(&ring).unwrap();
        drain(&rx);
        election
            .step(
                &ring,
                Envelope {
                    from: id(1),
                    to: Address::Node(id(3)),
                    term: 7,
                    seq: 0,
                    message: Message::Probe { origin: id(1), dir: Direction::Left, hops: 1, phase: 0 },
                },
            )
            .unwrap();
        assert_eq!(election.round(), 7);
        // The lower origin was swallowed and we re-campaigned in round 7.
        let sent = drain(&rx);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|envelope| envelope.term == 7));
    }

    #[test]
    fn coordinator_sets_leader_and_forwards() {
        let (mut election, ring, rx) = setup(2, &[1, 3, 4]);
        election.campaign(&ring).unwrap();
        drain(&rx);
        election
            .step(
                &ring,
                Envelope {
                    from: id(3),
                    to: Address::Node(id(2)),
                    term: 1,
                    seq: 0,
                    message: Message::Coordinator { leader: id(4) },
                },
            )
            .unwrap();
        assert_eq!(election.leader(), Some(&id(4)));
        assert_eq!(
            drain(&rx),
            vec![Envelope {
                from: id(2),
                to: Address::Node(id(1)),
                term: 1,
                seq: 0,
                message: Message::Coordinator { leader: id(4) },
            }]
        );
        // A repeat announcement isn't forwarded again.
        election
            .step(
                &ring,
                Envelope {
                    from: id(3),
                    to: Address::Node(id(2)),
                    term: 1,
                    seq: 0,
                    message: Message::Coordinator { leader: id(4) },
                },
            )
            .unwrap();
        assert_eq!(drain(&rx), vec![]);
    }

    #[test]
    fn coordinator_stops_before_reaching_winner() {
        // Node 1's left neighbour is the winner 3: it must not forward.
        let (mut election, ring, rx) = setup(1, &[2, 3]);
        election
            .step(
                &ring,
                Envelope {
                    from: id(2),
                    to: Address::Node(id(1)),
                    term: 1,
                    seq: 0,
                    message: Message::Coordinator { leader: id(3) },
                },
            )
            .unwrap();
        assert_eq!(election.leader(), Some(&id(3)));
        assert_eq!(drain(&rx), vec![]);
    }

    #[test]
    fn timeout_restarts_round() {
        let (mut election, ring, rx) = setup(2, &[1, 3]);
        election.campaign(&ring).unwrap();
        assert_eq!(election.round(), 1);
        drain(&rx);
        for _ in 0..20 {
            election.tick(&ring, 20).unwrap();
        }
        assert_eq!(election.round(), 2);
        let sent = drain(&rx);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|envelope| envelope.term == 2));
    }

    #[test]
    fn no_timeout_once_leader_known() {
        let (mut election, ring, rx) = setup(1, &[2, 3]);
        election
            .step(
                &ring,
                Envelope {
                    from: id(2),
                    to: Address::Node(id(1)),
                    term: 1,
                    seq: 0,
                    message: Message::Coordinator { leader: id(3) },
                },
            )
            .unwrap();
        for _ in 0..100 {
            election.tick(&ring, 20).unwrap();
        }
        assert_eq!(election.round(), 1);
        assert_eq!(election.leader(), Some(&id(3)));
        assert_eq!(drain(&rx), vec![]);
    }

    /// Runs a full in-memory election across the given ring of nodes,
    /// routing messages until quiescence, and asserts that every node agrees
    /// the highest ID won. Exercises the whole protocol including swallows,
    /// relays, turnarounds and the coordinator traversal.
    fn simulate(ports: &[u16]) {
        let mut elections = HashMap::new();
        let mut rings = HashMap::new();
        let mut receivers = HashMap::new();
        for &port in ports {
            let peers: Vec<u16> = ports.iter().copied().filter(|p| *p != port).collect();
            let (election, ring, rx) = setup(port, &peers);
            elections.insert(id(port), election);
            rings.insert(id(port), ring);
            receivers.insert(id(port), rx);
        }

        // Everybody campaigns at once, as after a membership change.
        for (node, election) in elections.iter_mut() {
            election.campaign(&rings[node]).unwrap();
        }

        // Route messages until the network is quiet.
        let mut queue: VecDeque<Envelope> = VecDeque::new();
        loop {
            for rx in receivers.values() {
                queue.extend(rx.try_iter());
            }
            let Some(envelope) = queue.pop_front() else { break };
            let Address::Node(to) = envelope.to.clone() else { panic!("unexpected address") };
            elections.get_mut(&to).unwrap().step(&rings[&to], envelope).unwrap();
        }

        let expected = ports.iter().max().map(|port| id(*port)).unwrap();
        for (node, election) in &elections {
            assert_eq!(election.leader(), Some(&expected), "wrong leader on {node}");
        }
    }

    #[test]
    fn converges_on_highest_node() {
        simulate(&[1, 2]);
        simulate(&[1, 2, 3]);
        simulate(&[3, 1, 4, 2]);
        simulate(&[5, 9, 2, 7, 1, 8, 3, 6, 4]);
        simulate(&[17, 3, 11, 29, 23, 5, 13, 19, 7, 2]);
    }
}

//! FIFO-ordered reliable group delivery.
//!
//! The leader is the only sender. Per group it stamps every event with a
//! sequence number, sends it to each member's unicast address, and buffers it
//! until every member has acked, retransmitting periodically. Receivers keep
//! a per-group cursor and a holdback buffer: events arriving early wait in
//! the holdback until the gap fills, duplicates are re-acked and dropped, so
//! the application sees every event exactly once and in send order.

use crate::config::Ticks;
use crate::message::{ClientId, GroupEvent, NodeId};

use log::debug;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A transmission to one group member: its address, the event's sequence
/// number, and the event.
pub type Transmission = (NodeId, u64, GroupEvent);

/// An event the sender buffers until every addressed member has acked it.
#[derive(Debug)]
struct Unacked {
    event: GroupEvent,
    /// Members that haven't acked yet.
    waiting: HashSet<ClientId>,
    /// Ticks since the event was last (re)transmitted.
    ticks: Ticks,
}

/// The sending side of one group's delivery stream, owned by the leader.
#[derive(Debug)]
pub struct Sender {
    /// The next sequence number to assign, starting at 1.
    next_seq: u64,
    /// Current member addresses.
    members: HashMap<ClientId, NodeId>,
    /// Sent events not yet acked by everyone, by sequence number.
    unacked: BTreeMap<u64, Unacked>,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

impl Sender {
    pub fn new() -> Self {
        Self { next_seq: 1, members: HashMap::new(), unacked: BTreeMap::new() }
    }

    /// The sequence number the next event will get. Returned from group
    /// joins so the joiner can seed its receive cursor.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Adds a member. It will receive all events multicast from now on,
    /// i.e. those with seq >= the returned join seq.
    pub fn join(&mut self, client: ClientId, addr: NodeId) -> u64 {
        self.members.insert(client, addr);
        self.next_seq
    }

    /// Removes a member, dropping it from all pending ack sets so it can't
    /// hold up the buffers.
    pub fn leave(&mut self, client: &ClientId) {
        self.members.remove(client);
        self.unacked.retain(|_, unacked| {
            unacked.waiting.remove(client);
            !unacked.waiting.is_empty()
        });
    }

    /// Stamps an event with the next sequence number and emits a
    /// transmission per member. The event is buffered until all of them ack.
    pub fn multicast(&mut self, event: GroupEvent) -> Vec<Transmission> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let transmissions: Vec<Transmission> =
            self.members.values().map(|addr| (addr.clone(), seq, event.clone())).collect();
        if !self.members.is_empty() {
            let waiting = self.members.keys().copied().collect();
            self.unacked.insert(seq, Unacked { event, waiting, ticks: 0 });
        }
        transmissions
    }

    /// Records a member's ack for a sequence number.
    pub fn ack(&mut self, client: &ClientId, seq: u64) {
        if let Some(unacked) = self.unacked.get_mut(&seq) {
            unacked.waiting.remove(client);
            if unacked.waiting.is_empty() {
                self.unacked.remove(&seq);
            }
        }
    }

    /// Advances time by one tick, retransmitting events whose remaining
    /// members haven't acked within the retransmit interval.
    pub fn tick(&mut self, retransmit: Ticks) -> Vec<Transmission> {
        let mut transmissions = Vec::new();
        for (seq, unacked) in self.unacked.iter_mut() {
            unacked.ticks += 1;
            if unacked.ticks >= retransmit {
                unacked.ticks = 0;
                debug!("Retransmitting seq {seq} to {} members", unacked.waiting.len());
                for client in &unacked.waiting {
                    if let Some(addr) = self.members.get(client) {
                        transmissions.push((addr.clone(), *seq, unacked.event.clone()));
                    }
                }
            }
        }
        transmissions
    }
}

/// The receiving side of one group's delivery stream, owned by a client.
#[derive(Debug, Default)]
pub struct Receiver {
    /// The next sequence number to deliver. None until the first event is
    /// observed or the cursor is seeded from a join reply.
    expected: Option<u64>,
    /// Events received ahead of the cursor, by sequence number.
    holdback: BTreeMap<u64, GroupEvent>,
}

impl Receiver {
    /// A receiver that starts at the first sequence number it observes.
    pub fn new() -> Self {
        Self::default()
    }

    /// A receiver seeded with the join seq from a group join reply.
    pub fn at(seq: u64) -> Self {
        Self { expected: Some(seq), holdback: BTreeMap::new() }
    }

    /// Processes a received event, returning the events now deliverable to
    /// the application, in order. Duplicates and held-back events return
    /// nothing. The caller acks every received seq regardless, so the sender
    /// stops retransmitting even when the ack for a duplicate was lost.
    pub fn receive(&mut self, seq: u64, event: GroupEvent) -> Vec<GroupEvent> {
        let expected = *self.expected.get_or_insert(seq);
        if seq < expected {
            debug!("Dropping duplicate delivery seq {seq}");
            return Vec::new();
        }
        self.holdback.insert(seq, event);

        let mut deliverable = Vec::new();
        let mut next = expected;
        while let Some(event) = self.holdback.remove(&next) {
            deliverable.push(event);
            next += 1;
        }
        self.expected = Some(next);
        if deliverable.is_empty() {
            debug!("Holding back delivery seq {seq}, expecting {expected}");
        }
        deliverable
    }
}

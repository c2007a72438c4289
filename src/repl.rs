//! Leader-to-follower state replication.
//!
//! Every state-changing client operation becomes an op, applied on the
//! leader and pushed to all followers before the client is answered. Ops are
//! numbered contiguously from 1 within a leader epoch; followers apply them
//! in order, buffering any that arrive early. The leader retransmits to
//! laggards until every live follower has acked, at which point the op is
//! durable and the client reply is released. A freshly elected leader
//! recovers the most advanced replica state before serving.

use crate::config::Ticks;
use crate::error::Result;
use crate::message::{Address, ClientId, Envelope, Message, NodeId, VoteId};
use crate::service::{ClientRecord, State, Tally, Vote};

use log::{debug, info};
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A replicated state mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    RegisterClient { record: ClientRecord },
    CreateGroup { name: String, creator: ClientId },
    JoinGroup { name: String, client: ClientId },
    LeaveGroup { name: String, client: ClientId },
    StartVote { vote: Vote },
    CastBallot { vote_id: VoteId, client: ClientId, option: usize },
    CloseVote { vote_id: VoteId, tally: Tally },
}

/// An op the leader has sent but not everyone has acked yet.
#[derive(Debug)]
struct Pending {
    op: Op,
    /// Followers that haven't acked yet.
    waiting: HashSet<NodeId>,
    /// Ticks since the op was last (re)transmitted.
    ticks: Ticks,
}

/// Leader-side replication: assigns op IDs, fans ops out to followers,
/// tracks acks and retransmits to laggards.
#[derive(Debug)]
pub struct Replicator {
    own: NodeId,
    epoch: u64,
    next_op: u64,
    pending: BTreeMap<u64, Pending>,
}

impl Replicator {
    /// Creates a replicator for a new leader epoch.
    pub fn new(own: NodeId, epoch: u64) -> Self {
        Self { own, epoch, next_op: 1, pending: BTreeMap::new() }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The last assigned op ID.
    pub fn last_op(&self) -> u64 {
        self.next_op - 1
    }

    /// Assigns the next op ID and fans the op out to the given followers.
    /// Returns the op ID and the envelopes to send. With no followers the op
    /// is immediately durable.
    pub fn submit(&mut self, followers: &[NodeId], op: Op) -> (u64, Vec<Envelope>) {
        let op_id = self.next_op;
        self.next_op += 1;
        let envelopes: Vec<Envelope> =
            followers.iter().map(|to| self.envelope(to, op_id, &op)).collect();
        if !followers.is_empty() {
            let waiting = followers.iter().cloned().collect();
            self.pending.insert(op_id, Pending { op, waiting, ticks: 0 });
        }
        (op_id, envelopes)
    }

    /// Records an ack from a follower. Returns true if the op just became
    /// durable (all followers have acked).
    pub fn ack(&mut self, from: &NodeId, epoch: u64, op_id: u64) -> bool {
        if epoch != self.epoch {
            debug!("Dropping replication ack from epoch {epoch}");
            return false;
        }
        let Some(pending) = self.pending.get_mut(&op_id) else { return false };
        pending.waiting.remove(from);
        if pending.waiting.is_empty() {
            self.pending.remove(&op_id);
            return true;
        }
        false
    }

    /// Drops a member from all pending sets, e.g. because it died. Returns
    /// the op IDs that became durable as a result, in order.
    pub fn remove_member(&mut self, member: &NodeId) -> Vec<u64> {
        let mut durable = Vec::new();
        for (op_id, pending) in self.pending.iter_mut() {
            pending.waiting.remove(member);
            if pending.waiting.is_empty() {
                durable.push(*op_id);
            }
        }
        for op_id in &durable {
            self.pending.remove(op_id);
        }
        durable
    }

    /// Whether the op is still awaiting acks.
    pub fn is_pending(&self, op_id: u64) -> bool {
        self.pending.contains_key(&op_id)
    }

    /// Advances time by one tick, retransmitting ops whose laggards haven't
    /// acked within the timeout.
    pub fn tick(&mut self, timeout: Ticks) -> Vec<Envelope> {
        let mut resend = Vec::new();
        for (op_id, pending) in self.pending.iter_mut() {
            pending.ticks += 1;
            if pending.ticks >= timeout {
                pending.ticks = 0;
                debug!("Retransmitting op {op_id} to {} laggards", pending.waiting.len());
                for to in &pending.waiting {
                    resend.push((to.clone(), *op_id, pending.op.clone()));
                }
            }
        }
        resend.into_iter().map(|(to, op_id, op)| self.envelope(&to, op_id, &op)).collect()
    }

    fn envelope(&self, to: &NodeId, op_id: u64, op: &Op) -> Envelope {
        Envelope {
            from: self.own.clone(),
            to: Address::Node(to.clone()),
            term: self.epoch,
            seq: op_id,
            message: Message::Replicate { op: op.clone() },
        }
    }
}

/// Follower-side replication: applies ops in op ID order, buffering any that
/// arrive out of order, and tracks which (epoch, op) the replica has reached.
#[derive(Debug, Default)]
pub struct Applier {
    epoch: u64,
    /// The last contiguously applied op ID within the epoch.
    applied: u64,
    /// Ops received ahead of order, by op ID.
    holdback: BTreeMap<u64, Op>,
}

impl Applier {
    pub fn new() -> Self {
        Self::default()
    }

    /// An applier starting at the given position, e.g. for a deposed leader
    /// resuming as a follower at its replicator's position.
    pub fn at(epoch: u64, applied: u64) -> Self {
        Self { epoch, applied, holdback: BTreeMap::new() }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Processes a replicated op against the given state, applying it and
    /// any directly following held-back ops. Returns the op IDs to ack: every
    /// received op that is now applied (including re-received duplicates, so
    /// lost acks are recovered), or nothing for ops still held back.
    ///
    /// Ops from other epochs are ignored: a new epoch is only entered by
    /// installing the new leader's state snapshot, since the ops of an epoch
    /// only make sense against the state the leader started it from. The
    /// caller requests the snapshot when it sees a future epoch.
    pub fn replicate(&mut self, state: &mut State, epoch: u64, op_id: u64, op: Op) -> Result<Vec<u64>> {
        if epoch != self.epoch {
            debug!("Ignoring replication op from epoch {epoch}, at epoch {}", self.epoch);
            return Ok(vec![]);
        }
        if op_id <= self.applied {
            // Duplicate, typically a retransmit racing a lost ack.
            return Ok(vec![op_id]);
        }
        self.holdback.insert(op_id, op);

        let mut acks = Vec::new();
        while let Some(op) = self.holdback.remove(&(self.applied + 1)) {
            // The leader validated the op; a failure here means this replica
            // has diverged and can't safely ack.
            state.apply(&op)?;
            self.applied += 1;
            acks.push(self.applied);
        }
        if acks.is_empty() {
            debug!("Holding back op {op_id}, expecting {}", self.applied + 1);
        }
        Ok(acks)
    }

    /// Installs a state snapshot if it is ahead of this replica, replacing
    /// the replica state. Used when a leader pushes its state to a member
    /// that joined mid-epoch, and by new leaders installing the most
    /// advanced recovered state.
    pub fn install(&mut self, state: &mut State, epoch: u64, applied: u64, snapshot: State) -> bool {
        if (epoch, applied) <= (self.epoch, self.applied) {
            return false;
        }
        info!("Installing state snapshot at epoch {epoch} op {applied}");
        self.epoch = epoch;
        self.applied = applied;
        self.holdback.clear();
        *state = snapshot;
        true
    }
}

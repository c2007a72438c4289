use crate::config::Ticks;
use crate::message::NodeId;

use log::{debug, warn};

/// Failure detection for the left ring neighbour. A probe is sent every
/// hb_interval; each probe is echoed back by the neighbour. If no echo
/// arrives for hb_timeout the neighbour is declared dead, and the caller is
/// expected to drop it from the member set and trigger an election.
#[derive(Debug)]
pub struct Heartbeat {
    /// The neighbour being probed. None when the local node is alone.
    target: Option<NodeId>,
    /// The probe sequence number, increasing per probe.
    seq: u64,
    /// Ticks since the last probe was sent.
    since_probe: Ticks,
    /// Ticks since the target last answered.
    since_ack: Ticks,
}

/// The actions resulting from a heartbeat tick.
#[derive(Debug, Default, PartialEq)]
pub struct HeartbeatTick {
    /// Send a probe with this sequence number to this neighbour.
    pub probe: Option<(NodeId, u64)>,
    /// This neighbour is dead.
    pub dead: Option<NodeId>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self { target: None, seq: 0, since_probe: 0, since_ack: 0 }
    }

    /// Points the prober at a new neighbour, typically after a ring rebuild.
    /// Probing an unchanged neighbour continues undisturbed; a new neighbour
    /// starts with a full timeout's grace. A node that is its own left
    /// neighbour (single-node ring) probes nobody.
    pub fn retarget(&mut self, own: &NodeId, left: &NodeId) {
        let target = Some(left).filter(|left| *left != own).cloned();
        if target != self.target {
            debug!("Heartbeat target changed to {:?}", target.as_ref().map(|id| id.to_string()));
            self.target = target;
            self.since_probe = 0;
            self.since_ack = 0;
        }
    }

    /// Records an ack from a neighbour. Acks from other nodes (e.g. a
    /// previous target) are ignored, as are acks for future probes.
    pub fn ack(&mut self, from: &NodeId, seq: u64) {
        if Some(from) == self.target.as_ref() && seq <= self.seq {
            self.since_ack = 0;
        }
    }

    /// Advances time by one tick, possibly emitting a probe or declaring the
    /// target dead. A dead target is forgotten; the caller drops it from the
    /// member set, which retargets the prober via the ring rebuild.
    pub fn tick(&mut self, interval: Ticks, timeout: Ticks) -> HeartbeatTick {
        let mut result = HeartbeatTick::default();
        let Some(target) = &self.target else { return result };

        self.since_probe += 1;
        self.since_ack += 1;

        if self.since_ack >= timeout {
            warn!("Heartbeat timeout for {target}, assuming crash");
            result.dead = self.target.take();
            return result;
        }
        if self.since_probe >= interval {
            self.since_probe = 0;
            self.seq += 1;
            result.probe = Some((target.clone(), self.seq));
        }
        result
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

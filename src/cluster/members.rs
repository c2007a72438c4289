use crate::config::Ticks;
use crate::message::NodeId;

use log::info;
use std::collections::HashMap;

/// The set of currently known servers, maintained from multicast
/// announcements. Entries are created when a peer is first heard from and
/// removed when it hasn't been heard from within the discovery timeout. The
/// local node is always a member and is never evicted.
#[derive(Debug)]
pub struct MemberSet {
    own: NodeId,
    /// Ticks since each peer was last heard from.
    peers: HashMap<NodeId, Ticks>,
}

impl MemberSet {
    /// Creates a member set containing only the local node.
    pub fn new(own: NodeId) -> Self {
        Self { own, peers: HashMap::new() }
    }

    /// Returns the local node ID.
    pub fn own(&self) -> &NodeId {
        &self.own
    }

    /// Records an announcement from a peer, returning true if it was
    /// previously unknown. Announcements from the local node are ignored.
    pub fn observe(&mut self, id: NodeId) -> bool {
        if id == self.own {
            return false;
        }
        let new = self.peers.insert(id.clone(), 0).is_none();
        if new {
            info!("Server joined: {id}");
        }
        new
    }

    /// Removes a peer, returning true if it was known. The local node can't
    /// be removed.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        if id == &self.own {
            return false;
        }
        let known = self.peers.remove(id).is_some();
        if known {
            info!("Server left: {id}");
        }
        known
    }

    /// Advances time by one tick and sweeps out peers whose last announcement
    /// is older than the timeout, returning them.
    pub fn tick(&mut self, timeout: Ticks) -> Vec<NodeId> {
        for age in self.peers.values_mut() {
            *age += 1;
        }
        let expired: Vec<NodeId> =
            self.peers.iter().filter(|(_, age)| **age >= timeout).map(|(id, _)| id.clone()).collect();
        for id in &expired {
            self.peers.remove(id);
            info!("Server timed out: {id}");
        }
        expired
    }

    /// Returns true if the node (including the local node) is a member.
    pub fn contains(&self, id: &NodeId) -> bool {
        id == &self.own || self.peers.contains_key(id)
    }

    /// The number of members, including the local node.
    pub fn len(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns true if the local node is the only member.
    pub fn is_alone(&self) -> bool {
        self.peers.is_empty()
    }

    /// Iterates over all members, including the local node, in no particular
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        std::iter::once(&self.own).chain(self.peers.keys())
    }

    /// Iterates over all peers (excluding the local node).
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.peers.keys()
    }
}

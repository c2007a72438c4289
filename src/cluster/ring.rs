use super::MemberSet;
use crate::message::{Direction, NodeId};

use itertools::Itertools as _;
use log::debug;

/// The deterministic circular projection of the member set: all members
/// sorted ascending by node ID, with the local node's position tracked so its
/// neighbours can be resolved. Since node IDs are totally ordered, every
/// member derives the same ring. Rebuilt from scratch on every membership
/// change; the vector is the sole owner of the node IDs, neighbours are
/// resolved by index.
#[derive(Clone, Debug, PartialEq)]
pub struct Ring {
    nodes: Vec<NodeId>,
    own: usize,
}

impl Ring {
    /// Builds the ring from the current member set.
    pub fn new(members: &MemberSet) -> Self {
        let nodes: Vec<NodeId> = members.iter().cloned().sorted().collect();
        let own = nodes.iter().position(|id| id == members.own()).expect("own node not a member");
        debug!("Built ring {:?}", nodes.iter().map(|id| id.to_string()).collect::<Vec<_>>());
        Self { nodes, own }
    }

    /// Returns the left neighbour. For a single-node ring this is the local
    /// node itself.
    pub fn left(&self) -> &NodeId {
        &self.nodes[(self.own + self.nodes.len() - 1) % self.nodes.len()]
    }

    /// Returns the right neighbour. For a single-node ring this is the local
    /// node itself.
    pub fn right(&self) -> &NodeId {
        &self.nodes[(self.own + 1) % self.nodes.len()]
    }

    /// Returns the neighbour in the given direction.
    pub fn neighbour(&self, dir: Direction) -> &NodeId {
        match dir {
            Direction::Left => self.left(),
            Direction::Right => self.right(),
        }
    }

    /// The number of nodes in the ring.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the local node is the only ring member.
    pub fn is_alone(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Returns the highest node ID in the ring, i.e. the expected election
    /// winner.
    pub fn max(&self) -> &NodeId {
        self.nodes.last().expect("ring is never empty")
    }

    /// Iterates over the ring in ascending node ID order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }
}

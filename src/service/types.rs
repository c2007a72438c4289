use crate::message::{ClientId, NodeId, Token, VoteId};

use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A registered client. Records survive leader failover via replication, so
/// clients keep their token across leader changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: ClientId,
    /// The client's unicast address, for FIFO group deliveries.
    pub addr: NodeId,
    pub token: Token,
}

/// A client group. Group names are unique process-wide.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub members: BTreeSet<ClientId>,
}

/// A vote instance. Opened by StartVote, it collects at most one ballot per
/// group member and closes on its deadline or when every member has voted,
/// after which it remains as an immutable result record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub id: VoteId,
    pub group: String,
    pub topic: String,
    pub options: Vec<String>,
    /// Close deadline as milliseconds since the Unix epoch.
    pub deadline_ms: u64,
    /// Accepted ballots, as option indexes by client.
    pub ballots: BTreeMap<ClientId, usize>,
    /// The final tally once closed. None while open.
    pub result: Option<Tally>,
}

impl Vote {
    pub fn is_open(&self) -> bool {
        self.result.is_none()
    }

    /// Computes the tally over the current ballots. The winner is the lowest
    /// option index among those with the maximum count.
    pub fn tally(&self) -> Tally {
        let mut counts = vec![0u64; self.options.len()];
        for option in self.ballots.values() {
            counts[*option] += 1;
        }
        let mut winner = 0;
        for (index, count) in counts.iter().enumerate() {
            if *count > counts[winner] {
                winner = index;
            }
        }
        Tally { counts, winner }
    }

    /// The winning option's name for the given tally.
    pub fn winner_name(&self, tally: &Tally) -> String {
        self.options[tally.winner].clone()
    }
}

/// A closed vote's result: per-option ballot counts and the winning option
/// index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub counts: Vec<u64>,
    pub winner: usize,
}

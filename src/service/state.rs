use super::{ClientRecord, Group, Vote};
use crate::errdata;
use crate::error::Result;
use crate::message::{ClientId, Token, VoteId};
use crate::repl::Op;

use log::info;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The authoritative service state: registered clients, groups, and votes.
/// The leader owns it and mutates it through ops, which it replicates to all
/// followers; followers apply the same ops in the same order, so every
/// replica's state is identical after the same op sequence. All reads and
/// writes go through ops to keep it that way.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    clients: HashMap<ClientId, ClientRecord>,
    /// Token lookup index, maintained alongside clients.
    tokens: HashMap<Token, ClientId>,
    groups: BTreeMap<String, Group>,
    votes: BTreeMap<VoteId, Vote>,
    next_vote_id: VoteId,
}

impl State {
    pub fn new() -> Self {
        Self { next_vote_id: 1, ..Self::default() }
    }

    /// Applies a replicated mutation. Ops are validated by the leader before
    /// replication, so failures here indicate replica divergence and are
    /// surfaced as data errors for the caller to log.
    pub fn apply(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::RegisterClient { record } => {
                self.tokens.insert(record.token, record.id);
                self.clients.insert(record.id, record.clone());
            }
            Op::CreateGroup { name, creator } => {
                if self.groups.contains_key(name) {
                    return errdata!("group {name} already exists");
                }
                let mut group = Group::default();
                group.members.insert(*creator);
                self.groups.insert(name.clone(), group);
                info!("Created group {name}");
            }
            Op::JoinGroup { name, client } => {
                let Some(group) = self.groups.get_mut(name) else {
                    return errdata!("no group named {name}");
                };
                group.members.insert(*client);
            }
            Op::LeaveGroup { name, client } => {
                let Some(group) = self.groups.get_mut(name) else {
                    return errdata!("no group named {name}");
                };
                group.members.remove(client);
            }
            Op::StartVote { vote } => {
                self.next_vote_id = self.next_vote_id.max(vote.id + 1);
                self.votes.insert(vote.id, vote.clone());
                info!("Opened vote {} in group {}: {}", vote.id, vote.group, vote.topic);
            }
            Op::CastBallot { vote_id, client, option } => {
                let Some(vote) = self.votes.get_mut(vote_id) else {
                    return errdata!("no vote with id {vote_id}");
                };
                if vote.is_open() {
                    vote.ballots.entry(*client).or_insert(*option);
                }
            }
            Op::CloseVote { vote_id, tally } => {
                let Some(vote) = self.votes.get_mut(vote_id) else {
                    return errdata!("no vote with id {vote_id}");
                };
                if vote.is_open() {
                    vote.result = Some(tally.clone());
                    info!("Closed vote {vote_id}");
                }
            }
        }
        Ok(())
    }

    /// Looks up the client holding the given token.
    pub fn authenticate(&self, token: Token) -> Option<&ClientRecord> {
        self.tokens.get(&token).and_then(|id| self.clients.get(id))
    }

    pub fn client(&self, id: &ClientId) -> Option<&ClientRecord> {
        self.clients.get(id)
    }

    /// Looks up a client by its unicast address, e.g. to attribute a
    /// delivery ack to the member that sent it.
    pub fn client_by_addr(&self, addr: &crate::message::NodeId) -> Option<&ClientRecord> {
        self.clients.values().find(|record| &record.addr == addr)
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn vote(&self, id: VoteId) -> Option<&Vote> {
        self.votes.get(&id)
    }

    /// The ID the next vote will be allocated.
    pub fn next_vote_id(&self) -> VoteId {
        self.next_vote_id
    }

    /// All groups with their names, in name order.
    pub fn groups(&self) -> impl Iterator<Item = (&String, &Group)> {
        self.groups.iter()
    }

    /// All currently open votes.
    pub fn open_votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.values().filter(|vote| vote.is_open())
    }

    /// All group names, sorted.
    pub fn list_groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// The names of groups the given client belongs to, sorted.
    pub fn joined_groups(&self, client: &ClientId) -> Vec<String> {
        self.groups
            .iter()
            .filter(|(_, group)| group.members.contains(client))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Open votes whose deadline has passed.
    pub fn expired_votes(&self, now_ms: u64) -> Vec<VoteId> {
        self.votes
            .values()
            .filter(|vote| vote.is_open() && vote.deadline_ms <= now_ms)
            .map(|vote| vote.id)
            .collect()
    }
}

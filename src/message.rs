use crate::errinput;
use crate::error::Error;
use crate::repl::Op;
use crate::service::State;

use serde_derive::{Deserialize, Serialize};

/// A server identity: the host and port of its unicast socket. The identity
/// doubles as the election priority, compared lexicographically by
/// (host, port) with the highest identity winning elections.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub host: String,
    pub port: u16,
}

impl NodeId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Returns the socket address for this identity.
    pub fn socket_addr(&self) -> crate::error::Result<std::net::SocketAddr> {
        Ok(std::net::SocketAddr::new(self.host.parse()?, self.port))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((host, port)) = s.rsplit_once(':') else {
            return errinput!("invalid node id {s}, expected host:port");
        };
        Ok(Self { host: host.to_string(), port: port.parse()? })
    }
}

/// A message direction around the ring, as seen from the sending node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    /// Returns the opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

/// A message recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    /// A single node or client, addressed by its unicast socket.
    Node(NodeId),
    /// All processes listening on the well-known multicast group.
    Multicast,
}

/// A client identity, issued at registration.
pub type ClientId = uuid::Uuid;

/// A client request ID, generated by the client. Reissuing a request with the
/// same ID must be idempotent.
pub type RequestId = uuid::Uuid;

/// A vote instance ID, allocated by the leader.
pub type VoteId = u64;

/// An authentication token: 128 bits of unpredictable randomness issued at
/// registration. Tokens survive leader failover via replication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(pub u128);

impl Token {
    /// Generates a fresh random token.
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// A message envelope. The term field carries the election round for election
/// messages and the leader epoch for replication and leader announcements;
/// the seq field carries heartbeat, replication op and FIFO delivery
/// sequence numbers. Both are 0 where unused.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender.
    pub from: NodeId,
    /// The recipient.
    pub to: Address,
    /// Election round or leader epoch.
    pub term: u64,
    /// Message sequence number.
    pub seq: u64,
    /// The message payload.
    pub message: Message,
}

/// A message between processes (servers and clients).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Servers periodically announce themselves on the multicast group.
    Announce,
    /// A server detected the death of a neighbour and announces it, so all
    /// members drop it without waiting for their own discovery timeouts.
    Crash(NodeId),
    /// Clients ask the multicast group who the leader is.
    WhoIsLeader,
    /// The leader's unicast answer to WhoIsLeader.
    LeaderIs(NodeId),
    /// The election winner announces itself to clients on the multicast
    /// group. The envelope term carries the new epoch.
    NewLeader(NodeId),

    /// A liveness probe, sent periodically to the left ring neighbour. The
    /// envelope seq increases per probe.
    Heartbeat,
    /// Echoes a received heartbeat back to the prober, with the same seq.
    HeartbeatAck,

    /// A Hirschberg-Sinclair election probe, travelling in the given
    /// direction for the given number of remaining hops. The envelope term
    /// carries the election round.
    Probe { origin: NodeId, dir: Direction, hops: u64, phase: u32 },
    /// A probe turnaround, travelling in the given direction back to the
    /// origin of a probe that exhausted its hops.
    ProbeReply { origin: NodeId, dir: Direction, phase: u32 },
    /// The election winner circulates itself around the ring once.
    Coordinator { leader: NodeId },

    /// The leader replicates a state mutation to a follower. The envelope
    /// term carries the leader epoch and the seq the op ID, which increases
    /// contiguously from 1 within an epoch.
    Replicate { op: Op },
    /// A follower confirms it has applied the op in the envelope seq.
    ReplicateAck,
    /// A freshly elected leader asks all members for their replica state.
    StateRequest,
    /// A member's replica state: the full service state, the epoch it was
    /// replicated in (envelope term) and the last applied op ID (envelope
    /// seq). The new leader installs the most advanced response.
    StateResponse { state: State },

    /// A client request. The token authenticates all operations except
    /// Register.
    ClientRequest { id: RequestId, token: Option<Token>, request: Request },
    /// A response to a client request, matched by ID.
    ClientResponse { id: RequestId, response: Result<Response, ServiceError> },

    /// A FIFO-ordered group delivery from the leader. The envelope seq
    /// carries the per-group sequence number.
    Deliver { group: String, event: GroupEvent },
    /// A client acknowledges a group delivery, echoing its seq.
    DeliverAck { group: String },
}

/// A client request to the leader. All requests are idempotent when reissued
/// with the same request ID.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Registers the client, allocating an ID and token.
    Register,
    /// Creates a group with the given name, with the caller as first member.
    CreateGroup { name: String },
    /// Joins a group.
    JoinGroup { name: String },
    /// Leaves a group.
    LeaveGroup { name: String },
    /// Lists all group names.
    ListGroups,
    /// Lists the names of groups the caller belongs to.
    JoinedGroups,
    /// Opens a vote in a group. The vote closes after timeout_secs, or as
    /// soon as every group member has cast a ballot.
    StartVote { group: String, topic: String, options: Vec<String>, timeout_secs: u64 },
    /// Casts a ballot. Only the first ballot per client counts.
    CastBallot { vote_id: VoteId, option: usize },
}

/// A response to a client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Register { client_id: ClientId, token: Token, leader: NodeId },
    CreateGroup,
    /// The next FIFO delivery sequence number for the group, seeding the
    /// joiner's receive cursor.
    JoinGroup { next_seq: u64 },
    LeaveGroup,
    ListGroups { groups: Vec<String> },
    JoinedGroups { groups: Vec<String> },
    StartVote { vote_id: VoteId, deadline_ms: u64 },
    /// duplicate is true when the ballot had already been counted, either
    /// because the request was retried or the client voted before.
    CastBallot { duplicate: bool },
}

/// A structured client-facing error with a machine-readable code. These are
/// expected service outcomes, distinct from crate::error::Error: they never
/// indicate a server fault and cause no state change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServiceError {
    /// The token is unknown. The client must (re)register.
    Auth,
    /// The vote options are invalid (empty, or the option index is out of
    /// bounds).
    BadOptions(String),
    /// The group name is already in use.
    NameTaken(String),
    /// No leader is currently known or the leader is still recovering state.
    NoLeader,
    /// No group with this name exists.
    NoSuchGroup(String),
    /// No vote with this ID exists.
    NoSuchVote(VoteId),
    /// The client is not a member of the group.
    NotMember(String),
    /// This server is not the leader; retry against the given node.
    Redirect(NodeId),
    /// The vote has already closed.
    VoteClosed(VoteId),
}

impl ServiceError {
    /// Returns the machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Auth => "AUTH_FAILED",
            ServiceError::BadOptions(_) => "BAD_OPTIONS",
            ServiceError::NameTaken(_) => "NAME_TAKEN",
            ServiceError::NoLeader => "NO_LEADER",
            ServiceError::NoSuchGroup(_) => "NO_SUCH_GROUP",
            ServiceError::NoSuchVote(_) => "NO_SUCH_VOTE",
            ServiceError::NotMember(_) => "NOT_MEMBER",
            ServiceError::Redirect(_) => "REDIRECT",
            ServiceError::VoteClosed(_) => "CLOSED",
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Auth => write!(f, "unknown token, register first"),
            ServiceError::BadOptions(reason) => write!(f, "bad vote options: {reason}"),
            ServiceError::NameTaken(name) => write!(f, "group {name} already exists"),
            ServiceError::NoLeader => write!(f, "no leader available"),
            ServiceError::NoSuchGroup(name) => write!(f, "no group named {name}"),
            ServiceError::NoSuchVote(id) => write!(f, "no vote with id {id}"),
            ServiceError::NotMember(name) => write!(f, "not a member of group {name}"),
            ServiceError::Redirect(leader) => write!(f, "not the leader, retry against {leader}"),
            ServiceError::VoteClosed(id) => write!(f, "vote {id} is closed"),
        }
    }
}

/// An event delivered to group members in FIFO order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GroupEvent {
    /// A vote has opened in the group.
    VoteOpen { vote_id: VoteId, group: String, topic: String, options: Vec<String>, deadline_ms: u64 },
    /// A ballot was counted; ballots is the running total.
    BallotCounted { vote_id: VoteId, ballots: u64 },
    /// The vote closed with the given per-option counts. Ties are broken
    /// towards the lowest option index.
    VoteResult { vote_id: VoteId, counts: Vec<u64>, winner: String },
}

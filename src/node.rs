//! The per-server state machine.
//!
//! A node is driven synchronously by the server's event loop: inbound
//! messages are processed via step() and time advances via tick(). Outbound
//! messages are emitted into a channel that the server's socket threads
//! drain, so the node itself never touches the network and can be tested
//! deterministically.
//!
//! The node ties the subsystems together: discovery sweeps feed the member
//! set, the member set derives the ring, the ring drives heartbeats and
//! elections, and the election outcome decides the role. A leader serves
//! client requests, replicates mutations to all followers before answering,
//! and fans group events out over FIFO delivery streams. A follower applies
//! replicated mutations and redirects clients to the leader. A node that
//! wins an election first recovers the most advanced replica state from the
//! members before it starts serving.

use crate::cluster::{Heartbeat, MemberSet, Ring};
use crate::config::{Ticks, Timing};
use crate::election::Election;
use crate::error::Result;
use crate::fifo;
use crate::message::{
    Address, Envelope, GroupEvent, Message, NodeId, Request, RequestId, Response, ServiceError,
    Token, VoteId,
};
use crate::repl::{Applier, Op, Replicator};
use crate::service::{ClientRecord, State, Vote};

use crossbeam::channel::Sender;
use log::{debug, error, info, warn};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// The number of announcements sent back-to-back at startup, so discovery
/// converges faster than one full interval in the common case.
const ANNOUNCE_BURST: Ticks = 5;

/// A server node, driven by step() and tick().
pub struct Node {
    id: NodeId,
    timing: Timing,
    members: MemberSet,
    ring: Ring,
    heartbeat: Heartbeat,
    election: Election,
    /// The replicated service state. Authoritative on the leader, a replica
    /// on followers.
    state: State,
    role: Role,
    /// The highest leader epoch observed.
    epoch: u64,
    /// Wall-clock milliseconds, updated on every tick. Used for vote
    /// deadlines.
    now_ms: u64,
    /// Announcements left in the startup burst.
    announce_burst: Ticks,
    /// Ticks since the last periodic announcement.
    announce_ticks: Ticks,
    /// Outbound messages, drained by the server's sender thread.
    tx: Sender<Envelope>,
}

/// The node's current role.
enum Role {
    Follower(Follower),
    Recovering(Recovering),
    Leader(Leader),
}

/// A follower applies replicated mutations and redirects clients.
struct Follower {
    /// The current leader, if known.
    leader: Option<NodeId>,
    applier: Applier,
}

/// An election winner recovering the most advanced replica state from the
/// members before assuming leadership.
struct Recovering {
    /// Members whose state responses are still outstanding.
    waiting: HashSet<NodeId>,
    /// Our own replica position when recovery started.
    own: (u64, u64),
    /// The most advanced position seen so far.
    best: (u64, u64),
    /// The state at the best position, if it beats our own.
    snapshot: Option<State>,
    /// Ticks since recovery started.
    ticks: Ticks,
}

/// A leader serves client requests and replicates to all followers.
struct Leader {
    repl: Replicator,
    /// FIFO delivery streams, per group.
    streams: HashMap<String, fifo::Sender>,
    /// Completed responses by request ID, replayed on retries.
    replies: HashMap<RequestId, std::result::Result<Response, ServiceError>>,
    /// Responses withheld until their op is durable, by op ID.
    waiting: HashMap<u64, PendingReply>,
    /// Vote deadlines, earliest first.
    deadlines: BinaryHeap<Reverse<(u64, VoteId)>>,
}

/// A client reply awaiting replication durability.
struct PendingReply {
    to: NodeId,
    id: RequestId,
    response: Response,
}

impl Node {
    /// Creates a node and immediately campaigns: a node that boots alone
    /// declares itself leader without waiting for an election.
    pub fn new(id: NodeId, timing: Timing, tx: Sender<Envelope>) -> Result<Self> {
        let members = MemberSet::new(id.clone());
        let ring = Ring::new(&members);
        let election = Election::new(id.clone(), tx.clone());
        let mut node = Self {
            id: id.clone(),
            timing,
            members,
            ring,
            heartbeat: Heartbeat::new(),
            election,
            state: State::new(),
            role: Role::Follower(Follower { leader: None, applier: Applier::new() }),
            epoch: 0,
            now_ms: 0,
            announce_burst: ANNOUNCE_BURST,
            announce_ticks: 0,
            tx,
        };
        info!("Starting node {id}");
        node.election.campaign(&node.ring)?;
        node.reconcile()?;
        Ok(node)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The current leader, as this node sees it.
    pub fn leader(&self) -> Option<&NodeId> {
        match &self.role {
            Role::Follower(follower) => follower.leader.as_ref(),
            Role::Recovering(_) | Role::Leader(_) => Some(&self.id),
        }
    }

    /// Whether this node is currently serving as leader.
    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    /// Processes an inbound message.
    pub fn step(&mut self, envelope: Envelope) -> Result<()> {
        if matches!(
            envelope.message,
            Message::Probe { .. } | Message::ProbeReply { .. } | Message::Coordinator { .. }
        ) {
            self.election.step(&self.ring, envelope)?;
            return self.reconcile();
        }

        let Envelope { from, term, seq, message, .. } = envelope;
        match message {
            Message::Announce => {
                if self.members.observe(from) {
                    self.membership_changed()?;
                }
            }
            Message::Crash(dead) => {
                if dead != self.id && self.members.remove(&dead) {
                    self.drop_member(&dead)?;
                }
            }
            Message::WhoIsLeader => {
                if self.is_leader() {
                    self.send(&from, 0, 0, Message::LeaderIs(self.id.clone()))?;
                }
            }
            // These are client-facing; servers learn leadership from the
            // coordinator traversal instead.
            Message::LeaderIs(_)
            | Message::NewLeader(_)
            | Message::ClientResponse { .. }
            | Message::Deliver { .. } => {}

            Message::Heartbeat => self.send(&from, 0, seq, Message::HeartbeatAck)?,
            Message::HeartbeatAck => self.heartbeat.ack(&from, seq),

            Message::Probe { .. } | Message::ProbeReply { .. } | Message::Coordinator { .. } => {
                unreachable!("election messages handled above")
            }

            Message::Replicate { op } => self.step_replicate(from, term, seq, op)?,
            Message::ReplicateAck => {
                if let Role::Leader(leader) = &mut self.role {
                    if leader.repl.ack(&from, term, seq) {
                        self.release_reply(seq)?;
                    }
                }
            }
            Message::StateRequest => {
                let (epoch, applied) = self.position();
                let message = Message::StateResponse { state: self.state.clone() };
                self.send(&from, epoch, applied, message)?;
            }
            Message::StateResponse { state } => self.step_state_response(from, term, seq, state)?,

            Message::ClientRequest { id, token, request } => {
                self.client_request(from, id, token, request)?;
            }
            Message::DeliverAck { group } => {
                if let Role::Leader(leader) = &mut self.role {
                    if let Some(record) = self.state.client_by_addr(&from) {
                        if let Some(stream) = leader.streams.get_mut(&group) {
                            stream.ack(&record.id, seq);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Advances time by one tick, driving all periodic work: announcements,
    /// membership sweeps, heartbeats, election timeouts, replication and
    /// delivery retransmits, and vote deadlines.
    pub fn tick(&mut self, now_ms: u64) -> Result<()> {
        self.now_ms = now_ms;

        // Discovery announcements, with an initial burst.
        if self.announce_burst > 0 {
            self.announce_burst -= 1;
            self.multicast(0, 0, Message::Announce)?;
        } else {
            self.announce_ticks += 1;
            if self.announce_ticks >= self.timing.discovery_interval {
                self.announce_ticks = 0;
                self.multicast(0, 0, Message::Announce)?;
            }
        }

        // Membership sweep.
        for dead in self.members.tick(self.timing.discovery_timeout) {
            self.drop_member(&dead)?;
        }

        // Heartbeat the left neighbour.
        let hb = self.heartbeat.tick(self.timing.hb_interval, self.timing.hb_timeout);
        if let Some((to, seq)) = hb.probe {
            self.send(&to, 0, seq, Message::Heartbeat)?;
        }
        if let Some(dead) = hb.dead {
            // Tell everyone, so the whole membership drops it at once rather
            // than waiting out their own discovery timeouts.
            self.multicast(0, 0, Message::Crash(dead.clone()))?;
            if self.members.remove(&dead) {
                self.drop_member(&dead)?;
            }
        }

        // Election round timeout.
        self.election.tick(&self.ring, self.timing.election_timeout)?;
        self.reconcile()?;

        // Role-specific periodic work.
        match &mut self.role {
            Role::Follower(_) => {}
            Role::Recovering(recovering) => {
                recovering.ticks += 1;
                if recovering.ticks >= self.timing.repl_timeout {
                    warn!(
                        "State recovery timed out with {} members unresponsive",
                        recovering.waiting.len()
                    );
                    recovering.waiting.clear();
                    self.maybe_complete_recovery()?;
                }
            }
            Role::Leader(leader) => {
                for envelope in leader.repl.tick(self.timing.repl_timeout) {
                    self.tx.send(envelope)?;
                }
                let mut deliveries = Vec::new();
                for (group, stream) in leader.streams.iter_mut() {
                    for (addr, seq, event) in stream.tick(self.timing.fo_retransmit) {
                        deliveries.push((addr, seq, group.clone(), event));
                    }
                }
                for (addr, seq, group, event) in deliveries {
                    self.send(&addr, self.epoch, seq, Message::Deliver { group, event })?;
                }
                self.close_due_votes()?;
            }
        }
        Ok(())
    }

    /// Our replica position as (epoch, last applied op).
    fn position(&self) -> (u64, u64) {
        match &self.role {
            Role::Follower(follower) => (follower.applier.epoch(), follower.applier.applied()),
            Role::Recovering(recovering) => recovering.own,
            Role::Leader(leader) => (leader.repl.epoch(), leader.repl.last_op()),
        }
    }

    /// Rebuilds the ring after a membership change, retargets the heartbeat
    /// prober, and starts a new election round: the ring order changed, so
    /// leadership must be re-settled (a newly joined node may outrank the
    /// current leader).
    fn membership_changed(&mut self) -> Result<()> {
        self.ring = Ring::new(&self.members);
        self.heartbeat.retarget(&self.id, self.ring.left());
        // A leader pushes its state to the members so a newcomer can follow
        // the epoch's remaining ops; installs only move forward, so members
        // that are already caught up ignore it.
        if let Role::Leader(leader) = &self.role {
            let (epoch, applied) = (leader.repl.epoch(), leader.repl.last_op());
            for peer in self.members.peers() {
                let message = Message::StateResponse { state: self.state.clone() };
                self.send(peer, epoch, applied, message)?;
            }
        }
        self.election.campaign(&self.ring)?;
        self.reconcile()
    }

    /// Handles the loss of a member: replication stops waiting for it, state
    /// recovery stops waiting for it, and the ring is rebuilt with a fresh
    /// election.
    fn drop_member(&mut self, dead: &NodeId) -> Result<()> {
        match &mut self.role {
            Role::Follower(_) => {}
            Role::Recovering(recovering) => {
                recovering.waiting.remove(dead);
            }
            Role::Leader(leader) => {
                for op_id in leader.repl.remove_member(dead) {
                    self.release_reply(op_id)?;
                }
            }
        }
        if let Role::Recovering(_) = self.role {
            self.maybe_complete_recovery()?;
        }
        self.membership_changed()
    }

    /// Reconciles the role with the election outcome.
    fn reconcile(&mut self) -> Result<()> {
        let elected = self.election.leader().cloned();
        match elected {
            Some(leader) if leader == self.id => {
                if let Role::Follower(_) = self.role {
                    self.become_recovering()?;
                }
            }
            elected => match &mut self.role {
                Role::Follower(follower) => {
                    if follower.leader != elected {
                        follower.leader = elected;
                    }
                }
                Role::Recovering(_) | Role::Leader(_) => self.demote(elected)?,
            },
        }
        Ok(())
    }

    /// Steps down to follower, e.g. because a new election round started or
    /// another node won.
    fn demote(&mut self, leader: Option<NodeId>) -> Result<()> {
        let (epoch, applied) = self.position();
        info!("Stepping down at epoch {epoch}, following {leader:?}");
        self.role = Role::Follower(Follower { leader, applier: Applier::at(epoch, applied) });
        Ok(())
    }

    /// Starts state recovery after winning an election: ask every member for
    /// its replica state, so no durably replicated op is lost even if we
    /// were behind.
    fn become_recovering(&mut self) -> Result<()> {
        let own = self.position();
        let waiting: HashSet<NodeId> = self.members.peers().cloned().collect();
        info!("Won election, recovering state from {} members", waiting.len());
        for peer in &waiting {
            self.send(peer, self.epoch, 0, Message::StateRequest)?;
        }
        self.role =
            Role::Recovering(Recovering { waiting, own, best: own, snapshot: None, ticks: 0 });
        self.maybe_complete_recovery()
    }

    /// Completes recovery once every member has responded (or recovery timed
    /// out): install the most advanced state, start a new epoch, push the
    /// state to all members, and announce leadership to clients.
    fn maybe_complete_recovery(&mut self) -> Result<()> {
        let Role::Recovering(recovering) = &mut self.role else { return Ok(()) };
        if !recovering.waiting.is_empty() {
            return Ok(());
        }
        if let Some(snapshot) = recovering.snapshot.take() {
            info!("Recovered state from epoch {} op {}", recovering.best.0, recovering.best.1);
            self.state = snapshot;
        }
        let epoch = self.epoch.max(recovering.best.0) + 1;
        self.epoch = epoch;
        info!("Assuming leadership of epoch {epoch} as {}", self.id);

        // Rebuild the delivery streams from the recovered state, with every
        // current group member subscribed.
        let mut streams = HashMap::new();
        for (name, group) in self.state.groups() {
            let mut stream = fifo::Sender::new();
            for member in &group.members {
                if let Some(record) = self.state.client(member) {
                    stream.join(*member, record.addr.clone());
                }
            }
            streams.insert(name.clone(), stream);
        }
        // And the deadline queue from the open votes.
        let mut deadlines = BinaryHeap::new();
        for vote in self.state.open_votes() {
            deadlines.push(Reverse((vote.deadline_ms, vote.id)));
        }
        self.role = Role::Leader(Leader {
            repl: Replicator::new(self.id.clone(), epoch),
            streams,
            replies: HashMap::new(),
            waiting: HashMap::new(),
            deadlines,
        });

        // Align all members with the state we're about to serve from, then
        // tell the clients where to send requests.
        for peer in self.members.peers() {
            let message = Message::StateResponse { state: self.state.clone() };
            self.send(peer, epoch, 0, message)?;
        }
        self.multicast(epoch, 0, Message::NewLeader(self.id.clone()))?;
        Ok(())
    }

    /// Applies a replicated op as a follower and acks what was applied.
    fn step_replicate(&mut self, from: NodeId, epoch: u64, op_id: u64, op: Op) -> Result<()> {
        self.epoch = self.epoch.max(epoch);
        let Role::Follower(follower) = &mut self.role else {
            debug!("Ignoring replication op as non-follower");
            return Ok(());
        };
        // The sender is serving as leader; follow it if we had nobody.
        if follower.leader.is_none() {
            follower.leader = Some(from.clone());
        }
        // An op from an epoch we haven't entered means we missed the leader's
        // state push. Ask for it; the leader retransmits the op until we've
        // installed the snapshot and can ack.
        if epoch > follower.applier.epoch() {
            debug!("Missing state for epoch {epoch}, requesting it from {from}");
            return self.send(&from, self.epoch, 0, Message::StateRequest);
        }
        match follower.applier.replicate(&mut self.state, epoch, op_id, op) {
            Ok(acks) => {
                for ack in acks {
                    self.send(&from, epoch, ack, Message::ReplicateAck)?;
                }
            }
            Err(err) => error!("Failed to apply replicated op {op_id}: {err}"),
        }
        Ok(())
    }

    /// Handles a state snapshot: a recovering winner collects it, a follower
    /// installs it if it is ahead of its own replica.
    fn step_state_response(
        &mut self,
        from: NodeId,
        epoch: u64,
        applied: u64,
        state: State,
    ) -> Result<()> {
        self.epoch = self.epoch.max(epoch);
        match &mut self.role {
            Role::Recovering(recovering) => {
                if (epoch, applied) > recovering.best {
                    recovering.best = (epoch, applied);
                    recovering.snapshot = Some(state);
                }
                recovering.waiting.remove(&from);
                self.maybe_complete_recovery()?;
            }
            Role::Follower(follower) => {
                follower.applier.install(&mut self.state, epoch, applied, state);
            }
            Role::Leader(_) => debug!("Ignoring state snapshot as leader"),
        }
        Ok(())
    }

    /// Handles a client request. Only the leader serves clients; anyone else
    /// redirects. Requests are idempotent: completed responses are cached by
    /// request ID and replayed on retries, and retries of requests still
    /// awaiting replication are left to the pending reply.
    fn client_request(
        &mut self,
        from: NodeId,
        id: RequestId,
        token: Option<Token>,
        request: Request,
    ) -> Result<()> {
        let Role::Leader(leader) = &mut self.role else {
            let response = match self.leader() {
                Some(leader) if leader != &self.id => Err(ServiceError::Redirect(leader.clone())),
                _ => Err(ServiceError::NoLeader),
            };
            return self.respond(&from, id, response);
        };
        if let Some(response) = leader.replies.get(&id) {
            let response = response.clone();
            return self.respond(&from, id, response);
        }
        if leader.waiting.values().any(|pending| pending.id == id) {
            // A retry of a request whose op is still replicating; the reply
            // goes out when the op is durable.
            return Ok(());
        }

        match self.process(&from, token, request) {
            // Reads and no-op duplicates complete immediately.
            Ok((response, None)) => {
                self.leader_mut().replies.insert(id, Ok(response.clone()));
                self.respond(&from, id, Ok(response))
            }
            // Mutations complete once every live follower has acked the op.
            Ok((response, Some(op_id))) => {
                if self.leader_mut().repl.is_pending(op_id) {
                    let pending = PendingReply { to: from, id, response };
                    self.leader_mut().waiting.insert(op_id, pending);
                    return Ok(());
                }
                self.leader_mut().replies.insert(id, Ok(response.clone()));
                self.respond(&from, id, Ok(response))
            }
            Err(err) => {
                self.leader_mut().replies.insert(id, Err(err.clone()));
                self.respond(&from, id, Err(err))
            }
        }
    }

    /// Validates and executes a request against the service state, returning
    /// the response and the replication op ID for mutations.
    fn process(
        &mut self,
        from: &NodeId,
        token: Option<Token>,
        request: Request,
    ) -> std::result::Result<(Response, Option<u64>), ServiceError> {
        if let Request::Register = request {
            let record = ClientRecord {
                id: uuid::Uuid::new_v4(),
                addr: from.clone(),
                token: Token::generate(),
            };
            info!("Registering client {} at {}", record.id, record.addr);
            let response = Response::Register {
                client_id: record.id,
                token: record.token,
                leader: self.id.clone(),
            };
            let op_id = self.mutate(Op::RegisterClient { record });
            return Ok((response, Some(op_id)));
        }

        // All other requests are authenticated. Tokens the leader has never
        // seen (e.g. because their registration didn't survive a failover)
        // require re-registration.
        let client = token
            .and_then(|token| self.state.authenticate(token))
            .cloned()
            .ok_or(ServiceError::Auth)?;

        match request {
            Request::Register => unreachable!("handled above"),
            Request::CreateGroup { name } => {
                if self.state.group(&name).is_some() {
                    return Err(ServiceError::NameTaken(name));
                }
                let op_id = self.mutate(Op::CreateGroup { name: name.clone(), creator: client.id });
                let mut stream = fifo::Sender::new();
                stream.join(client.id, client.addr.clone());
                self.leader_mut().streams.insert(name, stream);
                Ok((Response::CreateGroup, Some(op_id)))
            }
            Request::JoinGroup { name } => {
                if self.state.group(&name).is_none() {
                    return Err(ServiceError::NoSuchGroup(name));
                }
                let op_id = self.mutate(Op::JoinGroup { name: name.clone(), client: client.id });
                let stream = self.leader_mut().streams.entry(name).or_default();
                let next_seq = stream.join(client.id, client.addr.clone());
                Ok((Response::JoinGroup { next_seq }, Some(op_id)))
            }
            Request::LeaveGroup { name } => {
                let group =
                    self.state.group(&name).ok_or_else(|| ServiceError::NoSuchGroup(name.clone()))?;
                if !group.members.contains(&client.id) {
                    return Err(ServiceError::NotMember(name));
                }
                let op_id = self.mutate(Op::LeaveGroup { name: name.clone(), client: client.id });
                if let Some(stream) = self.leader_mut().streams.get_mut(&name) {
                    stream.leave(&client.id);
                }
                Ok((Response::LeaveGroup, Some(op_id)))
            }
            Request::ListGroups => {
                Ok((Response::ListGroups { groups: self.state.list_groups() }, None))
            }
            Request::JoinedGroups => {
                Ok((Response::JoinedGroups { groups: self.state.joined_groups(&client.id) }, None))
            }
            Request::StartVote { group, topic, options, timeout_secs } => {
                let members = self
                    .state
                    .group(&group)
                    .ok_or_else(|| ServiceError::NoSuchGroup(group.clone()))?;
                if !members.members.contains(&client.id) {
                    return Err(ServiceError::NotMember(group));
                }
                if options.is_empty() {
                    return Err(ServiceError::BadOptions("no options given".to_string()));
                }
                let vote = Vote {
                    id: self.state.next_vote_id(),
                    group: group.clone(),
                    topic,
                    options,
                    deadline_ms: self.now_ms + timeout_secs * 1000,
                    ballots: Default::default(),
                    result: None,
                };
                let (vote_id, deadline_ms) = (vote.id, vote.deadline_ms);
                let event = GroupEvent::VoteOpen {
                    vote_id,
                    group: group.clone(),
                    topic: vote.topic.clone(),
                    options: vote.options.clone(),
                    deadline_ms,
                };
                let op_id = self.mutate(Op::StartVote { vote });
                self.leader_mut().deadlines.push(Reverse((deadline_ms, vote_id)));
                self.deliver(&group, event);
                Ok((Response::StartVote { vote_id, deadline_ms }, Some(op_id)))
            }
            Request::CastBallot { vote_id, option } => {
                let vote =
                    self.state.vote(vote_id).ok_or(ServiceError::NoSuchVote(vote_id))?.clone();
                if !vote.is_open() {
                    return Err(ServiceError::VoteClosed(vote_id));
                }
                let group = self
                    .state
                    .group(&vote.group)
                    .ok_or_else(|| ServiceError::NoSuchGroup(vote.group.clone()))?;
                if !group.members.contains(&client.id) {
                    return Err(ServiceError::NotMember(vote.group.clone()));
                }
                if option >= vote.options.len() {
                    return Err(ServiceError::BadOptions(format!(
                        "option index {option} out of bounds"
                    )));
                }
                // The first ballot per client counts; anything after is a
                // duplicate acknowledged as success.
                if vote.ballots.contains_key(&client.id) {
                    return Ok((Response::CastBallot { duplicate: true }, None));
                }
                let members = group.members.len();
                let op_id = self.mutate(Op::CastBallot { vote_id, client: client.id, option });
                let ballots = self.state.vote(vote_id).map(|v| v.ballots.len()).unwrap_or(0);
                self.deliver(
                    &vote.group,
                    GroupEvent::BallotCounted { vote_id, ballots: ballots as u64 },
                );
                // Everyone has voted: no point waiting out the deadline.
                if ballots >= members {
                    self.close_vote(vote_id);
                }
                Ok((Response::CastBallot { duplicate: false }, Some(op_id)))
            }
        }
    }

    /// Applies a mutation locally and replicates it to all members,
    /// returning its op ID.
    fn mutate(&mut self, op: Op) -> u64 {
        if let Err(err) = self.state.apply(&op) {
            // process() validated the op against this same state.
            error!("Failed to apply validated op: {err}");
        }
        let followers: Vec<NodeId> = self.members.peers().cloned().collect();
        let leader = self.leader_mut();
        let (op_id, envelopes) = leader.repl.submit(&followers, op);
        for envelope in envelopes {
            if let Err(err) = self.tx.send(envelope) {
                error!("Failed to queue replication op: {err}");
            }
        }
        op_id
    }

    /// Multicasts an event to a group's delivery stream.
    fn deliver(&mut self, group: &str, event: GroupEvent) {
        let epoch = self.epoch;
        let Role::Leader(leader) = &mut self.role else { return };
        let Some(stream) = leader.streams.get_mut(group) else { return };
        let transmissions = stream.multicast(event);
        for (addr, seq, event) in transmissions {
            let message = Message::Deliver { group: group.to_string(), event };
            if let Err(err) = self.send(&addr, epoch, seq, message) {
                error!("Failed to queue delivery: {err}");
            }
        }
    }

    /// Closes any open votes whose deadline has passed.
    fn close_due_votes(&mut self) -> Result<()> {
        loop {
            let Role::Leader(leader) = &mut self.role else { return Ok(()) };
            match leader.deadlines.peek() {
                Some(Reverse((deadline, _))) if *deadline <= self.now_ms => {}
                _ => return Ok(()),
            }
            let Some(Reverse((_, vote_id))) = leader.deadlines.pop() else { return Ok(()) };
            // The vote may have closed early when everyone voted.
            if self.state.vote(vote_id).is_some_and(|vote| vote.is_open()) {
                self.close_vote(vote_id);
            }
        }
    }

    /// Closes a vote: computes the final tally, replicates the close, and
    /// announces the result to the group.
    fn close_vote(&mut self, vote_id: VoteId) {
        let Some(vote) = self.state.vote(vote_id) else { return };
        let tally = vote.tally();
        let winner = vote.winner_name(&tally);
        let group = vote.group.clone();
        let counts = tally.counts.clone();
        self.mutate(Op::CloseVote { vote_id, tally });
        self.deliver(&group, GroupEvent::VoteResult { vote_id, counts, winner });
    }

    /// Releases a client reply whose op became durable.
    fn release_reply(&mut self, op_id: u64) -> Result<()> {
        let Role::Leader(leader) = &mut self.role else { return Ok(()) };
        let Some(reply) = leader.waiting.remove(&op_id) else { return Ok(()) };
        leader.replies.insert(reply.id, Ok(reply.response.clone()));
        self.respond(&reply.to, reply.id, Ok(reply.response))
    }

    /// Accesses the leader role state. Must only be called on paths that
    /// hold leadership.
    fn leader_mut(&mut self) -> &mut Leader {
        match &mut self.role {
            Role::Leader(leader) => leader,
            _ => unreachable!("not leader"),
        }
    }

    fn respond(
        &self,
        to: &NodeId,
        id: RequestId,
        response: std::result::Result<Response, ServiceError>,
    ) -> Result<()> {
        self.send(to, 0, 0, Message::ClientResponse { id, response })
    }

    fn send(&self, to: &NodeId, term: u64, seq: u64, message: Message) -> Result<()> {
        self.tx.send(Envelope {
            from: self.id.clone(),
            to: Address::Node(to.clone()),
            term,
            seq,
            message,
        })?;
        Ok(())
    }

    fn multicast(&self, term: u64, seq: u64, message: Message) -> Result<()> {
        self.tx.send(Envelope {
            from: self.id.clone(),
            to: Address::Multicast,
            term,
            seq,
            message,
        })?;
        Ok(())
    }
}

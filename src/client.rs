//! The toyvote client library.
//!
//! A client discovers the leader over the multicast group, registers to
//! obtain its token, and then issues requests directly to the leader's
//! unicast socket. Requests carry a stable request ID and are retried until
//! answered, so datagram loss and leader failover are survived: a redirect
//! or NEW_LEADER broadcast retargets the client, which resumes with the same
//! token.
//!
//! Group events (vote opened, ballot counted, vote result) arrive as FIFO
//! deliveries on the client's unicast socket; they are reassembled in order
//! through fifo::Receiver and handed to the application via poll_event().

use crate::cluster;
use crate::config::Config;
use crate::encoding::bincode;
use crate::errdata;
use crate::error::{Error, Result};
use crate::fifo;
use crate::message::{
    Address, ClientId, Envelope, GroupEvent, Message, NodeId, Request, RequestId, Response,
    ServiceError, Token, VoteId,
};

use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

/// How long a single logical request is retried before giving up.
const CALL_TIMEOUT: Duration = Duration::from_secs(15);
/// How long to wait for a response before resending a request.
const RETRY_INTERVAL: Duration = Duration::from_millis(1000);
/// The socket poll granularity.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A toyvote client.
pub struct Client {
    /// The unicast socket, which is also the client's delivery address.
    socket: UdpSocket,
    addr: NodeId,
    /// Listens on the multicast group for NEW_LEADER broadcasts.
    multicast: UdpSocket,
    /// Sends WHO_IS_LEADER queries to the multicast group.
    multicast_out: UdpSocket,
    group_addr: SocketAddrV4,
    buffer: usize,
    leader: Option<NodeId>,
    client_id: Option<ClientId>,
    token: Option<Token>,
    /// FIFO reassembly state per (group, sender). Delivery streams are per
    /// sender, so a new leader's stream gets its own fresh cursor and stale
    /// streams die with their sender.
    receivers: HashMap<(String, NodeId), fifo::Receiver>,
    /// In-order events ready for the application.
    events: VecDeque<(String, GroupEvent)>,
}

impl Client {
    /// Creates a client with an ephemeral unicast port, subscribed to the
    /// multicast group for leader broadcasts.
    pub fn new(config: &Config) -> Result<Self> {
        let host = match config.host.as_str() {
            "" => cluster::local_ip().to_string(),
            host => host.to_string(),
        };
        let interface = cluster::multicast_interface(&host);
        let socket = UdpSocket::bind((host.as_str(), 0))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let addr = NodeId::new(host, socket.local_addr()?.port());

        let group_addr: SocketAddrV4 = config
            .multicast_group
            .parse()
            .map_err(|e| Error::InvalidInput(format!("invalid multicast group: {e}")))?;
        let multicast = cluster::multicast_listener(group_addr, interface)?;
        multicast.set_nonblocking(true)?;
        let multicast_out = cluster::multicast_sender(interface, config.multicast_ttl)?;

        info!("Client listening on {addr}");
        Ok(Self {
            socket,
            addr,
            multicast,
            multicast_out,
            group_addr,
            buffer: config.buffer_size,
            leader: None,
            client_id: None,
            token: None,
            receivers: HashMap::new(),
            events: VecDeque::new(),
        })
    }

    /// The client's delivery address.
    pub fn addr(&self) -> &NodeId {
        &self.addr
    }

    /// The client ID, once registered.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// The authentication token, once registered.
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// The leader the client currently targets.
    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    /// Discovers the leader by querying the multicast group, retrying until
    /// one answers or the timeout expires.
    pub fn discover_leader(&mut self, timeout: Duration) -> Result<NodeId> {
        let deadline = Instant::now() + timeout;
        let mut last_query: Option<Instant> = None;
        while Instant::now() < deadline {
            if last_query.map_or(true, |last| last.elapsed() >= RETRY_INTERVAL) {
                debug!("Querying multicast group for the leader");
                let query = self.envelope(Address::Multicast, 0, 0, Message::WhoIsLeader);
                self.multicast_out.send_to(&bincode::serialize(&query)?, self.group_addr)?;
                last_query = Some(Instant::now());
            }
            self.pump()?;
            if let Some(leader) = self.leader.clone() {
                info!("Leader is {leader}");
                return Ok(leader);
            }
        }
        Err(Error::IO("timed out discovering a leader".to_string()))
    }

    /// Registers the client, obtaining its ID and token.
    pub fn register(&mut self) -> Result<ClientId> {
        match self.call(Request::Register)? {
            Response::Register { client_id, token, leader } => {
                self.client_id = Some(client_id);
                self.token = Some(token);
                self.retarget(leader);
                info!("Registered as {client_id}");
                Ok(client_id)
            }
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Creates a group, with this client as its first member. The group's
    /// delivery stream starts fresh, so the cursor starts at 1.
    pub fn create_group(&mut self, name: &str) -> Result<()> {
        match self.call(Request::CreateGroup { name: name.to_string() })? {
            Response::CreateGroup => {
                if let Some(leader) = self.leader.clone() {
                    self.receivers.insert((name.to_string(), leader), fifo::Receiver::at(1));
                }
                Ok(())
            }
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Joins a group, seeding the delivery cursor from the join reply.
    pub fn join_group(&mut self, name: &str) -> Result<()> {
        match self.call(Request::JoinGroup { name: name.to_string() })? {
            Response::JoinGroup { next_seq } => {
                if let Some(leader) = self.leader.clone() {
                    self.receivers
                        .insert((name.to_string(), leader), fifo::Receiver::at(next_seq));
                }
                Ok(())
            }
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Leaves a group.
    pub fn leave_group(&mut self, name: &str) -> Result<()> {
        match self.call(Request::LeaveGroup { name: name.to_string() })? {
            Response::LeaveGroup => {
                self.receivers.retain(|(group, _), _| group != name);
                Ok(())
            }
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Lists all group names.
    pub fn list_groups(&mut self) -> Result<Vec<String>> {
        match self.call(Request::ListGroups)? {
            Response::ListGroups { groups } => Ok(groups),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Lists the groups this client belongs to.
    pub fn joined_groups(&mut self) -> Result<Vec<String>> {
        match self.call(Request::JoinedGroups)? {
            Response::JoinedGroups { groups } => Ok(groups),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Starts a vote in a group, returning the vote ID and deadline.
    pub fn start_vote(
        &mut self,
        group: &str,
        topic: &str,
        options: Vec<String>,
        timeout_secs: u64,
    ) -> Result<(VoteId, u64)> {
        let request = Request::StartVote {
            group: group.to_string(),
            topic: topic.to_string(),
            options,
            timeout_secs,
        };
        match self.call(request)? {
            Response::StartVote { vote_id, deadline_ms } => Ok((vote_id, deadline_ms)),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Casts a ballot. Returns true if the ballot had already been counted.
    pub fn cast_ballot(&mut self, vote_id: VoteId, option: usize) -> Result<bool> {
        match self.call(Request::CastBallot { vote_id, option })? {
            Response::CastBallot { duplicate } => Ok(duplicate),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Returns the next in-order group event, waiting up to the timeout.
    pub fn poll_event(&mut self, timeout: Duration) -> Result<Option<(String, GroupEvent)>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.pump()?;
        }
    }

    /// Issues a request to the leader, retrying with the same request ID
    /// until a response arrives. Handles redirects, leader changes, and
    /// leader loss along the way.
    fn call(&mut self, request: Request) -> Result<Response> {
        let id: RequestId = uuid::Uuid::new_v4();
        let deadline = Instant::now() + CALL_TIMEOUT;
        let mut last_send: Option<Instant> = None;
        loop {
            if Instant::now() >= deadline {
                return Err(Error::IO("request timed out".to_string()));
            }
            let Some(leader) = self.leader.clone() else {
                self.discover_leader(deadline.saturating_duration_since(Instant::now()))?;
                continue;
            };
            if last_send.map_or(true, |last| last.elapsed() >= RETRY_INTERVAL) {
                let message =
                    Message::ClientRequest { id, token: self.token, request: request.clone() };
                let envelope = self.envelope(Address::Node(leader.clone()), 0, 0, message);
                self.socket.send_to(&bincode::serialize(&envelope)?, leader.socket_addr()?)?;
                last_send = Some(Instant::now());
            }
            match self.pump_response(id)? {
                Some(Ok(response)) => return Ok(response),
                Some(Err(ServiceError::Redirect(leader))) => {
                    info!("Redirected to leader {leader}");
                    self.retarget(leader);
                    last_send = None;
                }
                Some(Err(ServiceError::NoLeader)) => {
                    // The target is between leaders (e.g. recovering state);
                    // keep retrying at the normal cadence.
                    debug!("No leader available yet, retrying");
                    std::thread::sleep(POLL_INTERVAL);
                }
                Some(Err(err)) => return Err(err.into()),
                None => {}
            }
        }
    }

    /// Switches to a new leader. Delivery streams are per sender, so the new
    /// leader's streams get fresh cursors on first delivery; nothing to
    /// reset here.
    fn retarget(&mut self, leader: NodeId) {
        if self.leader.as_ref() != Some(&leader) {
            if self.leader.is_some() {
                warn!("Leader changed to {leader}");
            }
            self.leader = Some(leader);
        }
    }

    /// Pumps both sockets once, handling deliveries and leader updates, and
    /// returns the response to the given request if one arrived.
    fn pump_response(
        &mut self,
        id: RequestId,
    ) -> Result<Option<std::result::Result<Response, ServiceError>>> {
        for envelope in self.receive()? {
            if let Some(response) = self.handle(envelope, Some(id))? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Pumps both sockets once, handling deliveries and leader updates.
    fn pump(&mut self) -> Result<()> {
        for envelope in self.receive()? {
            self.handle(envelope, None)?;
        }
        Ok(())
    }

    /// Receives pending datagrams: a blocking read with a short timeout on
    /// the unicast socket, then a non-blocking drain of the multicast
    /// socket.
    fn receive(&mut self) -> Result<Vec<Envelope>> {
        let mut envelopes = Vec::new();
        let mut buf = vec![0u8; self.buffer];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _)) => match bincode::deserialize::<Envelope>(&buf[..len]) {
                Ok(envelope) => envelopes.push(envelope),
                Err(err) => debug!("Dropping malformed datagram: {err}"),
            },
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err.into()),
        }
        loop {
            match self.multicast.recv_from(&mut buf) {
                Ok((len, _)) => match bincode::deserialize::<Envelope>(&buf[..len]) {
                    Ok(envelope) => envelopes.push(envelope),
                    Err(err) => debug!("Dropping malformed datagram: {err}"),
                },
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(envelopes)
    }

    /// Handles one inbound envelope. Returns the response if it answers the
    /// request we're waiting for.
    fn handle(
        &mut self,
        envelope: Envelope,
        waiting_for: Option<RequestId>,
    ) -> Result<Option<std::result::Result<Response, ServiceError>>> {
        let from = envelope.from.clone();
        let seq = envelope.seq;
        match envelope.message {
            Message::ClientResponse { id, response } => {
                if waiting_for == Some(id) {
                    return Ok(Some(response));
                }
                debug!("Dropping response to stale request {id}");
            }
            Message::Deliver { group, event } => {
                // Always ack, even duplicates: the ack for the original may
                // have been lost.
                let ack = self.envelope(Address::Node(from.clone()), 0, seq, Message::DeliverAck {
                    group: group.clone(),
                });
                self.socket.send_to(&bincode::serialize(&ack)?, from.socket_addr()?)?;
                let receiver = self.receivers.entry((group.clone(), from)).or_default();
                for event in receiver.receive(seq, event) {
                    self.events.push_back((group.clone(), event));
                }
            }
            Message::LeaderIs(leader) => self.retarget(leader),
            Message::NewLeader(leader) => self.retarget(leader),
            message => debug!("Ignoring message {message:?}"),
        }
        Ok(None)
    }

    fn envelope(&self, to: Address, term: u64, seq: u64, message: Message) -> Envelope {
        Envelope { from: self.addr.clone(), to, term, seq, message }
    }
}

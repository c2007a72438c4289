//! The toyvote server: socket plumbing and thread topology around the node
//! state machine.
//!
//! Threads per server:
//!
//! - Unicast receiver: blocks on the per-node socket, decodes datagrams and
//!   fans them into the event loop.
//! - Multicast receiver: same, for the well-known multicast group
//!   (announcements, crash notices, client leader queries).
//! - Sender: drains the node's outbound channel and routes envelopes to
//!   unicast peers or the multicast group.
//! - Event loop (the calling thread): drives the node with inbound messages
//!   and periodic ticks.
//!
//! All inter-thread communication is message passing over channels; the node
//! state machine runs single-threaded in the event loop.

use crate::cluster;
use crate::config::Config;
use crate::encoding::bincode;
use crate::error::{Error, Result};
use crate::message::{Address, Envelope, NodeId};
use crate::node::Node;

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The event-loop tick interval, the time unit for all periodic work.
pub const TICK: Duration = Duration::from_millis(100);

/// A toyvote server process. Binds its sockets at construction (failures are
/// fatal) and serves until the stop flag is raised.
pub struct Server {
    id: NodeId,
    config: Config,
    group: SocketAddrV4,
    unicast: UdpSocket,
    multicast: UdpSocket,
    multicast_out: UdpSocket,
}

impl Server {
    /// Creates a server listening on the given port, binding the unicast
    /// socket and joining the multicast group.
    pub fn new(port: u16, config: Config) -> Result<Self> {
        let host = match config.host.as_str() {
            "" => cluster::local_ip().to_string(),
            host => host.to_string(),
        };
        let interface = cluster::multicast_interface(&host);
        let id = NodeId::new(host, port);
        let addr = id.socket_addr()?;
        let unicast = UdpSocket::bind(addr)
            .map_err(|e| Error::Fatal(format!("failed to bind {addr}: {e}")))?;
        unicast.set_read_timeout(Some(TICK))?;

        let group: SocketAddrV4 = config
            .multicast_group
            .parse()
            .map_err(|e| Error::Fatal(format!("invalid multicast group: {e}")))?;
        let multicast = cluster::multicast_listener(group, interface)?;
        multicast.set_read_timeout(Some(TICK))?;
        let multicast_out = cluster::multicast_sender(interface, config.multicast_ttl)?;

        Ok(Self { id, config, group, unicast, multicast, multicast_out })
    }

    /// The server's node identity.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Serves until the stop flag is raised. Consumes the server; the
    /// sockets close when it returns.
    pub fn serve(self, stop: Arc<AtomicBool>) -> Result<()> {
        info!("Serving as {} (multicast group {})", self.id, self.group);
        let (out_tx, out_rx) = crossbeam::channel::unbounded::<Envelope>();
        let (in_tx, in_rx) = crossbeam::channel::unbounded::<Envelope>();
        let node = Node::new(self.id.clone(), self.config.timing(TICK), out_tx)?;

        let mut threads = Vec::new();
        let unicast_in = self.unicast.try_clone()?;
        let buffer = self.config.buffer_size;
        threads.push(std::thread::spawn({
            let (in_tx, stop) = (in_tx.clone(), stop.clone());
            move || Self::receive(unicast_in, in_tx, buffer, stop)
        }));
        threads.push(std::thread::spawn({
            let (in_tx, stop) = (in_tx, stop.clone());
            let multicast = self.multicast;
            move || Self::receive(multicast, in_tx, buffer, stop)
        }));
        threads.push(std::thread::spawn({
            let (unicast, multicast_out, group, stop) =
                (self.unicast, self.multicast_out, self.group, stop.clone());
            move || Self::send(out_rx, unicast, multicast_out, group, stop)
        }));

        let result = Self::eventloop(node, in_rx, stop);
        for thread in threads {
            if thread.join().is_err() {
                error!("Server thread panicked");
            }
        }
        result
    }

    /// Drives the node: inbound messages as they arrive, ticks at the tick
    /// interval. Step and tick errors are logged, never fatal.
    fn eventloop(mut node: Node, in_rx: Receiver<Envelope>, stop: Arc<AtomicBool>) -> Result<()> {
        let ticker = crossbeam::channel::tick(TICK);
        while !stop.load(Ordering::Relaxed) {
            crossbeam::select! {
                recv(in_rx) -> envelope => match envelope {
                    Ok(envelope) => {
                        if let Err(err) = node.step(envelope) {
                            error!("Failed to process message: {err}");
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    if let Err(err) = node.tick(now_ms()) {
                        error!("Tick failed: {err}");
                    }
                }
            }
        }
        info!("Server {} shutting down", node.id());
        Ok(())
    }

    /// Receives datagrams from a socket and fans decoded envelopes into the
    /// event loop. Malformed datagrams are logged and dropped.
    fn receive(socket: UdpSocket, in_tx: Sender<Envelope>, buffer: usize, stop: Arc<AtomicBool>) {
        let mut buf = vec![0u8; buffer];
        while !stop.load(Ordering::Relaxed) {
            let (len, addr) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => {
                    warn!("Receive error: {err}");
                    continue;
                }
            };
            match bincode::deserialize::<Envelope>(&buf[..len]) {
                Ok(envelope) => {
                    if in_tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(err) => debug!("Dropping malformed datagram from {addr}: {err}"),
            }
        }
    }

    /// Routes outbound envelopes to their destination: unicast to a node's
    /// socket address, or the multicast group. Send failures are transient
    /// (the protocol retransmits anything that matters) and only logged. On
    /// shutdown, anything still queued (e.g. in-flight replication ops) is
    /// flushed before the socket closes.
    fn send(
        out_rx: Receiver<Envelope>,
        unicast: UdpSocket,
        multicast_out: UdpSocket,
        group: SocketAddrV4,
        stop: Arc<AtomicBool>,
    ) {
        let route = |envelope: Envelope| {
            let bytes = match bincode::serialize(&envelope) {
                Ok(bytes) => bytes,
                Err(err) => return error!("Failed to encode envelope: {err}"),
            };
            let result = match &envelope.to {
                Address::Node(node) => match node.socket_addr() {
                    Ok(addr) => unicast.send_to(&bytes, addr).map(|_| ()),
                    Err(err) => return warn!("Unresolvable address {node}: {err}"),
                },
                Address::Multicast => multicast_out.send_to(&bytes, group).map(|_| ()),
            };
            if let Err(err) = result {
                debug!("Send to {:?} failed: {err}", envelope.to);
            }
        };

        while !stop.load(Ordering::Relaxed) {
            match out_rx.recv_timeout(TICK) {
                Ok(envelope) => route(envelope),
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        for envelope in out_rx.try_iter() {
            route(envelope);
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

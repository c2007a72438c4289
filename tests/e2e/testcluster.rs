use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use toyvote::config::Config;
use toyvote::message::NodeId;
use toyvote::{Client, Server};

/// Allocates disjoint port blocks so concurrently running test clusters
/// don't collide on unicast ports or overhear each other's multicast group.
static NEXT_BLOCK: AtomicU16 = AtomicU16::new(0);

/// Runs a toyvote cluster as in-process server threads on localhost. There
/// is no persistent state, so in-process threads with a stop flag give the
/// same coverage as child processes while shutting down cleanly; killing a
/// node just raises its flag, which closes its sockets and silences it.
pub struct TestCluster {
    config: Config,
    base_port: u16,
    nodes: HashMap<u16, TestNode>,
}

struct TestNode {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl TestCluster {
    /// Creates and starts a cluster with the given number of nodes, numbered
    /// from 1. Node numbering follows election priority: the highest number
    /// is the expected leader.
    pub fn run(nodes: u16) -> Self {
        let block = NEXT_BLOCK.fetch_add(1, Ordering::SeqCst);
        let base_port = 21000 + block * 20;
        let mut config = Config::load(None).expect("failed to load config");
        config.host = "127.0.0.1".to_string();
        config.multicast_group = format!("224.1.1.1:{}", 25000 + block);
        // Tighter timings than production so tests converge quickly.
        config.discovery_interval_ms = 200;
        config.discovery_timeout_ms = 3000;
        config.hb_interval_ms = 200;
        config.hb_timeout_ms = 1000;
        config.election_timeout_ms = 2000;
        config.repl_timeout_ms = 300;
        config.fo_retransmit_ms = 200;

        let mut cluster = Self { config, base_port, nodes: HashMap::new() };
        for node in 1..=nodes {
            cluster.start(node);
        }
        cluster
    }

    /// Starts the given node.
    pub fn start(&mut self, node: u16) {
        let server =
            Server::new(self.base_port + node, self.config.clone()).expect("failed to bind server");
        let stop = Arc::new(AtomicBool::new(false));
        let thread = std::thread::spawn({
            let stop = stop.clone();
            move || server.serve(stop).expect("server failed")
        });
        self.nodes.insert(node, TestNode { stop, thread });
    }

    /// Kills the given node, as a crash: it stops responding immediately and
    /// its sockets close. The rest of the cluster finds out via heartbeat
    /// timeouts.
    pub fn kill(&mut self, node: u16) {
        let node = self.nodes.remove(&node).expect("no such node");
        node.stop.store(true, Ordering::Relaxed);
        node.thread.join().expect("server panicked");
    }

    /// The node ID of the given node.
    pub fn id(&self, node: u16) -> NodeId {
        NodeId::new("127.0.0.1", self.base_port + node)
    }

    /// Creates a client for this cluster.
    pub fn client(&self) -> Client {
        Client::new(&self.config).expect("failed to create client")
    }

    /// Creates a registered client, discovering the leader first.
    pub fn registered_client(&self) -> Client {
        let mut client = self.client();
        client.discover_leader(Duration::from_secs(10)).expect("no leader discovered");
        client.register().expect("registration failed");
        client
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for (_, node) in self.nodes.drain() {
            node.stop.store(true, Ordering::Relaxed);
            let _ = node.thread.join();
        }
    }
}

use crate::error::Result;

use serde_derive::Deserialize;
use std::time::Duration;

/// A logical clock interval as a number of event-loop ticks.
pub type Ticks = u64;

/// Server configuration. Loaded from defaults, an optional YAML file, and
/// TOYVOTE_-prefixed environment variables, in increasing precedence.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The host to bind the unicast socket to, and to advertise as part of
    /// the node identity. Empty means auto-detect the local address.
    pub host: String,
    /// The well-known multicast group for announcements and leader
    /// broadcasts.
    pub multicast_group: String,
    /// Multicast TTL. 1 is sufficient for a LAN.
    pub multicast_ttl: u32,
    /// Datagram receive buffer size in bytes.
    pub buffer_size: usize,
    /// Log level filter.
    pub log_level: String,
    /// Interval between multicast announcements.
    pub discovery_interval_ms: u64,
    /// Members not seen for this long are dropped.
    pub discovery_timeout_ms: u64,
    /// Interval between heartbeat probes to the left neighbour.
    pub hb_interval_ms: u64,
    /// Probes unacknowledged for this long declare the neighbour dead.
    pub hb_timeout_ms: u64,
    /// Election rounds that have not converged by this deadline restart.
    pub election_timeout_ms: u64,
    /// Replication ops unacked for this long are retransmitted.
    pub repl_timeout_ms: u64,
    /// Unacked group deliveries are retransmitted at this interval.
    pub fo_retransmit_ms: u64,
}

impl Config {
    /// Loads the configuration, optionally merging the given file.
    pub fn load(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("host", "")?
            .set_default("multicast_group", "224.1.1.1:5007")?
            .set_default("multicast_ttl", 1)?
            .set_default("buffer_size", 4096)?
            .set_default("log_level", "info")?
            .set_default("discovery_interval_ms", 1000)?
            .set_default("discovery_timeout_ms", 5000)?
            .set_default("hb_interval_ms", 1000)?
            .set_default("hb_timeout_ms", 5000)?
            .set_default("election_timeout_ms", 10000)?
            .set_default("repl_timeout_ms", 1000)?
            .set_default("fo_retransmit_ms", 500)?;
        if let Some(file) = file {
            builder = builder.add_source(config::File::with_name(file));
        }
        Ok(builder
            .add_source(config::Environment::with_prefix("TOYVOTE"))
            .build()?
            .try_deserialize()?)
    }

    /// Converts the timing configuration into tick counts for the given tick
    /// duration, rounding up so short intervals never collapse to 0 ticks.
    pub fn timing(&self, tick: Duration) -> Timing {
        let ticks = |ms: u64| -> Ticks {
            let tick_ms = tick.as_millis().max(1) as u64;
            ms.div_ceil(tick_ms).max(1)
        };
        Timing {
            discovery_interval: ticks(self.discovery_interval_ms),
            discovery_timeout: ticks(self.discovery_timeout_ms),
            hb_interval: ticks(self.hb_interval_ms),
            hb_timeout: ticks(self.hb_timeout_ms),
            election_timeout: ticks(self.election_timeout_ms),
            repl_timeout: ticks(self.repl_timeout_ms),
            fo_retransmit: ticks(self.fo_retransmit_ms),
        }
    }
}

/// The timing configuration expressed in event-loop ticks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timing {
    pub discovery_interval: Ticks,
    pub discovery_timeout: Ticks,
    pub hb_interval: Ticks,
    pub hb_timeout: Ticks,
    pub election_timeout: Ticks,
    pub repl_timeout: Ticks,
    pub fo_retransmit: Ticks,
}

impl Timing {
    /// A timing configuration for tests, with every interval at a small fixed
    /// tick count. The discovery timeout exceeds the heartbeat timeout so
    /// neighbour death is detected by the heartbeat, as in production where
    /// the heartbeat is the fast path.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            discovery_interval: 2,
            discovery_timeout: 30,
            hb_interval: 2,
            hb_timeout: 10,
            election_timeout: 20,
            repl_timeout: 3,
            fo_retransmit: 2,
        }
    }
}

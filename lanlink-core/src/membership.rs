//! Membership: peer table keyed by logical name, refreshed by heartbeats, swept on timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How often a node broadcasts its own heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5_000);
/// A peer silent for longer than this is evicted.
pub const DEVICE_TIMEOUT: Duration = Duration::from_millis(10_000);
/// How often the eviction sweep runs.
pub const CLEANUP_INTERVAL: Duration = Duration::from_millis(2_000);

/// A peer heard from on the segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub name: String,
    pub addr: SocketAddr,
    pub last_heartbeat: Instant,
}

impl PeerRecord {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

/// Result of applying a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Discovered,
    Refreshed,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an unseen name, or refresh the timestamp of a known one.
    /// The address recorded at discovery is kept until the peer is evicted.
    pub fn on_heartbeat(&mut self, name: &str, addr: SocketAddr, now: Instant) -> HeartbeatOutcome {
        match self.peers.get_mut(name) {
            Some(peer) => {
                if now > peer.last_heartbeat {
                    peer.last_heartbeat = now;
                }
                HeartbeatOutcome::Refreshed
            }
            None => {
                self.peers.insert(
                    name.to_string(),
                    PeerRecord {
                        name: name.to_string(),
                        addr,
                        last_heartbeat: now,
                    },
                );
                HeartbeatOutcome::Discovered
            }
        }
    }

    /// Remove every peer whose age exceeds `timeout`. Returns the removed records.
    pub fn sweep_expired(&mut self, now: Instant, timeout: Duration) -> Vec<PeerRecord> {
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.age(now) > timeout)
            .map(|p| p.name.clone())
            .collect();
        expired
            .iter()
            .filter_map(|name| self.peers.remove(name))
            .collect()
    }

    pub fn resolve(&self, name: &str) -> Option<PeerRecord> {
        self.peers.get(name).cloned()
    }

    /// All peers, ordered by name for display.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self.peers.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

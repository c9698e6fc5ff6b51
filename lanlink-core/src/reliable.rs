//! Reliable delivery: frames awaiting ACK, blind frame-level retransmission on a fixed timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::protocol::owning_transfer;

/// Period of the retransmit sweep.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(2_000);
/// Age after which an unacknowledged frame is resent (1.5 sweep periods).
pub const DEFAULT_RESEND_AFTER: Duration = Duration::from_millis(3_000);
/// Resends attempted before a frame is given up.
pub const DEFAULT_MAX_RETRANSMITS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitPolicy {
    pub resend_after: Duration,
    /// `None` retries forever.
    pub max_retransmits: Option<u32>,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            resend_after: DEFAULT_RESEND_AFTER,
            max_retransmits: Some(DEFAULT_MAX_RETRANSMITS),
        }
    }
}

/// An outbound frame awaiting acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub id: String,
    pub frame: Vec<u8>,
    pub destination: SocketAddr,
    pub last_sent: Instant,
    pub retransmits: u32,
}

/// One datagram the sweep wants resent, byte-identical to the original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resend {
    pub id: String,
    pub destination: SocketAddr,
    pub frame: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub resend: Vec<Resend>,
    /// Entries dropped because their transfer is finalized.
    pub finalized: Vec<String>,
    /// Entries dropped after exhausting the retransmit budget.
    pub gave_up: Vec<PendingSend>,
}

#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingSend>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `frame` under `id`, replacing any earlier entry with the same id.
    pub fn register(
        &mut self,
        id: &str,
        frame: Vec<u8>,
        destination: SocketAddr,
        now: Instant,
    ) -> Option<PendingSend> {
        self.entries.insert(
            id.to_string(),
            PendingSend {
                id: id.to_string(),
                frame,
                destination,
                last_sent: now,
                retransmits: 0,
            },
        )
    }

    /// Remove exactly the entry for `id`.
    pub fn on_ack(&mut self, id: &str) -> Option<PendingSend> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&PendingSend> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Ids still awaiting acknowledgment, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries whose transfer is finalized, give up on exhausted entries,
    /// and collect everything older than `policy.resend_after` for resending.
    pub fn retransmit_sweep<F>(
        &mut self,
        now: Instant,
        policy: &RetransmitPolicy,
        is_finalized: F,
    ) -> SweepOutcome
    where
        F: Fn(&str) -> bool,
    {
        let mut out = SweepOutcome::default();
        let finalized: Vec<String> = self
            .entries
            .keys()
            .filter(|id| is_finalized(id.as_str()) || is_finalized(owning_transfer(id.as_str())))
            .cloned()
            .collect();
        for id in finalized {
            self.entries.remove(&id);
            out.finalized.push(id);
        }

        let mut exhausted = Vec::new();
        for entry in self.entries.values_mut() {
            if now.saturating_duration_since(entry.last_sent) <= policy.resend_after {
                continue;
            }
            if policy
                .max_retransmits
                .is_some_and(|max| entry.retransmits >= max)
            {
                exhausted.push(entry.id.clone());
                continue;
            }
            entry.retransmits += 1;
            entry.last_sent = now;
            out.resend.push(Resend {
                id: entry.id.clone(),
                destination: entry.destination,
                frame: entry.frame.clone(),
            });
        }
        for id in exhausted {
            if let Some(entry) = self.entries.remove(&id) {
                out.gave_up.push(entry);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::chunk_correlation_id;

    fn dest() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 9876))
    }

    fn none_finalized(_: &str) -> bool {
        false
    }

    #[test]
    fn ack_removes_only_matching_entry() {
        let mut t = PendingTable::new();
        let now = Instant::now();
        t.register("msg1", b"TALK msg1 a".to_vec(), dest(), now);
        t.register("msg2", b"TALK msg2 b".to_vec(), dest(), now);
        assert!(t.on_ack("msg1").is_some());
        assert!(t.on_ack("msg1").is_none());
        assert_eq!(t.ids(), vec!["msg2".to_string()]);
    }

    #[test]
    fn reregister_replaces_entry() {
        let mut t = PendingTable::new();
        let now = Instant::now();
        t.register("msg1", b"FILE msg1 a 1".to_vec(), dest(), now);
        let old = t.register("msg1", b"END msg1 x".to_vec(), dest(), now);
        assert_eq!(old.unwrap().frame, b"FILE msg1 a 1".to_vec());
        assert_eq!(t.len(), 1);
        assert_eq!(t.get("msg1").unwrap().frame, b"END msg1 x".to_vec());
    }

    #[test]
    fn stale_entry_resent_byte_identical_and_age_reset() {
        let mut t = PendingTable::new();
        let policy = RetransmitPolicy::default();
        let t0 = Instant::now();
        t.register("msg1", b"TALK msg1 hello".to_vec(), dest(), t0);

        let early = t.retransmit_sweep(t0 + Duration::from_millis(2_000), &policy, none_finalized);
        assert!(early.resend.is_empty());

        let t1 = t0 + Duration::from_millis(3_001);
        let out = t.retransmit_sweep(t1, &policy, none_finalized);
        assert_eq!(out.resend.len(), 1);
        assert_eq!(out.resend[0].frame, b"TALK msg1 hello".to_vec());
        assert_eq!(out.resend[0].destination, dest());
        assert_eq!(t.get("msg1").unwrap().last_sent, t1);

        // Age was reset: a sweep shortly after does nothing.
        let again = t.retransmit_sweep(t1 + Duration::from_millis(1_000), &policy, none_finalized);
        assert!(again.resend.is_empty());
    }

    #[test]
    fn finalized_transfer_entries_dropped_without_resend() {
        let mut t = PendingTable::new();
        let t0 = Instant::now();
        t.register("msg5", b"FILE".to_vec(), dest(), t0);
        t.register(&chunk_correlation_id("msg5", 1), b"CHUNK 1".to_vec(), dest(), t0);
        t.register(&chunk_correlation_id("msg5", 2), b"CHUNK 2".to_vec(), dest(), t0);
        t.register("msg6", b"TALK msg6 x".to_vec(), dest(), t0);

        let out = t.retransmit_sweep(
            t0 + Duration::from_secs(10),
            &RetransmitPolicy::default(),
            |id| id == "msg5",
        );
        assert_eq!(out.finalized.len(), 3);
        assert_eq!(out.resend.len(), 1);
        assert_eq!(out.resend[0].id, "msg6");
        assert_eq!(t.ids(), vec!["msg6".to_string()]);
    }

    #[test]
    fn gives_up_after_budget() {
        let mut t = PendingTable::new();
        let policy = RetransmitPolicy {
            resend_after: Duration::from_millis(100),
            max_retransmits: Some(2),
        };
        let mut now = Instant::now();
        t.register("msg1", b"x".to_vec(), dest(), now);
        for _ in 0..2 {
            now += Duration::from_millis(200);
            assert_eq!(t.retransmit_sweep(now, &policy, none_finalized).resend.len(), 1);
        }
        now += Duration::from_millis(200);
        let out = t.retransmit_sweep(now, &policy, none_finalized);
        assert!(out.resend.is_empty());
        assert_eq!(out.gave_up.len(), 1);
        assert_eq!(out.gave_up[0].retransmits, 2);
        assert!(t.is_empty());
    }

    #[test]
    fn unbounded_policy_keeps_retrying() {
        let mut t = PendingTable::new();
        let policy = RetransmitPolicy {
            resend_after: Duration::from_millis(10),
            max_retransmits: None,
        };
        let mut now = Instant::now();
        t.register("msg1", b"x".to_vec(), dest(), now);
        for _ in 0..100 {
            now += Duration::from_millis(20);
            assert_eq!(t.retransmit_sweep(now, &policy, none_finalized).resend.len(), 1);
        }
        assert_eq!(t.get("msg1").unwrap().retransmits, 100);
    }
}

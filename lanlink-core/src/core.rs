//! Host-driven API: NodeCore receives datagrams and timer ticks from the host, returns actions.
//!
//! Each shared table sits behind its own lock so the receive path, the three periodic
//! sweeps and console-initiated sends can run on different tasks. No method holds two
//! locks except the retransmit sweep (finalized set, then pending table); nothing takes
//! them in the opposite order.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::chunk::{plan_file_frames, TrackedFrame};
use crate::membership::{HeartbeatOutcome, PeerRecord, PeerTable, DEVICE_TIMEOUT};
use crate::protocol::{end_transfer_id, Frame, NackReason};
use crate::reliable::{PendingTable, RetransmitPolicy};
use crate::store::{DiskStore, TransferStore};
use crate::transfer::{InboundTransfers, TransferEvent, TransferKey, TransferPhase};
use crate::wire::{self, FrameDecodeError};

/// Tunables of the protocol core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    pub device_timeout: Duration,
    pub retransmit: RetransmitPolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_timeout: DEVICE_TIMEOUT,
            retransmit: RetransmitPolicy::default(),
        }
    }
}

/// Something the console should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    PeerDiscovered {
        name: String,
        addr: SocketAddr,
    },
    PeerExpired {
        name: String,
        addr: SocketAddr,
    },
    TalkReceived {
        id: String,
        from: SocketAddr,
        text: String,
    },
    Acknowledged {
        id: String,
    },
    NackReceived {
        id: String,
        from: SocketAddr,
        reason: NackReason,
    },
    /// Retransmit budget exhausted; the frame was dropped.
    DeliveryFailed {
        id: String,
        destination: SocketAddr,
    },
    Transfer(TransferEvent),
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send { to: SocketAddr, bytes: Vec<u8> },
    Event(NodeEvent),
}

/// Result of a console-initiated send: the message or transfer id and the datagrams to emit.
#[derive(Debug)]
pub struct Outbound {
    pub id: String,
    pub actions: Vec<Action>,
}

/// User-level failure of `send_text` / `send_file`. No traffic results.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("file not found or not readable: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// One node's protocol state.
pub struct NodeCore<S: TransferStore = DiskStore> {
    name: String,
    config: CoreConfig,
    next_id: AtomicU64,
    peers: Mutex<PeerTable>,
    pending: Mutex<PendingTable>,
    inbound: Mutex<InboundTransfers<S>>,
    /// Our own transfers whose END was acknowledged.
    outbound_finalized: Mutex<HashSet<String>>,
}

impl<S: TransferStore> NodeCore<S> {
    pub fn new(name: impl Into<String>, store: S, config: CoreConfig) -> Self {
        Self {
            name: name.into(),
            config,
            next_id: AtomicU64::new(0),
            peers: Mutex::new(PeerTable::new()),
            pending: Mutex::new(PendingTable::new()),
            inbound: Mutex::new(InboundTransfers::new(store)),
            outbound_finalized: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Fresh id, unique and increasing within this node: `msg1`, `msg2`, ...
    pub fn next_message_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("msg{n}")
    }

    /// Datagram to broadcast every heartbeat interval.
    pub fn heartbeat_frame(&self) -> Vec<u8> {
        wire::encode_frame(&Frame::Heartbeat {
            name: self.name.clone(),
        })
    }

    /// Process one inbound datagram.
    pub fn on_datagram(&self, bytes: &[u8], from: SocketAddr, now: Instant) -> Vec<Action> {
        match wire::decode_frame(bytes) {
            Ok(frame) => {
                tracing::debug!(command = frame.command(), %from, "frame received");
                self.on_frame(frame, from, now)
            }
            Err(FrameDecodeError::Unknown(command)) => {
                tracing::warn!(%command, %from, "unknown command ignored");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(%from, error = %e, "dropping undecodable frame");
                Vec::new()
            }
        }
    }

    fn on_frame(&self, frame: Frame, from: SocketAddr, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        match frame {
            Frame::Heartbeat { name } => {
                if name == self.name {
                    return actions;
                }
                let outcome = self.peers.lock().on_heartbeat(&name, from, now);
                if outcome == HeartbeatOutcome::Discovered {
                    tracing::info!(peer = %name, addr = %from, "new peer discovered");
                    actions.push(Action::Event(NodeEvent::PeerDiscovered { name, addr: from }));
                }
            }
            Frame::Talk { id, text } => {
                // Repeated delivery of the same id is surfaced again; there is no dedup.
                actions.push(reply(from, Frame::Ack { id: id.clone() }));
                tracing::info!(%id, %from, "message received");
                actions.push(Action::Event(NodeEvent::TalkReceived { id, from, text }));
            }
            Frame::File {
                id,
                file_name,
                size,
            } => {
                let outcome = self.inbound.lock().on_file(from, &id, &file_name, size);
                push_outcome(&mut actions, from, outcome.reply, outcome.event);
            }
            Frame::Chunk { id, seq, payload } => {
                let outcome = self.inbound.lock().on_chunk(from, &id, seq, &payload);
                push_outcome(&mut actions, from, outcome.reply, outcome.event);
            }
            Frame::End { id, digest } => {
                let outcome = self.inbound.lock().on_end(from, &id, &digest);
                push_outcome(&mut actions, from, outcome.reply, outcome.event);
            }
            Frame::Ack { id } => {
                let removed = self.pending.lock().on_ack(&id);
                if removed.is_none() {
                    tracing::debug!(%id, "ack for unknown or already acknowledged id");
                    return actions;
                }
                tracing::debug!(%id, "acknowledged");
                if let Some(transfer) = end_transfer_id(&id) {
                    tracing::info!(%transfer, "file transfer confirmed by receiver");
                    self.outbound_finalized.lock().insert(transfer.to_string());
                }
                actions.push(Action::Event(NodeEvent::Acknowledged { id }));
            }
            Frame::Nack { id, reason } => {
                // Informational only: the pending entry keeps its normal retransmit schedule.
                tracing::warn!(%id, %reason, %from, "nack received");
                actions.push(Action::Event(NodeEvent::NackReceived { id, from, reason }));
            }
        }
        actions
    }

    /// Register `frame` as pending under `correlation_id` and return the datagram to send.
    fn register(&self, correlation_id: &str, frame: &Frame, to: SocketAddr, now: Instant) -> Action {
        let bytes = wire::encode_frame(frame);
        self.pending
            .lock()
            .register(correlation_id, bytes.clone(), to, now);
        Action::Send { to, bytes }
    }

    fn resolve_peer(&self, peer: &str) -> Result<PeerRecord, SendError> {
        self.peers
            .lock()
            .resolve(peer)
            .ok_or_else(|| SendError::PeerNotFound(peer.to_string()))
    }

    /// Send a text message to a named peer.
    pub fn send_text(&self, peer: &str, text: &str, now: Instant) -> Result<Outbound, SendError> {
        let target = self.resolve_peer(peer)?;
        let id = self.next_message_id();
        let frame = Frame::Talk {
            id: id.clone(),
            text: text.to_string(),
        };
        let action = self.register(&id, &frame, target.addr, now);
        tracing::info!(%id, peer, "message sent");
        Ok(Outbound {
            id,
            actions: vec![action],
        })
    }

    /// Announce, chunk and close a file transfer to a named peer. Every frame is tracked
    /// independently until acknowledged or until the receiver confirms the END.
    pub fn send_file(&self, peer: &str, path: &Path, now: Instant) -> Result<Outbound, SendError> {
        let target = self.resolve_peer(peer)?;
        let not_found = || SendError::FileNotFound(path.to_path_buf());
        let metadata = std::fs::metadata(path).map_err(|_| not_found())?;
        if !metadata.is_file() {
            return Err(not_found());
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(not_found)?;
        let file = File::open(path).map_err(|e| {
            tracing::debug!(path = %path.display(), error = %e, "cannot open file for sending");
            not_found()
        })?;

        let id = self.next_message_id();
        let frames = plan_file_frames(&id, &file_name, BufReader::new(file))?;
        let actions: Vec<Action> = frames
            .iter()
            .map(|TrackedFrame { correlation_id, frame }| {
                self.register(correlation_id, frame, target.addr, now)
            })
            .collect();
        tracing::info!(
            %id,
            peer,
            file = %file_name,
            chunks = frames.len().saturating_sub(2),
            "file transfer started"
        );
        Ok(Outbound { id, actions })
    }

    /// Evict peers silent for longer than the device timeout.
    pub fn sweep_peers(&self, now: Instant) -> Vec<Action> {
        let expired = self
            .peers
            .lock()
            .sweep_expired(now, self.config.device_timeout);
        expired
            .into_iter()
            .map(|p| {
                tracing::info!(peer = %p.name, addr = %p.addr, "inactive peer removed");
                Action::Event(NodeEvent::PeerExpired {
                    name: p.name,
                    addr: p.addr,
                })
            })
            .collect()
    }

    /// Resend stale unacknowledged frames; drop those belonging to finalized transfers.
    pub fn retransmit_sweep(&self, now: Instant) -> Vec<Action> {
        let outcome = {
            let finalized = self.outbound_finalized.lock();
            self.pending
                .lock()
                .retransmit_sweep(now, &self.config.retransmit, |id| finalized.contains(id))
        };
        for id in &outcome.finalized {
            tracing::debug!(%id, "dropping pending frame of finalized transfer");
        }
        let mut actions = Vec::with_capacity(outcome.resend.len() + outcome.gave_up.len());
        for r in outcome.resend {
            tracing::debug!(id = %r.id, to = %r.destination, "retransmitting");
            actions.push(Action::Send {
                to: r.destination,
                bytes: r.frame,
            });
        }
        for p in outcome.gave_up {
            tracing::warn!(id = %p.id, to = %p.destination, retransmits = p.retransmits, "giving up on unacknowledged frame");
            actions.push(Action::Event(NodeEvent::DeliveryFailed {
                id: p.id,
                destination: p.destination,
            }));
        }
        actions
    }

    /// Known peers, ordered by name.
    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.peers.lock().snapshot()
    }

    pub fn resolve(&self, name: &str) -> Option<PeerRecord> {
        self.peers.lock().resolve(name)
    }

    /// Correlation ids still awaiting acknowledgment.
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().ids()
    }

    pub fn is_outbound_finalized(&self, transfer_id: &str) -> bool {
        self.outbound_finalized.lock().contains(transfer_id)
    }

    pub fn inbound_phase(&self, from: SocketAddr, transfer_id: &str) -> Option<TransferPhase> {
        self.inbound
            .lock()
            .phase(&TransferKey::new(from, transfer_id))
    }

    /// Run `f` against the reassembly store.
    pub fn with_store<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(self.inbound.lock().store())
    }
}

fn reply(to: SocketAddr, frame: Frame) -> Action {
    Action::Send {
        to,
        bytes: wire::encode_frame(&frame),
    }
}

fn push_outcome(
    actions: &mut Vec<Action>,
    from: SocketAddr,
    frame: Frame,
    event: Option<TransferEvent>,
) {
    actions.push(reply(from, frame));
    if let Some(event) = event {
        actions.push(Action::Event(NodeEvent::Transfer(event)));
    }
}

//! LAN discovery: periodic HEARTBEAT broadcast and eviction of silent peers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lanlink_core::{NodeCore, NodeEvent};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::node::dispatch;
use crate::transport::Transport;

/// Broadcast this node's heartbeat every `period`, starting immediately.
pub async fn heartbeat_loop(core: Arc<NodeCore>, transport: Arc<Transport>, period: Duration) {
    let frame = core.heartbeat_frame();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        tracing::trace!(to = %transport.broadcast_target(), "heartbeat");
        transport.broadcast(&frame).await;
    }
}

/// Remove peers whose last heartbeat is older than the device timeout.
pub async fn sweep_loop(
    core: Arc<NodeCore>,
    transport: Arc<Transport>,
    events: mpsc::UnboundedSender<NodeEvent>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let actions = core.sweep_peers(Instant::now());
        dispatch(&transport, &events, actions).await;
    }
}

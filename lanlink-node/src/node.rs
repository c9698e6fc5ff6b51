//! Node: owns the shared NodeCore, the UDP transport, and the background tasks that drive them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lanlink_core::{Action, DiskStore, NodeCore, NodeEvent, PeerRecord, SendError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::discovery;
use crate::transport::{Transport, RECV_BUF_LEN};

/// Perform the actions returned by the core: datagrams go out on the socket, events to the console.
pub async fn dispatch(
    transport: &Transport,
    events: &mpsc::UnboundedSender<NodeEvent>,
    actions: Vec<Action>,
) {
    for action in actions {
        match action {
            Action::Send { to, bytes } => transport.send_to(&bytes, to).await,
            Action::Event(e) => {
                let _ = events.send(e);
            }
        }
    }
}

pub struct Node {
    core: Arc<NodeCore>,
    transport: Arc<Transport>,
    events: mpsc::UnboundedSender<NodeEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind the configured port and start heartbeat, sweeps and the receive loop.
    pub fn start(
        name: &str,
        config: &Config,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<NodeEvent>)> {
        Self::bind_with(name, config, config.listen_addr(), config.broadcast_target())
    }

    /// Like `start` with an explicit bind address and heartbeat destination.
    pub fn bind_with(
        name: &str,
        config: &Config,
        listen: SocketAddr,
        announce: SocketAddr,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<NodeEvent>)> {
        let transport = Arc::new(Transport::bind(listen, announce)?);
        let store = DiskStore::new(&config.download_dir);
        let core = Arc::new(NodeCore::new(name, store, config.core_config()));
        let (events, events_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(recv_loop(core.clone(), transport.clone(), events.clone())),
            tokio::spawn(discovery::heartbeat_loop(
                core.clone(),
                transport.clone(),
                config.heartbeat_interval(),
            )),
            tokio::spawn(discovery::sweep_loop(
                core.clone(),
                transport.clone(),
                events.clone(),
                config.cleanup_interval(),
            )),
            tokio::spawn(retransmit_loop(
                core.clone(),
                transport.clone(),
                events.clone(),
                config.resend_interval(),
            )),
        ];
        tracing::info!(
            name,
            addr = %transport.local_addr()?,
            broadcast = %announce,
            download_dir = %config.download_dir.display(),
            "node started"
        );
        Ok((
            Self {
                core,
                transport,
                events,
                tasks,
            },
            events_rx,
        ))
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.core.list_peers()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.core.pending_ids()
    }

    /// Send a TALK to a named peer. Returns the message id.
    pub async fn send_text(&self, peer: &str, text: &str) -> Result<String, SendError> {
        let out = self.core.send_text(peer, text, Instant::now())?;
        dispatch(&self.transport, &self.events, out.actions).await;
        Ok(out.id)
    }

    /// Send a file to a named peer. Reading and hashing happen off the runtime threads.
    /// Returns the transfer id.
    pub async fn send_file(&self, peer: &str, path: PathBuf) -> Result<String, SendError> {
        let core = self.core.clone();
        let peer_name = peer.to_string();
        let out = tokio::task::spawn_blocking(move || {
            core.send_file(&peer_name, &path, Instant::now())
        })
        .await
        .map_err(|e| SendError::Io(std::io::Error::other(e)))??;
        dispatch(&self.transport, &self.events, out.actions).await;
        Ok(out.id)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn recv_loop(
    core: Arc<NodeCore>,
    transport: Arc<Transport>,
    events: mpsc::UnboundedSender<NodeEvent>,
) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        match transport.recv(&mut buf).await {
            Ok((n, from)) => {
                let actions = core.on_datagram(&buf[..n], from, Instant::now());
                dispatch(&transport, &events, actions).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "receive failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn retransmit_loop(
    core: Arc<NodeCore>,
    transport: Arc<Transport>,
    events: mpsc::UnboundedSender<NodeEvent>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let actions = core.retransmit_sweep(Instant::now());
        dispatch(&transport, &events, actions).await;
    }
}

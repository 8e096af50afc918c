//! # Connection Manager (Peer Exchange)
//!
//! Keeps a node connected to at least `min_connections` peers by
//! trading peer lists over `pex`-labeled streams and surfacing newly
//! discovered peers to the connection layer.
//!
//! ## Protocol
//!
//! | Frame | Meaning |
//! |-------|---------|
//! | `{"type":"request","maxNumberOfPeers":n}` | Ask a peer for up to n new peers |
//! | `{"type":"advertisement","peers":[…]}` | Answer with known peers |
//!
//! ## Control Loop
//!
//! After a short startup delay the manager sends one request to the
//! nearest peer with an open PEX channel (nearest by XOR distance to
//! the local id, resolved through the routing table). A periodic sweep
//! then tops the connection count back up whenever it falls below the
//! minimum.
//!
//! ## Seams
//!
//! Connection initiation itself (the WebRTC session dance) is not this
//! crate's business: discovered peers are handed to a [`PeerConnector`].
//! Inbound requests are answered from a [`PeerDirectory`]. A
//! user-configurable filter predicate picks which advertised peers are
//! preferred; the remainder only fills a deficit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, trace, warn};

use crate::dht::DhtNode;
use crate::id::NodeId;
use crate::messages::{self, PeerDto, PexMessage};
use crate::transport::{StreamHandle, StreamState};

/// Delay before the first PEX request after startup.
pub const PEX_INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Period of the connection-maintenance sweep.
pub const PEX_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Default lower bound on maintained connections.
pub const DEFAULT_MIN_CONNECTIONS: usize = 5;

/// Command channel capacity for the manager actor.
const PEX_COMMAND_CHANNEL_SIZE: usize = 64;

/// Predicate selecting which advertised peers are connected eagerly.
pub type PeerFilter = Box<dyn Fn(&PeerDto) -> bool + Send + Sync>;

/// Initiates connections to discovered peers (the WebRTC layer in the
/// reference deployment). New links come back via the attach calls on
/// the node and manager.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    async fn connect(&self, peer: &PeerDto) -> anyhow::Result<()>;
}

/// Supplies peers for answering inbound PEX requests.
#[async_trait]
pub trait PeerDirectory: Send + Sync + 'static {
    async fn sample(&self, limit: usize) -> Vec<PeerDto>;
}

/// Connection-manager configuration.
pub struct ConnectionConfig {
    pub min_connections: usize,
    /// Peers passing the filter are connected eagerly; the rest only
    /// fill a deficit. `None` prefers every advertised peer.
    pub filter: Option<PeerFilter>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            filter: None,
        }
    }
}

enum PexCommand {
    AttachChannel {
        node: NodeId,
        stream: StreamHandle,
    },
    Inbound {
        node: NodeId,
        frame: String,
    },
    ChannelClosed {
        node: NodeId,
    },
    ConnectedCount {
        reply: oneshot::Sender<usize>,
    },
    Quit {
        reply: oneshot::Sender<()>,
    },
}

/// Public handle to the connection manager actor.
#[derive(Clone)]
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<PexCommand>,
}

impl ConnectionManager {
    /// Spawn the manager. The control loop starts immediately: one
    /// request after [`PEX_INITIAL_DELAY`], then sweeps every
    /// [`PEX_SWEEP_INTERVAL`].
    pub fn spawn(
        dht: DhtNode,
        connector: Arc<dyn PeerConnector>,
        directory: Arc<dyn PeerDirectory>,
        config: ConnectionConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(PEX_COMMAND_CHANNEL_SIZE);
        let actor = PexActor {
            dht,
            connector,
            directory,
            channels: HashMap::new(),
            min_connections: config.min_connections,
            filter: config.filter,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Install a peer's `pex` stream.
    pub async fn attach_channel(&self, node: NodeId, stream: StreamHandle) {
        let _ = self
            .cmd_tx
            .send(PexCommand::AttachChannel { node, stream })
            .await;
    }

    /// Number of peers with an open PEX channel.
    pub async fn connected_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PexCommand::ConnectedCount { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(PexCommand::Quit { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct PexActor {
    dht: DhtNode,
    connector: Arc<dyn PeerConnector>,
    directory: Arc<dyn PeerDirectory>,
    channels: HashMap<NodeId, StreamHandle>,
    min_connections: usize,
    filter: Option<PeerFilter>,
    cmd_tx: mpsc::Sender<PexCommand>,
}

impl PexActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PexCommand>) {
        let initial = sleep(PEX_INITIAL_DELAY);
        tokio::pin!(initial);
        let mut initial_done = false;

        let mut sweep = interval(PEX_SWEEP_INTERVAL);
        sweep.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(PexCommand::AttachChannel { node, stream }) => {
                        self.attach_channel(node, stream);
                    }
                    Some(PexCommand::Inbound { node, frame }) => {
                        self.handle_frame(node, &frame).await;
                    }
                    Some(PexCommand::ChannelClosed { node }) => {
                        self.handle_channel_closed(node);
                    }
                    Some(PexCommand::ConnectedCount { reply }) => {
                        let _ = reply.send(self.open_channels().len());
                    }
                    Some(PexCommand::Quit { reply }) => {
                        for (_, channel) in self.channels.drain() {
                            channel.close();
                        }
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                _ = &mut initial, if !initial_done => {
                    initial_done = true;
                    self.request_peers(self.min_connections).await;
                }
                _ = sweep.tick() => {
                    let open = self.open_channels().len();
                    if open < self.min_connections {
                        self.request_peers(self.min_connections - open).await;
                    }
                }
            }
        }
        debug!("connection manager shutting down");
    }

    fn attach_channel(&mut self, node: NodeId, mut stream: StreamHandle) {
        let Some(mut inbound) = stream.take_inbound() else {
            warn!(
                node = hex::encode(&node.as_bytes()[..8]),
                "pex attach rejected: inbound side already taken"
            );
            return;
        };
        let mut state = stream.state_watch();
        if let Some(old) = self.channels.insert(node, stream) {
            old.close();
        }

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = inbound.recv() => match frame {
                        Some(frame) => {
                            if cmd_tx.send(PexCommand::Inbound { node, frame }).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                    changed = state.changed() => {
                        if changed.is_err() || *state.borrow() == StreamState::Closed {
                            break;
                        }
                    }
                }
            }
            let _ = cmd_tx.send(PexCommand::ChannelClosed { node }).await;
        });
    }

    fn handle_channel_closed(&mut self, node: NodeId) {
        let actually_closed = self
            .channels
            .get(&node)
            .is_none_or(|channel| channel.state() == StreamState::Closed);
        if actually_closed && self.channels.remove(&node).is_some() {
            debug!(
                node = hex::encode(&node.as_bytes()[..8]),
                "pex channel closed"
            );
        }
    }

    fn open_channels(&self) -> Vec<NodeId> {
        self.channels
            .iter()
            .filter(|(_, channel)| channel.state() == StreamState::Open)
            .map(|(node, _)| *node)
            .collect()
    }

    /// Ask the nearest open PEX channel for up to `wanted` new peers.
    async fn request_peers(&mut self, wanted: usize) {
        if wanted == 0 {
            return;
        }
        let open = self.open_channels();
        if open.is_empty() {
            trace!("no open pex channels to request peers from");
            return;
        }

        let frame = messages::encode(&PexMessage::Request {
            max_number_of_peers: wanted,
        });
        for node in self.dht.sort_closest_to_self(open).await {
            if let Some(channel) = self.channels.get(&node)
                && channel.send(frame.clone()).await
            {
                debug!(
                    node = hex::encode(&node.as_bytes()[..8]),
                    wanted, "requested peers over pex"
                );
                return;
            }
        }
        warn!("no open pex channel accepted the peer request");
    }

    async fn handle_frame(&mut self, node: NodeId, frame: &str) {
        let message = match messages::decode::<PexMessage>(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    node = hex::encode(&node.as_bytes()[..8]),
                    error = %e,
                    "dropping malformed pex frame"
                );
                return;
            }
        };

        match message {
            PexMessage::Request {
                max_number_of_peers,
            } => {
                let mut peers = self.directory.sample(max_number_of_peers).await;
                let self_id = self.dht.self_id();
                peers.retain(|peer| peer.peer_id != node && peer.peer_id != self_id);
                peers.truncate(max_number_of_peers);
                let answer = messages::encode(&PexMessage::Advertisement { peers });
                if let Some(channel) = self.channels.get(&node)
                    && !channel.send(answer).await
                {
                    debug!(
                        node = hex::encode(&node.as_bytes()[..8]),
                        "could not answer pex request"
                    );
                }
            }
            PexMessage::Advertisement { peers } => {
                debug!(
                    node = hex::encode(&node.as_bytes()[..8]),
                    advertised = peers.len(),
                    "received peer advertisement"
                );
                self.handle_new_peers(peers).await;
            }
        }
    }

    /// Connect to advertised peers: those passing the filter eagerly,
    /// the leftovers only while the connection count is short of the
    /// minimum.
    async fn handle_new_peers(&mut self, peers: Vec<PeerDto>) {
        let self_id = self.dht.self_id();
        let fresh: Vec<PeerDto> = peers
            .into_iter()
            .filter(|peer| peer.peer_id != self_id && !self.channels.contains_key(&peer.peer_id))
            .collect();

        let (preferred, leftover): (Vec<PeerDto>, Vec<PeerDto>) = match &self.filter {
            Some(filter) => fresh.into_iter().partition(|peer| filter(peer)),
            None => (fresh, Vec::new()),
        };

        let mut established = self.open_channels().len();
        for peer in &preferred {
            match self.connector.connect(peer).await {
                Ok(()) => established += 1,
                Err(e) => debug!(
                    peer = hex::encode(&peer.peer_id.as_bytes()[..8]),
                    error = %e,
                    "connection attempt failed"
                ),
            }
        }

        for peer in &leftover {
            if established >= self.min_connections {
                break;
            }
            match self.connector.connect(peer).await {
                Ok(()) => established += 1,
                Err(e) => debug!(
                    peer = hex::encode(&peer.peer_id.as_bytes()[..8]),
                    error = %e,
                    "connection attempt failed"
                ),
            }
        }
    }
}

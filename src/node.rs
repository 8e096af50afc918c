//! # High-Level Overlay API
//!
//! An [`Overlay`] combines the routing node and the connection manager
//! into a single entry point. The connection layer feeds it streams
//! (one `dht` and one `pex` stream per peer) and a [`PeerConnector`] to
//! dial newly discovered peers; everything else runs internally.
//!
//! ## Quick Start
//!
//! ```ignore
//! let overlay = Overlay::spawn(config, connector, directory);
//!
//! // Wire up a freshly connected peer.
//! overlay.attach_link(peer_id, dht_stream).await;
//! overlay.attach_pex(peer_id, pex_stream).await;
//!
//! // Chat.
//! overlay.send_message(recipient, Envelope::chat(overlay.self_id())).await;
//! let mut events = overlay.subscribe();
//! ```

use std::sync::Arc;

use crate::dht::{DhtConfig, DhtNode, DhtStats};
use crate::error::Error;
use crate::events::NodeEvent;
use crate::id::NodeId;
use crate::messages::Envelope;
use crate::pex::{ConnectionConfig, ConnectionManager, PeerConnector, PeerDirectory};
use crate::transport::StreamHandle;

/// Configuration for a full overlay node.
pub struct OverlayConfig {
    pub dht: DhtConfig,
    pub connections: ConnectionConfig,
}

impl OverlayConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            dht: DhtConfig::new(node_id),
            connections: ConnectionConfig::default(),
        }
    }
}

/// A running overlay node: routing, caching and peer exchange.
pub struct Overlay {
    dht: DhtNode,
    manager: ConnectionManager,
}

impl Overlay {
    pub fn spawn(
        config: OverlayConfig,
        connector: Arc<dyn PeerConnector>,
        directory: Arc<dyn PeerDirectory>,
    ) -> Self {
        let dht = DhtNode::spawn(config.dht);
        let manager =
            ConnectionManager::spawn(dht.clone(), connector, directory, config.connections);
        Self { dht, manager }
    }

    pub fn self_id(&self) -> NodeId {
        self.dht.self_id()
    }

    /// The routing node, for callers needing the lower-level API.
    pub fn dht(&self) -> &DhtNode {
        &self.dht
    }

    /// Install a peer's `dht` stream.
    pub async fn attach_link(&self, peer: NodeId, stream: StreamHandle) {
        self.dht.attach(peer, stream).await;
    }

    /// Install a peer's `pex` stream.
    pub async fn attach_pex(&self, peer: NodeId, stream: StreamHandle) {
        self.manager.attach_channel(peer, stream).await;
    }

    /// Number of peers with an open PEX channel.
    pub async fn connected_count(&self) -> usize {
        self.manager.connected_count().await
    }

    pub async fn send_message(&self, recipient: NodeId, payload: Envelope) {
        self.dht.send_message(recipient, payload).await;
    }

    pub async fn send_signaling(&self, recipient: NodeId, payload: Envelope) {
        self.dht.send_signaling(recipient, payload, None).await;
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NodeEvent> {
        self.dht.subscribe()
    }

    pub async fn save_state(&self) -> Result<(), Error> {
        self.dht.save_state().await
    }

    pub async fn load_state(&self) -> Result<(), Error> {
        self.dht.load_state().await
    }

    pub async fn stats(&self) -> DhtStats {
        self.dht.stats().await
    }

    /// Shut down in reverse dependency order.
    pub async fn shutdown(&self) {
        self.manager.quit().await;
        self.dht.close().await;
    }
}

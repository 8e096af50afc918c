//! # Link RPC Layer
//!
//! The per-link RPC protocol: framing, liveness pings and message
//! dispatch over the `dht` stream of every connected peer.
//!
//! ## Architecture
//!
//! The layer uses the actor pattern:
//! - [`LinkRpc`]: public handle (cheap to clone) for attach/send/ping
//! - `LinkRpcActor`: private actor owning the `node id → stream` map
//!   and the outstanding ping waiters
//!
//! The actor is the only owner of stream handles; the routing table
//! stores bare ids and resolves them through this map. Decoded frames
//! flow upward as [`RpcEvent`]s on the channel returned by
//! [`LinkRpc::spawn`].
//!
//! ## Ping Tracking
//!
//! Each outbound ping registers a waiter keyed by its UUID. The waiter
//! resolves `true` on a matching pong from the same node, `false` when
//! the stream closes or after [`PING_TIMEOUT`]. Expiry is driven by a
//! spawned sleeper posting a command back to the actor, so resolution
//! always happens in one place.
//!
//! ## Robustness
//!
//! Malformed frames are logged at warn and dropped; the connection is
//! preserved. `send` to an absent or closed stream returns `false`,
//! never an error.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::id::NodeId;
use crate::messages::{self, RpcMessage};
use crate::transport::{StreamHandle, StreamState};

/// How long a ping waits for its pong before resolving `false`.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Guard on handle-side waits for actor replies. A stalled actor (for
/// example one wedged behind a saturated upward event channel) makes
/// the operation report failure instead of parking the caller forever.
const REPLY_GUARD: Duration = Duration::from_secs(15);

/// Command channel capacity for the RPC actor.
const RPC_COMMAND_CHANNEL_SIZE: usize = 256;

/// Upward event channel capacity.
const RPC_EVENT_CHANNEL_SIZE: usize = 256;

/// Events the RPC layer reports upward to the node.
#[derive(Debug)]
pub enum RpcEvent {
    /// A stream was attached and is being listened on.
    Listening(NodeId),
    /// The peer pinged us (the pong is already on its way back).
    Ping(NodeId),
    /// A routed frame arrived from the peer.
    Message(RpcMessage, NodeId),
    /// The peer's stream closed and was removed from the map.
    Closed(NodeId),
}

enum RpcCommand {
    Attach {
        node: NodeId,
        stream: StreamHandle,
    },
    Send {
        node: NodeId,
        message: RpcMessage,
        reply: oneshot::Sender<bool>,
    },
    Ping {
        node: NodeId,
        reply: oneshot::Sender<bool>,
    },
    Inbound {
        node: NodeId,
        frame: String,
    },
    StreamClosed {
        node: NodeId,
    },
    PingExpired {
        id: Uuid,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Public handle to the link RPC actor.
#[derive(Clone)]
pub struct LinkRpc {
    cmd_tx: mpsc::Sender<RpcCommand>,
    self_id: NodeId,
}

impl LinkRpc {
    /// Spawn the actor for a node. Returns the handle and the upward
    /// event stream.
    pub fn spawn(self_id: NodeId) -> (Self, mpsc::Receiver<RpcEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(RPC_EVENT_CHANNEL_SIZE);

        let actor = LinkRpcActor {
            self_id,
            streams: HashMap::new(),
            pending_pings: HashMap::new(),
            cmd_tx: cmd_tx.clone(),
            events: event_tx,
        };
        tokio::spawn(actor.run(cmd_rx));

        (Self { cmd_tx, self_id }, event_rx)
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Install a peer's `dht` stream and start listening on it.
    pub async fn attach(&self, node: NodeId, stream: StreamHandle) {
        let _ = self.cmd_tx.send(RpcCommand::Attach { node, stream }).await;
    }

    /// Hand a frame to the peer's stream.
    ///
    /// `true` when the stream was open and accepted the frame.
    pub async fn send(&self, node: NodeId, message: RpcMessage) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RpcCommand::Send {
                node,
                message,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        matches!(tokio::time::timeout(REPLY_GUARD, rx).await, Ok(Ok(true)))
    }

    /// Ping a peer, resolving `true` on a matching pong.
    pub async fn ping(&self, node: NodeId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RpcCommand::Ping { node, reply })
            .await
            .is_err()
        {
            return false;
        }
        matches!(tokio::time::timeout(REPLY_GUARD, rx).await, Ok(Ok(true)))
    }

    /// Close every stream and shut the actor down. In-flight pings
    /// resolve `false`.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(RpcCommand::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct PendingPing {
    node: NodeId,
    reply: oneshot::Sender<bool>,
}

struct LinkRpcActor {
    self_id: NodeId,
    streams: HashMap<NodeId, StreamHandle>,
    pending_pings: HashMap<Uuid, PendingPing>,
    cmd_tx: mpsc::Sender<RpcCommand>,
    events: mpsc::Sender<RpcEvent>,
}

impl LinkRpcActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                RpcCommand::Attach { node, stream } => self.attach(node, stream).await,
                RpcCommand::Send {
                    node,
                    message,
                    reply,
                } => {
                    let ok = self.send(&node, &message).await;
                    let _ = reply.send(ok);
                }
                RpcCommand::Ping { node, reply } => self.start_ping(node, reply).await,
                RpcCommand::Inbound { node, frame } => self.handle_frame(node, &frame).await,
                RpcCommand::StreamClosed { node } => self.handle_stream_closed(node).await,
                RpcCommand::PingExpired { id } => {
                    if let Some(pending) = self.pending_pings.remove(&id) {
                        trace!(
                            node = hex::encode(&pending.node.as_bytes()[..8]),
                            "ping timed out"
                        );
                        let _ = pending.reply.send(false);
                    }
                }
                RpcCommand::Close { reply } => {
                    self.close_all();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("link RPC actor shutting down");
    }

    async fn attach(&mut self, node: NodeId, mut stream: StreamHandle) {
        let Some(inbound) = stream.take_inbound() else {
            warn!(
                node = hex::encode(&node.as_bytes()[..8]),
                "attach rejected: inbound side of stream already taken"
            );
            return;
        };

        if let Some(old) = self.streams.insert(node, stream) {
            debug!(
                node = hex::encode(&node.as_bytes()[..8]),
                "replacing existing stream"
            );
            old.close();
        }

        self.spawn_reader(node, inbound);
        let _ = self.events.send(RpcEvent::Listening(node)).await;
    }

    fn spawn_reader(&self, node: NodeId, mut inbound: mpsc::Receiver<String>) {
        let cmd_tx = self.cmd_tx.clone();
        let mut state = match self.streams.get(&node) {
            Some(stream) => stream.state_watch(),
            None => return,
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = inbound.recv() => match frame {
                        Some(frame) => {
                            if cmd_tx.send(RpcCommand::Inbound { node, frame }).await.is_err() {
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
            let _ = cmd_tx.send(RpcCommand::StreamClosed { node }).await;
        });
    }

    async fn send(&mut self, node: &NodeId, message: &RpcMessage) -> bool {
        match self.streams.get(node) {
            Some(stream) => stream.send(messages::encode(message)).await,
            None => false,
        }
    }

    async fn start_ping(&mut self, node: NodeId, reply: oneshot::Sender<bool>) {
        let id = Uuid::new_v4();
        let frame = RpcMessage::Ping {
            sender: self.self_id,
            id,
        };
        if !self.send(&node, &frame).await {
            let _ = reply.send(false);
            return;
        }

        self.pending_pings.insert(id, PendingPing { node, reply });

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            sleep(PING_TIMEOUT).await;
            let _ = cmd_tx.send(RpcCommand::PingExpired { id }).await;
        });
    }

    async fn handle_frame(&mut self, node: NodeId, frame: &str) {
        let message = match messages::decode::<RpcMessage>(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    node = hex::encode(&node.as_bytes()[..8]),
                    error = %e,
                    "dropping malformed frame"
                );
                return;
            }
        };

        match message {
            RpcMessage::Ping { id, .. } => {
                let pong = RpcMessage::Pong {
                    sender: self.self_id,
                    id,
                };
                if !self.send(&node, &pong).await {
                    debug!(
                        node = hex::encode(&node.as_bytes()[..8]),
                        "could not answer ping, stream gone"
                    );
                }
                let _ = self.events.send(RpcEvent::Ping(node)).await;
            }
            RpcMessage::Pong { id, .. } => {
                match self.pending_pings.remove(&id) {
                    Some(pending) if pending.node == node => {
                        let _ = pending.reply.send(true);
                    }
                    Some(pending) => {
                        // Pong for an id we issued, but from the wrong
                        // peer. Keep waiting for the real one.
                        warn!(
                            node = hex::encode(&node.as_bytes()[..8]),
                            expected = hex::encode(&pending.node.as_bytes()[..8]),
                            "pong from unexpected node"
                        );
                        self.pending_pings.insert(id, pending);
                    }
                    None => {
                        trace!(
                            node = hex::encode(&node.as_bytes()[..8]),
                            "pong without outstanding ping"
                        );
                    }
                }
            }
            message @ (RpcMessage::Message { .. } | RpcMessage::Signaling { .. }) => {
                let _ = self.events.send(RpcEvent::Message(message, node)).await;
            }
        }
    }

    async fn handle_stream_closed(&mut self, node: NodeId) {
        // A reader posts this when its stream ends. Ignore stale
        // notifications from a stream that was already replaced.
        let actually_closed = self
            .streams
            .get(&node)
            .is_none_or(|s| s.state() == StreamState::Closed);
        if !actually_closed {
            return;
        }
        if self.streams.remove(&node).is_some() {
            self.fail_pings_for(&node);
            let _ = self.events.send(RpcEvent::Closed(node)).await;
        }
    }

    fn fail_pings_for(&mut self, node: &NodeId) {
        let expired: Vec<Uuid> = self
            .pending_pings
            .iter()
            .filter(|(_, pending)| pending.node == *node)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending_pings.remove(&id) {
                let _ = pending.reply.send(false);
            }
        }
    }

    fn close_all(&mut self) {
        for (_, stream) in self.streams.drain() {
            stream.close();
        }
        for (_, pending) in self.pending_pings.drain() {
            let _ = pending.reply.send(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_link;
    use tokio::time::timeout;

    fn node(index: u8) -> NodeId {
        let mut bytes = [0u8; crate::id::ID_LEN];
        bytes[crate::id::ID_LEN - 1] = index;
        NodeId::from_bytes(bytes)
    }

    const WAIT: Duration = Duration::from_secs(5);

    /// Two linked RPC layers; returns both handles and event streams.
    fn linked_pair() -> (LinkRpc, mpsc::Receiver<RpcEvent>, LinkRpc, mpsc::Receiver<RpcEvent>) {
        let (a, a_events) = LinkRpc::spawn(node(1));
        let (b, b_events) = LinkRpc::spawn(node(2));
        (a, a_events, b, b_events)
    }

    async fn expect_listening(events: &mut mpsc::Receiver<RpcEvent>, expected: NodeId) {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(RpcEvent::Listening(n)) => assert_eq!(n, expected),
            other => panic!("expected Listening, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_resolves_true_on_matching_pong() {
        let (a, mut a_events, b, mut b_events) = linked_pair();
        let (to_b, to_a) = memory_link("dht");
        a.attach(node(2), to_b).await;
        b.attach(node(1), to_a).await;
        expect_listening(&mut a_events, node(2)).await;
        expect_listening(&mut b_events, node(1)).await;

        assert!(timeout(WAIT, a.ping(node(2))).await.unwrap());

        // The pinged side reports the ping upward.
        match timeout(WAIT, b_events.recv()).await.unwrap() {
            Some(RpcEvent::Ping(n)) => assert_eq!(n, node(1)),
            other => panic!("expected Ping, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_of_unknown_node_is_false() {
        let (a, _a_events) = LinkRpc::spawn(node(1));
        assert!(!a.ping(node(9)).await);
    }

    #[tokio::test]
    async fn ping_fails_fast_when_stream_closed() {
        let (a, mut a_events, _b, _b_events) = linked_pair();
        let (to_b, to_a) = memory_link("dht");
        a.attach(node(2), to_b).await;
        expect_listening(&mut a_events, node(2)).await;

        to_a.close();
        // Wait for the close to be observed.
        match timeout(WAIT, a_events.recv()).await.unwrap() {
            Some(RpcEvent::Closed(n)) => assert_eq!(n, node(2)),
            other => panic!("expected Closed, got {other:?}"),
        }

        assert!(!timeout(WAIT, a.ping(node(2))).await.unwrap());
    }

    #[tokio::test]
    async fn send_to_unknown_node_is_false_not_an_error() {
        let (a, _events) = LinkRpc::spawn(node(1));
        let frame = RpcMessage::user(node(1), node(2), crate::messages::Envelope::chat(node(1)));
        assert!(!a.send(node(2), frame).await);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_link_survives() {
        let (a, mut a_events, b, mut b_events) = linked_pair();
        let (to_b, to_a) = memory_link("dht");
        a.attach(node(2), to_b).await;
        expect_listening(&mut a_events, node(2)).await;

        // Inject garbage before attaching the far side, then attach.
        assert!(to_a.send("this is not json".into()).await);
        b.attach(node(1), to_a).await;
        expect_listening(&mut b_events, node(1)).await;

        // Garbage was dropped; a real ping still round-trips.
        assert!(timeout(WAIT, a.ping(node(2))).await.unwrap());
    }

    #[tokio::test]
    async fn routed_frames_are_reported_upward() {
        let (a, mut a_events, b, mut b_events) = linked_pair();
        let (to_b, to_a) = memory_link("dht");
        a.attach(node(2), to_b).await;
        b.attach(node(1), to_a).await;
        expect_listening(&mut a_events, node(2)).await;
        expect_listening(&mut b_events, node(1)).await;

        let payload = crate::messages::Envelope::chat(node(1));
        let sent_id = payload.id;
        assert!(a.send(node(2), RpcMessage::user(node(1), node(2), payload)).await);

        match timeout(WAIT, b_events.recv()).await.unwrap() {
            Some(RpcEvent::Message(RpcMessage::Message { message, .. }, from)) => {
                assert_eq!(from, node(1));
                assert_eq!(message.unwrap().id, sent_id);
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_fails_outstanding_pings() {
        let (a, mut a_events, _b, _b_events) = linked_pair();
        let (to_b, _to_a) = memory_link("dht");
        a.attach(node(2), to_b).await;
        expect_listening(&mut a_events, node(2)).await;

        // The far side never answers; close the layer while the ping
        // is in flight.
        let pinger = {
            let a = a.clone();
            tokio::spawn(async move { a.ping(node(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.close().await;

        assert!(!timeout(WAIT, pinger).await.unwrap().unwrap());
    }
}

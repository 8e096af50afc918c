//! # DHT Routing Core
//!
//! This module implements the routing overlay a node runs per identity:
//! the XOR-metric k-bucket table, the forwarding strategy that floods
//! narrowly toward a recipient, the dedup sets that suppress loops, and
//! the node actor composing them with the link RPC and the message
//! cache.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `attach(node, stream)` | Install a peer's `dht` stream |
//! | `send_message(to, payload)` | Deliver a chat envelope, caching and forwarding as needed |
//! | `send_signaling(to, payload, sender)` | Route a signaling envelope (never cached) |
//! | `save_state` / `load_state` | Persist the cache and routing ids per node |
//!
//! ## Routing Table
//!
//! 160 buckets indexed by the position of the highest set bit of the
//! XOR distance (bucket 0 holds the furthest half of the id space).
//! Buckets hold up to k ids in insertion order; a full bucket evicts
//! its front. The table stores bare ids: stream handles live in the
//! link RPC's map, which avoids cyclic ownership between buckets and
//! transports.
//!
//! ## Actor Architecture
//!
//! - [`DhtNode`]: public handle for overlay operations
//! - `DhtActor`: internal actor owning table, cache and dedup state
//!
//! Commands arrive on an async channel; RPC events arrive on a second
//! channel from the link layer; dedup cleanup and cache replay run on
//! intervals inside the same select loop. Liveness pings issued while
//! adding a node run in spawned tasks that post their result back as a
//! command, so the actor never blocks on a joining peer.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, Duration};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::cache::{
    build_strategy, CacheOutcome, CacheStrategy, CacheStrategyKind, DeliveryCourier,
    DEFAULT_CACHE_PROBABILITY, DEFAULT_CACHE_SIZE, DEFAULT_DISTANCE_THRESHOLD, DEFAULT_MAX_TTL,
};
use crate::error::Error;
use crate::events::{EventSink, NodeEvent};
use crate::id::{bucket_index, distance_cmp, NodeId, ID_BITS};
use crate::messages::{Envelope, RpcMessage};
use crate::rpc::{LinkRpc, RpcEvent};
use crate::transport::StreamHandle;

/// Default bucket capacity (Kademlia k).
pub const DEFAULT_K: usize = 20;

/// Upper bound on each dedup set. Oldest ids fall out first.
pub const MAX_RECEIVED_IDS: usize = 10_000;

/// How often the dedup sets are pruned back to their bound.
const DEDUP_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often cached messages are replayed and expired.
const CACHE_REPLAY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Command channel capacity for the node actor.
const DHT_COMMAND_CHANNEL_SIZE: usize = 256;

// ============================================================================
// Routing Table (XOR-Metric k-Buckets)
// ============================================================================

#[derive(Debug, Default, Clone)]
struct Bucket {
    ids: Vec<NodeId>,
}

impl Bucket {
    /// Insert with insertion-order LRU semantics: a present id is a
    /// no-op, a full bucket evicts its front before appending.
    fn add(&mut self, id: NodeId, k: usize) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        if self.ids.len() >= k {
            self.ids.remove(0);
        }
        self.ids.push(id);
        true
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.ids.contains(id)
    }
}

/// XOR-metric routing table of 160 insertion-order buckets.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: vec![Bucket::default(); ID_BITS],
        }
    }

    /// Add an id. The self id is never stored.
    pub fn add(&mut self, id: NodeId) -> bool {
        if id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id.xor_distance(&id));
        self.buckets[idx].add(id, self.k)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        if *id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id.xor_distance(id));
        self.buckets[idx].contains(id)
    }

    /// Every stored id, bucket by bucket.
    pub fn all(&self) -> Vec<NodeId> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.ids.iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The k ids closest to `target`, ascending by XOR distance with a
    /// lexicographic id tiebreak.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<NodeId> {
        let mut scored: Vec<(NodeId, [u8; crate::id::ID_LEN])> = self
            .all()
            .into_iter()
            .map(|id| (id, id.xor_distance(target)))
            .collect();
        scored.sort_by(|a, b| distance_cmp(&a.1, &b.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        scored.into_iter().map(|(id, _)| id).collect()
    }

    /// Stable-sort the given ids by XOR distance to the local id.
    pub fn sort_closest_to_self(&self, mut ids: Vec<NodeId>) -> Vec<NodeId> {
        ids.sort_by(|a, b| {
            distance_cmp(
                &self.self_id.xor_distance(a),
                &self.self_id.xor_distance(b),
            )
        });
        ids
    }
}

// ============================================================================
// Dedup Sets (loop suppression)
// ============================================================================

/// An insertion-ordered set of message ids with a hard size bound.
#[derive(Debug, Default)]
struct BoundedIdSet {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    cap: usize,
}

impl BoundedIdSet {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            cap,
        }
    }

    fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        self.prune();
        true
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    fn prune(&mut self) {
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Node configuration. Defaults follow the reference deployment.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub node_id: NodeId,
    pub k: usize,
    /// Added to the table and pinged on startup when present.
    pub bootstrap_node_id: Option<NodeId>,
    pub cache_strategy: CacheStrategyKind,
    pub cache_size: usize,
    pub cache_distance_threshold: u64,
    pub cache_probability: f64,
    pub cache_max_ttl: Duration,
    /// Skip liveness pings when adding nodes; peers count as live
    /// immediately. Used by simulations and the demo mesh.
    pub simulator_mode: bool,
    /// Directory for persisted state files.
    pub state_dir: PathBuf,
}

impl DhtConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            k: DEFAULT_K,
            bootstrap_node_id: None,
            cache_strategy: CacheStrategyKind::Distance,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            cache_probability: DEFAULT_CACHE_PROBABILITY,
            cache_max_ttl: DEFAULT_MAX_TTL,
            simulator_mode: false,
            state_dir: PathBuf::from("."),
        }
    }
}

/// Point-in-time counters for logs and the demo loop.
#[derive(Clone, Copy, Debug, Default)]
pub struct DhtStats {
    pub peers: usize,
    pub cached_messages: usize,
    pub forwarded_ids: usize,
    pub received_signaling_ids: usize,
}

// ============================================================================
// Node Actor
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ForwardKind {
    User,
    Signaling,
}

enum Command {
    SendMessage {
        recipient: NodeId,
        payload: Envelope,
        reply: oneshot::Sender<()>,
    },
    SendSignaling {
        recipient: NodeId,
        payload: Envelope,
        sender: Option<NodeId>,
        reply: oneshot::Sender<()>,
    },
    AddNode {
        node: NodeId,
    },
    NodePingSettled {
        node: NodeId,
        alive: bool,
    },
    Contains {
        node: NodeId,
        reply: oneshot::Sender<bool>,
    },
    Peers {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    SortClosestToSelf {
        ids: Vec<NodeId>,
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    TryDeliverCached,
    SaveState {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    LoadState {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Stats {
        reply: oneshot::Sender<DhtStats>,
    },
    Quit {
        reply: oneshot::Sender<()>,
    },
}

/// Public handle to a routing overlay node.
#[derive(Clone)]
pub struct DhtNode {
    cmd_tx: mpsc::Sender<Command>,
    rpc: LinkRpc,
    events: EventSink,
    self_id: NodeId,
}

impl DhtNode {
    /// Spawn the node actor for the given configuration.
    pub fn spawn(config: DhtConfig) -> Self {
        let (rpc, rpc_events) = LinkRpc::spawn(config.node_id);
        let (cmd_tx, cmd_rx) = mpsc::channel(DHT_COMMAND_CHANNEL_SIZE);
        let events = EventSink::new();

        let cache = build_strategy(
            config.cache_strategy,
            config.cache_size,
            config.cache_distance_threshold,
            config.cache_probability,
        );

        let actor = DhtActor {
            self_id: config.node_id,
            k: config.k,
            routing: RoutingTable::new(config.node_id, config.k),
            cache,
            forwarded_ids: BoundedIdSet::new(MAX_RECEIVED_IDS),
            received_signaling_ids: BoundedIdSet::new(MAX_RECEIVED_IDS),
            rpc: rpc.clone(),
            events: events.clone(),
            simulator_mode: config.simulator_mode,
            cache_max_ttl: config.cache_max_ttl,
            state_dir: config.state_dir.clone(),
            bootstrap_node_id: config.bootstrap_node_id,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(actor.run(cmd_rx, rpc_events));

        Self {
            cmd_tx,
            rpc,
            events,
            self_id: config.node_id,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Subscribe to this node's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Install a peer's `dht` stream. The link RPC reports it as
    /// listening, which adds the peer to the routing table.
    pub async fn attach(&self, node: NodeId, stream: StreamHandle) {
        self.rpc.attach(node, stream).await;
    }

    /// Deliver a chat envelope to `recipient`, directly when a live
    /// link exists, otherwise through guardians and forwarding.
    pub async fn send_message(&self, recipient: NodeId, payload: Envelope) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::SendMessage {
                recipient,
                payload,
                reply,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Route a signaling envelope. Pass `sender: None` when this node
    /// originates the message.
    pub async fn send_signaling(
        &self,
        recipient: NodeId,
        payload: Envelope,
        sender: Option<NodeId>,
    ) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::SendSignaling {
                recipient,
                payload,
                sender,
                reply,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Add a peer id to the routing table (pinged for liveness unless
    /// the node runs in simulator mode).
    pub async fn add_node(&self, node: NodeId) {
        let _ = self.cmd_tx.send(Command::AddNode { node }).await;
    }

    pub async fn contains(&self, node: NodeId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Contains { node, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn peers(&self) -> Vec<NodeId> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Peers { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stable-sort ids by XOR distance to this node.
    pub async fn sort_closest_to_self(&self, ids: Vec<NodeId>) -> Vec<NodeId> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::SortClosestToSelf { ids, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Run a cache replay pass now (also runs periodically).
    pub async fn try_deliver_cached(&self) {
        let _ = self.cmd_tx.send(Command::TryDeliverCached).await;
    }

    /// Persist the cache snapshot and routing ids to the state
    /// directory.
    pub async fn save_state(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SaveState { reply })
            .await
            .map_err(|_| Error::Persistence(std::io::Error::other("node closed")))?;
        rx.await
            .map_err(|_| Error::Persistence(std::io::Error::other("node closed")))?
    }

    /// Load persisted state. Missing files are not errors.
    pub async fn load_state(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::LoadState { reply })
            .await
            .map_err(|_| Error::Persistence(std::io::Error::other("node closed")))?;
        rx.await
            .map_err(|_| Error::Persistence(std::io::Error::other("node closed")))?
    }

    pub async fn stats(&self) -> DhtStats {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats { reply }).await.is_err() {
            return DhtStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Tear the node down: streams closed, timers cancelled, in-memory
    /// state cleared. In-flight pings resolve `false`.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Quit { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedContact {
    id: NodeId,
}

struct DhtActor {
    self_id: NodeId,
    k: usize,
    routing: RoutingTable,
    cache: Box<dyn CacheStrategy>,
    forwarded_ids: BoundedIdSet,
    received_signaling_ids: BoundedIdSet,
    rpc: LinkRpc,
    events: EventSink,
    simulator_mode: bool,
    cache_max_ttl: Duration,
    state_dir: PathBuf,
    bootstrap_node_id: Option<NodeId>,
    cmd_tx: mpsc::Sender<Command>,
}

impl DhtActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut rpc_events: mpsc::Receiver<RpcEvent>,
    ) {
        if let Some(bootstrap) = self.bootstrap_node_id {
            self.add_node(bootstrap).await;
        }

        let mut dedup_interval = interval(DEDUP_CLEANUP_INTERVAL);
        let mut replay_interval = interval(CACHE_REPLAY_INTERVAL);
        // Skip the immediate first tick of each interval.
        dedup_interval.tick().await;
        replay_interval.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                event = rpc_events.recv() => match event {
                    Some(event) => self.handle_rpc_event(event).await,
                    None => break,
                },
                _ = dedup_interval.tick() => self.cleanup_dedup(),
                _ = replay_interval.tick() => self.try_deliver_cached().await,
            }
        }
        debug!(node = hex::encode(&self.self_id.as_bytes()[..8]), "node actor shutting down");
    }

    /// Returns `true` when the actor should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SendMessage {
                recipient,
                payload,
                reply,
            } => {
                self.send_message(recipient, payload, true).await;
                let _ = reply.send(());
            }
            Command::SendSignaling {
                recipient,
                payload,
                sender,
                reply,
            } => {
                self.send_signaling(recipient, payload, sender).await;
                let _ = reply.send(());
            }
            Command::AddNode { node } => self.add_node(node).await,
            Command::NodePingSettled { node, alive } => {
                if alive {
                    self.events.emit(NodeEvent::Ready { node });
                    self.try_deliver_cached().await;
                } else {
                    debug!(
                        node = hex::encode(&node.as_bytes()[..8]),
                        "peer did not answer join ping"
                    );
                }
            }
            Command::Contains { node, reply } => {
                let _ = reply.send(self.routing.contains(&node));
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.routing.all());
            }
            Command::SortClosestToSelf { ids, reply } => {
                let _ = reply.send(self.routing.sort_closest_to_self(ids));
            }
            Command::TryDeliverCached => self.try_deliver_cached().await,
            Command::SaveState { reply } => {
                let _ = reply.send(self.save_state().await);
            }
            Command::LoadState { reply } => {
                let _ = reply.send(self.load_state().await);
            }
            Command::Stats { reply } => {
                let _ = reply.send(DhtStats {
                    peers: self.routing.len(),
                    cached_messages: self.cache.count(),
                    forwarded_ids: self.forwarded_ids.len(),
                    received_signaling_ids: self.received_signaling_ids.len(),
                });
            }
            Command::Quit { reply } => {
                self.rpc.close().await;
                self.cache.clear();
                self.forwarded_ids.clear();
                self.received_signaling_ids.clear();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn handle_rpc_event(&mut self, event: RpcEvent) {
        match event {
            RpcEvent::Listening(node) => {
                self.add_node(node).await;
                self.try_deliver_cached().await;
            }
            RpcEvent::Ping(node) => self.add_node(node).await,
            RpcEvent::Message(message, from) => self.handle_message(message, from).await,
            RpcEvent::Closed(node) => {
                trace!(
                    node = hex::encode(&node.as_bytes()[..8]),
                    "peer stream closed"
                );
            }
        }
    }

    async fn add_node(&mut self, node: NodeId) {
        if node == self.self_id || self.routing.contains(&node) {
            return;
        }
        self.routing.add(node);
        debug!(
            node = hex::encode(&node.as_bytes()[..8]),
            peers = self.routing.len(),
            "added node to routing table"
        );

        if self.simulator_mode {
            self.events.emit(NodeEvent::Ready { node });
            self.try_deliver_cached().await;
            return;
        }

        let rpc = self.rpc.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let alive = rpc.ping(node).await;
            let _ = cmd_tx.send(Command::NodePingSettled { node, alive }).await;
        });
    }

    async fn handle_message(&mut self, message: RpcMessage, from: NodeId) {
        let (kind, sender, recipient, envelope) = match message {
            RpcMessage::Message {
                sender,
                recipient,
                message,
                ..
            } => (ForwardKind::User, sender, recipient, message),
            RpcMessage::Signaling {
                sender,
                recipient,
                signaling_message,
                ..
            } => (ForwardKind::Signaling, sender, recipient, signaling_message),
            // Pings and pongs are consumed by the link layer.
            _ => return,
        };

        let Some(envelope) = envelope else {
            warn!(
                from = hex::encode(&from.as_bytes()[..8]),
                "rejecting routed frame without payload"
            );
            return;
        };
        let Some(envelope_id) = envelope.id else {
            warn!(
                from = hex::encode(&from.as_bytes()[..8]),
                "rejecting routed frame without payload id"
            );
            return;
        };

        self.add_node(from).await;

        if recipient == self.self_id {
            match kind {
                ForwardKind::User => {
                    self.events.emit(NodeEvent::ChatMessage { payload: envelope });
                }
                ForwardKind::Signaling => {
                    if self.received_signaling_ids.contains(&envelope_id) {
                        debug!(id = %envelope_id, "suppressing duplicate signaling message");
                        return;
                    }
                    self.received_signaling_ids.insert(envelope_id);
                    self.events
                        .emit(NodeEvent::SignalingMessage { payload: envelope });
                }
            }
            return;
        }

        // Not addressed to us: relay toward the recipient.
        match kind {
            ForwardKind::User => self.send_message(recipient, envelope, false).await,
            ForwardKind::Signaling => {
                self.send_signaling(recipient, envelope, Some(sender)).await
            }
        }
    }

    async fn send_message(&mut self, recipient: NodeId, payload: Envelope, is_origin: bool) {
        if recipient == self.self_id {
            // Local short-circuit: nothing to route.
            self.events.emit(NodeEvent::ChatMessage { payload });
            return;
        }

        // A relay handles each message id once; later copies arriving
        // over other paths are dropped here.
        if !is_origin
            && let Some(id) = payload.id
            && self.forwarded_ids.contains(&id)
        {
            debug!(id = %id, "relay suppressed, id already handled");
            return;
        }

        if self.routing.contains(&recipient) {
            if self.rpc.ping(recipient).await {
                let frame = RpcMessage::user(self.self_id, recipient, payload.clone());
                if self.rpc.send(recipient, frame).await {
                    if !is_origin
                        && let Some(id) = payload.id
                    {
                        self.forwarded_ids.insert(id);
                    }
                    self.events.emit(NodeEvent::Sent {
                        recipient,
                        id: payload.id,
                    });
                    return;
                }
                debug!(
                    recipient = hex::encode(&recipient.as_bytes()[..8]),
                    "direct send refused by transport, handing off to guardians"
                );
                // Fall through to the unknown-recipient path.
            } else {
                self.cache_for(recipient, &payload, true);
                self.forward(payload.sender_id, recipient, &payload, ForwardKind::User, true)
                    .await;
                return;
            }
        }

        self.cache_for(recipient, &payload, false);
        self.forward(payload.sender_id, recipient, &payload, ForwardKind::User, false)
            .await;
    }

    async fn send_signaling(
        &mut self,
        recipient: NodeId,
        mut payload: Envelope,
        sender: Option<NodeId>,
    ) {
        let (sender, is_origin) = match sender {
            Some(sender) => (sender, false),
            None => (self.self_id, true),
        };
        if payload.id.is_none() {
            payload.id = Some(Uuid::new_v4());
        }
        let payload_id = payload.id;

        // Relays handle each signaling id once.
        if !is_origin
            && let Some(id) = payload_id
            && self.forwarded_ids.contains(&id)
        {
            debug!(id = %id, "signaling relay suppressed, id already handled");
            return;
        }

        if recipient == self.self_id {
            if let Some(id) = payload_id {
                if self.received_signaling_ids.contains(&id) {
                    return;
                }
                self.received_signaling_ids.insert(id);
            }
            self.events
                .emit(NodeEvent::SignalingMessage { payload });
            return;
        }

        if self.routing.contains(&recipient) {
            if self.rpc.ping(recipient).await {
                let frame = RpcMessage::signaling(sender, recipient, payload.clone());
                if self.rpc.send(recipient, frame).await {
                    // The origin must not re-forward its own signaling.
                    if let Some(id) = payload_id {
                        self.forwarded_ids.insert(id);
                    }
                    self.events.emit(NodeEvent::Sent {
                        recipient,
                        id: payload_id,
                    });
                    return;
                }
            } else {
                self.forward(Some(sender), recipient, &payload, ForwardKind::Signaling, true)
                    .await;
                return;
            }
        }

        self.forward(Some(sender), recipient, &payload, ForwardKind::Signaling, false)
            .await;
    }

    fn cache_for(&mut self, recipient: NodeId, payload: &Envelope, recipient_in_buckets: bool) {
        let sender = payload.sender_id.unwrap_or(self.self_id);
        match self.cache.cache_message(
            sender,
            recipient,
            payload,
            &self.self_id,
            recipient_in_buckets,
        ) {
            CacheOutcome::Cached(id) => {
                self.events.emit(NodeEvent::MessageCached { id });
            }
            outcome => trace!(?outcome, "message not cached"),
        }
    }

    /// Forward-to-all-closer: relay the payload through every known
    /// peer strictly closer to the recipient than we are, or through
    /// the k closest when `force_k_peers` crosses a local minimum.
    async fn forward(
        &mut self,
        sender: Option<NodeId>,
        recipient: NodeId,
        payload: &Envelope,
        kind: ForwardKind,
        force_k_peers: bool,
    ) {
        if let Some(id) = payload.id
            && self.forwarded_ids.contains(&id)
        {
            debug!(id = %id, "forward suppressed, id already forwarded");
            return;
        }

        let self_dist = self.self_id.xor_distance(&recipient);
        let candidates: Vec<NodeId> = self
            .routing
            .closest(&recipient, self.k)
            .into_iter()
            .filter(|peer| Some(*peer) != sender && *peer != self.self_id)
            .collect();

        let selected: Vec<NodeId> = if force_k_peers {
            candidates
        } else {
            candidates
                .into_iter()
                .filter(|peer| {
                    distance_cmp(&peer.xor_distance(&recipient), &self_dist) == Ordering::Less
                })
                .collect()
        };

        if selected.is_empty() && !force_k_peers {
            warn!(
                recipient = hex::encode(&recipient.as_bytes()[..8]),
                "no peers closer to recipient, forwarding exhausted"
            );
            return;
        }

        // On the wire, user messages carry us as the hop sender while
        // signaling frames keep their original sender.
        let frame_sender = match kind {
            ForwardKind::User => self.self_id,
            ForwardKind::Signaling => sender.unwrap_or(self.self_id),
        };

        for peer in &selected {
            let frame = match kind {
                ForwardKind::User => RpcMessage::user(frame_sender, recipient, payload.clone()),
                ForwardKind::Signaling => {
                    RpcMessage::signaling(frame_sender, recipient, payload.clone())
                }
            };
            if self.rpc.send(*peer, frame).await {
                self.events.emit(NodeEvent::Forwarded {
                    via: *peer,
                    recipient,
                    id: payload.id,
                });
                self.events.emit(NodeEvent::Visualization {
                    kind: "forward".to_string(),
                    detail: json!({
                        "from": self.self_id.to_hex(),
                        "via": peer.to_hex(),
                        "recipient": recipient.to_hex(),
                    }),
                });
            } else {
                debug!(
                    peer = hex::encode(&peer.as_bytes()[..8]),
                    "forward send failed, continuing with remaining peers"
                );
            }
        }

        if let Some(id) = payload.id {
            self.forwarded_ids.insert(id);
        }
    }

    async fn try_deliver_cached(&mut self) {
        if self.cache.count() == 0 {
            return;
        }
        let report = {
            let mut courier = NodeCourier {
                routing: &self.routing,
                rpc: self.rpc.clone(),
            };
            self.cache.try_deliver(&mut courier, self.cache_max_ttl).await
        };

        for id in &report.delivered {
            self.events.emit(NodeEvent::Delivered { id: *id });
        }
        if !report.expired.is_empty() {
            debug!(expired = report.expired.len(), "dropped expired cached messages");
        }
        if report.emptied {
            self.events.emit(NodeEvent::EmptyCache);
        }
    }

    fn cleanup_dedup(&mut self) {
        self.forwarded_ids.prune();
        self.received_signaling_ids.prune();
        trace!(
            forwarded = self.forwarded_ids.len(),
            received_signaling = self.received_signaling_ids.len(),
            "dedup sets pruned"
        );
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn cache_state_path(&self) -> PathBuf {
        self.state_dir
            .join(format!("dht_{}_cachedMessages.json", self.self_id.to_hex()))
    }

    fn bucket_state_path(&self) -> PathBuf {
        self.state_dir
            .join(format!("dht_{}_kBucket.json", self.self_id.to_hex()))
    }

    async fn save_state(&mut self) -> Result<(), Error> {
        let snapshot = self.cache.snapshot();
        let cache_json = serde_json::to_vec(&snapshot)
            .map_err(|e| Error::Persistence(std::io::Error::other(e)))?;
        tokio::fs::write(self.cache_state_path(), cache_json).await?;

        let contacts: Vec<PersistedContact> = self
            .routing
            .all()
            .into_iter()
            .map(|id| PersistedContact { id })
            .collect();
        let bucket_json = serde_json::to_vec(&contacts)
            .map_err(|e| Error::Persistence(std::io::Error::other(e)))?;
        tokio::fs::write(self.bucket_state_path(), bucket_json).await?;

        info!(
            cached = self.cache.count(),
            peers = self.routing.len(),
            "persisted node state"
        );
        Ok(())
    }

    async fn load_state(&mut self) -> Result<(), Error> {
        match tokio::fs::read(self.cache_state_path()).await {
            Ok(bytes) => {
                let entries: Vec<(Uuid, crate::cache::CachedEntry)> =
                    serde_json::from_slice(&bytes)
                        .map_err(|e| Error::Persistence(std::io::Error::other(e)))?;
                let count = entries.len();
                match self.cache.bulk_load(entries) {
                    Ok(()) => debug!(count, "restored cached messages"),
                    Err(e) => warn!(error = %e, "cache strategy did not accept persisted entries"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        match tokio::fs::read(self.bucket_state_path()).await {
            Ok(bytes) => {
                let contacts: Vec<PersistedContact> = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Persistence(std::io::Error::other(e)))?;
                let count = contacts.len();
                // Reloaded contacts are not pinged; liveness is probed
                // as traffic touches them.
                for contact in contacts {
                    self.routing.add(contact.id);
                }
                debug!(count, "restored routing table ids");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }
}

/// Courier the cache replay pass uses: a recipient is deliverable when
/// it sits in the routing table and answers a ping.
struct NodeCourier<'a> {
    routing: &'a RoutingTable,
    rpc: LinkRpc,
}

#[async_trait]
impl DeliveryCourier for NodeCourier<'_> {
    async fn find_and_ping(&mut self, recipient: &NodeId) -> Option<NodeId> {
        if !self.routing.contains(recipient) {
            return None;
        }
        if self.rpc.ping(*recipient).await {
            Some(*recipient)
        } else {
            None
        }
    }

    async fn deliver(
        &mut self,
        target: &NodeId,
        sender: &NodeId,
        recipient: &NodeId,
        payload: &Envelope,
    ) -> bool {
        let frame = RpcMessage::user(*sender, *recipient, payload.clone());
        self.rpc.send(*target, frame).await
    }
}

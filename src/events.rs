//! # Observability Events
//!
//! Every externally observable action of a node is reported as a typed
//! [`NodeEvent`] on a broadcast channel owned by that node. There is no
//! global emitter: subscribers obtain a receiver from the node handle
//! and pattern-match on the variants they care about. Emission is
//! synchronous relative to the producing operation; a lagging subscriber
//! loses old events rather than blocking the node.

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::id::NodeId;
use crate::messages::Envelope;

/// Events buffered per subscriber before lag drops the oldest.
const EVENT_BUFFER: usize = 256;

/// An observable action of a node.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A peer answered its liveness ping after joining the table.
    Ready { node: NodeId },
    /// A user message addressed to this node was delivered.
    ChatMessage { payload: Envelope },
    /// A signaling message addressed to this node was delivered.
    SignalingMessage { payload: Envelope },
    /// A frame was handed directly to a peer's stream.
    Sent { recipient: NodeId, id: Option<Uuid> },
    /// A frame was relayed toward its recipient through a peer.
    Forwarded { via: NodeId, recipient: NodeId, id: Option<Uuid> },
    /// A message was retained for an offline recipient.
    MessageCached { id: Uuid },
    /// A cached message reached its recipient on replay.
    Delivered { id: Uuid },
    /// A replay pass removed the last cached entry.
    EmptyCache,
    /// Free-form datum for external visualization sinks.
    Visualization { kind: String, detail: Value },
}

/// Broadcast sink for [`NodeEvent`]s, owned by the node.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. A send with no live subscribers is a no-op.
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multiple_subscribers_see_the_same_event() {
        let sink = EventSink::new();
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();

        sink.emit(NodeEvent::EmptyCache);

        assert!(matches!(first.recv().await, Ok(NodeEvent::EmptyCache)));
        assert!(matches!(second.recv().await, Ok(NodeEvent::EmptyCache)));
    }

    #[tokio::test]
    async fn emitting_without_subscribers_is_harmless() {
        let sink = EventSink::new();
        sink.emit(NodeEvent::EmptyCache);
        // A subscriber attached afterwards only sees later events.
        let mut rx = sink.subscribe();
        sink.emit(NodeEvent::Delivered { id: Uuid::new_v4() });
        assert!(matches!(rx.recv().await, Ok(NodeEvent::Delivered { .. })));
    }
}

//! # Stream Transport Abstraction
//!
//! The overlay does not open network connections itself. For every peer
//! the connection layer hands it a [`StreamHandle`]: an ordered,
//! reliable, message-oriented channel carrying one UTF-8 JSON text frame
//! per send. In the reference deployment these are WebRTC data channels;
//! here the capability is expressed over tokio channels so any session
//! layer (and the in-process [`memory_link`] used by tests and the demo
//! binary) can supply it.
//!
//! ## Semantics
//!
//! - Frames sent on an open stream arrive in FIFO order or not at all.
//! - `send` on a stream that is not open returns `false`; it never
//!   fails with an error.
//! - Both ends of a link share one state. Closing either side closes
//!   the link, and readers observe the transition via the state watch.
//! - The inbound receiver is taken exactly once by whichever component
//!   owns the stream (the link RPC for `dht` streams, the connection
//!   manager for `pex` streams).

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

/// Frames buffered per direction before senders are backpressured.
const STREAM_BUFFER: usize = 64;

/// Lifecycle of a per-peer stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One end of an ordered reliable message stream.
pub struct StreamHandle {
    label: String,
    peer_tx: mpsc::Sender<String>,
    inbound: Option<mpsc::Receiver<String>>,
    state_tx: Arc<watch::Sender<StreamState>>,
    state_rx: watch::Receiver<StreamState>,
}

impl StreamHandle {
    /// The stream's protocol label (`"dht"` or `"pex"`).
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> StreamState {
        *self.state_rx.borrow()
    }

    /// A watch over the stream state, for readers that must wake on
    /// close.
    pub fn state_watch(&self) -> watch::Receiver<StreamState> {
        self.state_rx.clone()
    }

    /// Hand one frame to the transport.
    ///
    /// Returns `true` when the stream was open and accepted the frame,
    /// `false` otherwise. A send that discovers the remote end gone
    /// marks the link closed.
    pub async fn send(&self, frame: String) -> bool {
        if self.state() != StreamState::Open {
            return false;
        }
        if self.peer_tx.send(frame).await.is_err() {
            let _ = self.state_tx.send(StreamState::Closed);
            return false;
        }
        true
    }

    /// Take the inbound frame receiver. Yields `None` after the first
    /// call.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<String>> {
        self.inbound.take()
    }

    /// Close the link. Both ends observe the transition.
    pub fn close(&self) {
        let _ = self.state_tx.send(StreamState::Closed);
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

/// An in-process pair of connected stream handles, both open.
pub fn memory_link(label: &str) -> (StreamHandle, StreamHandle) {
    let (a_tx, a_rx) = mpsc::channel(STREAM_BUFFER);
    let (b_tx, b_rx) = mpsc::channel(STREAM_BUFFER);
    let (state_tx, state_rx) = watch::channel(StreamState::Open);
    let state_tx = Arc::new(state_tx);

    let left = StreamHandle {
        label: label.to_string(),
        peer_tx: a_tx,
        inbound: Some(b_rx),
        state_tx: state_tx.clone(),
        state_rx: state_rx.clone(),
    };
    let right = StreamHandle {
        label: label.to_string(),
        peer_tx: b_tx,
        inbound: Some(a_rx),
        state_tx,
        state_rx,
    };
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (a, mut b) = memory_link("dht");
        let mut inbound = b.take_inbound().unwrap();

        assert!(a.send("one".into()).await);
        assert!(a.send("two".into()).await);

        assert_eq!(inbound.recv().await.as_deref(), Some("one"));
        assert_eq!(inbound.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn send_after_close_returns_false() {
        let (a, b) = memory_link("dht");
        b.close();
        assert_eq!(a.state(), StreamState::Closed);
        assert!(!a.send("late".into()).await);
    }

    #[tokio::test]
    async fn inbound_taken_once() {
        let (_a, mut b) = memory_link("pex");
        assert!(b.take_inbound().is_some());
        assert!(b.take_inbound().is_none());
    }

    #[tokio::test]
    async fn close_wakes_state_watchers() {
        let (a, b) = memory_link("dht");
        let mut watch = a.state_watch();
        let waiter = tokio::spawn(async move {
            while *watch.borrow() != StreamState::Closed {
                if watch.changed().await.is_err() {
                    break;
                }
            }
        });
        b.close();
        waiter.await.unwrap();
        assert_eq!(a.state(), StreamState::Closed);
    }
}

//! # Gabble - Routing Overlay for Decentralized Chat
//!
//! Gabble is the peer-to-peer core of a decentralized chat/matchmaking
//! application: a Kademlia-style DHT running over ordered reliable
//! per-peer byte streams (browserless WebRTC in the reference
//! deployment), with a store-and-forward cache that keeps messages
//! alive while their recipient is offline.
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for every stateful
//! component: a cheap-to-clone public Handle communicates with a
//! private actor over async channels, and the actor owns all mutable
//! state, processing commands sequentially.
//!
//! Scope boundaries: the cryptographic envelope, the WebRTC session
//! layer and the UI sink are external collaborators. The overlay
//! consumes abstract streams, treats payloads as opaque JSON and emits
//! typed events.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `id` | 160-bit identifiers, XOR metric, bucket indexing |
//! | `dht` | Routing table, forwarding strategy, node actor |
//! | `rpc` | Per-link RPC: framing, ping/pong, dispatch |
//! | `cache` | Distance-bounded store-and-forward cache strategies |
//! | `pex` | Connection manager: peer exchange, min-peer upkeep |
//! | `transport` | Ordered reliable stream abstraction + memory links |
//! | `messages` | JSON wire types for the `dht` and `pex` streams |
//! | `events` | Typed observability events |

pub mod cache;
pub mod dht;
pub mod error;
pub mod events;
pub mod id;
pub mod messages;
pub mod node;
pub mod pex;
pub mod rpc;
pub mod transport;

pub use cache::{CacheStrategy, CacheStrategyKind, CachedEntry};
pub use dht::{DhtConfig, DhtNode, DhtStats, RoutingTable, DEFAULT_K, MAX_RECEIVED_IDS};
pub use error::Error;
pub use events::NodeEvent;
pub use id::NodeId;
pub use messages::{Envelope, PeerDto, PexMessage, RpcMessage};
pub use node::{Overlay, OverlayConfig};
pub use pex::{ConnectionConfig, ConnectionManager, PeerConnector, PeerDirectory};
pub use transport::{memory_link, StreamHandle, StreamState};

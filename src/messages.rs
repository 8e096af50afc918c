//! # Wire Protocol Messages
//!
//! All frames exchanged by the overlay are UTF-8 JSON text on a per-peer
//! ordered reliable stream. This module defines the serializable types
//! for both wire protocols and the bounded decode helpers.
//!
//! ## Protocol Types
//!
//! | Stream label | Types |
//! |--------------|-------|
//! | `dht` | [`RpcMessage`] (`ping`, `pong`, `message`, `signaling`) |
//! | `pex` | [`PexMessage`] (`request`, `advertisement`) |
//!
//! ## Envelopes
//!
//! Chat and signaling payloads are opaque to the overlay. The only
//! fields the core reads are `id` (dedup and caching), `timestamp` (TTL
//! expiry) and `senderId` (forwarding origin on user messages); every
//! other field is carried through untouched.
//!
//! ## Limits
//!
//! Frames larger than [`MAX_FRAME_LEN`] are rejected before parsing to
//! bound memory spent on a single peer's input.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::id::NodeId;

/// Maximum accepted frame length in bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Milliseconds since the Unix epoch, the timestamp unit envelopes use.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An opaque chat or signaling payload.
///
/// `extra` captures every field the overlay does not interpret, so
/// payloads survive forwarding and caching with their full content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "senderId", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<NodeId>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    /// A fresh user-message envelope originated by `sender_id`.
    pub fn chat(sender_id: NodeId) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            timestamp: Some(now_millis()),
            sender_id: Some(sender_id),
            extra: serde_json::Map::new(),
        }
    }

    /// A fresh signaling envelope.
    pub fn signaling() -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            timestamp: Some(now_millis()),
            sender_id: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Attach an opaque field.
    pub fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

/// A frame on the `dht` stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RpcMessage {
    Ping {
        sender: NodeId,
        id: Uuid,
    },
    Pong {
        sender: NodeId,
        id: Uuid,
    },
    Message {
        sender: NodeId,
        recipient: NodeId,
        message: Option<Envelope>,
        #[serde(rename = "signalingMessage")]
        signaling_message: Option<Envelope>,
    },
    Signaling {
        sender: NodeId,
        recipient: NodeId,
        message: Option<Envelope>,
        #[serde(rename = "signalingMessage")]
        signaling_message: Option<Envelope>,
    },
}

impl RpcMessage {
    /// Build a `message` frame carrying a user envelope.
    pub fn user(sender: NodeId, recipient: NodeId, payload: Envelope) -> Self {
        RpcMessage::Message {
            sender,
            recipient,
            message: Some(payload),
            signaling_message: None,
        }
    }

    /// Build a `signaling` frame carrying a signaling envelope.
    pub fn signaling(sender: NodeId, recipient: NodeId, payload: Envelope) -> Self {
        RpcMessage::Signaling {
            sender,
            recipient,
            message: None,
            signaling_message: Some(payload),
        }
    }

    pub fn sender(&self) -> NodeId {
        match self {
            RpcMessage::Ping { sender, .. }
            | RpcMessage::Pong { sender, .. }
            | RpcMessage::Message { sender, .. }
            | RpcMessage::Signaling { sender, .. } => *sender,
        }
    }

    /// The envelope a routed frame carries, if any.
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            RpcMessage::Message { message, .. } => message.as_ref(),
            RpcMessage::Signaling {
                signaling_message, ..
            } => signaling_message.as_ref(),
            _ => None,
        }
    }
}

/// A frame on the `pex` stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PexMessage {
    Request {
        #[serde(rename = "maxNumberOfPeers")]
        max_number_of_peers: usize,
    },
    Advertisement {
        peers: Vec<PeerDto>,
    },
}

/// A peer advertised over PEX.
///
/// The overlay routes on `peerId` and hands `publicKey` to the
/// connection layer; profile fields (age, sex, searching, coordinates)
/// pass through opaquely.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerDto {
    #[serde(rename = "peerId")]
    pub peer_id: NodeId,
    #[serde(rename = "publicKey", default)]
    pub public_key: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Encode a frame for transmission.
pub fn encode<T: Serialize>(frame: &T) -> String {
    // Infallible for the frame types in this module.
    serde_json::to_string(frame).unwrap_or_default()
}

/// Decode an inbound frame, enforcing the size bound before parsing.
pub fn decode<T: serde::de::DeserializeOwned>(frame: &str) -> Result<T, Error> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(Error::InvalidFrame(serde::de::Error::custom(format!(
            "frame of {} bytes exceeds limit of {}",
            frame.len(),
            MAX_FRAME_LEN
        ))));
    }
    Ok(serde_json::from_str(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(index: u8) -> NodeId {
        let mut bytes = [0u8; crate::id::ID_LEN];
        bytes[crate::id::ID_LEN - 1] = index;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn ping_frame_shape() {
        let ping = RpcMessage::Ping {
            sender: node(1),
            id: Uuid::new_v4(),
        };
        let json: serde_json::Value = serde_json::from_str(&encode(&ping)).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["sender"], node(1).to_hex());
        assert!(json["id"].is_string());
    }

    #[test]
    fn message_frame_carries_null_signaling_slot() {
        let frame = RpcMessage::user(node(1), node(2), Envelope::chat(node(1)));
        let json: serde_json::Value = serde_json::from_str(&encode(&frame)).unwrap();
        assert_eq!(json["type"], "message");
        assert!(json["message"].is_object());
        assert!(json["signalingMessage"].is_null());
    }

    #[test]
    fn envelope_preserves_opaque_fields() {
        let text = r#"{"id":"6a3d8a31-48a4-4a5a-9f5a-111111111111","timestamp":5,
                       "senderId":"0000000000000000000000000000000000000001",
                       "body":"hi","nick":"ada"}"#;
        let env: Envelope = serde_json::from_str(text).unwrap();
        assert_eq!(env.extra["body"], "hi");

        let round: Envelope = serde_json::from_str(&encode(&env)).unwrap();
        assert_eq!(round, env);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(decode::<RpcMessage>("not json").is_err());
        assert!(decode::<RpcMessage>(r#"{"type":"mystery"}"#).is_err());
        assert!(decode::<RpcMessage>(r#"{"type":"ping","sender":"zz","id":"x"}"#).is_err());
    }

    #[test]
    fn oversized_frames_are_rejected_before_parsing() {
        let huge = format!(r#"{{"type":"ping","pad":"{}"}}"#, "x".repeat(MAX_FRAME_LEN));
        assert!(decode::<RpcMessage>(&huge).is_err());
    }

    #[test]
    fn pex_frames_round_trip() {
        let req = PexMessage::Request {
            max_number_of_peers: 4,
        };
        let json: serde_json::Value = serde_json::from_str(&encode(&req)).unwrap();
        assert_eq!(json["maxNumberOfPeers"], 4);

        let ad_text = r#"{"type":"advertisement","peers":[
            {"peerId":"0000000000000000000000000000000000000002",
             "publicKey":"pk","age":30,"sex":"f","searching":"m",
             "x":0.5,"y":0.25,"latitude":52.5,"longitude":13.4}]}"#;
        let ad: PexMessage = decode(ad_text).unwrap();
        match ad {
            PexMessage::Advertisement { peers } => {
                assert_eq!(peers[0].peer_id, node(2));
                assert_eq!(peers[0].public_key, "pk");
                assert_eq!(peers[0].extra["age"], 30);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}

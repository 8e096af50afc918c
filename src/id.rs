//! # Node Identifiers and XOR Metric
//!
//! This module defines the core identifier type used throughout the
//! overlay:
//!
//! - [`NodeId`]: a 160-bit opaque identifier (20 bytes), derived by the
//!   external crypto layer and treated here as an opaque byte string
//! - XOR distance between identifiers, compared big-endian
//! - [`bucket_index`]: the routing-table bucket an identifier falls into
//! - [`truncated_distance`]: the 48 most significant distance bits as an
//!   unsigned integer, used for cache admission
//!
//! ## Identity Model
//!
//! The overlay never inspects identifier contents. Equality, XOR and
//! big-endian comparison are the only operations routing needs; anything
//! cryptographic (key derivation, signatures) belongs to the external
//! crypto collaborator.
//!
//! On the wire and in file names, identifiers are lowercase hex strings
//! (40 characters).

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Length of a node identifier in bytes (160 bits).
pub const ID_LEN: usize = 20;

/// Number of routing buckets: one per possible highest-set-bit position.
pub const ID_BITS: usize = ID_LEN * 8;

/// A 160-bit node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse an identifier from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let arr: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidId(format!("{} bytes, expected {}", bytes.len(), ID_LEN)))?;
        Ok(Self(arr))
    }

    /// Parse an identifier from a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidId(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Bytewise XOR distance to another identifier.
    pub fn xor_distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut dist = [0u8; ID_LEN];
        for (i, byte) in dist.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        dist
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}…)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Compare two distances big-endian, equivalent to unsigned integer
/// compare. This is the tiebreak order for "closest".
pub fn distance_cmp(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Bucket index of a distance: the position of its highest-order set
/// bit, counting from the most significant bit of byte 0.
///
/// The zero distance (self) maps to index 0 by convention; the self id
/// is never stored in any bucket.
pub fn bucket_index(dist: &[u8; ID_LEN]) -> usize {
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    0
}

/// The 48 most significant bits of a distance as an unsigned integer.
///
/// Used by the message cache to decide whether this node is close enough
/// to the recipient to act as a guardian.
pub fn truncated_distance(dist: &[u8; ID_LEN]) -> u64 {
    let mut value = 0u64;
    for byte in &dist[..6] {
        value = (value << 8) | *byte as u64;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[ID_LEN - 1] = index;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn xor_symmetry_and_identity() {
        let a = id(1);
        let b = id(7);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; ID_LEN]);
    }

    #[test]
    fn hex_round_trip() {
        let a = NodeId::from_hex("00112233445566778899aabbccddeeff00112233").unwrap();
        assert_eq!(NodeId::from_hex(&a.to_hex()).unwrap(), a);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(NodeId::from_hex("0011"), Err(Error::InvalidId(_))));
        assert!(matches!(NodeId::from_slice(&[0u8; 19]), Err(Error::InvalidId(_))));
        assert!(matches!(NodeId::from_hex("zz"), Err(Error::InvalidId(_))));
    }

    #[test]
    fn bucket_index_tracks_highest_bit() {
        let mut dist = [0u8; ID_LEN];
        dist[0] = 0x80;
        assert_eq!(bucket_index(&dist), 0);

        dist[0] = 0x01;
        assert_eq!(bucket_index(&dist), 7);

        let mut low = [0u8; ID_LEN];
        low[ID_LEN - 1] = 0x01;
        assert_eq!(bucket_index(&low), ID_BITS - 1);

        assert_eq!(bucket_index(&[0u8; ID_LEN]), 0);
    }

    #[test]
    fn distance_compare_is_big_endian() {
        let mut a = [0u8; ID_LEN];
        let mut b = [0u8; ID_LEN];
        a[0] = 1;
        b[1] = 0xff;
        assert_eq!(distance_cmp(&a, &b), std::cmp::Ordering::Greater);
        assert_eq!(distance_cmp(&b, &a), std::cmp::Ordering::Less);
        assert_eq!(distance_cmp(&a, &a), std::cmp::Ordering::Equal);
    }

    #[test]
    fn truncation_keeps_the_first_48_bits() {
        let mut dist = [0u8; ID_LEN];
        dist[5] = 0x01;
        assert_eq!(truncated_distance(&dist), 1);

        dist[0] = 0x80;
        assert_eq!(truncated_distance(&dist), (1 << 47) | 1);

        // Bits past the 48th do not contribute.
        dist[7] = 0xff;
        assert_eq!(truncated_distance(&dist), (1 << 47) | 1);
    }

    #[test]
    fn serde_uses_hex_strings() {
        let a = id(0x2a);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, format!("\"{}\"", a.to_hex()));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}

//! # XOR Keyspace
//!
//! Every routing decision in the DHT happens in a single 256-bit keyspace.
//! Raw keys and peer identifiers are both mapped into it with BLAKE3, so a
//! record key and the peers that should hold it are directly comparable:
//!
//! - [`hash_id`]: map arbitrary bytes to a [`KeyspaceId`]
//! - [`KeyspaceId::distance`]: XOR distance between two keyspace points
//! - [`distance_cmp`]: big-endian total order on distances
//! - [`KeyspaceId::common_prefix_len`]: shared leading bits, in `[0, 256]`
//!
//! Determinism matters here: two nodes must agree on hash, distance and CPL
//! for the same inputs, so everything below is pure byte arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of the keyspace in bits.
pub const KEYSPACE_BITS: u32 = 256;

/// Opaque peer identifier.
///
/// The bytes themselves carry no structure the routing core relies on; a
/// peer's position in the keyspace is always `hash_id(peer.as_bytes())`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The peer's position in the XOR keyspace.
    pub fn keyspace_id(&self) -> KeyspaceId {
        hash_id(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A point in the 256-bit XOR keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyspaceId([u8; 32]);

/// XOR distance between two keyspace points, interpreted big-endian.
pub type Distance = [u8; 32];

/// Hash arbitrary bytes into the keyspace.
pub fn hash_id(bytes: &[u8]) -> KeyspaceId {
    KeyspaceId(*blake3::hash(bytes).as_bytes())
}

impl KeyspaceId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn distance(&self, other: &KeyspaceId) -> Distance {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading bits shared with `other`, in `[0, 256]`.
    ///
    /// `256` only when the two ids are identical.
    pub fn common_prefix_len(&self, other: &KeyspaceId) -> u32 {
        let mut cpl = 0u32;
        for i in 0..32 {
            let diff = self.0[i] ^ other.0[i];
            if diff != 0 {
                return cpl + diff.leading_zeros();
            }
            cpl += 8;
        }
        cpl
    }
}

impl fmt::Debug for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyspaceId({})", hex::encode(&self.0[..8]))
    }
}

/// Compare two XOR distances as big-endian unsigned integers.
pub fn distance_cmp(a: &Distance, b: &Distance) -> std::cmp::Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn hash_id_is_deterministic() {
        assert_eq!(hash_id(b"some key"), hash_id(b"some key"));
        assert_ne!(hash_id(b"some key"), hash_id(b"other key"));
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = hash_id(b"a");
        let b = hash_id(b"b");
        assert_eq!(a.distance(&a), [0u8; 32]);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn distance_cmp_orders_big_endian() {
        let mut near = [0u8; 32];
        near[31] = 1;
        let mut far = [0u8; 32];
        far[0] = 1;
        assert_eq!(distance_cmp(&near, &far), Ordering::Less);
        assert_eq!(distance_cmp(&far, &near), Ordering::Greater);
        assert_eq!(distance_cmp(&near, &near), Ordering::Equal);
    }

    #[test]
    fn cpl_counts_shared_leading_bits() {
        let a = KeyspaceId::from_bytes([0u8; 32]);
        let mut bytes = [0u8; 32];
        bytes[0] = 0b0000_1000;
        let b = KeyspaceId::from_bytes(bytes);
        assert_eq!(a.common_prefix_len(&b), 4);
        assert_eq!(a.common_prefix_len(&a), KEYSPACE_BITS);

        let mut deep = [0u8; 32];
        deep[20] = 0x01;
        let c = KeyspaceId::from_bytes(deep);
        assert_eq!(a.common_prefix_len(&c), 20 * 8 + 7);
    }

    #[test]
    fn cpl_is_symmetric() {
        let a = hash_id(b"left");
        let b = hash_id(b"right");
        assert_eq!(a.common_prefix_len(&b), b.common_prefix_len(&a));
    }
}

// Peer and topic identifiers
//
// Both are 32-byte public keys. Byte-wise ordering is identical to the
// lowercase hex ordering, which the offer tie-break relies on.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a key in bytes
pub const KEY_LENGTH: usize = 32;

/// 256-bit public key identifying a peer or a topic
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; KEY_LENGTH]);

/// Identifier of a peer in a swarm
pub type PeerId = PublicKey;

/// Identifier of a swarm
pub type Topic = PublicKey;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
    #[error("Invalid key length: expected {KEY_LENGTH} bytes, got {0}")]
    InvalidLength(usize),
}

impl PublicKey {
    /// Wrap raw key bytes
    pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Generate a random key
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; KEY_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log output
    pub fn truncate(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// XOR distance to another key, as a big-endian 256-bit integer
    pub fn distance(&self, other: &PublicKey) -> [u8; KEY_LENGTH] {
        let mut out = [0u8; KEY_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let array: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Ok(Self(array))
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", self.truncate())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let key = PublicKey::random();
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<PublicKey>().unwrap(), key);
    }

    #[test]
    fn test_ordering_matches_hex_ordering() {
        for _ in 0..64 {
            let a = PublicKey::random();
            let b = PublicKey::random();
            assert_eq!(a.cmp(&b), a.to_hex().cmp(&b.to_hex()));
        }
    }

    #[test]
    fn test_distance() {
        let a = PublicKey::from_bytes([0u8; KEY_LENGTH]);
        let mut near = [0u8; KEY_LENGTH];
        near[31] = 1;
        let mut far = [0u8; KEY_LENGTH];
        far[0] = 1;
        let near = PublicKey::from_bytes(near);
        let far = PublicKey::from_bytes(far);

        assert!(a.distance(&near) < a.distance(&far));
        assert_eq!(a.distance(&a), [0u8; KEY_LENGTH]);
        assert_eq!(near.distance(&far), far.distance(&near));
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(
            "abcd".parse::<PublicKey>(),
            Err(KeyError::InvalidLength(2))
        ));
        assert!(matches!(
            "zz".parse::<PublicKey>(),
            Err(KeyError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let key = PublicKey::random();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}

//! Curve25519 node identity keys.
//!
//! Text forms follow the DERP conventions: `privkey:<hex>` for private keys
//! and `nodekey:<hex>` for public keys, both 64 lowercase hex digits.

use crate::error::KeyError;
use rand::rngs::OsRng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Length in bytes of both private and public node keys.
pub const KEY_LEN: usize = 32;

const PRIVATE_PREFIX: &str = "privkey:";
const PUBLIC_PREFIX: &str = "nodekey:";

fn decode_key(text: &str, prefix: &'static str) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
    let body = text
        .strip_prefix(prefix)
        .ok_or(KeyError::MissingPrefix { expected: prefix })?;
    let raw = Zeroizing::new(hex::decode(body)?);
    if raw.len() != KEY_LEN {
        return Err(KeyError::InvalidLength(raw.len()));
    }
    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    bytes.copy_from_slice(&raw);
    Ok(bytes)
}

/// A node's private key.
///
/// The secret is zeroized on drop and never printed by `Debug`.
#[derive(Clone)]
pub struct NodePrivate(StaticSecret);

impl NodePrivate {
    /// Generate a fresh private key from the OS random source.
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    /// Create a private key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Get the raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.0.as_bytes()
    }

    /// Derive the public half.
    pub fn public(&self) -> NodePublic {
        NodePublic(PublicKey::from(&self.0).to_bytes())
    }

    /// Text form, `privkey:<hex>`.
    pub fn to_text(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("{PRIVATE_PREFIX}{}", hex::encode(self.as_bytes())))
    }
}

impl PartialEq for NodePrivate {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for NodePrivate {}

impl fmt::Debug for NodePrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePrivate(public={:?})", self.public())
    }
}

impl FromStr for NodePrivate {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_key(s, PRIVATE_PREFIX)?;
        Ok(Self::from_bytes(*bytes))
    }
}

impl Serialize for NodePrivate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_text())
    }
}

impl<'de> Deserialize<'de> for NodePrivate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = Zeroizing::new(String::deserialize(deserializer)?);
        text.parse().map_err(de::Error::custom)
    }
}

/// A node's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePublic([u8; KEY_LEN]);

impl NodePublic {
    /// Create a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Hex without the `nodekey:` prefix, as sent in `Derp-Public-Key`.
    pub fn untyped_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PUBLIC_PREFIX}{}", self.untyped_hex())
    }
}

impl fmt::Debug for NodePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePublic({})", &self.untyped_hex()[..8])
    }
}

impl FromStr for NodePublic {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_key(s, PUBLIC_PREFIX)?;
        Ok(Self(*bytes))
    }
}

impl Serialize for NodePublic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodePublic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        let a = NodePrivate::generate();
        let b = NodePrivate::generate();
        assert_ne!(a, b);
        assert_ne!(a.public(), b.public());
    }

    #[test]
    fn private_text_roundtrip() {
        let key = NodePrivate::generate();
        let text = key.to_text();
        assert!(text.starts_with("privkey:"));
        assert_eq!(text.len(), "privkey:".len() + 64);

        let parsed: NodePrivate = text.parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.public(), key.public());
    }

    #[test]
    fn public_display_has_prefix() {
        let public = NodePublic::from_bytes([0xab; 32]);
        assert_eq!(public.to_string(), format!("nodekey:{}", "ab".repeat(32)));
        assert_eq!(public.untyped_hex(), "ab".repeat(32));
        assert_eq!(format!("{public:?}"), "NodePublic(abababab)");
    }

    #[test]
    fn parse_rejects_wrong_prefix() {
        let text = format!("nodekey:{}", "00".repeat(32));
        assert_eq!(
            text.parse::<NodePrivate>().unwrap_err(),
            KeyError::MissingPrefix { expected: "privkey:" }
        );
    }

    #[test]
    fn parse_rejects_short_key() {
        let err = "nodekey:abcd".parse::<NodePublic>().unwrap_err();
        assert_eq!(err, KeyError::InvalidLength(2));
    }

    #[test]
    fn debug_does_not_leak_private_bytes() {
        let key = NodePrivate::from_bytes([0x11; 32]);
        let debug = format!("{key:?}");
        assert!(!debug.contains(&"11".repeat(16)));
        assert!(debug.starts_with("NodePrivate(public="));
    }

    #[test]
    fn serde_uses_text_form() {
        let key = NodePrivate::generate();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_text().as_str()));

        let back: NodePrivate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);

        let public = key.public();
        let json = serde_json::to_string(&public).unwrap();
        let back: NodePublic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, public);
    }
}

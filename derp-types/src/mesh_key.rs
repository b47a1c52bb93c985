//! Mesh pre-shared key.

use crate::error::MeshKeyError;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Number of hex digits in a mesh key.
const MESH_KEY_HEX_LEN: usize = 64;

/// The secret shared by every relay in a mesh.
///
/// Valid keys are exactly 64 lowercase hex digits. Uppercase hex is rejected
/// so that every relay compares the same canonical text.
#[derive(Clone, PartialEq, Eq)]
pub struct MeshKey(Zeroizing<String>);

impl MeshKey {
    /// Validate and wrap a mesh key.
    pub fn parse(text: &str) -> Result<Self, MeshKeyError> {
        if !Self::is_valid(text) {
            return Err(MeshKeyError::Malformed);
        }
        Ok(Self(Zeroizing::new(text.to_owned())))
    }

    /// Whether `text` is a well-formed mesh key.
    pub fn is_valid(text: &str) -> bool {
        text.len() == MESH_KEY_HEX_LEN
            && text
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// The key in its canonical hex text form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MeshKey {
    type Err = MeshKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for MeshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MeshKey(..)")
    }
}

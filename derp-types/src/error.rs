//! Error types for meshderp wire types.

use thiserror::Error;

/// Errors parsing node keys.
#[derive(Debug, Error, PartialEq)]
pub enum KeyError {
    /// The text form is missing its type prefix.
    #[error("key must start with {expected:?}")]
    MissingPrefix {
        /// The prefix that was expected.
        expected: &'static str,
    },

    /// The key body is not valid hex.
    #[error("key is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// The decoded key has the wrong length.
    #[error("key must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Errors validating a mesh pre-shared key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeshKeyError {
    /// The key is not exactly 64 lowercase hex digits.
    #[error("key must contain exactly 64 hex digits")]
    Malformed,
}

/// Errors decoding STUN datagrams.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    /// Not a STUN message at all.
    #[error("not a STUN message")]
    NotStun,

    /// A STUN message, but not a binding request.
    #[error("not a STUN binding request")]
    NotBindingRequest,

    /// A STUN message, but not a binding success response.
    #[error("not a STUN binding response")]
    NotBindingResponse,

    /// Attribute TLVs overrun the message.
    #[error("malformed STUN attributes")]
    MalformedAttributes,

    /// The last attribute is not FINGERPRINT.
    #[error("STUN request lacks a fingerprint")]
    NoFingerprint,

    /// FINGERPRINT does not match the message.
    #[error("STUN request has the wrong fingerprint")]
    WrongFingerprint,

    /// No usable (XOR-)MAPPED-ADDRESS attribute.
    #[error("STUN response lacks a mapped address")]
    NoMappedAddress,
}

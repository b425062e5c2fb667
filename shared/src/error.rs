//! Error types for protocol operations

use thiserror::Error;

/// Errors that can occur in the cryptographic and wire layers
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A signature check failed; the peer's key material cannot be trusted.
    /// Fatal for session establishment; never retried silently.
    #[error("Cannot verify this contact's keys")]
    Authenticity,

    /// Encryption failure
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Decryption failure (corrupted ciphertext, replay past the skip
    /// window, or a session the peer has since rotated away from). The
    /// ratchet is never rewound to retry.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Key derivation failure
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Malformed or incomplete key bundle
    #[error("Invalid key bundle: {0}")]
    InvalidBundle(String),

    /// A handshake referenced a pre-key id this device does not hold
    #[error("Unknown pre-key id: {0}")]
    UnknownPreKey(u32),

    /// Ratchet state desynchronization
    #[error("Ratchet error: {0}")]
    Ratchet(String),

    /// Serialization or persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// A frame that failed validation at the wire boundary
    #[error("Wire error: {0}")]
    Wire(String),
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

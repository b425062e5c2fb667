//! Sotto protocol core
//!
//! Cryptographic and wire-level building blocks shared by the Sotto client
//! and server: identity keys, per-device key bundles, the X3DH handshake,
//! the Double Ratchet message cipher, ciphertext envelopes, and the typed
//! frame protocol.

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod bundle;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod ratchet;
pub mod wire;
pub mod x3dh;

pub use bundle::{generate_device_keys, KeyBundle, OneTimePreKey, PrivatePreKeys, SignedPreKey};
pub use envelope::{chat_id, unix_timestamp, Ciphertext, CiphertextKind, Envelope, MessageMeta};
pub use error::{ProtocolError, Result};
pub use keys::{
    generate_identity, generate_registration_id, seal_identity, unseal_identity, IdentityKey,
};
pub use ratchet::{DoubleRatchet, MessageKey, RatchetHeader};
pub use x3dh::{Handshake, HandshakeInfo};

use subtle::ConstantTimeEq;

/// Version of the wire protocol
pub const PROTOCOL_VERSION: u8 = 1;

/// Constant-time comparison of byte arrays
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

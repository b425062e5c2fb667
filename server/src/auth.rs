//! Authentication utilities

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

pub use sotto_shared::wire::AUTH_CONTEXT;

/// Verify a challenge signature.
///
/// Used for WebSocket authentication: the device must sign
/// `AUTH_CONTEXT || nonce` with its Ed25519 identity key. Identity and
/// device ids themselves are vouched for by the auth layer in front of
/// this server; what is checked here is possession of the claimed key.
pub fn verify_challenge(pubkey_bytes: &[u8], signature_bytes: &[u8], challenge: &[u8]) -> bool {
    let pubkey_array: [u8; 32] = match pubkey_bytes.try_into() {
        Ok(arr) => arr,
        Err(_) => return false,
    };

    let pubkey = match VerifyingKey::from_bytes(&pubkey_array) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let sig_array: [u8; 64] = match signature_bytes.try_into() {
        Ok(arr) => arr,
        Err(_) => return false,
    };

    let signature = Signature::from_bytes(&sig_array);

    pubkey.verify_strict(challenge, &signature).is_ok()
}

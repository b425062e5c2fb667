//! Public key bundles and the private pre-key material behind them
//!
//! A bundle is the public face of one device: everything a stranger needs
//! to start an authenticated session with it. Bundles are published to the
//! server as a single mutable row per `(uid, device_id)` and fetched by
//! peers during session establishment.

use crate::error::{ProtocolError, Result};
use crate::keys::IdentityKey;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Signed pre-key: a medium-lived X25519 key vouched for by the identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Key id, unique per device
    pub id: u32,
    /// X25519 public key bytes
    pub public: [u8; 32],
    /// Ed25519 signature over `public` by the device's identity key (64 bytes)
    pub signature: Vec<u8>,
}

/// Single-use X25519 pre-key. The server deletes each one as it hands it out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Key id, unique per device
    pub id: u32,
    /// X25519 public key bytes
    pub public: [u8; 32],
}

/// Public pre-key bundle for one `(uid, device_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBundle {
    /// Owning identity
    pub uid: String,
    /// Device the bundle belongs to
    pub device_id: u32,
    /// Registration id generated with the device's identity
    pub registration_id: u32,
    /// Ed25519 identity public key; verifies the signed pre-key and goes
    /// into the session's associated data
    pub identity_key: [u8; 32],
    /// X25519 identity public key, used directly in DH calculations
    pub identity_dh_key: [u8; 32],
    /// Current signed pre-key
    pub signed_pre_key: SignedPreKey,
    /// Remaining one-time pre-keys. A bundle served for establishment
    /// carries at most one (the server consumes it on fetch).
    pub one_time_pre_keys: Vec<OneTimePreKey>,
}

impl KeyBundle {
    /// Check required fields without any cryptography.
    pub fn validate(&self) -> Result<()> {
        if self.uid.is_empty() {
            return Err(ProtocolError::InvalidBundle("empty uid".into()));
        }
        if self.registration_id == 0 {
            return Err(ProtocolError::InvalidBundle("zero registration id".into()));
        }
        if self.signed_pre_key.signature.len() != 64 {
            return Err(ProtocolError::InvalidBundle(format!(
                "signature must be 64 bytes, got {}",
                self.signed_pre_key.signature.len()
            )));
        }
        Ok(())
    }

    /// Parse the Ed25519 identity key.
    pub fn identity_verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.identity_key)
            .map_err(|_| ProtocolError::InvalidKey("malformed identity key".into()))
    }

    /// Verify that the signed pre-key was signed by the bundle's identity key.
    ///
    /// Failure means the bundle was tampered with or mis-assembled and the
    /// peer cannot be authenticated. Callers must treat this as fatal.
    pub fn verify(&self) -> Result<()> {
        self.validate()?;
        let identity = self.identity_verifying_key()?;
        let sig_bytes: [u8; 64] = self
            .signed_pre_key
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::Authenticity)?;
        let signature = Signature::from_bytes(&sig_bytes);
        identity
            .verify(&self.signed_pre_key.public, &signature)
            .map_err(|_| ProtocolError::Authenticity)
    }

    /// Stable digest of the handshake-relevant bundle contents.
    ///
    /// Two bundles with the same fingerprint derive the same session; a
    /// changed fingerprint means the peer rotated keys and any existing
    /// session with that device is stale.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.identity_key);
        hasher.update(self.identity_dh_key);
        hasher.update(self.signed_pre_key.id.to_le_bytes());
        hasher.update(self.signed_pre_key.public);
        hasher.finalize().into()
    }
}

/// One-time pre-key secret held in the local vault.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct OneTimePreKeySecret {
    /// Matches the id published in the bundle
    #[zeroize(skip)]
    pub id: u32,
    /// X25519 secret
    pub secret: StaticSecret,
}

/// Private pre-key material for one device. Never leaves the vault.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PrivatePreKeys {
    /// Id of the current signed pre-key
    #[zeroize(skip)]
    pub signed_pre_key_id: u32,
    /// Signed pre-key secret
    pub signed_pre_key: StaticSecret,
    /// Remaining one-time pre-key secrets, looked up by id when a peer's
    /// first message references one
    #[zeroize(skip)]
    pub one_time_pre_keys: Vec<OneTimePreKeySecret>,
}

impl PrivatePreKeys {
    /// Find (without removing) a one-time pre-key secret by id.
    pub fn one_time_secret(&self, id: u32) -> Option<&StaticSecret> {
        self.one_time_pre_keys
            .iter()
            .find(|k| k.id == id)
            .map(|k| &k.secret)
    }
}

/// Generate the full pre-key set for a device: the publishable bundle and
/// the private half that stays in the vault.
pub fn generate_device_keys(
    identity: &IdentityKey,
    uid: &str,
    device_id: u32,
    registration_id: u32,
    one_time_count: usize,
) -> (KeyBundle, PrivatePreKeys) {
    let signed_pre_key_id: u32 = (rand::random::<u32>() % 0xFFFFFE) + 1;
    let signed_secret = StaticSecret::random_from_rng(&mut OsRng);
    let signed_public = X25519PublicKey::from(&signed_secret);
    let signature = identity.sign(signed_public.as_bytes());

    let id_base: u32 = (rand::random::<u32>() % 0xFFFF00) + 1;
    let mut one_time_public = Vec::with_capacity(one_time_count);
    let mut one_time_private = Vec::with_capacity(one_time_count);
    for i in 0..one_time_count {
        let id = id_base + i as u32;
        let secret = StaticSecret::random_from_rng(&mut OsRng);
        one_time_public.push(OneTimePreKey {
            id,
            public: *X25519PublicKey::from(&secret).as_bytes(),
        });
        one_time_private.push(OneTimePreKeySecret { id, secret });
    }

    let bundle = KeyBundle {
        uid: uid.to_string(),
        device_id,
        registration_id,
        identity_key: *identity.public_signing_key().as_bytes(),
        identity_dh_key: *identity.public_dh_key().as_bytes(),
        signed_pre_key: SignedPreKey {
            id: signed_pre_key_id,
            public: *signed_public.as_bytes(),
            signature: signature.to_bytes().to_vec(),
        },
        one_time_pre_keys: one_time_public,
    };

    let private = PrivatePreKeys {
        signed_pre_key_id,
        signed_pre_key: signed_secret,
        one_time_pre_keys: one_time_private,
    };

    (bundle, private)
}

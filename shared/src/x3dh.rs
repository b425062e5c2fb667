//! X3DH (Extended Triple Diffie-Hellman) session establishment
//!
//! <https://signal.org/docs/specifications/x3dh/>
//!
//! ## Flow
//!
//! 1. Bob's device publishes a [`KeyBundle`](crate::bundle::KeyBundle).
//! 2. Alice fetches it and calls [`Handshake::initiate`], which yields the
//!    derived session secret plus a [`HandshakeInfo`] describing which keys
//!    she used.
//! 3. Alice attaches the `HandshakeInfo` to her first ciphertext (a
//!    pre-key message).
//! 4. Bob calls [`Handshake::respond`] with the embedded info and his
//!    private pre-keys to derive the same secret.

use crate::bundle::{KeyBundle, PrivatePreKeys};
use crate::error::{ProtocolError, Result};
use crate::keys::IdentityKey;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, ReusableSecret};

type HmacSha256 = Hmac<Sha256>;

/// Everything the responder needs to re-derive the session: carried inside
/// the initiator's first message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeInfo {
    /// Initiator's Ed25519 identity key (for associated data)
    pub identity_key: [u8; 32],
    /// Initiator's X25519 identity key (for DH)
    pub identity_dh_key: [u8; 32],
    /// Initiator's ephemeral X25519 public key
    pub ephemeral_key: [u8; 32],
    /// Which of the responder's signed pre-keys was used
    pub signed_pre_key_id: u32,
    /// Which one-time pre-key was consumed, if any
    pub one_time_pre_key_id: Option<u32>,
    /// Initiator device's registration id
    pub registration_id: u32,
}

/// Result of a completed X3DH handshake: the root secret for the ratchet
/// and the associated data both sides authenticate every message against.
#[derive(Debug)]
pub struct Handshake {
    shared_secret: [u8; 32],
    associated_data: Vec<u8>,
}

impl Handshake {
    /// Run X3DH as the initiator against a fetched bundle.
    ///
    /// Verifies the bundle's signed pre-key signature first; a failure is
    /// fatal (`Authenticity`) and must surface to the user rather than be
    /// retried. Consumes the bundle's one-time pre-key when one is present.
    pub fn initiate(
        our_identity: &IdentityKey,
        our_registration_id: u32,
        their_bundle: &KeyBundle,
    ) -> Result<(Self, HandshakeInfo)> {
        their_bundle.verify()?;

        let their_identity_dh = PublicKey::from(their_bundle.identity_dh_key);
        let their_spk = PublicKey::from(their_bundle.signed_pre_key.public);

        let ephemeral = ReusableSecret::random_from_rng(&mut rand::rngs::OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);

        // DH1 = DH(IK_A, SPK_B), DH2 = DH(EK_A, IK_B), DH3 = DH(EK_A, SPK_B),
        // DH4 = DH(EK_A, OPK_B) when a one-time key is available.
        let dh1 = our_identity.dh.diffie_hellman(&their_spk);
        let dh2 = ephemeral.diffie_hellman(&their_identity_dh);
        let dh3 = ephemeral.diffie_hellman(&their_spk);

        let one_time = their_bundle.one_time_pre_keys.first();
        let dh4 = one_time.map(|otpk| ephemeral.diffie_hellman(&PublicKey::from(otpk.public)));

        let mut dh_bytes = Vec::with_capacity(128);
        dh_bytes.extend_from_slice(dh1.as_bytes());
        dh_bytes.extend_from_slice(dh2.as_bytes());
        dh_bytes.extend_from_slice(dh3.as_bytes());
        if let Some(ref dh4) = dh4 {
            dh_bytes.extend_from_slice(dh4.as_bytes());
        }

        // AD = IK_A || IK_B (Ed25519 public keys, initiator first)
        let mut associated_data = Vec::with_capacity(64);
        associated_data.extend_from_slice(our_identity.public_signing_key().as_bytes());
        associated_data.extend_from_slice(&their_bundle.identity_key);

        let shared_secret = kdf(&dh_bytes, &associated_data)?;

        let info = HandshakeInfo {
            identity_key: *our_identity.public_signing_key().as_bytes(),
            identity_dh_key: *our_identity.public_dh_key().as_bytes(),
            ephemeral_key: *ephemeral_public.as_bytes(),
            signed_pre_key_id: their_bundle.signed_pre_key.id,
            one_time_pre_key_id: one_time.map(|k| k.id),
            registration_id: our_registration_id,
        };

        Ok((
            Self {
                shared_secret,
                associated_data,
            },
            info,
        ))
    }

    /// Run X3DH as the responder, from the info embedded in a pre-key
    /// message.
    ///
    /// Fails with `UnknownPreKey` when the referenced signed or one-time
    /// pre-key is no longer held (rotated away, or already consumed by a
    /// previous handshake): the session cannot be derived and the sender
    /// must re-establish against a fresh bundle.
    pub fn respond(
        our_identity: &IdentityKey,
        our_pre_keys: &PrivatePreKeys,
        info: &HandshakeInfo,
    ) -> Result<Self> {
        if info.signed_pre_key_id != our_pre_keys.signed_pre_key_id {
            return Err(ProtocolError::UnknownPreKey(info.signed_pre_key_id));
        }

        let their_identity_dh = PublicKey::from(info.identity_dh_key);
        let their_ephemeral = PublicKey::from(info.ephemeral_key);

        // Mirror of the initiator's DH calculations.
        let dh1 = our_pre_keys.signed_pre_key.diffie_hellman(&their_identity_dh);
        let dh2 = our_identity.dh.diffie_hellman(&their_ephemeral);
        let dh3 = our_pre_keys.signed_pre_key.diffie_hellman(&their_ephemeral);

        let dh4 = match info.one_time_pre_key_id {
            Some(id) => {
                let secret = our_pre_keys
                    .one_time_secret(id)
                    .ok_or(ProtocolError::UnknownPreKey(id))?;
                Some(secret.diffie_hellman(&their_ephemeral))
            }
            None => None,
        };

        let mut dh_bytes = Vec::with_capacity(128);
        dh_bytes.extend_from_slice(dh1.as_bytes());
        dh_bytes.extend_from_slice(dh2.as_bytes());
        dh_bytes.extend_from_slice(dh3.as_bytes());
        if let Some(ref dh4) = dh4 {
            dh_bytes.extend_from_slice(dh4.as_bytes());
        }

        // Same ordering as the initiator: their identity first.
        let mut associated_data = Vec::with_capacity(64);
        associated_data.extend_from_slice(&info.identity_key);
        associated_data.extend_from_slice(our_identity.public_signing_key().as_bytes());

        let shared_secret = kdf(&dh_bytes, &associated_data)?;

        Ok(Self {
            shared_secret,
            associated_data,
        })
    }

    /// The derived 32-byte root secret.
    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }

    /// Associated data (IK_initiator || IK_responder).
    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }
}

/// HKDF-style extract-then-expand over the concatenated DH outputs.
fn kdf(dh_bytes: &[u8], associated_data: &[u8]) -> Result<[u8; 32]> {
    // Extract: PRK = HMAC(salt=0, IKM=dh outputs)
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&[0u8; 32])
        .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
    mac.update(dh_bytes);
    let prk = mac.finalize().into_bytes();

    // Expand: HMAC(PRK, label || AD || 0x01)
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&prk)
        .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
    mac.update(b"Sotto-v1-X3DH");
    mac.update(associated_data);
    mac.update(&[1u8]);
    let out = mac.finalize().into_bytes();

    let mut secret = [0u8; 32];
    secret.copy_from_slice(&out[..32]);
    Ok(secret)
}

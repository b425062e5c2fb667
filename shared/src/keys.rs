//! Identity key generation and password-encrypted storage

use crate::error::{ProtocolError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{
    password_hash::{rand_core::OsRng as ArgonRng, SaltString},
    Argon2, PasswordHasher,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identity key pair: the root of trust for one device.
///
/// The Ed25519 half signs (connection auth, signed pre-keys); the X25519
/// half participates in X3DH key agreement. The two are generated
/// independently; no Ed25519-to-X25519 conversion is involved, so a future
/// signing-key change does not silently change DH results.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct IdentityKey {
    /// Ed25519 signing key
    #[zeroize(skip)]
    pub signing: SigningKey,
    /// X25519 static key for key agreement
    pub dh: StaticSecret,
}

impl IdentityKey {
    /// Public signing key (Ed25519)
    pub fn public_signing_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Public key-agreement key (X25519)
    pub fn public_dh_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(&self.dh)
    }

    /// Sign a message with the identity key
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Verify a signature made by this identity
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.signing
            .verifying_key()
            .verify(message, signature)
            .map_err(|_| ProtocolError::Authenticity)
    }
}

/// Generate a fresh identity key pair from OS randomness.
pub fn generate_identity() -> IdentityKey {
    let mut csprng = OsRng;

    IdentityKey {
        signing: SigningKey::generate(&mut csprng),
        dh: StaticSecret::random_from_rng(&mut csprng),
    }
}

/// Generate a registration id for a new device.
///
/// 14-bit space, never zero. The id is public and only used to
/// disambiguate reinstalls of the same device slot.
pub fn generate_registration_id() -> u32 {
    (rand::random::<u32>() % 0x3FFE) + 1
}

/// Encrypt an identity key pair for storage, bound to a password.
///
/// Argon2id derives the encryption key; AES-256-GCM seals the 64 bytes of
/// key material. Output layout: `[salt (22)] [nonce (12)] [ciphertext]`.
pub fn seal_identity(key: &IdentityKey, password: &str) -> Result<Vec<u8>> {
    let mut plaintext = Vec::with_capacity(64);
    plaintext.extend_from_slice(&key.signing.to_bytes());
    plaintext.extend_from_slice(&key.dh.to_bytes());

    let salt = SaltString::generate(&mut ArgonRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
    let key_material = password_hash
        .hash
        .ok_or_else(|| ProtocolError::KeyDerivation("No hash generated".to_string()))?;

    let aes_key = Key::<Aes256Gcm>::from_slice(&key_material.as_bytes()[..32]);
    let cipher = Aes256Gcm::new(aes_key);

    let nonce_bytes = rand::random::<[u8; 12]>();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|e| ProtocolError::Encryption(e.to_string()))?;

    let mut out = Vec::new();
    out.extend_from_slice(salt.as_str().as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);

    plaintext.zeroize();

    Ok(out)
}

/// Decrypt an identity sealed by [`seal_identity`].
pub fn unseal_identity(sealed: &[u8], password: &str) -> Result<IdentityKey> {
    if sealed.len() < 34 {
        return Err(ProtocolError::InvalidKey(
            "Sealed identity too short".to_string(),
        ));
    }

    let salt_str = std::str::from_utf8(&sealed[..22])
        .map_err(|_| ProtocolError::InvalidKey("Invalid salt encoding".to_string()))?;
    let salt = SaltString::from_b64(salt_str)
        .map_err(|_| ProtocolError::InvalidKey("Invalid salt format".to_string()))?;

    let nonce = Nonce::from_slice(&sealed[22..34]);
    let ciphertext = &sealed[34..];

    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
    let key_material = password_hash
        .hash
        .ok_or_else(|| ProtocolError::KeyDerivation("No hash generated".to_string()))?;

    let aes_key = Key::<Aes256Gcm>::from_slice(&key_material.as_bytes()[..32]);
    let cipher = Aes256Gcm::new(aes_key);

    let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| {
        ProtocolError::Decryption("wrong password or corrupted identity file".to_string())
    })?;

    if plaintext.len() != 64 {
        return Err(ProtocolError::InvalidKey(
            "Decrypted identity has wrong length".to_string(),
        ));
    }

    let mut signing_bytes = [0u8; 32];
    let mut dh_bytes = [0u8; 32];
    signing_bytes.copy_from_slice(&plaintext[..32]);
    dh_bytes.copy_from_slice(&plaintext[32..]);

    let identity = IdentityKey {
        signing: SigningKey::from_bytes(&signing_bytes),
        dh: StaticSecret::from(dh_bytes),
    };

    signing_bytes.zeroize();
    dh_bytes.zeroize();

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_valid_keys() {
        let key = generate_identity();
        assert_eq!(key.public_signing_key().as_bytes().len(), 32);
        assert_eq!(key.public_dh_key().as_bytes().len(), 32);
    }

    #[test]
    fn sign_verify() {
        let key = generate_identity();
        let message = b"challenge bytes";
        let signature = key.sign(message);
        assert!(key.verify(message, &signature).is_ok());
        assert!(key.verify(b"different bytes", &signature).is_err());
    }

    #[test]
    fn registration_id_in_range() {
        for _ in 0..100 {
            let id = generate_registration_id();
            assert!(id >= 1 && id <= 0x3FFE);
        }
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let key = generate_identity();
        let password = "correct horse battery staple";

        let sealed = seal_identity(&key, password).unwrap();
        assert!(!sealed.is_empty());

        let loaded = unseal_identity(&sealed, password).unwrap();
        assert_eq!(
            key.public_signing_key().as_bytes(),
            loaded.public_signing_key().as_bytes()
        );
        assert_eq!(
            key.public_dh_key().as_bytes(),
            loaded.public_dh_key().as_bytes()
        );

        assert!(unseal_identity(&sealed, "wrong password").is_err());
    }
}

//! Double Ratchet message cipher
//!
//! <https://signal.org/docs/specifications/doubleratchet/>
//!
//! Every encrypt call advances the sending chain and every decrypt call
//! advances (or skips forward in) the receiving chain, so no message key is
//! ever used twice. A bounded store of skipped message keys allows
//! out-of-order ciphertexts within a window of [`MAX_SKIP`] messages;
//! anything beyond that is rejected rather than risking unbounded key
//! retention.
//!
//! ## Header
//!
//! Each ciphertext travels with a 40-byte header:
//! `dh_public (32) || message_number (4, LE) || previous_chain_length (4, LE)`.
//! The receiver uses `dh_public` to detect DH ratchet steps and the two
//! counters to position itself in the sending chain.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, ReusableSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on retained skipped message keys per session.
pub const MAX_SKIP: u32 = 1000;

/// Key material for exactly one message: AES-256-GCM key plus nonce.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey {
    /// AES-256-GCM key
    pub key: [u8; 32],
    /// 12-byte nonce
    pub iv: [u8; 12],
}

/// Ratchet header transmitted alongside every ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current ratchet DH public key
    pub dh_public: [u8; 32],
    /// Index of this message in the current sending chain
    pub message_number: u32,
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
}

impl RatchetHeader {
    /// Serialize to the fixed 40-byte wire layout.
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut buf = [0u8; 40];
        buf[0..32].copy_from_slice(&self.dh_public);
        buf[32..36].copy_from_slice(&self.message_number.to_le_bytes());
        buf[36..40].copy_from_slice(&self.previous_chain_length.to_le_bytes());
        buf
    }

    /// Parse from exactly 40 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 40 {
            return Err(ProtocolError::Ratchet("invalid header length".into()));
        }
        let mut dh_public = [0u8; 32];
        dh_public.copy_from_slice(&bytes[0..32]);
        Ok(Self {
            dh_public,
            message_number: u32::from_le_bytes(bytes[32..36].try_into().unwrap()),
            previous_chain_length: u32::from_le_bytes(bytes[36..40].try_into().unwrap()),
        })
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
struct RootKey {
    key: [u8; 32],
}

#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
struct ChainKey {
    key: [u8; 32],
}

/// A message key retained because its message arrived out of order.
/// Identified by the ratchet public key active when it was skipped plus the
/// message number; those identifiers are not secret and skip zeroization.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SkippedKey {
    #[zeroize(skip)]
    ratchet_pub: [u8; 32],
    #[zeroize(skip)]
    message_number: u32,
    key: [u8; 32],
    iv: [u8; 12],
}

/// Serializable snapshot of a ratchet session, produced by
/// [`DoubleRatchet::snapshot`] and consumed by [`DoubleRatchet::restore`].
/// The vault encrypts these bytes before they touch disk.
#[derive(Serialize, Deserialize)]
pub struct RatchetState {
    root_key: RootKey,
    send_chain: Option<ChainKey>,
    recv_chain: Option<ChainKey>,
    dh_private: Option<[u8; 32]>,
    dh_public: Option<[u8; 32]>,
    their_dh_public: Option<[u8; 32]>,
    send_count: u32,
    recv_count: u32,
    prev_chain_len: u32,
    skipped: Vec<SkippedKey>,
}

/// Double Ratchet state for one session.
///
/// The X3DH initiator calls [`DoubleRatchet::init_sender`]; the responder
/// calls [`DoubleRatchet::init_receiver`] with its signed pre-key secret.
///
/// ## DH key persistence
///
/// x25519-dalek's `ReusableSecret` hides its raw bytes, so a parallel copy
/// of the current DH secret is kept in `dh_private_bytes` and written into
/// every snapshot. The copy is refreshed at each point a new DH pair is
/// generated and zeroized on replacement and on drop; restoring a snapshot
/// rebuilds the `ReusableSecret` from it via [`FixedRng`].
pub struct DoubleRatchet {
    root_key: RootKey,
    send_chain: Option<ChainKey>,
    recv_chain: Option<ChainKey>,
    dh_private: Option<ReusableSecret>,
    dh_private_bytes: Option<[u8; 32]>,
    dh_public: Option<PublicKey>,
    their_dh_public: Option<PublicKey>,
    send_count: u32,
    recv_count: u32,
    prev_chain_len: u32,
    skipped: Vec<SkippedKey>,
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        if let Some(ref mut bytes) = self.dh_private_bytes {
            bytes.zeroize();
        }
    }
}

impl DoubleRatchet {
    /// Initialise the sending side (the X3DH initiator).
    ///
    /// Performs the first DH ratchet step against the peer's signed
    /// pre-key immediately, so the session can encrypt before anything has
    /// been received.
    pub fn init_sender(shared_secret: &[u8; 32], their_spk: &PublicKey) -> Result<Self> {
        let mut dh_bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut dh_bytes);
        let dh = ReusableSecret::random_from_rng(&mut FixedRng(dh_bytes));
        let dh_public = PublicKey::from(&dh);

        let dh_out = dh.diffie_hellman(their_spk);
        let (root, send_ck) = kdf_root(shared_secret, dh_out.as_bytes())?;

        Ok(Self {
            root_key: RootKey { key: root },
            send_chain: Some(ChainKey { key: send_ck }),
            recv_chain: None,
            dh_private: Some(dh),
            dh_private_bytes: Some(dh_bytes),
            dh_public: Some(dh_public),
            their_dh_public: Some(*their_spk),
            send_count: 0,
            recv_count: 0,
            prev_chain_len: 0,
            skipped: Vec::new(),
        })
    }

    /// Initialise the receiving side (the X3DH responder).
    ///
    /// The signed pre-key pair doubles as the first ratchet key pair, since
    /// that is what the initiator DHed against. No sending chain exists
    /// until the first incoming message triggers a DH ratchet step.
    pub fn init_receiver(shared_secret: &[u8; 32], spk_secret: &StaticSecret) -> Result<Self> {
        let spk_bytes = spk_secret.to_bytes();
        let dh = ReusableSecret::random_from_rng(&mut FixedRng(spk_bytes));
        let dh_public = PublicKey::from(spk_secret);

        Ok(Self {
            root_key: RootKey {
                key: *shared_secret,
            },
            send_chain: None,
            recv_chain: None,
            dh_private: Some(dh),
            dh_private_bytes: Some(spk_bytes),
            dh_public: Some(dh_public),
            their_dh_public: None,
            send_count: 0,
            recv_count: 0,
            prev_chain_len: 0,
            skipped: Vec::new(),
        })
    }

    /// Encrypt a plaintext, advancing the sending chain.
    ///
    /// Returns the header to transmit with the ciphertext. `associated_data`
    /// is the X3DH associated data for the session; the header bytes are
    /// mixed into the AAD as well, so a tampered header fails the GCM tag.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(RatchetHeader, Vec<u8>)> {
        let ck = self
            .send_chain
            .as_ref()
            .ok_or_else(|| ProtocolError::Ratchet("no sending chain".into()))?;

        let (mk, next_ck) = kdf_chain(&ck.key)?;
        self.send_chain = Some(ChainKey { key: next_ck });

        let dh_public = self
            .dh_public
            .ok_or_else(|| ProtocolError::Ratchet("no DH public key".into()))?;
        let header = RatchetHeader {
            dh_public: *dh_public.as_bytes(),
            message_number: self.send_count,
            previous_chain_length: self.prev_chain_len,
        };

        let ciphertext = seal(&mk, plaintext, &full_aad(associated_data, &header))?;
        self.send_count += 1;

        Ok((header, ciphertext))
    }

    /// Decrypt an incoming ciphertext.
    ///
    /// Handles skipped keys, DH ratchet steps, and in-chain skips. Failure
    /// leaves whatever state was already advanced in place; the ratchet is
    /// never rewound, so retrying a corrupt ciphertext cannot succeed and
    /// callers should surface the error instead.
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        // A key stored for this exact (ratchet key, counter) pair wins.
        if let Some(mk) = self.take_skipped(&header.dh_public, header.message_number) {
            return open(&mk, ciphertext, &full_aad(associated_data, header));
        }

        let their_pub = PublicKey::from(header.dh_public);
        let need_dh_step = match self.their_dh_public {
            Some(ref current) => *current.as_bytes() != header.dh_public,
            None => true,
        };

        if need_dh_step {
            // Bank the rest of the old receiving chain, then turn the ratchet.
            self.skip_to(header.previous_chain_length)?;
            self.dh_ratchet(&their_pub)?;
        }

        self.skip_to(header.message_number)?;

        let ck = self
            .recv_chain
            .as_ref()
            .ok_or_else(|| ProtocolError::Ratchet("no receiving chain".into()))?;
        let (mk, next_ck) = kdf_chain(&ck.key)?;
        self.recv_chain = Some(ChainKey { key: next_ck });
        self.recv_count += 1;

        open(&mk, ciphertext, &full_aad(associated_data, header))
    }

    /// DH ratchet step on receipt of a new remote ratchet key: derive a new
    /// receiving chain, then a fresh key pair and a new sending chain.
    fn dh_ratchet(&mut self, their_new_pub: &PublicKey) -> Result<()> {
        self.prev_chain_len = self.send_count;
        self.send_count = 0;
        self.recv_count = 0;
        self.their_dh_public = Some(*their_new_pub);

        let dh = self
            .dh_private
            .as_ref()
            .ok_or_else(|| ProtocolError::Ratchet("no DH private key".into()))?;
        let dh_out = dh.diffie_hellman(their_new_pub);
        let (root, recv_ck) = kdf_root(&self.root_key.key, dh_out.as_bytes())?;
        self.root_key = RootKey { key: root };
        self.recv_chain = Some(ChainKey { key: recv_ck });

        let mut new_bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut new_bytes);
        let new_dh = ReusableSecret::random_from_rng(&mut FixedRng(new_bytes));
        let new_public = PublicKey::from(&new_dh);

        let dh_out = new_dh.diffie_hellman(their_new_pub);
        let (root, send_ck) = kdf_root(&self.root_key.key, dh_out.as_bytes())?;
        self.root_key = RootKey { key: root };
        self.send_chain = Some(ChainKey { key: send_ck });

        if let Some(ref mut old) = self.dh_private_bytes {
            old.zeroize();
        }
        self.dh_private = Some(new_dh);
        self.dh_private_bytes = Some(new_bytes);
        self.dh_public = Some(new_public);

        Ok(())
    }

    /// Remove and return a skipped key matching this header, if stored.
    fn take_skipped(&mut self, ratchet_pub: &[u8; 32], message_number: u32) -> Option<MessageKey> {
        let pos = self
            .skipped
            .iter()
            .position(|sk| sk.ratchet_pub == *ratchet_pub && sk.message_number == message_number)?;
        let sk = self.skipped.remove(pos);
        Some(MessageKey {
            key: sk.key,
            iv: sk.iv,
        })
    }

    /// Advance the receiving chain to `until`, banking every key passed over.
    fn skip_to(&mut self, until: u32) -> Result<()> {
        if until < self.recv_count {
            return Ok(());
        }
        let to_skip = until - self.recv_count;
        if to_skip > MAX_SKIP {
            return Err(ProtocolError::Ratchet(format!(
                "too many skipped messages: {to_skip}"
            )));
        }
        let ck = match self.recv_chain.as_ref() {
            Some(ck) => ck,
            None => return Ok(()),
        };
        let their_pub = match self.their_dh_public {
            Some(pk) => *pk.as_bytes(),
            None => return Ok(()),
        };

        let mut current = ck.key;
        for _ in 0..to_skip {
            let (mk, next) = kdf_chain(&current)?;
            self.skipped.push(SkippedKey {
                ratchet_pub: their_pub,
                message_number: self.recv_count,
                key: mk.key,
                iv: mk.iv,
            });
            current = next;
            self.recv_count += 1;
        }
        self.recv_chain = Some(ChainKey { key: current });
        Ok(())
    }

    /// Current ratchet DH public key (the one sent in headers).
    pub fn dh_public(&self) -> Option<PublicKey> {
        self.dh_public
    }

    /// Serialize the session to bytes (MessagePack). The caller is expected
    /// to encrypt the result before persisting it.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let state = RatchetState {
            root_key: self.root_key.clone(),
            send_chain: self.send_chain.clone(),
            recv_chain: self.recv_chain.clone(),
            dh_private: self.dh_private_bytes,
            dh_public: self.dh_public.map(|pk| *pk.as_bytes()),
            their_dh_public: self.their_dh_public.map(|pk| *pk.as_bytes()),
            send_count: self.send_count,
            recv_count: self.recv_count,
            prev_chain_len: self.prev_chain_len,
            skipped: self.skipped.clone(),
        };
        rmp_serde::to_vec(&state).map_err(|e| ProtocolError::Storage(e.to_string()))
    }

    /// Restore a session from [`snapshot`](Self::snapshot) bytes.
    ///
    /// Rejects snapshots whose stored DH private key does not reproduce the
    /// stored public key. Such a session cannot perform ratchet steps and
    /// must be re-established rather than limp along.
    pub fn restore(bytes: &[u8]) -> Result<Self> {
        let state: RatchetState =
            rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Storage(e.to_string()))?;

        if let (Some(priv_bytes), Some(pub_bytes)) = (&state.dh_private, &state.dh_public) {
            let rebuilt = ReusableSecret::random_from_rng(&mut FixedRng(*priv_bytes));
            if PublicKey::from(&rebuilt).as_bytes() != pub_bytes {
                return Err(ProtocolError::Storage(
                    "DH key mismatch in stored session; re-establish the session".into(),
                ));
            }
        }

        let dh_private = state
            .dh_private
            .map(|raw| ReusableSecret::random_from_rng(&mut FixedRng(raw)));

        Ok(Self {
            root_key: state.root_key,
            send_chain: state.send_chain,
            recv_chain: state.recv_chain,
            dh_private,
            dh_private_bytes: state.dh_private,
            dh_public: state.dh_public.map(PublicKey::from),
            their_dh_public: state.their_dh_public.map(PublicKey::from),
            send_count: state.send_count,
            recv_count: state.recv_count,
            prev_chain_len: state.prev_chain_len,
            skipped: state.skipped,
        })
    }
}

/// RNG that yields exactly the 32 bytes it was constructed with.
///
/// `ReusableSecret::random_from_rng` reads 32 bytes; feeding it stored
/// bytes reconstructs the same secret. Used for snapshot restore and for
/// generating keys whose raw bytes must be retained for the next snapshot.
struct FixedRng([u8; 32]);

impl rand::RngCore for FixedRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill_bytes(&mut buf);
        u32::from_le_bytes(buf)
    }
    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let len = dest.len().min(32);
        dest[..len].copy_from_slice(&self.0[..len]);
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl rand::CryptoRng for FixedRng {}

/// Root-key ratchet: `(new_root, chain_key) = KDF_RK(root, dh_output)`.
fn kdf_root(root_key: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(root_key)
        .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
    mac.update(dh_output);
    let prk: [u8; 32] = mac.finalize().into_bytes().into();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&prk)
        .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
    mac.update(b"Sotto-v1-RK");
    mac.update(&[0x01]);
    let new_root: [u8; 32] = mac.finalize().into_bytes().into();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&prk)
        .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
    mac.update(b"Sotto-v1-CK");
    mac.update(&[0x02]);
    let chain: [u8; 32] = mac.finalize().into_bytes().into();

    Ok((new_root, chain))
}

/// Symmetric chain ratchet: `(message_key, next_chain) = KDF_CK(chain)`.
fn kdf_chain(chain_key: &[u8; 32]) -> Result<(MessageKey, [u8; 32])> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key)
        .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
    mac.update(&[0x01]);
    let mk: [u8; 32] = mac.finalize().into_bytes().into();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key)
        .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
    mac.update(&mk);
    mac.update(&[0x02]);
    let iv_full: [u8; 32] = mac.finalize().into_bytes().into();
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&iv_full[..12]);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key)
        .map_err(|e| ProtocolError::KeyDerivation(e.to_string()))?;
    mac.update(&[0x03]);
    let next: [u8; 32] = mac.finalize().into_bytes().into();

    Ok((MessageKey { key: mk, iv }, next))
}

fn full_aad(associated_data: &[u8], header: &RatchetHeader) -> Vec<u8> {
    let mut aad = associated_data.to_vec();
    aad.extend_from_slice(&header.to_bytes());
    aad
}

fn seal(mk: &MessageKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&mk.key));
    cipher
        .encrypt(
            Nonce::from_slice(&mk.iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| ProtocolError::Encryption(e.to_string()))
}

fn open(mk: &MessageKey, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&mk.key));
    cipher
        .decrypt(
            Nonce::from_slice(&mk.iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| ProtocolError::Decryption("authentication failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::StaticSecret;

    fn make_pair() -> (DoubleRatchet, DoubleRatchet) {
        let shared_secret = [0x42u8; 32];
        let spk_secret = StaticSecret::random_from_rng(&mut rand::rngs::OsRng);
        let spk_public = PublicKey::from(&spk_secret);

        let sender = DoubleRatchet::init_sender(&shared_secret, &spk_public).unwrap();
        let receiver = DoubleRatchet::init_receiver(&shared_secret, &spk_secret).unwrap();
        (sender, receiver)
    }

    #[test]
    fn basic_round_trip() {
        let (mut alice, mut bob) = make_pair();
        let ad = b"ad";

        let (hdr, ct) = alice.encrypt(b"hello bob", ad).unwrap();
        assert_eq!(bob.decrypt(&hdr, &ct, ad).unwrap(), b"hello bob");

        let (hdr, ct) = bob.encrypt(b"hello alice", ad).unwrap();
        assert_eq!(alice.decrypt(&hdr, &ct, ad).unwrap(), b"hello alice");
    }

    #[test]
    fn each_message_uses_a_fresh_key() {
        let (mut alice, mut bob) = make_pair();
        let ad = b"ad";

        // Same plaintext twice must never produce the same ciphertext, and
        // each header carries a new counter.
        let (hdr1, ct1) = alice.encrypt(b"repeat", ad).unwrap();
        let (hdr2, ct2) = alice.encrypt(b"repeat", ad).unwrap();
        assert_ne!(ct1, ct2);
        assert_ne!(hdr1.message_number, hdr2.message_number);

        assert_eq!(bob.decrypt(&hdr1, &ct1, ad).unwrap(), b"repeat");
        assert_eq!(bob.decrypt(&hdr2, &ct2, ad).unwrap(), b"repeat");
    }

    #[test]
    fn long_one_directional_run() {
        let (mut alice, mut bob) = make_pair();
        let ad = b"ad";

        for i in 0..20 {
            let msg = format!("message {i}");
            let (hdr, ct) = alice.encrypt(msg.as_bytes(), ad).unwrap();
            assert_eq!(bob.decrypt(&hdr, &ct, ad).unwrap(), msg.as_bytes());
        }
    }

    #[test]
    fn alternating_directions() {
        let (mut alice, mut bob) = make_pair();
        let ad = b"ad";

        for i in 0..5 {
            let a = format!("alice {i}");
            let (hdr, ct) = alice.encrypt(a.as_bytes(), ad).unwrap();
            assert_eq!(bob.decrypt(&hdr, &ct, ad).unwrap(), a.as_bytes());

            let b = format!("bob {i}");
            let (hdr, ct) = bob.encrypt(b.as_bytes(), ad).unwrap();
            assert_eq!(alice.decrypt(&hdr, &ct, ad).unwrap(), b.as_bytes());
        }
    }

    #[test]
    fn out_of_order_delivery_within_window() {
        let (mut alice, mut bob) = make_pair();
        let ad = b"ad";

        let (hdr0, ct0) = alice.encrypt(b"zero", ad).unwrap();
        let (hdr1, ct1) = alice.encrypt(b"one", ad).unwrap();
        let (hdr2, ct2) = alice.encrypt(b"two", ad).unwrap();

        assert_eq!(bob.decrypt(&hdr2, &ct2, ad).unwrap(), b"two");
        assert_eq!(bob.decrypt(&hdr0, &ct0, ad).unwrap(), b"zero");
        assert_eq!(bob.decrypt(&hdr1, &ct1, ad).unwrap(), b"one");
    }

    #[test]
    fn tampered_ciphertext_fails_without_rewind() {
        let (mut alice, mut bob) = make_pair();
        let ad = b"ad";

        let (hdr, mut ct) = alice.encrypt(b"intact", ad).unwrap();
        ct[0] ^= 0xFF;
        assert!(matches!(
            bob.decrypt(&hdr, &ct, ad),
            Err(ProtocolError::Decryption(_))
        ));

        // The ratchet moved on; later messages still decrypt.
        let (hdr2, ct2) = alice.encrypt(b"next", ad).unwrap();
        assert_eq!(bob.decrypt(&hdr2, &ct2, ad).unwrap(), b"next");
    }

    #[test]
    fn wrong_associated_data_fails() {
        let (mut alice, mut bob) = make_pair();

        let (hdr, ct) = alice.encrypt(b"secret", b"right-ad").unwrap();
        assert!(bob.decrypt(&hdr, &ct, b"wrong-ad").is_err());
    }

    #[test]
    fn header_wire_roundtrip() {
        let hdr = RatchetHeader {
            dh_public: [0xAB; 32],
            message_number: 42,
            previous_chain_length: 7,
        };
        let parsed = RatchetHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(hdr, parsed);
        assert!(RatchetHeader::from_bytes(&[0u8; 39]).is_err());
    }

    #[test]
    fn snapshot_restore_continues_both_directions() {
        let shared_secret = [0x55u8; 32];
        let spk_bytes: [u8; 32] = rand::random();
        let spk = StaticSecret::from(spk_bytes);
        let spk_pub = PublicKey::from(&spk);
        let ad = b"ad";

        let mut alice = DoubleRatchet::init_sender(&shared_secret, &spk_pub).unwrap();
        let mut bob = DoubleRatchet::init_receiver(&shared_secret, &spk).unwrap();

        let (hdr, ct) = alice.encrypt(b"hello", ad).unwrap();
        assert_eq!(bob.decrypt(&hdr, &ct, ad).unwrap(), b"hello");
        let (hdr, ct) = bob.encrypt(b"world", ad).unwrap();
        assert_eq!(alice.decrypt(&hdr, &ct, ad).unwrap(), b"world");

        // Both sides go through a snapshot/restore cycle.
        let mut alice = DoubleRatchet::restore(&alice.snapshot().unwrap()).unwrap();
        let mut bob = DoubleRatchet::restore(&bob.snapshot().unwrap()).unwrap();

        // The restored sessions can send immediately (DH key survived).
        let (hdr, ct) = alice.encrypt(b"after restore", ad).unwrap();
        assert_eq!(bob.decrypt(&hdr, &ct, ad).unwrap(), b"after restore");
        let (hdr, ct) = bob.encrypt(b"ack", ad).unwrap();
        assert_eq!(alice.decrypt(&hdr, &ct, ad).unwrap(), b"ack");

        for i in 0..5 {
            let msg = format!("round {i}");
            let (h, c) = alice.encrypt(msg.as_bytes(), ad).unwrap();
            assert_eq!(bob.decrypt(&h, &c, ad).unwrap(), msg.as_bytes());
        }
    }

    #[test]
    fn corrupted_snapshot_is_rejected() {
        let (alice, _) = make_pair();
        let mut bytes = alice.snapshot().unwrap();
        let len = bytes.len();
        bytes.truncate(len / 2);
        assert!(DoubleRatchet::restore(&bytes).is_err());
    }
}

//! Session management
//!
//! One session per (peer identity, peer device), each guarded by its own
//! async mutex: establishment and ratchet steps for the same peer device
//! are serialized, while different sessions advance concurrently with no
//! global lock. Session state is persisted to the vault after every
//! mutation and before a new session becomes visible, so an abandoned
//! establish leaves nothing behind.

use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use x25519_dalek::PublicKey;

use sotto_shared::bundle::{KeyBundle, PrivatePreKeys};
use sotto_shared::envelope::{Ciphertext, CiphertextKind, Envelope};
use sotto_shared::keys::IdentityKey;
use sotto_shared::ratchet::DoubleRatchet;
use sotto_shared::wire::DeviceCiphertext;
use sotto_shared::x3dh::{Handshake, HandshakeInfo};
use sotto_shared::ProtocolError;

use crate::vault::{DeviceRecord, Vault};

/// Vault representation of a live session: the ratchet snapshot plus the
/// not-yet-acknowledged handshake info, if the peer has never replied.
#[derive(Serialize, Deserialize)]
struct PersistedSession {
    ratchet: Vec<u8>,
    pending_handshake: Option<HandshakeInfo>,
}

struct SessionSlot {
    ratchet: DoubleRatchet,
    associated_data: Vec<u8>,
    /// Fingerprint of the bundle this session was established from;
    /// all-zero for sessions created by responding to a pre-key message.
    fingerprint: [u8; 32],
    /// While set, outgoing ciphertexts are pre-key messages carrying the
    /// handshake; cleared on the first successful inbound decrypt.
    pending_handshake: Option<HandshakeInfo>,
}

type SessionRef = Arc<Mutex<Option<SessionSlot>>>;

/// Manages every pairwise session this device holds.
pub struct SessionManager {
    vault: Arc<Vault>,
    identity: Arc<IdentityKey>,
    device: DeviceRecord,
    pre_keys: RwLock<Option<PrivatePreKeys>>,
    sessions: DashMap<(String, u32), SessionRef>,
}

impl SessionManager {
    /// Create a manager over an unlocked vault.
    pub fn new(vault: Arc<Vault>, identity: Arc<IdentityKey>, device: DeviceRecord) -> Self {
        Self {
            vault,
            identity,
            device,
            pre_keys: RwLock::new(None),
            sessions: DashMap::new(),
        }
    }

    /// This device's record.
    pub fn device(&self) -> DeviceRecord {
        self.device
    }

    /// Load existing pre-key material, or generate a fresh set.
    ///
    /// Returns `Some(bundle)` when new keys were generated, and the caller
    /// must publish that bundle; `None` when the vault already held keys.
    pub async fn bootstrap(&self, uid: &str, one_time_count: usize) -> Result<Option<KeyBundle>> {
        if let Some(existing) = self.vault.load_private_pre_keys().await? {
            *self.pre_keys.write().await = Some(existing);
            return Ok(None);
        }

        let (bundle, private) = sotto_shared::bundle::generate_device_keys(
            &self.identity,
            uid,
            self.device.device_id,
            self.device.registration_id,
            one_time_count,
        );
        self.vault.store_private_pre_keys(&private).await?;
        *self.pre_keys.write().await = Some(private);
        info!(
            "Generated pre-key set for {}/{} ({} one-time keys)",
            uid, self.device.device_id, one_time_count
        );
        Ok(Some(bundle))
    }

    fn slot(&self, peer_uid: &str, peer_device_id: u32) -> SessionRef {
        self.sessions
            .entry((peer_uid.to_string(), peer_device_id))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Load vault state into an empty slot, if any exists.
    async fn hydrate(
        &self,
        guard: &mut Option<SessionSlot>,
        peer_uid: &str,
        peer_device_id: u32,
    ) -> Result<()> {
        if guard.is_some() {
            return Ok(());
        }
        if let Some(stored) = self.vault.load_session(peer_uid, peer_device_id).await? {
            let persisted: PersistedSession = rmp_serde::from_slice(&stored.snapshot)?;
            *guard = Some(SessionSlot {
                ratchet: DoubleRatchet::restore(&persisted.ratchet)?,
                associated_data: stored.associated_data,
                fingerprint: stored.fingerprint,
                pending_handshake: persisted.pending_handshake,
            });
        }
        Ok(())
    }

    /// Write a slot's current state to the vault.
    async fn persist(
        &self,
        peer_uid: &str,
        peer_device_id: u32,
        slot: &SessionSlot,
    ) -> Result<()> {
        let persisted = PersistedSession {
            ratchet: slot.ratchet.snapshot()?,
            pending_handshake: slot.pending_handshake.clone(),
        };
        self.vault
            .store_session(
                peer_uid,
                peer_device_id,
                &slot.fingerprint,
                &slot.associated_data,
                &rmp_serde::to_vec(&persisted)?,
            )
            .await
    }

    /// Whether a session exists with a peer device. Pure lookup: no
    /// mutation, no network.
    pub async fn has_session(&self, peer_uid: &str, peer_device_id: u32) -> bool {
        if let Some(slot) = self
            .sessions
            .get(&(peer_uid.to_string(), peer_device_id))
        {
            if let Ok(guard) = slot.value().try_lock() {
                if guard.is_some() {
                    return true;
                }
            }
        }
        self.vault
            .has_session(peer_uid, peer_device_id)
            .await
            .unwrap_or(false)
    }

    /// Establish a session from a fetched bundle.
    ///
    /// Idempotent for the same bundle: concurrent or repeated calls cannot
    /// write two different root keys, because the per-session mutex
    /// serializes them and the second call sees the first's fingerprint.
    /// A *different* bundle for the same device deliberately overwrites
    /// the session (the peer rotated keys); callers should only pass one
    /// after detecting that the old session is dead.
    pub async fn establish(&self, bundle: &KeyBundle) -> Result<()> {
        let slot = self.slot(&bundle.uid, bundle.device_id);
        let mut guard = slot.lock().await;
        self.hydrate(&mut guard, &bundle.uid, bundle.device_id).await?;

        if let Some(existing) = guard.as_ref() {
            if existing.fingerprint == bundle.fingerprint() {
                debug!(
                    "Session with {}/{} already established",
                    bundle.uid, bundle.device_id
                );
                return Ok(());
            }
            info!(
                "Overwriting session with {}/{} (peer rotated keys)",
                bundle.uid, bundle.device_id
            );
        }

        // Signature failure inside initiate is fatal and surfaces as-is.
        let (handshake, info) =
            Handshake::initiate(&self.identity, self.device.registration_id, bundle)?;
        let ratchet = DoubleRatchet::init_sender(
            handshake.shared_secret(),
            &PublicKey::from(bundle.signed_pre_key.public),
        )?;

        let state = SessionSlot {
            ratchet,
            associated_data: handshake.associated_data().to_vec(),
            fingerprint: bundle.fingerprint(),
            pending_handshake: Some(info),
        };

        // Persist before the session becomes visible; a cancellation
        // before this point leaves no trace of the new session.
        self.persist(&bundle.uid, bundle.device_id, &state).await?;
        *guard = Some(state);
        Ok(())
    }

    /// Encrypt a plaintext for one peer device under an existing session.
    pub async fn encrypt_to(
        &self,
        peer_uid: &str,
        peer_device_id: u32,
        plaintext: &[u8],
    ) -> Result<Ciphertext> {
        let slot = self.slot(peer_uid, peer_device_id);
        let mut guard = slot.lock().await;
        self.hydrate(&mut guard, peer_uid, peer_device_id).await?;

        let state = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No session with {}/{}", peer_uid, peer_device_id))?;

        let (header, body) = state.ratchet.encrypt(plaintext, &state.associated_data)?;
        let (kind, handshake) = match &state.pending_handshake {
            Some(info) => (CiphertextKind::PreKey, Some(info.clone())),
            None => (CiphertextKind::Ratchet, None),
        };

        // The chain advanced; persist before handing out the ciphertext.
        self.persist(peer_uid, peer_device_id, state).await?;

        Ok(Ciphertext {
            kind,
            header,
            body,
            handshake,
        })
    }

    /// Encrypt one plaintext for every device bundle given, establishing
    /// sessions where none exist yet. One logical send, one ciphertext per
    /// recipient device.
    pub async fn encrypt_with_bundles(
        &self,
        bundles: &[KeyBundle],
        plaintext: &[u8],
    ) -> Result<Vec<DeviceCiphertext>> {
        let mut out = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            if !self.has_session(&bundle.uid, bundle.device_id).await {
                self.establish(bundle).await?;
            }
            let ciphertext = self
                .encrypt_to(&bundle.uid, bundle.device_id, plaintext)
                .await?;
            out.push(DeviceCiphertext {
                device_id: bundle.device_id,
                ciphertext,
            });
        }
        Ok(out)
    }

    /// Decrypt an incoming envelope.
    ///
    /// Returns `Ok(None)`, not an error and with no state touched,
    /// when the envelope is addressed to a different device of ours; the
    /// transport fans envelopes out to every connected device and local
    /// filtering is the expected path. A pre-key envelope with no session
    /// completes the handshake inline first. Decryption failures are
    /// final: the ratchet is never rewound for a retry.
    pub async fn decrypt(&self, envelope: &Envelope) -> Result<Option<Vec<u8>>> {
        if envelope.recipient_device_id != self.device.device_id {
            return Ok(None);
        }
        envelope.ciphertext.validate()?;

        let peer_uid = &envelope.sender_uid;
        let peer_device_id = envelope.sender_device_id;
        let slot = self.slot(peer_uid, peer_device_id);
        let mut guard = slot.lock().await;
        self.hydrate(&mut guard, peer_uid, peer_device_id).await?;

        if guard.is_none() {
            match envelope.ciphertext.kind {
                CiphertextKind::PreKey => {
                    let info = envelope.ciphertext.handshake.as_ref().ok_or_else(|| {
                        ProtocolError::Wire("pre-key ciphertext without handshake info".into())
                    })?;
                    let pre_keys_guard = self.pre_keys.read().await;
                    let pre_keys = pre_keys_guard
                        .as_ref()
                        .ok_or_else(|| anyhow::anyhow!("Pre-keys not initialized"))?;

                    let handshake = Handshake::respond(&self.identity, pre_keys, info)?;
                    let ratchet = DoubleRatchet::init_receiver(
                        handshake.shared_secret(),
                        &pre_keys.signed_pre_key,
                    )?;
                    info!(
                        "Completed inbound handshake with {}/{}",
                        peer_uid, peer_device_id
                    );
                    *guard = Some(SessionSlot {
                        ratchet,
                        associated_data: handshake.associated_data().to_vec(),
                        fingerprint: [0u8; 32],
                        pending_handshake: None,
                    });
                }
                CiphertextKind::Ratchet => {
                    return Err(ProtocolError::Decryption(format!(
                        "no session with {peer_uid}/{peer_device_id}"
                    ))
                    .into());
                }
            }
        }

        let state = guard
            .as_mut()
            .ok_or_else(|| ProtocolError::Ratchet("session slot empty after handshake".into()))?;
        let result = state.ratchet.decrypt(
            &envelope.ciphertext.header,
            &envelope.ciphertext.body,
            &state.associated_data,
        );

        match result {
            Ok(plaintext) => {
                // Evidence the peer holds the session: stop sending the
                // handshake with every message.
                state.pending_handshake = None;
                self.persist(peer_uid, peer_device_id, state).await?;
                Ok(Some(plaintext))
            }
            Err(e) => {
                // Whatever chain state advanced stays advanced.
                self.persist(peer_uid, peer_device_id, state).await?;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sotto_shared::envelope::MessageMeta;
    use sotto_shared::keys::generate_identity;

    struct Peer {
        _dir: tempfile::TempDir,
        manager: SessionManager,
        bundle: KeyBundle,
        uid: String,
    }

    async fn make_peer(uid: &str) -> Peer {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(Vault::open(dir.path(), "pw").await.unwrap());
        let identity = Arc::new(generate_identity());
        let device = vault.init_device_record().await.unwrap();
        let manager = SessionManager::new(vault, identity, device);
        let bundle = manager.bootstrap(uid, 4).await.unwrap().unwrap();
        Peer {
            _dir: dir,
            manager,
            bundle,
            uid: uid.to_string(),
        }
    }

    fn envelope_to(peer: &Peer, from: &Peer, ct: Ciphertext) -> Envelope {
        Envelope::new(
            &from.uid,
            from.manager.device().device_id,
            &peer.uid,
            peer.manager.device().device_id,
            ct,
            MessageMeta::default(),
        )
    }

    #[tokio::test]
    async fn establish_then_round_trip() {
        let alice = make_peer("alice").await;
        let bob = make_peer("bob").await;

        assert!(!alice.manager.has_session("bob", bob.manager.device().device_id).await);
        alice.manager.establish(&bob.bundle).await.unwrap();
        assert!(alice.manager.has_session("bob", bob.manager.device().device_id).await);

        let ct = alice
            .manager
            .encrypt_to("bob", bob.manager.device().device_id, b"hi")
            .await
            .unwrap();
        assert_eq!(ct.kind, CiphertextKind::PreKey);

        let envelope = envelope_to(&bob, &alice, ct);
        let plaintext = bob.manager.decrypt(&envelope).await.unwrap();
        assert_eq!(plaintext.as_deref(), Some(&b"hi"[..]));

        // Reply flows over the reverse direction of the same session.
        let reply_ct = bob
            .manager
            .encrypt_to("alice", alice.manager.device().device_id, b"hello")
            .await
            .unwrap();
        let reply_env = envelope_to(&alice, &bob, reply_ct);
        let reply = alice.manager.decrypt(&reply_env).await.unwrap();
        assert_eq!(reply.as_deref(), Some(&b"hello"[..]));

        // After hearing back, alice's sends drop the handshake payload.
        let ct = alice
            .manager
            .encrypt_to("bob", bob.manager.device().device_id, b"again")
            .await
            .unwrap();
        assert_eq!(ct.kind, CiphertextKind::Ratchet);
        assert!(ct.handshake.is_none());
    }

    #[tokio::test]
    async fn establish_is_idempotent_for_the_same_bundle() {
        let alice = make_peer("alice").await;
        let bob = make_peer("bob").await;

        alice.manager.establish(&bob.bundle).await.unwrap();
        let ct1 = alice
            .manager
            .encrypt_to("bob", bob.manager.device().device_id, b"one")
            .await
            .unwrap();

        // A second establish with the same bundle must not reset the chain.
        alice.manager.establish(&bob.bundle).await.unwrap();
        let ct2 = alice
            .manager
            .encrypt_to("bob", bob.manager.device().device_id, b"two")
            .await
            .unwrap();
        assert_eq!(ct2.header.message_number, ct1.header.message_number + 1);
    }

    #[tokio::test]
    async fn concurrent_establish_yields_one_session() {
        let alice = Arc::new(make_peer("alice").await);
        let bob = make_peer("bob").await;

        let (a, b) = tokio::join!(
            alice.manager.establish(&bob.bundle),
            alice.manager.establish(&bob.bundle),
        );
        a.unwrap();
        b.unwrap();

        // Whichever call won, the session works end to end.
        let ct = alice
            .manager
            .encrypt_to("bob", bob.manager.device().device_id, b"race")
            .await
            .unwrap();
        let envelope = envelope_to(&bob, &alice, ct);
        assert_eq!(
            bob.manager.decrypt(&envelope).await.unwrap().as_deref(),
            Some(&b"race"[..])
        );
    }

    #[tokio::test]
    async fn envelopes_for_other_devices_are_filtered_not_failed() {
        let alice = make_peer("alice").await;
        let bob = make_peer("bob").await;

        alice.manager.establish(&bob.bundle).await.unwrap();
        let ct = alice
            .manager
            .encrypt_to("bob", bob.manager.device().device_id, b"hi")
            .await
            .unwrap();

        // Same ciphertext, addressed to a sibling device id.
        let mut envelope = envelope_to(&bob, &alice, ct);
        envelope.recipient_device_id = envelope.recipient_device_id.wrapping_add(1);

        let result = bob.manager.decrypt(&envelope).await.unwrap();
        assert!(result.is_none());

        // No session state was created or consumed by the filtered drop.
        assert!(!bob
            .manager
            .has_session("alice", alice.manager.device().device_id)
            .await);
    }

    #[tokio::test]
    async fn ratchet_message_without_session_is_an_error() {
        let alice = make_peer("alice").await;
        let bob = make_peer("bob").await;

        alice.manager.establish(&bob.bundle).await.unwrap();
        let mut ct = alice
            .manager
            .encrypt_to("bob", bob.manager.device().device_id, b"hi")
            .await
            .unwrap();
        // Strip the handshake, masquerading as an established-session message.
        ct.kind = CiphertextKind::Ratchet;
        ct.handshake = None;

        let envelope = envelope_to(&bob, &alice, ct);
        let err = bob.manager.decrypt(&envelope).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::Decryption(_))
        ));
    }

    #[tokio::test]
    async fn tampered_bundle_fails_establish_with_authenticity_error() {
        let alice = make_peer("alice").await;
        let bob = make_peer("bob").await;

        let mut bundle = bob.bundle.clone();
        bundle.signed_pre_key.public[0] ^= 1;

        let err = alice.manager.establish(&bundle).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::Authenticity)
        ));
        assert!(!alice.manager.has_session("bob", bundle.device_id).await);
    }

    #[tokio::test]
    async fn fan_out_produces_one_ciphertext_per_device() {
        let alice = make_peer("alice").await;
        let bob = make_peer("bob").await;
        let carol = make_peer("carol").await;

        let bundles = vec![bob.bundle.clone(), carol.bundle.clone()];
        let messages = alice
            .manager
            .encrypt_with_bundles(&bundles, b"hello all")
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);

        // Each leg decrypts independently on its own device.
        for (peer, msg) in [(&bob, &messages[0]), (&carol, &messages[1])] {
            let envelope = Envelope::new(
                "alice",
                alice.manager.device().device_id,
                &peer.uid,
                msg.device_id,
                msg.ciphertext.clone(),
                MessageMeta::default(),
            );
            assert_eq!(
                peer.manager.decrypt(&envelope).await.unwrap().as_deref(),
                Some(&b"hello all"[..])
            );
        }
    }

    #[tokio::test]
    async fn sessions_survive_a_manager_restart() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(generate_identity());
        let bob = make_peer("bob").await;

        let device = {
            let vault = Arc::new(Vault::open(dir.path(), "pw").await.unwrap());
            let device = vault.init_device_record().await.unwrap();
            let manager = SessionManager::new(vault, identity.clone(), device);
            manager.bootstrap("alice", 2).await.unwrap();

            manager.establish(&bob.bundle).await.unwrap();
            let ct = manager
                .encrypt_to("bob", bob.manager.device().device_id, b"first")
                .await
                .unwrap();
            let envelope = Envelope::new(
                "alice",
                device.device_id,
                "bob",
                bob.manager.device().device_id,
                ct,
                MessageMeta::default(),
            );
            assert!(bob.manager.decrypt(&envelope).await.unwrap().is_some());
            device
        };

        // Fresh manager over the same vault: the session hydrates from disk.
        let vault = Arc::new(Vault::open(dir.path(), "pw").await.unwrap());
        let manager = SessionManager::new(vault, identity, device);
        manager.bootstrap("alice", 2).await.unwrap();
        assert!(manager.has_session("bob", bob.manager.device().device_id).await);

        let ct = manager
            .encrypt_to("bob", bob.manager.device().device_id, b"second")
            .await
            .unwrap();
        let envelope = Envelope::new(
            "alice",
            device.device_id,
            "bob",
            bob.manager.device().device_id,
            ct,
            MessageMeta::default(),
        );
        assert_eq!(
            bob.manager.decrypt(&envelope).await.unwrap().as_deref(),
            Some(&b"second"[..])
        );
    }
}

//! Ciphertext envelopes and stored message records
//!
//! A logical "send to an identity" fans out into one [`Envelope`] per
//! recipient device, each independently encrypted and independently
//! tracked. The envelope is both the wire shape pushed over a live
//! connection and the row shape queued for offline devices.

use crate::ratchet::RatchetHeader;
use crate::x3dh::HandshakeInfo;
use serde::{Deserialize, Serialize};

/// Discriminates the two ciphertext shapes a device can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiphertextKind {
    /// First-contact message carrying embedded handshake info; the
    /// receiver completes session establishment inline before decrypting.
    PreKey,
    /// Ordinary message under an established session.
    Ratchet,
}

/// One encrypted message body addressed to one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ciphertext {
    /// Pre-key vs ratchet discriminator
    pub kind: CiphertextKind,
    /// Double Ratchet header
    pub header: RatchetHeader,
    /// AEAD ciphertext bytes
    pub body: Vec<u8>,
    /// Handshake info; present exactly when `kind` is `PreKey`
    pub handshake: Option<HandshakeInfo>,
}

impl Ciphertext {
    /// Boundary validation: the handshake field must agree with the kind.
    pub fn validate(&self) -> crate::error::Result<()> {
        match (self.kind, self.handshake.is_some()) {
            (CiphertextKind::PreKey, false) => Err(crate::error::ProtocolError::Wire(
                "pre-key ciphertext without handshake info".into(),
            )),
            (CiphertextKind::Ratchet, true) => Err(crate::error::ProtocolError::Wire(
                "ratchet ciphertext with handshake info".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Message metadata the server stores but cannot read into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMeta {
    /// Set when the message is one leg of a group fan-out
    pub is_group_message: bool,
    /// Group identifier, when `is_group_message`
    pub group_id: Option<String>,
}

/// One stored/delivered message row, addressed to a single device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message id (UUID v4)
    pub id: String,
    /// Sending identity
    pub sender_uid: String,
    /// Sending device
    pub sender_device_id: u32,
    /// Receiving identity
    pub recipient_uid: String,
    /// The one device this ciphertext is decryptable by
    pub recipient_device_id: u32,
    /// Encrypted payload
    pub ciphertext: Ciphertext,
    /// Unix seconds at send time
    pub timestamp: i64,
    /// Whether the recipient identity has received the row
    pub read: bool,
    /// Whether the display layer should obscure this message
    pub blurred: bool,
    /// Group fan-out metadata
    pub metadata: MessageMeta,
}

impl Envelope {
    /// Build a fresh envelope with a new id and the current timestamp.
    pub fn new(
        sender_uid: &str,
        sender_device_id: u32,
        recipient_uid: &str,
        recipient_device_id: u32,
        ciphertext: Ciphertext,
        metadata: MessageMeta,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_uid: sender_uid.to_string(),
            sender_device_id,
            recipient_uid: recipient_uid.to_string(),
            recipient_device_id,
            ciphertext,
            timestamp: unix_timestamp(),
            read: false,
            blurred: false,
            metadata,
        }
    }
}

/// Canonical conversation id for a pair of identities: the two uids sorted
/// and joined, so both sides compute the same value.
pub fn chat_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

/// Current unix time in seconds.
pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_header() -> RatchetHeader {
        RatchetHeader {
            dh_public: [0u8; 32],
            message_number: 0,
            previous_chain_length: 0,
        }
    }

    #[test]
    fn chat_id_is_order_independent() {
        assert_eq!(chat_id("alice", "bob"), chat_id("bob", "alice"));
        assert_eq!(chat_id("alice", "bob"), "alice:bob");
        assert_eq!(chat_id("zed", "zed"), "zed:zed");
    }

    #[test]
    fn ratchet_ciphertext_must_not_carry_handshake() {
        let ct = Ciphertext {
            kind: CiphertextKind::Ratchet,
            header: dummy_header(),
            body: vec![1, 2, 3],
            handshake: None,
        };
        assert!(ct.validate().is_ok());
    }

    #[test]
    fn prekey_ciphertext_requires_handshake() {
        let ct = Ciphertext {
            kind: CiphertextKind::PreKey,
            header: dummy_header(),
            body: vec![1, 2, 3],
            handshake: None,
        };
        assert!(ct.validate().is_err());
    }

    #[test]
    fn envelope_roundtrips_through_messagepack() {
        let env = Envelope::new(
            "alice",
            1,
            "bob",
            2,
            Ciphertext {
                kind: CiphertextKind::Ratchet,
                header: dummy_header(),
                body: vec![0xEE; 64],
                handshake: None,
            },
            MessageMeta::default(),
        );

        let bytes = rmp_serde::to_vec_named(&env).unwrap();
        let decoded: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.id, env.id);
        assert_eq!(decoded.recipient_device_id, 2);
        assert!(!decoded.read);
    }
}

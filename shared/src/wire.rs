//! Typed client ↔ server protocol frames
//!
//! Every WebSocket frame is one of these enums, MessagePack-encoded with
//! named fields. Decoding validates shape at the boundary; a frame that
//! does not parse is answered with a generic error frame and never reaches
//! a handler.

use crate::bundle::KeyBundle;
use crate::envelope::{Ciphertext, Envelope, MessageMeta};
use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Domain separator a device prepends to the server's challenge nonce
/// before signing it with its identity key.
pub const AUTH_CONTEXT: &[u8] = b"Sotto-auth-v1";

/// Result of publishing a key bundle. Callers must check this: an
/// `AlreadyExists` is a successful no-op, not a stored upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    /// A bundle already existed and `force_overwrite` was false; nothing
    /// was written
    AlreadyExists,
    /// First bundle stored for this device
    Stored,
    /// Existing bundle replaced (`force_overwrite`)
    Updated,
}

/// Per-device delivery outcome for one leg of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Pushed over a live channel
    Delivered,
    /// Persisted for later fetch
    Queued,
}

/// One ciphertext leg of a fan-out send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCiphertext {
    /// Target device
    pub device_id: u32,
    /// Ciphertext encrypted for that device's session
    pub ciphertext: Ciphertext,
}

/// Delivery outcome for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Target device
    pub device_id: u32,
    /// Stored message id
    pub message_id: String,
    /// Delivered live or queued
    pub status: DeliveryStatus,
}

/// Frames sent by a client device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Answer to the server's auth challenge
    Auth {
        /// Claimed identity
        uid: String,
        /// Claimed device
        device_id: u32,
        /// Ed25519 identity public key
        pubkey: Vec<u8>,
        /// Signature over the challenge domain string plus nonce
        signature: Vec<u8>,
    },
    /// Upload or replace this device's key bundle
    PublishBundle {
        /// The bundle to store
        bundle: KeyBundle,
        /// Replace an existing bundle instead of no-opping
        force_overwrite: bool,
    },
    /// Fetch one device's bundle, consuming a one-time pre-key
    FetchBundle {
        /// Target identity
        uid: String,
        /// Target device
        device_id: u32,
    },
    /// Fetch bundles for every registered device of an identity
    FetchAllBundles {
        /// Target identity
        uid: String,
    },
    /// Ask how many one-time pre-keys the server still holds for us
    PreKeyCount,
    /// Fan a logical message out to a recipient's devices
    SendMessage {
        /// Receiving identity
        recipient_uid: String,
        /// One pre-encrypted ciphertext per recipient device
        messages: Vec<DeviceCiphertext>,
        /// Group fan-out metadata
        metadata: MessageMeta,
    },
    /// Pull queued messages newer than `since`; marks them read for the
    /// requesting device only
    FetchMessages {
        /// Unix-seconds lower bound (0 for everything)
        since: i64,
    },
    /// Re-pull the online/offline snapshot of the friend list
    GetInitialStatus,
    /// Ephemeral typing signal; relayed, never stored
    Typing {
        /// Identity being typed at
        recipient_uid: String,
    },
    /// Opt this identity in or out of blur for one conversation
    SetBlurOptIn {
        /// The other participant
        peer_uid: String,
        /// Opt in (true) or out (false)
        enabled: bool,
    },
    /// Query the blur consent state for one conversation
    GetBlurState {
        /// The other participant
        peer_uid: String,
    },
    /// Keepalive
    Ping,
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every connection: a nonce the device must sign
    AuthChallenge {
        /// Random 32-byte nonce
        nonce: Vec<u8>,
    },
    /// Authentication accepted
    AuthSuccess {
        /// Number of messages waiting in the queue
        queued_count: u64,
    },
    /// Result of a `PublishBundle`
    BundlePublished {
        /// Tri-state outcome
        status: PublishStatus,
    },
    /// A single fetched bundle
    Bundle {
        /// The bundle, with at most one one-time pre-key attached
        bundle: KeyBundle,
    },
    /// All bundles for an identity
    Bundles {
        /// Queried identity
        uid: String,
        /// One bundle per registered device
        bundles: Vec<KeyBundle>,
    },
    /// Remaining one-time pre-key count for the requesting device
    PreKeyCount {
        /// Keys left in the pool
        count: u32,
    },
    /// Per-device outcomes of a `SendMessage`
    SendReceipt {
        /// Receiving identity
        recipient_uid: String,
        /// One outcome per ciphertext leg
        outcomes: Vec<DeliveryOutcome>,
    },
    /// A message pushed over the live channel
    Message {
        /// The envelope
        envelope: Envelope,
    },
    /// Response to `FetchMessages`
    Messages {
        /// Queued envelopes, oldest first
        envelopes: Vec<Envelope>,
    },
    /// A friend came online
    UserOnline {
        /// Their identity
        uid: String,
    },
    /// A friend went offline (last device disconnected)
    UserOffline {
        /// Their identity
        uid: String,
    },
    /// Online/offline snapshot of the friend list
    InitialStatus {
        /// Friends with at least one connected device
        online: Vec<String>,
        /// Everyone else
        offline: Vec<String>,
    },
    /// A peer is typing at us
    Typing {
        /// The typing identity
        sender_uid: String,
    },
    /// Blur consent state for one conversation
    BlurState {
        /// Conversation id (sorted uid pair)
        chat_id: String,
        /// Whether this identity has opted in
        self_opted_in: bool,
        /// Whether the peer has opted in
        peer_opted_in: bool,
        /// Active iff both opted in
        enabled: bool,
    },
    /// Generic error; `code` follows HTTP semantics (404 unknown user,
    /// 410 no published keys, 401 unauthenticated, 429 rate limited)
    Error {
        /// HTTP-like status code
        code: u16,
        /// Human-readable hint
        message: String,
    },
    /// Positive acknowledgement with nothing else to say
    Ack,
    /// Keepalive reply
    Pong,
}

/// Encode a frame as named-field MessagePack.
pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(frame).map_err(|e| ProtocolError::Wire(e.to_string()))
}

/// Decode a frame, rejecting anything malformed at the boundary.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Wire(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_roundtrip() {
        let frame = ClientFrame::FetchBundle {
            uid: "bob".into(),
            device_id: 3,
        };
        let bytes = encode(&frame).unwrap();
        let decoded: ClientFrame = decode(&bytes).unwrap();
        match decoded {
            ClientFrame::FetchBundle { uid, device_id } => {
                assert_eq!(uid, "bob");
                assert_eq!(device_id, 3);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn server_frame_roundtrip() {
        let frame = ServerFrame::InitialStatus {
            online: vec!["carol".into()],
            offline: vec!["dave".into(), "erin".into()],
        };
        let bytes = encode(&frame).unwrap();
        let decoded: ServerFrame = decode(&bytes).unwrap();
        match decoded {
            ServerFrame::InitialStatus { online, offline } => {
                assert_eq!(online, vec!["carol"]);
                assert_eq!(offline.len(), 2);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_rejected_at_decode() {
        let result: Result<ClientFrame> = decode(&[0xFF, 0x00, 0x13]);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        #[derive(Serialize)]
        struct Rogue<'a> {
            #[serde(rename = "type")]
            kind: &'a str,
            anything: u32,
        }
        let bytes = encode(&Rogue {
            kind: "launch_missiles",
            anything: 1,
        })
        .unwrap();
        let result: Result<ClientFrame> = decode(&bytes);
        assert!(result.is_err());
    }
}

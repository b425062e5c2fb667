//! Group sending
//!
//! A group message here is nothing more than a pairwise send per member:
//! no shared group key, every member gets its own independently encrypted
//! ciphertext. The [`GroupSender`] trait is the seam: a sender-key
//! implementation could replace [`PairwiseFanout`] without touching the
//! session engine.

use anyhow::Result;

use sotto_shared::bundle::KeyBundle;
use sotto_shared::envelope::MessageMeta;
use sotto_shared::wire::DeviceCiphertext;

use crate::session::SessionManager;

/// One group member: identity plus the device bundles to encrypt for.
pub struct GroupRecipient {
    /// Member identity
    pub uid: String,
    /// One bundle per device of the member
    pub bundles: Vec<KeyBundle>,
}

/// One logical recipient's worth of an outgoing group message, ready to
/// hand to the transport's send operation.
pub struct OutboundGroupMessage {
    /// Receiving identity
    pub recipient_uid: String,
    /// Per-device ciphertexts
    pub messages: Vec<DeviceCiphertext>,
    /// Metadata marking the group fan-out
    pub metadata: MessageMeta,
}

/// Strategy for encrypting a message to a set of group members.
pub trait GroupSender {
    /// Produce one outbound message per member.
    fn encrypt_group(
        &self,
        group_id: &str,
        members: &[GroupRecipient],
        plaintext: &[u8],
    ) -> impl std::future::Future<Output = Result<Vec<OutboundGroupMessage>>> + Send;
}

/// The naive strategy: encrypt the plaintext separately for every device
/// of every member under the existing pairwise sessions.
pub struct PairwiseFanout<'a> {
    /// Session engine used for each pairwise leg
    pub sessions: &'a SessionManager,
}

impl GroupSender for PairwiseFanout<'_> {
    async fn encrypt_group(
        &self,
        group_id: &str,
        members: &[GroupRecipient],
        plaintext: &[u8],
    ) -> Result<Vec<OutboundGroupMessage>> {
        let metadata = MessageMeta {
            is_group_message: true,
            group_id: Some(group_id.to_string()),
        };

        let mut out = Vec::with_capacity(members.len());
        for member in members {
            let messages = self
                .sessions
                .encrypt_with_bundles(&member.bundles, plaintext)
                .await?;
            out.push(OutboundGroupMessage {
                recipient_uid: member.uid.clone(),
                messages,
                metadata: metadata.clone(),
            });
        }
        Ok(out)
    }
}

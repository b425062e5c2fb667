//! Ephemeral message blur
//!
//! A display-layer timer, nothing more: messages in a conversation where
//! both participants opted in are flagged `blurred` once they pass a fixed
//! age, on a recurring local sweep. Ciphertext and session state are never
//! touched. Either participant can opt out unilaterally, which disables
//! blur for the pair immediately.

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::vault::Vault;

/// Default age after which eligible messages blur.
pub const BLUR_AGE_SECONDS: i64 = 30;

/// Blur is active for a pair only under mutual consent.
pub fn blur_active(self_opted_in: bool, peer_opted_in: bool) -> bool {
    self_opted_in && peer_opted_in
}

/// Per-conversation consent state, fed from the server's blur frames.
#[derive(Default)]
pub struct BlurSettings {
    chats: DashMap<String, (bool, bool)>,
}

impl BlurSettings {
    /// Create empty settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the consent pair for a conversation.
    pub fn update(&self, chat_id: &str, self_opted_in: bool, peer_opted_in: bool) {
        self.chats
            .insert(chat_id.to_string(), (self_opted_in, peer_opted_in));
    }

    /// Whether blur is active for a conversation.
    pub fn active(&self, chat_id: &str) -> bool {
        self.chats
            .get(chat_id)
            .map(|entry| blur_active(entry.0, entry.1))
            .unwrap_or(false)
    }

    /// Conversations currently under mutual consent.
    pub fn mutual_chats(&self) -> Vec<String> {
        self.chats
            .iter()
            .filter(|entry| blur_active(entry.value().0, entry.value().1))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Recurring local sweep that applies blur to the vault's message store.
pub struct BlurClock {
    vault: Arc<Vault>,
    settings: Arc<BlurSettings>,
    age_seconds: i64,
    interval: Duration,
}

impl BlurClock {
    /// Build a clock over the vault and consent settings.
    pub fn new(vault: Arc<Vault>, settings: Arc<BlurSettings>) -> Self {
        Self {
            vault,
            settings,
            age_seconds: BLUR_AGE_SECONDS,
            interval: Duration::from_secs(10),
        }
    }

    /// Override the blur age (display policy, not security).
    pub fn with_age_seconds(mut self, age_seconds: i64) -> Self {
        self.age_seconds = age_seconds;
        self
    }

    /// One sweep pass over every mutually-consenting conversation.
    /// Returns the number of messages flipped.
    pub async fn sweep_once(&self) -> Result<u64> {
        let mut flipped = 0;
        for chat_id in self.settings.mutual_chats() {
            flipped += self
                .vault
                .blur_messages_older_than(&chat_id, self.age_seconds)
                .await?;
        }
        if flipped > 0 {
            debug!("Blur sweep obscured {} messages", flipped);
        }
        Ok(flipped)
    }

    /// Run the sweep on its interval until the task is dropped.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    warn!("Blur sweep error: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::LocalMessage;
    use sotto_shared::envelope::chat_id;

    #[test]
    fn blur_requires_both_opt_ins() {
        assert!(!blur_active(false, false));
        assert!(!blur_active(true, false));
        assert!(!blur_active(false, true));
        assert!(blur_active(true, true));
    }

    #[test]
    fn opt_out_immediately_deactivates_the_pair() {
        let settings = BlurSettings::new();
        let chat = chat_id("alice", "bob");

        settings.update(&chat, true, true);
        assert!(settings.active(&chat));

        // Peer stays opted in; our opt-out alone kills it.
        settings.update(&chat, false, true);
        assert!(!settings.active(&chat));
        assert!(settings.mutual_chats().is_empty());
    }

    #[tokio::test]
    async fn sweep_only_touches_consenting_chats() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(Vault::open(dir.path(), "pw").await.unwrap());
        let settings = Arc::new(BlurSettings::new());

        let consenting = chat_id("alice", "bob");
        let holdout = chat_id("alice", "carol");
        settings.update(&consenting, true, true);
        settings.update(&holdout, true, false);

        for (i, chat) in [&consenting, &holdout].into_iter().enumerate() {
            vault
                .store_message(&LocalMessage {
                    id: format!("m{i}"),
                    chat_id: chat.clone(),
                    sender_uid: "alice".into(),
                    body: b"aging message".to_vec(),
                    timestamp: sotto_shared::unix_timestamp() - 300,
                    is_outgoing: false,
                    blurred: false,
                })
                .await
                .unwrap();
        }

        let clock = BlurClock::new(vault.clone(), settings.clone());
        assert_eq!(clock.sweep_once().await.unwrap(), 1);

        let blurred = vault.messages_for_chat(&consenting).await.unwrap();
        assert!(blurred[0].blurred);
        let spared = vault.messages_for_chat(&holdout).await.unwrap();
        assert!(!spared[0].blurred);
    }

    #[tokio::test]
    async fn sweep_spares_fresh_messages() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(Vault::open(dir.path(), "pw").await.unwrap());
        let settings = Arc::new(BlurSettings::new());
        let chat = chat_id("alice", "bob");
        settings.update(&chat, true, true);

        vault
            .store_message(&LocalMessage {
                id: "fresh".into(),
                chat_id: chat.clone(),
                sender_uid: "bob".into(),
                body: b"just sent".to_vec(),
                timestamp: sotto_shared::unix_timestamp(),
                is_outgoing: false,
                blurred: false,
            })
            .await
            .unwrap();

        let clock = BlurClock::new(vault, settings);
        assert_eq!(clock.sweep_once().await.unwrap(), 0);
    }
}

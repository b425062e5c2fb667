//! Typing indicator tracking
//!
//! Typing signals are ephemeral: the sender emits one per keystroke batch
//! and never sends a "stopped" event. Each incoming signal resets that
//! peer's timer; a peer is shown as typing until the fixed window elapses
//! with no further signal.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// How long a typing indicator stays alive after the last signal.
pub const TYPING_WINDOW: Duration = Duration::from_secs(3);

/// Tracks which peers are currently typing at us.
#[derive(Default)]
pub struct TypingTracker {
    peers: Mutex<HashMap<String, Instant>>,
}

impl TypingTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a typing signal from a peer, resetting their window.
    pub fn note_typing(&self, uid: &str) {
        self.peers
            .lock()
            .expect("typing map lock")
            .insert(uid.to_string(), Instant::now());
    }

    /// Whether the peer's typing window is still open.
    pub fn is_typing(&self, uid: &str) -> bool {
        self.peers
            .lock()
            .expect("typing map lock")
            .get(uid)
            .map(|last| last.elapsed() < TYPING_WINDOW)
            .unwrap_or(false)
    }

    /// Peers with open typing windows; expired entries are pruned.
    pub fn typing_peers(&self) -> Vec<String> {
        let mut peers = self.peers.lock().expect("typing map lock");
        peers.retain(|_, last| last.elapsed() < TYPING_WINDOW);
        peers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn indicator_expires_after_the_window() {
        let tracker = TypingTracker::new();
        tracker.note_typing("bob");
        assert!(tracker.is_typing("bob"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.is_typing("bob"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!tracker.is_typing("bob"));
        assert!(tracker.typing_peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn each_signal_resets_the_window() {
        let tracker = TypingTracker::new();
        tracker.note_typing("bob");

        // Keep typing just inside the window; the indicator never drops.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(2)).await;
            assert!(tracker.is_typing("bob"));
            tracker.note_typing("bob");
        }

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!tracker.is_typing("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn peers_are_tracked_independently() {
        let tracker = TypingTracker::new();
        tracker.note_typing("bob");
        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.note_typing("carol");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!tracker.is_typing("bob"));
        assert!(tracker.is_typing("carol"));
        assert_eq!(tracker.typing_peers(), vec!["carol".to_string()]);
    }
}

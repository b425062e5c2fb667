//! Presence registry
//!
//! Tracks which identities currently have connected device channels. One
//! registry is created with the server state and torn down with it; there
//! is no module-level global. Entries are mutated under dashmap's per-key
//! locking, so rapid connect/disconnect for the same identity resolves
//! last-writer-wins without touching other identities.

use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Outbound channel to one connected device.
pub type DeviceChannel = mpsc::Sender<Vec<u8>>;

/// In-memory map of identity → connected device channels.
///
/// An identity is online while it has at least one registered channel.
/// Nothing here is persisted; the map is rebuilt from connect events.
#[derive(Default)]
pub struct PresenceRegistry {
    inner: DashMap<String, HashMap<u32, DeviceChannel>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device channel. Returns true if this took the identity
    /// from offline to online (first connected device).
    pub fn register(&self, uid: &str, device_id: u32, tx: DeviceChannel) -> bool {
        let mut entry = self.inner.entry(uid.to_string()).or_default();
        let was_offline = entry.is_empty();
        // A reconnect for the same device replaces the stale channel;
        // only the current connection matters for delivery.
        entry.insert(device_id, tx);
        was_offline
    }

    /// Remove a device channel. Returns true if the identity went offline
    /// (no channels remain).
    pub fn unregister(&self, uid: &str, device_id: u32) -> bool {
        let went_offline = match self.inner.get_mut(uid) {
            Some(mut entry) => {
                entry.remove(&device_id);
                entry.is_empty()
            }
            None => false,
        };
        if went_offline {
            self.inner.remove_if(uid, |_, channels| channels.is_empty());
        }
        went_offline
    }

    /// Whether the identity has any connected device.
    pub fn is_online(&self, uid: &str) -> bool {
        self.inner
            .get(uid)
            .map(|entry| !entry.is_empty())
            .unwrap_or(false)
    }

    /// Snapshot of every connected channel for an identity.
    pub fn channels(&self, uid: &str) -> Vec<DeviceChannel> {
        self.inner
            .get(uid)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of identities currently online.
    pub fn online_count(&self) -> usize {
        self.inner.len()
    }
}

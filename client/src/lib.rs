//! Sotto device-side core
//!
//! Everything a client application needs short of a UI: the encrypted
//! local vault ([`vault::Vault`]), pairwise session management
//! ([`session::SessionManager`]), the server connection
//! ([`connection::ConnectionManager`]), pairwise group fan-out
//! ([`group::PairwiseFanout`]), and the ephemeral display-layer timers
//! ([`blur`], [`typing`]).
//!
//! The intended wiring: open the vault, load or generate the identity and
//! device record, `bootstrap` the session manager (publishing the returned
//! bundle when one is generated), connect, and then drive sends through
//! [`session::SessionManager::encrypt_with_bundles`] and receives through
//! [`session::SessionManager::decrypt`].

#![warn(unsafe_code)]

pub mod blur;
pub mod connection;
pub mod group;
pub mod session;
pub mod typing;
pub mod vault;

pub use blur::{blur_active, BlurClock, BlurSettings};
pub use connection::{ConnectionManager, RequestError, ServerEvent};
pub use group::{GroupRecipient, GroupSender, OutboundGroupMessage, PairwiseFanout};
pub use session::SessionManager;
pub use typing::{TypingTracker, TYPING_WINDOW};
pub use vault::{DeviceRecord, LocalMessage, Vault};

//! WebSocket connection management
//!
//! One [`ConnectionManager`] value owns the socket for a device; there is
//! no module-level singleton. Frames sent before the server accepts our
//! auth are queued and flushed on `AuthSuccess` (deferred send, not an
//! error), and request/response pairs like bundle fetches are bridged over
//! oneshot slots with explicit timeouts: a hung fetch degrades into a
//! typed timeout instead of blocking the caller forever.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use sotto_shared::bundle::KeyBundle;
use sotto_shared::envelope::{Envelope, MessageMeta};
use sotto_shared::keys::IdentityKey;
use sotto_shared::wire::{
    self, ClientFrame, DeliveryOutcome, DeviceCiphertext, PublishStatus, ServerFrame, AUTH_CONTEXT,
};

/// Default time to wait for a request/response round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-originated events surfaced to the application.
#[derive(Debug)]
pub enum ServerEvent {
    /// Authentication completed; queued frames have been flushed
    Connected {
        /// Messages waiting server-side
        queued_count: u64,
    },
    /// A live-pushed envelope
    Message(Envelope),
    /// Response to a message fetch
    Messages(Vec<Envelope>),
    /// Per-device outcomes of a send
    SendReceipt {
        /// Receiving identity
        recipient_uid: String,
        /// One outcome per device leg
        outcomes: Vec<DeliveryOutcome>,
    },
    /// Result of a bundle publish
    BundlePublished(PublishStatus),
    /// Remaining one-time pre-keys server-side
    PreKeyCount(u32),
    /// A friend came online
    UserOnline(String),
    /// A friend went offline
    UserOffline(String),
    /// Online/offline snapshot of the friend list
    InitialStatus {
        /// Online friends
        online: Vec<String>,
        /// Offline friends
        offline: Vec<String>,
    },
    /// A peer is typing at us
    Typing {
        /// The typing identity
        sender_uid: String,
    },
    /// Blur consent state for a conversation
    BlurState {
        /// Conversation id
        chat_id: String,
        /// Our opt-in
        self_opted_in: bool,
        /// Peer's opt-in
        peer_opted_in: bool,
        /// Mutual consent
        enabled: bool,
    },
    /// An error frame not tied to an in-flight request
    ServerError {
        /// HTTP-like code
        code: u16,
        /// Human-readable hint
        message: String,
    },
    /// The socket closed
    Disconnected,
}

/// Typed failures of a request/response exchange.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Unknown identity or device, possibly a typo
    #[error("user not found")]
    NotFound,
    /// The peer has no published keys; they must act before a session can
    /// be established
    #[error("{0}")]
    Gone(String),
    /// No response inside the window; treat the feature as unavailable
    #[error("request timed out")]
    Timeout,
    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),
}

enum BundleResponse {
    One(KeyBundle),
    Many(Vec<KeyBundle>),
}

type BundleSlot = Mutex<Option<oneshot::Sender<Result<BundleResponse, RequestError>>>>;

/// Owns the device's server connection.
pub struct ConnectionManager {
    tx: mpsc::Sender<Vec<u8>>,
    authed: AtomicBool,
    /// Frames queued before auth completes, flushed in order on success
    pending: Mutex<Vec<Vec<u8>>>,
    /// At most one bundle request in flight at a time
    bundle_slot: BundleSlot,
    request_timeout: Duration,
}

impl ConnectionManager {
    fn with_channel(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            tx,
            authed: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            bundle_slot: Mutex::new(None),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Connect to the server, answer its auth challenge with the device's
    /// identity key, and spawn the read/write tasks.
    ///
    /// Returns the manager plus the event stream the application consumes.
    pub async fn connect(
        server_url: &str,
        identity: Arc<IdentityKey>,
        uid: &str,
        device_id: u32,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ServerEvent>)> {
        let (ws_stream, _) = connect_async(server_url).await?;
        let (mut write, mut read) = ws_stream.split();

        // The server speaks first: a nonce we must sign.
        let nonce = loop {
            let msg = read
                .next()
                .await
                .ok_or_else(|| anyhow::anyhow!("Server closed before sending auth challenge"))?
                .map_err(|e| anyhow::anyhow!("WebSocket error awaiting challenge: {}", e))?;
            match msg {
                Message::Binary(data) => match wire::decode::<ServerFrame>(&data)? {
                    ServerFrame::AuthChallenge { nonce } => break nonce,
                    other => anyhow::bail!("Expected auth challenge, got {:?}", other),
                },
                Message::Ping(_) | Message::Pong(_) => continue,
                other => anyhow::bail!("Expected binary auth challenge, got {:?}", other),
            }
        };

        let mut challenge_data = AUTH_CONTEXT.to_vec();
        challenge_data.extend_from_slice(&nonce);
        let signature = identity.sign(&challenge_data).to_bytes().to_vec();

        let auth = wire::encode(&ClientFrame::Auth {
            uid: uid.to_string(),
            device_id,
            pubkey: identity.public_signing_key().as_bytes().to_vec(),
            signature,
        })?;
        write
            .send(Message::Binary(auth))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send auth: {}", e))?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(100);
        let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(100);

        let manager = Arc::new(Self::with_channel(tx));

        // Write task: drain the outbound channel into the socket.
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = write.send(Message::Binary(data)).await {
                    error!("WebSocket send error: {}", e);
                    break;
                }
            }
            debug!("WebSocket write task ended");
        });

        // Read task: decode and dispatch server frames.
        let reader = manager.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if let Err(e) = reader.handle_server_frame(&data, &event_tx).await {
                            error!("Error handling server frame: {}", e);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("Server closed connection");
                        let _ = event_tx.send(ServerEvent::Disconnected).await;
                        break;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        let _ = event_tx.send(ServerEvent::Disconnected).await;
                        break;
                    }
                    _ => {}
                }
            }
            reader.authed.store(false, Ordering::Release);
        });

        info!("Connected to {} as {}/{}", server_url, uid, device_id);
        Ok((manager, event_rx))
    }

    async fn handle_server_frame(
        &self,
        data: &[u8],
        events: &mpsc::Sender<ServerEvent>,
    ) -> Result<()> {
        let frame: ServerFrame = wire::decode(data)?;
        match frame {
            ServerFrame::AuthChallenge { .. } => {
                warn!("Unexpected auth challenge after handshake");
            }
            ServerFrame::AuthSuccess { queued_count } => {
                self.authed.store(true, Ordering::Release);
                self.flush_pending().await;
                let _ = events.send(ServerEvent::Connected { queued_count }).await;
            }
            ServerFrame::Bundle { bundle } => {
                self.deliver_bundle(Ok(BundleResponse::One(bundle))).await;
            }
            ServerFrame::Bundles { bundles, .. } => {
                self.deliver_bundle(Ok(BundleResponse::Many(bundles))).await;
            }
            ServerFrame::Error { code, message } => {
                // An in-flight bundle request claims the error; anything
                // else surfaces to the application.
                let mut slot = self.bundle_slot.lock().await;
                if let Some(tx) = slot.take() {
                    let err = match code {
                        404 => RequestError::NotFound,
                        410 => RequestError::Gone(message),
                        _ => RequestError::Transport(message),
                    };
                    let _ = tx.send(Err(err));
                } else {
                    let _ = events.send(ServerEvent::ServerError { code, message }).await;
                }
            }
            ServerFrame::BundlePublished { status } => {
                let _ = events.send(ServerEvent::BundlePublished(status)).await;
            }
            ServerFrame::PreKeyCount { count } => {
                let _ = events.send(ServerEvent::PreKeyCount(count)).await;
            }
            ServerFrame::SendReceipt {
                recipient_uid,
                outcomes,
            } => {
                let _ = events
                    .send(ServerEvent::SendReceipt {
                        recipient_uid,
                        outcomes,
                    })
                    .await;
            }
            ServerFrame::Message { envelope } => {
                let _ = events.send(ServerEvent::Message(envelope)).await;
            }
            ServerFrame::Messages { envelopes } => {
                let _ = events.send(ServerEvent::Messages(envelopes)).await;
            }
            ServerFrame::UserOnline { uid } => {
                let _ = events.send(ServerEvent::UserOnline(uid)).await;
            }
            ServerFrame::UserOffline { uid } => {
                let _ = events.send(ServerEvent::UserOffline(uid)).await;
            }
            ServerFrame::InitialStatus { online, offline } => {
                let _ = events.send(ServerEvent::InitialStatus { online, offline }).await;
            }
            ServerFrame::Typing { sender_uid } => {
                let _ = events.send(ServerEvent::Typing { sender_uid }).await;
            }
            ServerFrame::BlurState {
                chat_id,
                self_opted_in,
                peer_opted_in,
                enabled,
            } => {
                let _ = events
                    .send(ServerEvent::BlurState {
                        chat_id,
                        self_opted_in,
                        peer_opted_in,
                        enabled,
                    })
                    .await;
            }
            ServerFrame::Ack | ServerFrame::Pong => {}
        }
        Ok(())
    }

    /// Send a frame, or queue it if auth has not completed yet.
    pub async fn send(&self, frame: &ClientFrame) -> Result<()> {
        let bytes = wire::encode(frame)?;
        if !self.authed.load(Ordering::Acquire) {
            self.pending.lock().await.push(bytes);
            return Ok(());
        }
        self.tx
            .send(bytes)
            .await
            .map_err(|_| anyhow::anyhow!("Connection closed"))
    }

    async fn flush_pending(&self) {
        let drained: Vec<Vec<u8>> = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        debug!("Flushing {} queued frames", drained.len());
        for bytes in drained {
            if self.tx.send(bytes).await.is_err() {
                break;
            }
        }
    }

    async fn deliver_bundle(&self, response: Result<BundleResponse, RequestError>) {
        if let Some(tx) = self.bundle_slot.lock().await.take() {
            let _ = tx.send(response);
        } else {
            warn!("Bundle response with no request in flight");
        }
    }

    async fn arm_bundle_slot(&self) -> oneshot::Receiver<Result<BundleResponse, RequestError>> {
        let (tx, rx) = oneshot::channel();
        *self.bundle_slot.lock().await = Some(tx);
        rx
    }

    async fn await_bundle(
        &self,
        rx: oneshot::Receiver<Result<BundleResponse, RequestError>>,
    ) -> Result<BundleResponse, RequestError> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Transport("response channel dropped".into())),
            Err(_) => {
                // Disarm so a late reply is not mistaken for the next request's.
                *self.bundle_slot.lock().await = None;
                Err(RequestError::Timeout)
            }
        }
    }

    /// Fetch one device's bundle (consumes a one-time pre-key server-side).
    pub async fn fetch_bundle(&self, uid: &str, device_id: u32) -> Result<KeyBundle, RequestError> {
        let rx = self.arm_bundle_slot().await;
        self.send(&ClientFrame::FetchBundle {
            uid: uid.to_string(),
            device_id,
        })
        .await
        .map_err(|e| RequestError::Transport(e.to_string()))?;

        match self.await_bundle(rx).await? {
            BundleResponse::One(bundle) => Ok(bundle),
            BundleResponse::Many(_) => {
                Err(RequestError::Transport("unexpected response shape".into()))
            }
        }
    }

    /// Fetch bundles for every device of an identity.
    pub async fn fetch_all_bundles(&self, uid: &str) -> Result<Vec<KeyBundle>, RequestError> {
        let rx = self.arm_bundle_slot().await;
        self.send(&ClientFrame::FetchAllBundles {
            uid: uid.to_string(),
        })
        .await
        .map_err(|e| RequestError::Transport(e.to_string()))?;

        match self.await_bundle(rx).await? {
            BundleResponse::Many(bundles) => Ok(bundles),
            BundleResponse::One(bundle) => Ok(vec![bundle]),
        }
    }

    /// Publish this device's key bundle.
    pub async fn publish_bundle(&self, bundle: KeyBundle, force_overwrite: bool) -> Result<()> {
        self.send(&ClientFrame::PublishBundle {
            bundle,
            force_overwrite,
        })
        .await
    }

    /// Send pre-encrypted per-device ciphertexts to an identity.
    pub async fn send_message(
        &self,
        recipient_uid: &str,
        messages: Vec<DeviceCiphertext>,
        metadata: MessageMeta,
    ) -> Result<()> {
        self.send(&ClientFrame::SendMessage {
            recipient_uid: recipient_uid.to_string(),
            messages,
            metadata,
        })
        .await
    }

    /// Pull queued messages newer than `since`.
    pub async fn fetch_messages(&self, since: i64) -> Result<()> {
        self.send(&ClientFrame::FetchMessages { since }).await
    }

    /// Emit a typing signal toward a peer.
    pub async fn typing(&self, recipient_uid: &str) -> Result<()> {
        self.send(&ClientFrame::Typing {
            recipient_uid: recipient_uid.to_string(),
        })
        .await
    }

    /// Opt in or out of blur for a conversation.
    pub async fn set_blur_opt_in(&self, peer_uid: &str, enabled: bool) -> Result<()> {
        self.send(&ClientFrame::SetBlurOptIn {
            peer_uid: peer_uid.to_string(),
            enabled,
        })
        .await
    }

    /// Re-pull the friend presence snapshot.
    pub async fn get_initial_status(&self) -> Result<()> {
        self.send(&ClientFrame::GetInitialStatus).await
    }
}

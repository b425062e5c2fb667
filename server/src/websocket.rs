//! WebSocket handler for real-time messaging
//!
//! Each connection is one device channel. A connection must answer the
//! auth challenge before any other frame is accepted; after that, frames
//! are decoded into typed [`ClientFrame`]s at the boundary and dispatched.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use sqlx::{Pool, Sqlite};
use sotto_shared::envelope::{chat_id, Envelope};
use sotto_shared::wire::{
    self, ClientFrame, DeliveryOutcome, DeliveryStatus, DeviceCiphertext, ServerFrame,
};

use crate::auth::{verify_challenge, AUTH_CONTEXT};
use crate::config::ServerConfig;
use crate::database::{self, FetchBundleError};
use crate::presence::PresenceRegistry;

/// Upper bound on envelopes returned by a single fetch.
const FETCH_LIMIT: i64 = 500;

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Simple token-bucket rate limiter (per connection, not shared)
struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: std::time::Instant,
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: std::time::Instant::now(),
        }
    }

    /// Try to consume one token. Returns false if rate limit exceeded.
    fn try_consume(&mut self) -> bool {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection state
// ---------------------------------------------------------------------------

struct Connection {
    /// Set once the auth challenge has been answered
    device: Option<(String, u32)>,
    tx: mpsc::Sender<Vec<u8>>,
    auth_challenge: Vec<u8>,
    /// 30 burst, 10/s refill
    rate_limiter: RateLimiter,
}

impl Connection {
    async fn send_frame(&self, frame: &ServerFrame) -> anyhow::Result<()> {
        let bytes = wire::encode(frame)?;
        self.tx
            .send(bytes)
            .await
            .map_err(|_| anyhow::anyhow!("connection channel closed"))
    }

    async fn send_error(&self, code: u16, message: &str) -> anyhow::Result<()> {
        self.send_frame(&ServerFrame::Error {
            code,
            message: message.to_string(),
        })
        .await
    }
}

/// Require the connection to be authenticated, returning (uid, device_id).
fn require_auth(conn: &Connection) -> anyhow::Result<(String, u32)> {
    conn.device
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Not authenticated"))
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

/// Server state shared across connections
pub struct ServerState {
    pub db_pool: Pool<Sqlite>,
    pub config: ServerConfig,
    /// Which identities have which device channels connected
    pub presence: PresenceRegistry,
    /// Current total connection count (for enforcing max_connections)
    connection_count: AtomicUsize,
    /// Per-IP connection counts (for enforcing max_connections_per_ip)
    ip_connections: dashmap::DashMap<std::net::IpAddr, AtomicUsize>,
}

impl ServerState {
    pub fn new(db_pool: Pool<Sqlite>, config: ServerConfig) -> Self {
        Self {
            db_pool,
            config,
            presence: PresenceRegistry::new(),
            connection_count: AtomicUsize::new(0),
            ip_connections: dashmap::DashMap::new(),
        }
    }

    /// Try to acquire a connection slot. Returns false if limits are exceeded.
    fn try_acquire_connection(&self, ip: std::net::IpAddr) -> bool {
        let max_global = self.config.max_connections;
        let max_per_ip = self.config.max_connections_per_ip;

        if max_global > 0 && self.connection_count.load(Ordering::Relaxed) >= max_global {
            return false;
        }

        if max_per_ip > 0 {
            let entry = self
                .ip_connections
                .entry(ip)
                .or_insert_with(|| AtomicUsize::new(0));
            if entry.value().load(Ordering::Relaxed) >= max_per_ip {
                return false;
            }
            entry.value().fetch_add(1, Ordering::Relaxed);
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release a connection slot.
    fn release_connection(&self, ip: std::net::IpAddr) {
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
        if let Some(entry) = self.ip_connections.get(&ip) {
            let prev = entry.value().fetch_sub(1, Ordering::Relaxed);
            if prev <= 1 {
                drop(entry);
                self.ip_connections.remove(&ip);
            }
        }
    }

    /// Friend list lookup with the configured timeout. Timeout or error
    /// degrades to an empty list: presence is then simply not broadcast,
    /// rather than the connection hanging on a slow collaborator.
    async fn friends_or_empty(&self, uid: &str) -> Vec<String> {
        let deadline = std::time::Duration::from_millis(self.config.friend_fetch_timeout_ms);
        match tokio::time::timeout(deadline, database::get_friends(&self.db_pool, uid)).await {
            Ok(Ok(friends)) => friends,
            Ok(Err(e)) => {
                warn!("Friend lookup failed for {}: {}", uid, e);
                Vec::new()
            }
            Err(_) => {
                warn!("Friend lookup timed out for {}", uid);
                Vec::new()
            }
        }
    }

    /// Push an encoded frame to every connected channel of an identity.
    async fn push_to_identity(&self, uid: &str, bytes: Vec<u8>) {
        for channel in self.presence.channels(uid) {
            let _ = channel.send(bytes.clone()).await;
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket upgrade handler
// ---------------------------------------------------------------------------

/// Handle WebSocket upgrade; enforces connection limits before accepting
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = addr.ip();

    if !state.try_acquire_connection(ip) {
        warn!("Connection rejected for {}: limit exceeded", ip);
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
        .into_response()
}

// ---------------------------------------------------------------------------
// Socket lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, addr: SocketAddr) {
    let ip = addr.ip();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(50);

    let auth_challenge: Vec<u8> = {
        use rand::rngs::OsRng;
        use rand::RngCore;
        let mut nonce = vec![0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        nonce
    };

    let mut conn = Connection {
        device: None,
        tx: tx.clone(),
        auth_challenge: auth_challenge.clone(),
        rate_limiter: RateLimiter::new(30.0, 10.0),
    };

    info!("New WebSocket connection from {}", addr);

    {
        let challenge = wire::encode(&ServerFrame::AuthChallenge {
            nonce: auth_challenge,
        })
        .unwrap_or_default();
        if ws_sender.send(Message::Binary(challenge)).await.is_err() {
            error!("Failed to send auth challenge to {}", addr);
            state.release_connection(ip);
            return;
        }
    }

    // Forward outbound frames and send periodic pings.
    let ping_interval_secs = state.config.ws_ping_interval;
    let forward_task = tokio::spawn(async move {
        let mut ping_ticker =
            tokio::time::interval(std::time::Duration::from_secs(ping_interval_secs));
        ping_ticker.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(data) => {
                            if ws_sender.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_ticker.tick() => {
                    if ws_sender.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Unauthenticated connections get dropped at the deadline.
    let auth_timeout = std::time::Duration::from_secs(state.config.auth_timeout_seconds);
    let auth_deadline = tokio::time::Instant::now() + auth_timeout;

    loop {
        let next_msg = if conn.device.is_none() {
            match tokio::time::timeout_at(auth_deadline, ws_receiver.next()).await {
                Ok(msg) => msg,
                Err(_) => {
                    warn!("Auth timeout for {} — dropping connection", addr);
                    break;
                }
            }
        } else {
            ws_receiver.next().await
        };

        match next_msg {
            Some(Ok(msg)) => match msg {
                Message::Binary(data) => {
                    if let Err(e) = handle_frame(&data, &mut conn, &state).await {
                        // Full error server-side; generic message to the
                        // client so internals never leak.
                        error!("Error handling frame from {}: {}", addr, e);
                        let _ = conn.send_error(400, "Request failed").await;
                    }
                }
                Message::Text(_) => { /* ignore text frames */ }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => { /* axum auto-responds to pings */ }
            },
            Some(Err(e)) => {
                debug!("WebSocket error from {}: {}", addr, e);
                break;
            }
            None => break,
        }
    }

    // Cleanup: drop the channel and, if this was the identity's last
    // device, tell online friends it went offline.
    if let Some((uid, device_id)) = conn.device.take() {
        let went_offline = state.presence.unregister(&uid, device_id);
        if went_offline {
            broadcast_presence(&state, &uid, false).await;
        }
        info!("Device {}/{} disconnected ({})", uid, device_id, addr);
    }

    state.release_connection(ip);
    forward_task.abort();
}

// ---------------------------------------------------------------------------
// Frame dispatch
// ---------------------------------------------------------------------------

async fn handle_frame(
    data: &[u8],
    conn: &mut Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    if data.len() > state.config.max_message_size {
        anyhow::bail!("Frame too large: {} bytes", data.len());
    }

    // Typed decode at the boundary; malformed input never reaches a handler.
    let frame: ClientFrame = wire::decode(data)?;

    // Rate limit everything except keepalives and the auth exchange itself.
    if !matches!(frame, ClientFrame::Ping | ClientFrame::Auth { .. })
        && !conn.rate_limiter.try_consume()
    {
        conn.send_error(429, "Rate limit exceeded — slow down").await?;
        return Ok(());
    }

    match frame {
        ClientFrame::Auth {
            uid,
            device_id,
            pubkey,
            signature,
        } => handle_auth(uid, device_id, pubkey, signature, conn, state).await,
        ClientFrame::PublishBundle {
            bundle,
            force_overwrite,
        } => handle_publish_bundle(bundle, force_overwrite, conn, state).await,
        ClientFrame::FetchBundle { uid, device_id } => {
            handle_fetch_bundle(&uid, device_id, conn, state).await
        }
        ClientFrame::FetchAllBundles { uid } => handle_fetch_all_bundles(&uid, conn, state).await,
        ClientFrame::PreKeyCount => handle_pre_key_count(conn, state).await,
        ClientFrame::SendMessage {
            recipient_uid,
            messages,
            metadata,
        } => handle_send_message(&recipient_uid, messages, metadata, conn, state).await,
        ClientFrame::FetchMessages { since } => handle_fetch_messages(since, conn, state).await,
        ClientFrame::GetInitialStatus => handle_get_initial_status(conn, state).await,
        ClientFrame::Typing { recipient_uid } => handle_typing(&recipient_uid, conn, state).await,
        ClientFrame::SetBlurOptIn { peer_uid, enabled } => {
            handle_set_blur_opt_in(&peer_uid, enabled, conn, state).await
        }
        ClientFrame::GetBlurState { peer_uid } => {
            handle_get_blur_state(&peer_uid, conn, state).await
        }
        ClientFrame::Ping => {
            conn.send_frame(&ServerFrame::Pong).await?;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

async fn handle_auth(
    uid: String,
    device_id: u32,
    pubkey: Vec<u8>,
    signature: Vec<u8>,
    conn: &mut Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let mut challenge_data = AUTH_CONTEXT.to_vec();
    challenge_data.extend_from_slice(&conn.auth_challenge);
    if !verify_challenge(&pubkey, &signature, &challenge_data) {
        warn!("Invalid authentication signature for {}", uid);
        conn.send_error(401, "Invalid authentication signature").await?;
        return Ok(());
    }

    // A known device must present the key it registered with; anything
    // else is a different installation claiming the same slot.
    if let Some(stored) = database::register_device(&state.db_pool, &uid, device_id, &pubkey).await?
    {
        if stored != pubkey {
            warn!("Identity key mismatch for {}/{}", uid, device_id);
            conn.send_error(401, "Identity key mismatch for this device").await?;
            return Ok(());
        }
    }

    conn.device = Some((uid.clone(), device_id));
    let came_online = state.presence.register(&uid, device_id, conn.tx.clone());

    let queued = database::count_queued(&state.db_pool, &uid).await.unwrap_or(0);
    conn.send_frame(&ServerFrame::AuthSuccess {
        queued_count: queued as u64,
    })
    .await?;

    info!("Device {}/{} authenticated", uid, device_id);

    // Tell online friends we appeared (only on the first device), and give
    // this connection a presence snapshot so it does not depend on having
    // seen live broadcasts.
    if came_online {
        broadcast_presence(state, &uid, true).await;
    }
    send_initial_status(&uid, conn, state).await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Key bundles
// ---------------------------------------------------------------------------

async fn handle_publish_bundle(
    bundle: sotto_shared::KeyBundle,
    force_overwrite: bool,
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let (uid, device_id) = require_auth(conn)?;

    if bundle.uid != uid || bundle.device_id != device_id {
        conn.send_error(403, "Bundle does not belong to this device").await?;
        return Ok(());
    }

    // The server re-checks the signed pre-key signature: a bundle that
    // cannot be verified would strand every peer that fetches it.
    if let Err(e) = bundle.verify() {
        warn!("Rejected bundle from {}/{}: {}", uid, device_id, e);
        conn.send_error(400, "Bundle failed verification").await?;
        return Ok(());
    }

    let status = database::publish_bundle(&state.db_pool, &bundle, force_overwrite).await?;
    debug!(
        "Bundle publish for {}/{}: {:?} ({} one-time keys)",
        uid,
        device_id,
        status,
        bundle.one_time_pre_keys.len()
    );

    conn.send_frame(&ServerFrame::BundlePublished { status }).await?;
    Ok(())
}

async fn send_fetch_error(conn: &Connection, err: FetchBundleError) -> anyhow::Result<()> {
    match err {
        FetchBundleError::NotFound => conn.send_error(404, "User not found").await,
        FetchBundleError::Gone => {
            conn.send_error(
                410,
                "No published keys for this device — ask them to republish or reinstall",
            )
            .await
        }
        FetchBundleError::Db(e) => Err(e.into()),
    }
}

async fn handle_fetch_bundle(
    uid: &str,
    device_id: u32,
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    require_auth(conn)?;

    match database::fetch_bundle(&state.db_pool, uid, device_id).await {
        Ok(bundle) => conn.send_frame(&ServerFrame::Bundle { bundle }).await,
        Err(e) => send_fetch_error(conn, e).await,
    }
}

async fn handle_fetch_all_bundles(
    uid: &str,
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    require_auth(conn)?;

    match database::fetch_all_bundles(&state.db_pool, uid).await {
        Ok(bundles) => {
            conn.send_frame(&ServerFrame::Bundles {
                uid: uid.to_string(),
                bundles,
            })
            .await
        }
        Err(e) => send_fetch_error(conn, e).await,
    }
}

async fn handle_pre_key_count(conn: &Connection, state: &Arc<ServerState>) -> anyhow::Result<()> {
    let (uid, device_id) = require_auth(conn)?;
    let count = database::count_one_time_pre_keys(&state.db_pool, &uid, device_id).await?;
    conn.send_frame(&ServerFrame::PreKeyCount { count }).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Message fan-out
// ---------------------------------------------------------------------------

async fn handle_send_message(
    recipient_uid: &str,
    messages: Vec<DeviceCiphertext>,
    metadata: sotto_shared::MessageMeta,
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let (sender_uid, sender_device_id) = require_auth(conn)?;

    if !database::identity_exists(&state.db_pool, recipient_uid).await? {
        conn.send_error(404, "User not found").await?;
        return Ok(());
    }

    let online = state.presence.is_online(recipient_uid);

    // Queue cap applies only while the recipient is offline; a connected
    // identity drains pushes immediately.
    if !online {
        let queued = database::count_queued(&state.db_pool, recipient_uid).await?;
        if queued + messages.len() as i64 > state.config.max_queued_messages as i64 {
            warn!(
                "Queue full for {} ({}/{}), rejecting send from {}",
                recipient_uid, queued, state.config.max_queued_messages, sender_uid
            );
            conn.send_error(429, "Recipient's message queue is full").await?;
            return Ok(());
        }
    }

    let mut outcomes = Vec::with_capacity(messages.len());
    for DeviceCiphertext {
        device_id,
        ciphertext,
    } in messages
    {
        ciphertext.validate()?;
        if ciphertext.body.len() > state.config.max_message_size {
            anyhow::bail!("Ciphertext too large for device {}", device_id);
        }

        let mut envelope = Envelope::new(
            &sender_uid,
            sender_device_id,
            recipient_uid,
            device_id,
            ciphertext,
            metadata.clone(),
        );
        envelope.read = online;

        database::store_envelope(&state.db_pool, &envelope).await?;

        let status = if online {
            // Fan out at the transport layer too: every connected channel
            // of the identity gets the envelope, and devices it was not
            // encrypted for drop it locally.
            let bytes = wire::encode(&ServerFrame::Message {
                envelope: envelope.clone(),
            })?;
            state.push_to_identity(recipient_uid, bytes).await;
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Queued
        };

        outcomes.push(DeliveryOutcome {
            device_id,
            message_id: envelope.id,
            status,
        });
    }

    debug!(
        "Message {} -> {}: {} device rows ({})",
        sender_uid,
        recipient_uid,
        outcomes.len(),
        if online { "delivered" } else { "queued" }
    );

    conn.send_frame(&ServerFrame::SendReceipt {
        recipient_uid: recipient_uid.to_string(),
        outcomes,
    })
    .await?;
    Ok(())
}

async fn handle_fetch_messages(
    since: i64,
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let (uid, device_id) = require_auth(conn)?;

    let envelopes = database::fetch_queued(&state.db_pool, &uid, since, FETCH_LIMIT).await?;

    // Read flags flip only for rows addressed to the fetching device; a
    // sibling device's queue is untouched.
    let marked = database::mark_read_for_device(&state.db_pool, &uid, device_id).await?;
    if marked > 0 {
        debug!("Marked {} rows read for {}/{}", marked, uid, device_id);
    }

    conn.send_frame(&ServerFrame::Messages { envelopes }).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Emit `user_online`/`user_offline` for `uid` to every friend that is
/// currently connected. Friend lookup failures degrade to no broadcast.
async fn broadcast_presence(state: &Arc<ServerState>, uid: &str, online: bool) {
    let friends = state.friends_or_empty(uid).await;
    if friends.is_empty() {
        return;
    }

    let frame = if online {
        ServerFrame::UserOnline {
            uid: uid.to_string(),
        }
    } else {
        ServerFrame::UserOffline {
            uid: uid.to_string(),
        }
    };
    let bytes = match wire::encode(&frame) {
        Ok(b) => b,
        Err(_) => return,
    };

    for friend in &friends {
        if state.presence.is_online(friend) {
            state.push_to_identity(friend, bytes.clone()).await;
        }
    }
}

/// Current online/offline split of the friend list, for connections that
/// missed live broadcasts (reconnect races make broadcast-only lossy).
async fn send_initial_status(
    uid: &str,
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let friends = state.friends_or_empty(uid).await;
    let (online, offline): (Vec<String>, Vec<String>) = friends
        .into_iter()
        .partition(|f| state.presence.is_online(f));

    conn.send_frame(&ServerFrame::InitialStatus { online, offline }).await?;
    Ok(())
}

async fn handle_get_initial_status(
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let (uid, _) = require_auth(conn)?;
    send_initial_status(&uid, conn, state).await
}

// ---------------------------------------------------------------------------
// Typing indicator
// ---------------------------------------------------------------------------

/// Relay a typing signal to the recipient's connected devices. Nothing is
/// persisted and no ack is sent. Expiry is the receiver's 3-second timer,
/// reset per signal, so idle senders never need a stop event.
async fn handle_typing(
    recipient_uid: &str,
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let (sender_uid, _) = require_auth(conn)?;

    if state.presence.is_online(recipient_uid) {
        let bytes = wire::encode(&ServerFrame::Typing { sender_uid })?;
        state.push_to_identity(recipient_uid, bytes).await;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Blur consent
// ---------------------------------------------------------------------------

async fn send_blur_state(
    uid: &str,
    peer_uid: &str,
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let chat = chat_id(uid, peer_uid);
    let self_opted_in = database::blur_opted_in(&state.db_pool, &chat, uid).await?;
    let peer_opted_in = database::blur_opted_in(&state.db_pool, &chat, peer_uid).await?;

    conn.send_frame(&ServerFrame::BlurState {
        chat_id: chat,
        self_opted_in,
        peer_opted_in,
        enabled: self_opted_in && peer_opted_in,
    })
    .await?;
    Ok(())
}

async fn handle_set_blur_opt_in(
    peer_uid: &str,
    enabled: bool,
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let (uid, _) = require_auth(conn)?;
    let chat = chat_id(&uid, peer_uid);

    database::set_blur_opt_in(&state.db_pool, &chat, &uid, enabled).await?;
    info!(
        "Blur opt-{} by {} for chat {}",
        if enabled { "in" } else { "out" },
        uid,
        chat
    );

    send_blur_state(&uid, peer_uid, conn, state).await
}

async fn handle_get_blur_state(
    peer_uid: &str,
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let (uid, _) = require_auth(conn)?;
    send_blur_state(&uid, peer_uid, conn, state).await
}

//! Database operations
//!
//! The server stores only public key material and opaque ciphertext rows.
//! One-time pre-keys live in their own table so that handing one out can
//! delete it in the same transaction, so a consumed key is never served to a
//! second establisher.

use anyhow::Result;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::info;

use sotto_shared::bundle::KeyBundle;
use sotto_shared::envelope::{chat_id, Ciphertext, Envelope, MessageMeta};
use sotto_shared::wire::PublishStatus;

/// Failure modes of a bundle fetch that callers must distinguish: an
/// unknown identity may be a typo, while a known device with no keys needs
/// the peer to act.
#[derive(Debug, thiserror::Error)]
pub enum FetchBundleError {
    /// No such identity or device
    #[error("user not found")]
    NotFound,
    /// Device exists but has no published key material
    #[error("no published keys for this device; ask them to republish or reinstall")]
    Gone,
    /// Underlying database failure
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Initialize the database connection pool
pub async fn init(database_url: &str) -> Result<Pool<Sqlite>> {
    if !sqlx::Sqlite::database_exists(database_url).await.unwrap_or(false) {
        info!("Creating database at {}", database_url);
        sqlx::Sqlite::create_database(database_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS identities (
            uid TEXT PRIMARY KEY,
            last_seen INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            uid TEXT NOT NULL,
            device_id INTEGER NOT NULL,
            identity_key BLOB NOT NULL,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            PRIMARY KEY (uid, device_id),
            FOREIGN KEY (uid) REFERENCES identities(uid)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // One mutable bundle row per (uid, device). The one-time pre-keys are
    // NOT part of the blob; they are consumable rows of their own.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS key_bundles (
            uid TEXT NOT NULL,
            device_id INTEGER NOT NULL,
            bundle BLOB NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            PRIMARY KEY (uid, device_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS one_time_pre_keys (
            uid TEXT NOT NULL,
            device_id INTEGER NOT NULL,
            key_id INTEGER NOT NULL,
            public BLOB NOT NULL,
            PRIMARY KEY (uid, device_id, key_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // One row per (logical message, recipient device): the fan-out design.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            sender_uid TEXT NOT NULL,
            sender_device_id INTEGER NOT NULL,
            recipient_uid TEXT NOT NULL,
            recipient_device_id INTEGER NOT NULL,
            ciphertext BLOB NOT NULL,
            timestamp INTEGER NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            blurred INTEGER NOT NULL DEFAULT 0,
            is_group INTEGER NOT NULL DEFAULT 0,
            group_id TEXT
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_recipient_read
        ON messages(recipient_uid, read, timestamp);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_chat_time
        ON messages(chat_id, timestamp);
        "#,
    )
    .execute(pool)
    .await?;

    // Friend edges are written by the account layer; the core only reads
    // them for presence broadcasts.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS friends (
            uid TEXT NOT NULL,
            friend_uid TEXT NOT NULL,
            PRIMARY KEY (uid, friend_uid)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // A row means "this uid opted into blur for this chat". Blur is active
    // for a chat only when both participants have a row.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blur_opt_ins (
            chat_id TEXT NOT NULL,
            uid TEXT NOT NULL,
            opted_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            PRIMARY KEY (chat_id, uid)
        );
        "#,
    )
    .execute(pool)
    .await?;

    info!("Migrations completed successfully");
    Ok(())
}

// ---------------------------------------------------------------------------
// Identities and devices
// ---------------------------------------------------------------------------

/// Record an identity/device pair at authentication time.
///
/// Returns the identity key already on file for the device, if any, so the
/// caller can reject a connection that claims a known device with a
/// different key.
pub async fn register_device(
    pool: &Pool<Sqlite>,
    uid: &str,
    device_id: u32,
    identity_key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let existing: Option<(Vec<u8>,)> =
        sqlx::query_as("SELECT identity_key FROM devices WHERE uid = ?1 AND device_id = ?2")
            .bind(uid)
            .bind(device_id)
            .fetch_optional(pool)
            .await?;

    if let Some((key,)) = existing {
        sqlx::query("UPDATE identities SET last_seen = strftime('%s', 'now') WHERE uid = ?1")
            .bind(uid)
            .execute(pool)
            .await?;
        return Ok(Some(key));
    }

    sqlx::query(
        r#"
        INSERT INTO identities (uid) VALUES (?1)
        ON CONFLICT(uid) DO UPDATE SET last_seen = strftime('%s', 'now')
        "#,
    )
    .bind(uid)
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT INTO devices (uid, device_id, identity_key) VALUES (?1, ?2, ?3)",
    )
    .bind(uid)
    .bind(device_id)
    .bind(identity_key)
    .execute(pool)
    .await?;

    Ok(None)
}

/// Whether any identity row exists for this uid.
pub async fn identity_exists(pool: &Pool<Sqlite>, uid: &str) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM identities WHERE uid = ?1")
        .bind(uid)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

// ---------------------------------------------------------------------------
// Key bundle store
// ---------------------------------------------------------------------------

/// Store a key bundle for a device.
///
/// When a bundle already exists and `force_overwrite` is false, this is a
/// successful no-op (`AlreadyExists`), deliberately not an error, so a
/// client restarting cannot clobber a bundle that live sessions were
/// derived from. Callers must check the returned status rather than assume
/// the upload happened.
pub async fn publish_bundle(
    pool: &Pool<Sqlite>,
    bundle: &KeyBundle,
    force_overwrite: bool,
) -> Result<PublishStatus> {
    let mut tx = pool.begin().await?;

    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM key_bundles WHERE uid = ?1 AND device_id = ?2",
    )
    .bind(&bundle.uid)
    .bind(bundle.device_id)
    .fetch_optional(&mut *tx)
    .await?;

    if existing.is_some() && !force_overwrite {
        tx.rollback().await?;
        return Ok(PublishStatus::AlreadyExists);
    }

    // The stored blob carries everything except the one-time pre-keys.
    let mut stripped = bundle.clone();
    let one_time = std::mem::take(&mut stripped.one_time_pre_keys);
    let blob = rmp_serde::to_vec_named(&stripped)?;

    sqlx::query(
        r#"
        INSERT INTO key_bundles (uid, device_id, bundle)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(uid, device_id) DO UPDATE SET
            bundle = excluded.bundle,
            updated_at = strftime('%s', 'now')
        "#,
    )
    .bind(&bundle.uid)
    .bind(bundle.device_id)
    .bind(&blob)
    .execute(&mut *tx)
    .await?;

    // A republish replaces the pool wholesale; stale keys would reference
    // secrets the device no longer holds.
    sqlx::query("DELETE FROM one_time_pre_keys WHERE uid = ?1 AND device_id = ?2")
        .bind(&bundle.uid)
        .bind(bundle.device_id)
        .execute(&mut *tx)
        .await?;

    for key in &one_time {
        sqlx::query(
            "INSERT INTO one_time_pre_keys (uid, device_id, key_id, public) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&bundle.uid)
        .bind(bundle.device_id)
        .bind(key.id)
        .bind(key.public.as_slice())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(if existing.is_some() {
        PublishStatus::Updated
    } else {
        PublishStatus::Stored
    })
}

/// Fetch one device's bundle for session establishment, consuming one
/// one-time pre-key.
///
/// The consumed key is deleted inside the same transaction that reads it,
/// so concurrent establishers can never be handed the same key. The
/// returned bundle carries at most one one-time pre-key.
pub async fn fetch_bundle(
    pool: &Pool<Sqlite>,
    uid: &str,
    device_id: u32,
) -> Result<KeyBundle, FetchBundleError> {
    if !identity_exists(pool, uid).await? {
        return Err(FetchBundleError::NotFound);
    }

    let device_known: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM devices WHERE uid = ?1 AND device_id = ?2")
            .bind(uid)
            .bind(device_id)
            .fetch_one(pool)
            .await?;
    if device_known == 0 {
        return Err(FetchBundleError::NotFound);
    }

    let mut tx = pool.begin().await?;

    let row: Option<(Vec<u8>,)> =
        sqlx::query_as("SELECT bundle FROM key_bundles WHERE uid = ?1 AND device_id = ?2")
            .bind(uid)
            .bind(device_id)
            .fetch_optional(&mut *tx)
            .await?;

    let blob = match row {
        Some((blob,)) => blob,
        None => return Err(FetchBundleError::Gone),
    };

    let mut bundle: KeyBundle = rmp_serde::from_slice(&blob)
        .map_err(|_| FetchBundleError::Gone)?;

    let one_time: Option<(u32, Vec<u8>)> = sqlx::query_as(
        r#"
        SELECT key_id, public FROM one_time_pre_keys
        WHERE uid = ?1 AND device_id = ?2
        ORDER BY key_id ASC
        LIMIT 1
        "#,
    )
    .bind(uid)
    .bind(device_id)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some((key_id, public)) = one_time {
        sqlx::query(
            "DELETE FROM one_time_pre_keys WHERE uid = ?1 AND device_id = ?2 AND key_id = ?3",
        )
        .bind(uid)
        .bind(device_id)
        .bind(key_id)
        .execute(&mut *tx)
        .await?;

        let public: [u8; 32] = public
            .try_into()
            .map_err(|_| FetchBundleError::Gone)?;
        bundle.one_time_pre_keys = vec![sotto_shared::bundle::OneTimePreKey {
            id: key_id,
            public,
        }];
    } else {
        bundle.one_time_pre_keys = Vec::new();
    }

    tx.commit().await?;

    Ok(bundle)
}

/// Fetch a bundle for every registered device of an identity, consuming
/// one one-time pre-key per device.
pub async fn fetch_all_bundles(
    pool: &Pool<Sqlite>,
    uid: &str,
) -> Result<Vec<KeyBundle>, FetchBundleError> {
    if !identity_exists(pool, uid).await? {
        return Err(FetchBundleError::NotFound);
    }

    let device_ids: Vec<(u32,)> =
        sqlx::query_as("SELECT device_id FROM devices WHERE uid = ?1 ORDER BY device_id")
            .bind(uid)
            .fetch_all(pool)
            .await?;

    let mut bundles = Vec::with_capacity(device_ids.len());
    for (device_id,) in device_ids {
        match fetch_bundle(pool, uid, device_id).await {
            Ok(bundle) => bundles.push(bundle),
            // A device that never published keys does not poison the rest.
            Err(FetchBundleError::Gone) => continue,
            Err(e) => return Err(e),
        }
    }

    if bundles.is_empty() {
        return Err(FetchBundleError::Gone);
    }

    Ok(bundles)
}

/// Remaining one-time pre-keys for a device. Clients poll this to decide
/// when to generate and upload a fresh pool.
pub async fn count_one_time_pre_keys(
    pool: &Pool<Sqlite>,
    uid: &str,
    device_id: u32,
) -> Result<u32> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM one_time_pre_keys WHERE uid = ?1 AND device_id = ?2",
    )
    .bind(uid)
    .bind(device_id)
    .fetch_one(pool)
    .await?;
    Ok(count as u32)
}

// ---------------------------------------------------------------------------
// Message rows
// ---------------------------------------------------------------------------

/// Persist one envelope row.
pub async fn store_envelope(pool: &Pool<Sqlite>, envelope: &Envelope) -> Result<()> {
    let ciphertext = rmp_serde::to_vec_named(&envelope.ciphertext)?;
    sqlx::query(
        r#"
        INSERT INTO messages (
            id, chat_id, sender_uid, sender_device_id,
            recipient_uid, recipient_device_id,
            ciphertext, timestamp, read, blurred, is_group, group_id
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(&envelope.id)
    .bind(chat_id(&envelope.sender_uid, &envelope.recipient_uid))
    .bind(&envelope.sender_uid)
    .bind(envelope.sender_device_id)
    .bind(&envelope.recipient_uid)
    .bind(envelope.recipient_device_id)
    .bind(&ciphertext)
    .bind(envelope.timestamp)
    .bind(envelope.read)
    .bind(envelope.blurred)
    .bind(envelope.metadata.is_group_message)
    .bind(&envelope.metadata.group_id)
    .execute(pool)
    .await?;
    Ok(())
}

type MessageRow = (
    String,
    String,
    i64,
    String,
    i64,
    Vec<u8>,
    i64,
    bool,
    bool,
    bool,
    Option<String>,
);

fn row_to_envelope(row: MessageRow) -> Result<Envelope> {
    let (
        id,
        sender_uid,
        sender_device_id,
        recipient_uid,
        recipient_device_id,
        ciphertext,
        timestamp,
        read,
        blurred,
        is_group,
        group_id,
    ) = row;
    let ciphertext: Ciphertext = rmp_serde::from_slice(&ciphertext)?;
    Ok(Envelope {
        id,
        sender_uid,
        sender_device_id: sender_device_id as u32,
        recipient_uid,
        recipient_device_id: recipient_device_id as u32,
        ciphertext,
        timestamp,
        read,
        blurred,
        metadata: MessageMeta {
            is_group_message: is_group,
            group_id,
        },
    })
}

/// Undelivered messages for an identity, oldest first.
pub async fn fetch_queued(
    pool: &Pool<Sqlite>,
    recipient_uid: &str,
    since: i64,
    limit: i64,
) -> Result<Vec<Envelope>> {
    let rows: Vec<MessageRow> = sqlx::query_as(
        r#"
        SELECT id, sender_uid, sender_device_id, recipient_uid, recipient_device_id,
               ciphertext, timestamp, read, blurred, is_group, group_id
        FROM messages
        WHERE recipient_uid = ?1 AND read = 0 AND timestamp >= ?2
        ORDER BY timestamp ASC
        LIMIT ?3
        "#,
    )
    .bind(recipient_uid)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(row_to_envelope).collect()
}

/// Flip the read flag for rows addressed to one specific device.
///
/// Deliberately scoped: fetching from device A must not mark device B's
/// rows delivered.
pub async fn mark_read_for_device(
    pool: &Pool<Sqlite>,
    recipient_uid: &str,
    device_id: u32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE messages SET read = 1 WHERE recipient_uid = ?1 AND recipient_device_id = ?2 AND read = 0",
    )
    .bind(recipient_uid)
    .bind(device_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Count undelivered rows for an identity (queue-cap enforcement).
pub async fn count_queued(pool: &Pool<Sqlite>, recipient_uid: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE recipient_uid = ?1 AND read = 0")
            .bind(recipient_uid)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Friends (read-only to the core)
// ---------------------------------------------------------------------------

/// Friend uids for an identity.
pub async fn get_friends(pool: &Pool<Sqlite>, uid: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT friend_uid FROM friends WHERE uid = ?1")
        .bind(uid)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Insert a symmetric friend edge. The account layer owns this table; the
/// core only writes it from tests and seeding tools.
pub async fn add_friendship(pool: &Pool<Sqlite>, a: &str, b: &str) -> Result<()> {
    for (x, y) in [(a, b), (b, a)] {
        sqlx::query("INSERT OR IGNORE INTO friends (uid, friend_uid) VALUES (?1, ?2)")
            .bind(x)
            .bind(y)
            .execute(pool)
            .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Blur consent and sweep
// ---------------------------------------------------------------------------

/// Record or withdraw one identity's blur opt-in for a chat.
pub async fn set_blur_opt_in(
    pool: &Pool<Sqlite>,
    chat: &str,
    uid: &str,
    enabled: bool,
) -> Result<()> {
    if enabled {
        sqlx::query("INSERT OR IGNORE INTO blur_opt_ins (chat_id, uid) VALUES (?1, ?2)")
            .bind(chat)
            .bind(uid)
            .execute(pool)
            .await?;
    } else {
        sqlx::query("DELETE FROM blur_opt_ins WHERE chat_id = ?1 AND uid = ?2")
            .bind(chat)
            .bind(uid)
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Whether a given identity has opted into blur for a chat.
pub async fn blur_opted_in(pool: &Pool<Sqlite>, chat: &str, uid: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM blur_opt_ins WHERE chat_id = ?1 AND uid = ?2")
            .bind(chat)
            .bind(uid)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Mark old messages blurred in every chat where both participants have
/// opted in. Returns the number of rows flipped. Best effort by design;
/// the sweep runs on an interval, not per message.
pub async fn blur_sweep(pool: &Pool<Sqlite>, age_seconds: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE messages SET blurred = 1
        WHERE blurred = 0
          AND timestamp < (strftime('%s', 'now') - ?1)
          AND (
            SELECT COUNT(DISTINCT uid) FROM blur_opt_ins b
            WHERE b.chat_id = messages.chat_id
          ) >= 2
        "#,
    )
    .bind(age_seconds)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

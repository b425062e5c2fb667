//! Local key vault
//!
//! The only place private key material lives. The vault is a per-profile
//! directory holding a password-sealed identity file plus a SQLite
//! database whose sensitive blobs (pre-key secrets, session state, message
//! bodies) are AES-256-GCM encrypted with a key derived from the user's
//! password. Blob wire format: `[12 bytes nonce][ciphertext + 16-byte tag]`.
//!
//! Everything here is generated once per device and survives restarts;
//! the only path that destroys sessions is an explicit [`Vault::wipe`].

use anyhow::Result;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;
use zeroize::Zeroize;

use sotto_shared::bundle::{OneTimePreKeySecret, PrivatePreKeys};
use sotto_shared::keys::{seal_identity, unseal_identity, IdentityKey};
use x25519_dalek::StaticSecret;

/// Nonce size for AES-256-GCM
const NONCE_LEN: usize = 12;
/// Minimum ciphertext size: nonce + GCM tag
const MIN_CT_LEN: usize = NONCE_LEN + 16;

/// Current schema version. Increment when adding new migrations.
const SCHEMA_VERSION: i64 = 1;

/// Non-secret device record, generated once and persisted for the life of
/// the installation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Locally generated stable device id
    pub device_id: u32,
    /// Registration id generated with the identity
    pub registration_id: u32,
}

/// A locally stored message copy (plaintext encrypted at rest).
#[derive(Debug, Clone)]
pub struct LocalMessage {
    /// Message id
    pub id: String,
    /// Conversation the message belongs to
    pub chat_id: String,
    /// Who sent it
    pub sender_uid: String,
    /// Decrypted message body
    pub body: Vec<u8>,
    /// Unix seconds
    pub timestamp: i64,
    /// Sent by this device
    pub is_outgoing: bool,
    /// Obscured by the blur sweep
    pub blurred: bool,
}

/// Session state as persisted: the ratchet snapshot plus the handshake
/// context it was derived under.
pub struct StoredSession {
    /// Bundle fingerprint recorded at establishment
    pub fingerprint: [u8; 32],
    /// X3DH associated data
    pub associated_data: Vec<u8>,
    /// Encrypted-at-rest ratchet snapshot bytes (decrypted on load)
    pub snapshot: Vec<u8>,
}

/// Serialized shape of the private pre-key material.
#[derive(Serialize, Deserialize)]
struct PreKeyStore {
    signed_pre_key_id: u32,
    signed_pre_key: [u8; 32],
    one_time: Vec<(u32, [u8; 32])>,
}

/// Encrypted local storage for one device profile.
pub struct Vault {
    pool: Pool<Sqlite>,
    data_dir: PathBuf,
    /// Present while the vault is unlocked
    db_key: RwLock<Option<[u8; 32]>>,
}

impl Vault {
    /// Open (or create) the vault in `data_dir`, unlocking it with the
    /// user's password. Fails on a wrong password for an existing vault.
    pub async fn open(data_dir: &Path, password: &str) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;

        let db_path = data_dir.join("vault.db");
        let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        run_migrations(&pool).await?;

        let key = derive_db_key(password);
        let vault = Self {
            pool,
            data_dir: data_dir.to_path_buf(),
            db_key: RwLock::new(Some(key)),
        };
        vault.check_or_init_canary().await?;

        info!("Vault opened at {}", data_dir.display());
        Ok(vault)
    }

    /// A known plaintext encrypted at first open; a later open with the
    /// wrong password fails here instead of producing garbage reads.
    async fn check_or_init_canary(&self) -> Result<()> {
        const CANARY: &[u8] = b"sotto-vault-canary";
        match self.meta_get("canary").await? {
            Some(blob) => {
                let key = self.key().await?;
                let plaintext = decrypt_blob(&key, &blob)
                    .map_err(|_| anyhow::anyhow!("Wrong password for this vault"))?;
                if plaintext != CANARY {
                    anyhow::bail!("Vault canary mismatch — storage is corrupted");
                }
            }
            None => {
                let key = self.key().await?;
                let blob = encrypt_blob(&key, CANARY)?;
                self.meta_put("canary", &blob).await?;
            }
        }
        Ok(())
    }

    /// Drop the in-memory vault key, locking the vault. Further reads of
    /// encrypted material fail until the vault is reopened.
    pub async fn lock(&self) {
        let mut guard = self.db_key.write().await;
        if let Some(ref mut key) = *guard {
            key.zeroize();
        }
        *guard = None;
    }

    async fn key(&self) -> Result<[u8; 32]> {
        let guard = self.db_key.read().await;
        guard.ok_or_else(|| anyhow::anyhow!("Vault is locked"))
    }

    // ─── identity ──────────────────────────────────────────────────────

    /// Whether an identity file exists for this profile.
    pub async fn has_identity(&self) -> bool {
        self.data_dir.join("identity.enc").exists()
    }

    /// Seal the identity key pair to disk under the password.
    pub async fn store_identity(&self, identity: &IdentityKey, password: &str) -> Result<()> {
        let sealed = seal_identity(identity, password)
            .map_err(|e| anyhow::anyhow!("Failed to seal identity: {}", e))?;
        let path = self.data_dir.join("identity.enc");
        tokio::fs::write(&path, &sealed).await?;
        info!("Identity stored at {} ({} bytes)", path.display(), sealed.len());
        Ok(())
    }

    /// Load and unseal the identity key pair.
    pub async fn load_identity(&self, password: &str) -> Result<IdentityKey> {
        let path = self.data_dir.join("identity.enc");
        let sealed = tokio::fs::read(&path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        unseal_identity(&sealed, password)
            .map_err(|e| anyhow::anyhow!("Failed to unseal identity: {}", e))
    }

    // ─── device record ─────────────────────────────────────────────────

    /// The persisted device record, if one was generated.
    pub async fn device_record(&self) -> Result<Option<DeviceRecord>> {
        match self.meta_get("device").await? {
            Some(blob) => Ok(Some(rmp_serde::from_slice(&blob)?)),
            None => Ok(None),
        }
    }

    /// Return the existing device record or generate and persist one.
    pub async fn init_device_record(&self) -> Result<DeviceRecord> {
        if let Some(record) = self.device_record().await? {
            return Ok(record);
        }
        let record = DeviceRecord {
            device_id: (rand::random::<u32>() % 0x7FFF_FFFE) + 1,
            registration_id: sotto_shared::keys::generate_registration_id(),
        };
        self.meta_put("device", &rmp_serde::to_vec(&record)?).await?;
        info!("Generated device record: device_id={}", record.device_id);
        Ok(record)
    }

    // ─── private pre-keys ──────────────────────────────────────────────

    /// Persist the device's private pre-key material, replacing any
    /// previous set.
    pub async fn store_private_pre_keys(&self, pre_keys: &PrivatePreKeys) -> Result<()> {
        let store = PreKeyStore {
            signed_pre_key_id: pre_keys.signed_pre_key_id,
            signed_pre_key: pre_keys.signed_pre_key.to_bytes(),
            one_time: pre_keys
                .one_time_pre_keys
                .iter()
                .map(|k| (k.id, k.secret.to_bytes()))
                .collect(),
        };
        let mut plaintext = rmp_serde::to_vec(&store)?;
        let key = self.key().await?;
        let blob = encrypt_blob(&key, &plaintext)?;
        plaintext.zeroize();

        self.meta_put("pre_keys", &blob).await?;
        Ok(())
    }

    /// Load the device's private pre-key material.
    pub async fn load_private_pre_keys(&self) -> Result<Option<PrivatePreKeys>> {
        let blob = match self.meta_get("pre_keys").await? {
            Some(blob) => blob,
            None => return Ok(None),
        };
        let key = self.key().await?;
        let mut plaintext = decrypt_blob(&key, &blob)?;
        let store: PreKeyStore = rmp_serde::from_slice(&plaintext)?;
        plaintext.zeroize();

        Ok(Some(PrivatePreKeys {
            signed_pre_key_id: store.signed_pre_key_id,
            signed_pre_key: StaticSecret::from(store.signed_pre_key),
            one_time_pre_keys: store
                .one_time
                .into_iter()
                .map(|(id, secret)| OneTimePreKeySecret {
                    id,
                    secret: StaticSecret::from(secret),
                })
                .collect(),
        }))
    }

    // ─── sessions ──────────────────────────────────────────────────────

    /// Persist session state for a peer device. Overwrites any previous
    /// state for the same key; callers decide when that is deliberate.
    pub async fn store_session(
        &self,
        peer_uid: &str,
        peer_device_id: u32,
        fingerprint: &[u8; 32],
        associated_data: &[u8],
        snapshot: &[u8],
    ) -> Result<()> {
        let key = self.key().await?;
        let enc_ad = encrypt_blob(&key, associated_data)?;
        let enc_snapshot = encrypt_blob(&key, snapshot)?;

        sqlx::query(
            r#"
            INSERT INTO sessions (peer_uid, peer_device_id, fingerprint, associated_data, ratchet)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(peer_uid, peer_device_id) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                associated_data = excluded.associated_data,
                ratchet = excluded.ratchet,
                updated_at = strftime('%s', 'now')
            "#,
        )
        .bind(peer_uid)
        .bind(peer_device_id)
        .bind(fingerprint.as_slice())
        .bind(&enc_ad)
        .bind(&enc_snapshot)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load session state for a peer device, decrypting it.
    pub async fn load_session(
        &self,
        peer_uid: &str,
        peer_device_id: u32,
    ) -> Result<Option<StoredSession>> {
        let row: Option<(Vec<u8>, Vec<u8>, Vec<u8>)> = sqlx::query_as(
            "SELECT fingerprint, associated_data, ratchet FROM sessions WHERE peer_uid = ?1 AND peer_device_id = ?2",
        )
        .bind(peer_uid)
        .bind(peer_device_id)
        .fetch_optional(&self.pool)
        .await?;

        let (fingerprint, enc_ad, enc_snapshot) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let key = self.key().await?;
        let fingerprint: [u8; 32] = fingerprint
            .try_into()
            .map_err(|_| anyhow::anyhow!("Corrupt session fingerprint"))?;

        Ok(Some(StoredSession {
            fingerprint,
            associated_data: decrypt_blob(&key, &enc_ad)?,
            snapshot: decrypt_blob(&key, &enc_snapshot)?,
        }))
    }

    /// Whether session state exists for a peer device. No decryption.
    pub async fn has_session(&self, peer_uid: &str, peer_device_id: u32) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE peer_uid = ?1 AND peer_device_id = ?2",
        )
        .bind(peer_uid)
        .bind(peer_device_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // ─── local messages ────────────────────────────────────────────────

    /// Store a local message copy, body encrypted at rest.
    pub async fn store_message(&self, message: &LocalMessage) -> Result<()> {
        let key = self.key().await?;
        let body = encrypt_blob(&key, &message.body)?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, chat_id, sender_uid, body, timestamp, is_outgoing, blurred)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&message.id)
        .bind(&message.chat_id)
        .bind(&message.sender_uid)
        .bind(&body)
        .bind(message.timestamp)
        .bind(message.is_outgoing)
        .bind(message.blurred)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Messages for a conversation, oldest first.
    pub async fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<LocalMessage>> {
        let rows: Vec<(String, String, String, Vec<u8>, i64, bool, bool)> = sqlx::query_as(
            r#"
            SELECT id, chat_id, sender_uid, body, timestamp, is_outgoing, blurred
            FROM messages WHERE chat_id = ?1 ORDER BY timestamp ASC
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        let key = self.key().await?;
        rows.into_iter()
            .map(|(id, chat_id, sender_uid, body, timestamp, is_outgoing, blurred)| {
                Ok(LocalMessage {
                    id,
                    chat_id,
                    sender_uid,
                    body: decrypt_blob(&key, &body)?,
                    timestamp,
                    is_outgoing,
                    blurred,
                })
            })
            .collect()
    }

    /// Flip the blur flag on messages in a chat older than `age_seconds`.
    /// Returns the number of rows flipped.
    pub async fn blur_messages_older_than(&self, chat_id: &str, age_seconds: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET blurred = 1
            WHERE chat_id = ?1 AND blurred = 0
              AND timestamp < (strftime('%s', 'now') - ?2)
            "#,
        )
        .bind(chat_id)
        .bind(age_seconds)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ─── wipe ──────────────────────────────────────────────────────────

    /// Destroy everything: identity file, pre-keys, sessions, messages.
    /// The only path that deletes session state.
    pub async fn wipe(&self) -> Result<()> {
        for table in ["vault_meta", "sessions", "messages"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await?;
        }
        let identity_path = self.data_dir.join("identity.enc");
        if identity_path.exists() {
            tokio::fs::remove_file(&identity_path).await?;
        }
        info!("Vault wiped at {}", self.data_dir.display());
        Ok(())
    }

    // ─── meta kv helpers ───────────────────────────────────────────────

    async fn meta_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM vault_meta WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    async fn meta_put(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vault_meta (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Key derivation and blob crypto
// ---------------------------------------------------------------------------

/// Derive the 32-byte vault encryption key from the user's password.
///
/// Argon2id (64 MiB, 3 iterations, 1 lane) with a deterministic salt
/// derived from the password, so the same password always yields the same
/// key. The salt derivation domain-separates this key from the identity
/// file's, which uses Argon2id with a random salt.
pub fn derive_db_key(password: &str) -> [u8; 32] {
    use argon2::{Algorithm, Argon2, Params, Version};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"Sotto-vault-salt-v1")
        .expect("HMAC accepts any key length");
    mac.update(password.as_bytes());
    let salt = mac.finalize().into_bytes();

    let params = Params::new(64 * 1024, 3, 1, Some(32)).expect("valid Argon2 params");
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), &salt, &mut key)
        .expect("Argon2id hashing should not fail with valid params");
    key
}

/// Encrypt arbitrary bytes with the vault key. Returns `nonce || ciphertext`.
pub fn encrypt_blob(db_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(db_key));

    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("Vault encryption failed: {}", e))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt_blob`].
pub fn decrypt_blob(db_key: &[u8; 32], encrypted: &[u8]) -> Result<Vec<u8>> {
    if encrypted.len() < MIN_CT_LEN {
        anyhow::bail!("Encrypted blob too short ({} bytes)", encrypted.len());
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(db_key));
    let nonce = Nonce::from_slice(&encrypted[..NONCE_LEN]);

    cipher
        .decrypt(nonce, &encrypted[NONCE_LEN..])
        .map_err(|_| anyhow::anyhow!("Vault decryption failed — wrong password or corrupted data"))
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL DEFAULT 0)")
        .execute(pool)
        .await?;

    let row_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
        .fetch_one(pool)
        .await?;
    if row_count == 0 {
        sqlx::query("INSERT INTO schema_version (version) VALUES (0)")
            .execute(pool)
            .await?;
    }

    let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
        .fetch_one(pool)
        .await?;

    if current < 1 {
        migrate_v1(pool).await?;
    }

    if current < SCHEMA_VERSION {
        sqlx::query("UPDATE schema_version SET version = ?1")
            .bind(SCHEMA_VERSION)
            .execute(pool)
            .await?;
        info!("Vault schema upgraded to version {}", SCHEMA_VERSION);
    }

    Ok(())
}

/// V1: initial schema
async fn migrate_v1(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vault_meta (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            peer_uid TEXT NOT NULL,
            peer_device_id INTEGER NOT NULL,
            fingerprint BLOB NOT NULL,
            associated_data BLOB NOT NULL,
            ratchet BLOB NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            PRIMARY KEY (peer_uid, peer_device_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            sender_uid TEXT NOT NULL,
            body BLOB NOT NULL,
            timestamp INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            is_outgoing BOOLEAN NOT NULL DEFAULT 0,
            blurred BOOLEAN NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_chat
        ON messages(chat_id, timestamp)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sotto_shared::bundle::generate_device_keys;
    use sotto_shared::keys::generate_identity;

    async fn temp_vault() -> (tempfile::TempDir, Vault) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path(), "test-password").await.unwrap();
        (dir, vault)
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _vault = Vault::open(dir.path(), "correct").await.unwrap();
        }
        assert!(Vault::open(dir.path(), "wrong").await.is_err());
        assert!(Vault::open(dir.path(), "correct").await.is_ok());
    }

    #[tokio::test]
    async fn identity_roundtrip() {
        let (_dir, vault) = temp_vault().await;
        assert!(!vault.has_identity().await);

        let identity = generate_identity();
        vault.store_identity(&identity, "pw").await.unwrap();
        assert!(vault.has_identity().await);

        let loaded = vault.load_identity("pw").await.unwrap();
        assert_eq!(
            identity.public_signing_key().as_bytes(),
            loaded.public_signing_key().as_bytes()
        );
        assert!(vault.load_identity("nope").await.is_err());
    }

    #[tokio::test]
    async fn device_record_is_generated_once() {
        let (_dir, vault) = temp_vault().await;
        assert!(vault.device_record().await.unwrap().is_none());

        let first = vault.init_device_record().await.unwrap();
        let second = vault.init_device_record().await.unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.registration_id, second.registration_id);
    }

    #[tokio::test]
    async fn pre_keys_roundtrip() {
        let (_dir, vault) = temp_vault().await;
        let identity = generate_identity();
        let (_, pre_keys) = generate_device_keys(&identity, "alice", 1, 100, 3);

        vault.store_private_pre_keys(&pre_keys).await.unwrap();
        let loaded = vault.load_private_pre_keys().await.unwrap().unwrap();

        assert_eq!(loaded.signed_pre_key_id, pre_keys.signed_pre_key_id);
        assert_eq!(
            loaded.signed_pre_key.to_bytes(),
            pre_keys.signed_pre_key.to_bytes()
        );
        assert_eq!(loaded.one_time_pre_keys.len(), 3);
    }

    #[tokio::test]
    async fn session_roundtrip_and_wipe() {
        let (_dir, vault) = temp_vault().await;

        assert!(!vault.has_session("bob", 2).await.unwrap());
        vault
            .store_session("bob", 2, &[7u8; 32], b"ad-bytes", b"snapshot-bytes")
            .await
            .unwrap();
        assert!(vault.has_session("bob", 2).await.unwrap());

        let stored = vault.load_session("bob", 2).await.unwrap().unwrap();
        assert_eq!(stored.fingerprint, [7u8; 32]);
        assert_eq!(stored.associated_data, b"ad-bytes");
        assert_eq!(stored.snapshot, b"snapshot-bytes");

        vault.wipe().await.unwrap();
        assert!(!vault.has_session("bob", 2).await.unwrap());
    }

    #[tokio::test]
    async fn locked_vault_refuses_encrypted_reads() {
        let (_dir, vault) = temp_vault().await;
        vault
            .store_session("bob", 1, &[1u8; 32], b"ad", b"snap")
            .await
            .unwrap();

        vault.lock().await;
        assert!(vault.load_session("bob", 1).await.is_err());
        // Unencrypted existence checks still work.
        assert!(vault.has_session("bob", 1).await.unwrap());
    }

    #[tokio::test]
    async fn message_storage_and_blur_flip() {
        let (_dir, vault) = temp_vault().await;

        let old = LocalMessage {
            id: "m1".into(),
            chat_id: "alice:bob".into(),
            sender_uid: "bob".into(),
            body: b"old message".to_vec(),
            timestamp: sotto_shared::unix_timestamp() - 120,
            is_outgoing: false,
            blurred: false,
        };
        let fresh = LocalMessage {
            id: "m2".into(),
            chat_id: "alice:bob".into(),
            sender_uid: "alice".into(),
            body: b"fresh message".to_vec(),
            timestamp: sotto_shared::unix_timestamp(),
            is_outgoing: true,
            blurred: false,
        };
        vault.store_message(&old).await.unwrap();
        vault.store_message(&fresh).await.unwrap();

        let flipped = vault
            .blur_messages_older_than("alice:bob", 30)
            .await
            .unwrap();
        assert_eq!(flipped, 1);

        let messages = vault.messages_for_chat("alice:bob").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].blurred);
        assert_eq!(messages[0].body, b"old message");
        assert!(!messages[1].blurred);
    }
}

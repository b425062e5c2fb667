//! Server database tests
//!
//! Verifies the bundle store's tri-state publish and consume-on-fetch
//! behavior, fan-out message rows, device-scoped read flags, and the blur
//! consent gate, against an in-memory SQLite pool with real migrations.

use sqlx::SqlitePool;

use sotto_server::database::{self, FetchBundleError};
use sotto_shared::bundle::generate_device_keys;
use sotto_shared::envelope::{chat_id, Ciphertext, CiphertextKind, Envelope, MessageMeta};
use sotto_shared::keys::{generate_identity, IdentityKey};
use sotto_shared::ratchet::RatchetHeader;
use sotto_shared::wire::PublishStatus;

async fn setup_test_db() -> SqlitePool {
    // One connection: an in-memory SQLite database exists per connection.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create test database");
    database::run_migrations(&pool).await.unwrap();
    pool
}

/// Register an identity/device and return its generated identity key.
async fn register(pool: &SqlitePool, uid: &str, device_id: u32) -> IdentityKey {
    let identity = generate_identity();
    database::register_device(
        pool,
        uid,
        device_id,
        identity.public_signing_key().as_bytes(),
    )
    .await
    .unwrap();
    identity
}

fn test_envelope(sender: &str, recipient: &str, device_id: u32) -> Envelope {
    Envelope::new(
        sender,
        1,
        recipient,
        device_id,
        Ciphertext {
            kind: CiphertextKind::Ratchet,
            header: RatchetHeader {
                dh_public: [0xAA; 32],
                message_number: 0,
                previous_chain_length: 0,
            },
            body: vec![0xEE; 128],
            handshake: None,
        },
        MessageMeta::default(),
    )
}

// ============================================================================
// Bundle store
// ============================================================================

#[tokio::test]
async fn publish_is_tri_state() {
    let pool = setup_test_db().await;
    let identity = register(&pool, "alice", 1).await;
    let (bundle, _) = generate_device_keys(&identity, "alice", 1, 100, 2);

    let status = database::publish_bundle(&pool, &bundle, false).await.unwrap();
    assert_eq!(status, PublishStatus::Stored);

    // Second publish without force is a distinguishable no-op.
    let (other_bundle, _) = generate_device_keys(&identity, "alice", 1, 100, 2);
    let status = database::publish_bundle(&pool, &other_bundle, false).await.unwrap();
    assert_eq!(status, PublishStatus::AlreadyExists);

    // The stored bundle is still the original.
    let fetched = database::fetch_bundle(&pool, "alice", 1).await.unwrap();
    assert_eq!(fetched.signed_pre_key.id, bundle.signed_pre_key.id);

    // Forced publish replaces it.
    let status = database::publish_bundle(&pool, &other_bundle, true).await.unwrap();
    assert_eq!(status, PublishStatus::Updated);
    let fetched = database::fetch_bundle(&pool, "alice", 1).await.unwrap();
    assert_eq!(fetched.signed_pre_key.id, other_bundle.signed_pre_key.id);
}

#[tokio::test]
async fn one_time_pre_keys_are_consumed_exactly_once() {
    let pool = setup_test_db().await;
    let identity = register(&pool, "bob", 1).await;
    let (bundle, _) = generate_device_keys(&identity, "bob", 1, 100, 2);
    database::publish_bundle(&pool, &bundle, false).await.unwrap();

    assert_eq!(
        database::count_one_time_pre_keys(&pool, "bob", 1).await.unwrap(),
        2
    );

    // Two establishers fetch; each consumes a different key.
    let first = database::fetch_bundle(&pool, "bob", 1).await.unwrap();
    let second = database::fetch_bundle(&pool, "bob", 1).await.unwrap();
    assert_eq!(first.one_time_pre_keys.len(), 1);
    assert_eq!(second.one_time_pre_keys.len(), 1);
    assert_ne!(
        first.one_time_pre_keys[0].id,
        second.one_time_pre_keys[0].id,
        "a one-time pre-key must never be handed out twice"
    );

    // Pool exhausted: fetches still succeed, with no one-time key.
    assert_eq!(
        database::count_one_time_pre_keys(&pool, "bob", 1).await.unwrap(),
        0
    );
    let third = database::fetch_bundle(&pool, "bob", 1).await.unwrap();
    assert!(third.one_time_pre_keys.is_empty());
}

#[tokio::test]
async fn not_found_and_gone_are_distinct() {
    let pool = setup_test_db().await;

    // Unknown identity entirely.
    assert!(matches!(
        database::fetch_bundle(&pool, "nobody", 1).await,
        Err(FetchBundleError::NotFound)
    ));

    // Known device that never published keys.
    register(&pool, "carol", 1).await;
    assert!(matches!(
        database::fetch_bundle(&pool, "carol", 1).await,
        Err(FetchBundleError::Gone)
    ));

    // Known identity, unknown device.
    assert!(matches!(
        database::fetch_bundle(&pool, "carol", 99).await,
        Err(FetchBundleError::NotFound)
    ));

    assert!(matches!(
        database::fetch_all_bundles(&pool, "nobody").await,
        Err(FetchBundleError::NotFound)
    ));
    assert!(matches!(
        database::fetch_all_bundles(&pool, "carol").await,
        Err(FetchBundleError::Gone)
    ));
}

#[tokio::test]
async fn fetch_all_returns_one_bundle_per_device() {
    let pool = setup_test_db().await;
    let identity = register(&pool, "dave", 1).await;
    database::register_device(&pool, "dave", 2, identity.public_signing_key().as_bytes())
        .await
        .unwrap();

    for device_id in [1u32, 2] {
        let (bundle, _) = generate_device_keys(&identity, "dave", device_id, 100, 1);
        database::publish_bundle(&pool, &bundle, false).await.unwrap();
    }

    let bundles = database::fetch_all_bundles(&pool, "dave").await.unwrap();
    assert_eq!(bundles.len(), 2);
    assert_eq!(bundles[0].device_id, 1);
    assert_eq!(bundles[1].device_id, 2);
}

// ============================================================================
// Message rows
// ============================================================================

#[tokio::test]
async fn fan_out_stores_one_row_per_device() {
    let pool = setup_test_db().await;
    register(&pool, "alice", 1).await;
    register(&pool, "bob", 1).await;

    // A logical message to bob with 3 devices → 3 independent rows.
    for device_id in [1u32, 2, 3] {
        database::store_envelope(&pool, &test_envelope("alice", "bob", device_id))
            .await
            .unwrap();
    }

    assert_eq!(database::count_queued(&pool, "bob").await.unwrap(), 3);
    let queued = database::fetch_queued(&pool, "bob", 0, 100).await.unwrap();
    assert_eq!(queued.len(), 3);
    let devices: Vec<u32> = queued.iter().map(|e| e.recipient_device_id).collect();
    assert_eq!(devices, vec![1, 2, 3]);
}

#[tokio::test]
async fn read_flags_are_scoped_to_the_fetching_device() {
    let pool = setup_test_db().await;
    register(&pool, "bob", 1).await;

    database::store_envelope(&pool, &test_envelope("alice", "bob", 1)).await.unwrap();
    database::store_envelope(&pool, &test_envelope("alice", "bob", 2)).await.unwrap();

    // Device 1 fetches: only its row flips.
    let marked = database::mark_read_for_device(&pool, "bob", 1).await.unwrap();
    assert_eq!(marked, 1);
    assert_eq!(database::count_queued(&pool, "bob").await.unwrap(), 1);

    let remaining = database::fetch_queued(&pool, "bob", 0, 100).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].recipient_device_id, 2);
}

#[tokio::test]
async fn stored_envelope_round_trips_intact() {
    let pool = setup_test_db().await;
    register(&pool, "bob", 1).await;

    let mut envelope = test_envelope("alice", "bob", 1);
    envelope.metadata = MessageMeta {
        is_group_message: true,
        group_id: Some("g1".into()),
    };
    database::store_envelope(&pool, &envelope).await.unwrap();

    let fetched = database::fetch_queued(&pool, "bob", 0, 10).await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].id, envelope.id);
    assert_eq!(fetched[0].ciphertext.body, envelope.ciphertext.body);
    assert!(fetched[0].metadata.is_group_message);
    assert_eq!(fetched[0].metadata.group_id.as_deref(), Some("g1"));
}

// ============================================================================
// Blur consent
// ============================================================================

#[tokio::test]
async fn blur_requires_mutual_opt_in() {
    let pool = setup_test_db().await;
    register(&pool, "alice", 1).await;
    register(&pool, "bob", 1).await;
    let chat = chat_id("alice", "bob");

    // An old message, eligible by age but not by consent.
    let mut envelope = test_envelope("alice", "bob", 1);
    envelope.timestamp -= 3600;
    database::store_envelope(&pool, &envelope).await.unwrap();

    database::set_blur_opt_in(&pool, &chat, "alice", true).await.unwrap();
    assert_eq!(database::blur_sweep(&pool, 30).await.unwrap(), 0);

    // Second participant opts in → the pair is mutually consenting.
    database::set_blur_opt_in(&pool, &chat, "bob", true).await.unwrap();
    assert_eq!(database::blur_sweep(&pool, 30).await.unwrap(), 1);

    assert!(database::blur_opted_in(&pool, &chat, "alice").await.unwrap());
    assert!(database::blur_opted_in(&pool, &chat, "bob").await.unwrap());
}

#[tokio::test]
async fn unilateral_opt_out_disables_blur_for_the_pair() {
    let pool = setup_test_db().await;
    register(&pool, "alice", 1).await;
    register(&pool, "bob", 1).await;
    let chat = chat_id("alice", "bob");

    database::set_blur_opt_in(&pool, &chat, "alice", true).await.unwrap();
    database::set_blur_opt_in(&pool, &chat, "bob", true).await.unwrap();

    // Alice backs out; bob's opt-in alone must not blur anything.
    database::set_blur_opt_in(&pool, &chat, "alice", false).await.unwrap();

    let mut envelope = test_envelope("bob", "alice", 1);
    envelope.timestamp -= 3600;
    database::store_envelope(&pool, &envelope).await.unwrap();

    assert_eq!(database::blur_sweep(&pool, 30).await.unwrap(), 0);
    assert!(!database::blur_opted_in(&pool, &chat, "alice").await.unwrap());
    assert!(database::blur_opted_in(&pool, &chat, "bob").await.unwrap());
}

#[tokio::test]
async fn blur_sweep_spares_recent_messages() {
    let pool = setup_test_db().await;
    register(&pool, "alice", 1).await;
    register(&pool, "bob", 1).await;
    let chat = chat_id("alice", "bob");

    database::set_blur_opt_in(&pool, &chat, "alice", true).await.unwrap();
    database::set_blur_opt_in(&pool, &chat, "bob", true).await.unwrap();

    // Fresh message: under the age threshold, untouched.
    database::store_envelope(&pool, &test_envelope("alice", "bob", 1)).await.unwrap();
    assert_eq!(database::blur_sweep(&pool, 30).await.unwrap(), 0);
}

// ============================================================================
// Identities and friends
// ============================================================================

#[tokio::test]
async fn device_registration_reports_existing_key() {
    let pool = setup_test_db().await;
    let identity = generate_identity();
    let key = identity.public_signing_key().as_bytes().to_vec();

    let previous = database::register_device(&pool, "erin", 1, &key).await.unwrap();
    assert!(previous.is_none());

    // Same device again: the stored key comes back for comparison.
    let previous = database::register_device(&pool, "erin", 1, &key).await.unwrap();
    assert_eq!(previous, Some(key));

    assert!(database::identity_exists(&pool, "erin").await.unwrap());
    assert!(!database::identity_exists(&pool, "nobody").await.unwrap());
}

#[tokio::test]
async fn friendships_are_symmetric() {
    let pool = setup_test_db().await;
    database::add_friendship(&pool, "alice", "bob").await.unwrap();

    assert_eq!(database::get_friends(&pool, "alice").await.unwrap(), vec!["bob"]);
    assert_eq!(database::get_friends(&pool, "bob").await.unwrap(), vec!["alice"]);
    assert!(database::get_friends(&pool, "carol").await.unwrap().is_empty());
}

//! Server configuration tests

use sotto_server::config::ServerConfig;
use std::env;

const VARS: &[&str] = &[
    "SOTTO_HOST",
    "SOTTO_PORT",
    "SOTTO_DATABASE_URL",
    "SOTTO_TLS_CERT",
    "SOTTO_TLS_KEY",
    "SOTTO_REQUIRE_TLS",
    "SOTTO_MAX_MESSAGE_SIZE",
    "SOTTO_WS_PING_INTERVAL",
    "SOTTO_MAX_QUEUED_MESSAGES",
    "SOTTO_MAX_CONNECTIONS",
    "SOTTO_MAX_CONNECTIONS_PER_IP",
    "SOTTO_CORS_ORIGINS",
    "SOTTO_ADMIN_TOKEN",
    "SOTTO_AUTH_TIMEOUT",
    "SOTTO_BLUR_AGE",
    "SOTTO_BLUR_SWEEP_INTERVAL",
    "SOTTO_FRIEND_FETCH_TIMEOUT_MS",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

// Environment mutation is process-global, so defaults and overrides are
// exercised in one sequential test rather than racing across threads.
#[test]
fn config_from_env() {
    clear_env();

    let config = ServerConfig::from_env().expect("defaults must parse");
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.port, 8443);
    assert_eq!(config.max_message_size, 1048576);
    assert_eq!(config.max_queued_messages, 1000);
    assert_eq!(config.blur_age_seconds, 30);
    assert!(config.require_tls);
    assert!(config.admin_token.is_none());

    env::set_var("SOTTO_PORT", "9001");
    env::set_var("SOTTO_REQUIRE_TLS", "false");
    env::set_var("SOTTO_BLUR_AGE", "45");
    env::set_var("SOTTO_ADMIN_TOKEN", "hunter2");

    let config = ServerConfig::from_env().expect("overrides must parse");
    assert_eq!(config.port, 9001);
    assert!(!config.require_tls);
    assert_eq!(config.blur_age_seconds, 45);
    assert_eq!(config.admin_token.as_deref(), Some("hunter2"));

    env::set_var("SOTTO_PORT", "not_a_port");
    assert!(ServerConfig::from_env().is_err());

    clear_env();
}

#[test]
fn port_parsing() {
    let port = "8443".parse::<u16>();
    assert!(port.is_ok());
    assert_eq!(port.unwrap(), 8443u16);

    assert!("not_a_port".parse::<u16>().is_err());
    assert!("70000".parse::<u16>().is_err());
}

#[test]
fn hex_encoding_for_log_ids() {
    let data = vec![0x01, 0x02, 0x03, 0x04];
    let encoded = hex::encode(&data);
    assert_eq!(encoded, "01020304");

    let decoded = hex::decode(&encoded).unwrap();
    assert_eq!(decoded, data);
}

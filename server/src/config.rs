//! Server configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Database URL
    pub database_url: String,
    /// TLS certificate path
    pub tls_cert_path: Option<String>,
    /// TLS key path
    pub tls_key_path: Option<String>,
    /// Require TLS (disable HTTP fallback)
    pub require_tls: bool,
    /// Maximum encoded frame size in bytes
    pub max_message_size: usize,
    /// WebSocket ping interval in seconds
    pub ws_ping_interval: u64,
    /// Maximum queued (undelivered) messages per identity
    pub max_queued_messages: usize,
    /// Maximum total WebSocket connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum WebSocket connections per IP address (0 = unlimited)
    pub max_connections_per_ip: usize,
    /// Comma-separated list of allowed CORS origins (empty = permissive)
    pub cors_origins: Option<String>,
    /// Bearer token for /admin/* endpoints (None = endpoints hidden)
    pub admin_token: Option<String>,
    /// Seconds to wait for authentication before dropping a connection
    pub auth_timeout_seconds: u64,
    /// Age in seconds after which messages in mutually-opted chats blur
    pub blur_age_seconds: i64,
    /// How often the blur sweep runs, in seconds
    pub blur_sweep_interval: u64,
    /// Timeout for friend-list lookups during presence broadcast, in
    /// milliseconds; on timeout the broadcast is skipped, not retried
    pub friend_fetch_timeout_ms: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = ServerConfig {
            host: env::var("SOTTO_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SOTTO_PORT")
                .unwrap_or_else(|_| "8443".to_string())
                .parse()
                .context("Invalid SOTTO_PORT")?,
            database_url: env::var("SOTTO_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/sotto.db".to_string()),
            tls_cert_path: env::var("SOTTO_TLS_CERT").ok(),
            tls_key_path: env::var("SOTTO_TLS_KEY").ok(),
            require_tls: env::var("SOTTO_REQUIRE_TLS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Invalid SOTTO_REQUIRE_TLS")?,
            max_message_size: env::var("SOTTO_MAX_MESSAGE_SIZE")
                .unwrap_or_else(|_| "1048576".to_string()) // 1MB
                .parse()
                .context("Invalid SOTTO_MAX_MESSAGE_SIZE")?,
            ws_ping_interval: env::var("SOTTO_WS_PING_INTERVAL")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid SOTTO_WS_PING_INTERVAL")?,
            max_queued_messages: env::var("SOTTO_MAX_QUEUED_MESSAGES")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("Invalid SOTTO_MAX_QUEUED_MESSAGES")?,
            max_connections: env::var("SOTTO_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .context("Invalid SOTTO_MAX_CONNECTIONS")?,
            max_connections_per_ip: env::var("SOTTO_MAX_CONNECTIONS_PER_IP")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid SOTTO_MAX_CONNECTIONS_PER_IP")?,
            cors_origins: env::var("SOTTO_CORS_ORIGINS").ok(),
            admin_token: env::var("SOTTO_ADMIN_TOKEN").ok(),
            auth_timeout_seconds: env::var("SOTTO_AUTH_TIMEOUT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid SOTTO_AUTH_TIMEOUT")?,
            blur_age_seconds: env::var("SOTTO_BLUR_AGE")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid SOTTO_BLUR_AGE")?,
            blur_sweep_interval: env::var("SOTTO_BLUR_SWEEP_INTERVAL")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid SOTTO_BLUR_SWEEP_INTERVAL")?,
            friend_fetch_timeout_ms: env::var("SOTTO_FRIEND_FETCH_TIMEOUT_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()
                .context("Invalid SOTTO_FRIEND_FETCH_TIMEOUT_MS")?,
        };

        Ok(config)
    }
}

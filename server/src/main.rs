use anyhow::Result;
use std::net::SocketAddr;
use tracing::{error, info, warn};

// Use jemalloc on Linux for reduced fragmentation and better throughput
// on long-running server processes.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use sotto_server::config::ServerConfig;
use sotto_server::websocket::ServerState;
use sotto_server::{database, routing, tls};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sotto_server=debug".parse()?)
                .add_directive("axum=info".parse()?),
        )
        .init();

    info!("Starting Sotto server");

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded");

    let db_pool = database::init(&config.database_url).await?;
    info!("Database initialized");

    let state = std::sync::Arc::new(ServerState::new(db_pool.clone(), config.clone()));

    // Recurring blur sweep: flip old rows in mutually-opted chats.
    {
        let pool = db_pool.clone();
        let age = config.blur_age_seconds;
        let interval_secs = config.blur_sweep_interval;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                match database::blur_sweep(&pool, age).await {
                    Ok(0) => {}
                    Ok(n) => info!("Blur sweep: obscured {} messages", n),
                    Err(e) => warn!("Blur sweep error: {}", e),
                }
            }
        });
        info!(
            "Blur sweep task started (age={}s, every {}s)",
            config.blur_age_seconds, config.blur_sweep_interval
        );
    }

    let app = routing::create_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    // Graceful shutdown signal (cross-platform)
    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, draining connections...");
    };

    let tls_acceptor = tls::configure_tls(&config).await?;

    if let Some(acceptor) = tls_acceptor {
        info!("Server listening on https://{}", addr);
        info!("WebSocket endpoint: wss://{}/ws", addr);
        let _tls_acceptor = tokio_rustls::TlsAcceptor::from(acceptor);

        // TODO: terminate TLS in-process instead of relying on a fronting proxy
        error!("TLS configured but HTTP fallback active until TLS termination is implemented.");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    } else {
        if config.require_tls {
            anyhow::bail!("TLS is required but not configured. Set SOTTO_TLS_CERT and SOTTO_TLS_KEY.");
        }

        warn!("Running without TLS — development mode only");
        info!("Server listening on http://{}", addr);
        info!("WebSocket endpoint: ws://{}/ws", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    }

    // Checkpoint SQLite WAL before exit
    info!("Checkpointing SQLite WAL...");
    if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&db_pool)
        .await
    {
        warn!("WAL checkpoint failed: {}", e);
    }

    info!("Server stopped cleanly");
    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;

use parcel_server::config::ServerConfig;
use parcel_server::storage::DiskBlobStore;
use parcel_server::store::MemorySessionStore;
use parcel_server::{build_state, reaper, router};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parcel_server=debug,tower_http=debug".into()),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env()?);
    let blobs = Arc::new(DiskBlobStore::new(config.storage_dir.clone()).await?);
    let state = build_state(config.clone(), Arc::new(MemorySessionStore::new()), blobs);

    tokio::spawn(reaper::run_reaper(
        state.assembler.clone(),
        config.sweep_interval,
        config.stale_after,
    ));

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Parcel server listening on {}", addr);
    info!(
        "Chunks: {} bytes default, {} max; stale uploads reaped after {:?}",
        config.default_chunk_size, config.max_chunk_size, config.stale_after
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}

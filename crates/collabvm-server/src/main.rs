mod auth;
mod channel;
mod config;
mod error;
mod guard;
mod handlers;
mod playback;
mod recording;
mod registry;
mod remote;
mod server;
mod session;
mod settings;
mod turn;
mod vm;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::server::{CollabVmServer, ServerDeps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,collabvm_server=debug")),
        )
        .init();

    info!("Starting CollabVM server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let server = CollabVmServer::new(config.clone(), ServerDeps::default()).await?;
    server.start().await;

    let app = ws::build_router(Arc::clone(&server));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "listening for connections");

    tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "server failed");
                server.stop().await;
                return Err(err.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            server.stop().await;
        }
    }

    Ok(())
}

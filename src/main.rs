//! TCP Chat Server - Entry Point
//!
//! Binds the listener, runs until Ctrl+C, then closes every session.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tcp_chat::{ChatServer, ServerConfig, DEFAULT_PORT};

/// Standalone chat server
#[derive(Debug, Parser)]
#[command(name = "tcp_chat_server", version, about = "Line-oriented TCP chat server")]
struct Args {
    /// Listening port
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=tcp_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tcp_chat=info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::with_port(args.port);

    let server = ChatServer::bind(&config).await?;
    info!("Starting chat server on {}", server.local_addr()?);
    info!("Press Ctrl+C to stop the server.");

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, shutting down");
                shutdown.stop();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await;
    info!("Server stopped.");

    Ok(())
}

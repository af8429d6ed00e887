//! Chat server listener
//!
//! Accepts connections until stopped and spawns one [`handle_connection`]
//! task per accepted socket, all sharing a single [`Router`] and its
//! [`Registry`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handler::handle_connection;
use crate::registry::Registry;
use crate::router::Router;

/// Bound chat server, ready to [`run`](ChatServer::run)
pub struct ChatServer {
    listener: TcpListener,
    router: Router,
    shutdown: ShutdownHandle,
}

impl ChatServer {
    /// Bind the listening socket described by `config`
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        let registry = Registry::new();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            listener,
            router: Router::new(registry.clone()),
            shutdown: ShutdownHandle {
                tx: Arc::new(shutdown_tx),
                registry,
            },
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Joined sessions
    pub fn registry(&self) -> &Registry {
        self.router.registry()
    }

    /// Handle that can stop the server from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Stop accepting and close every session
    pub fn stop(&self) {
        self.shutdown.stop();
    }

    /// Accept connections until stopped
    pub async fn run(self) {
        let local = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!("Chat server listening on {}", local);

        let mut stopped = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from {}", addr);
                        let router = self.router.clone();
                        let shutdown = self.shutdown.subscribe();

                        // Spawn handler task for each connection
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, router, shutdown).await {
                                error!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                _ = wait_for_stop(&mut stopped) => break,
            }
        }

        info!("Chat server stopped accepting on {}", local);
    }
}

/// Resolve once the stop flag is set or its sender is gone
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Stops a running [`ChatServer`]
///
/// Cloneable so a signal handler can hold one while `run` owns the server.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    registry: Registry,
}

impl ShutdownHandle {
    /// Halt acceptance and force-close every connection
    ///
    /// Connection tasks observe the flag and drop their sockets. The
    /// registry is cleared so nothing is delivered to closing sessions.
    pub fn stop(&self) {
        self.tx.send_replace(true);
        let closed = self.registry.clear();
        info!("Shutdown requested, closing {} session(s)", closed.len());
    }

    /// Check if `stop` has been called
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

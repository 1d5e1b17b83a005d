//! TCP server implementation.

use crate::config::{Config, ConnectionConfig, LeaseConfig};
use crate::connection::Connection;
use crate::error::TransportError;
use dashmap::DashMap;
use rsocket_core::Responder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time allowed for a new connection to send SETUP.
    pub setup_timeout: Duration,
    /// Per-connection protocol settings.
    pub connection: ConnectionConfig,
    /// Lease settings honored when a client asks for lease.
    pub lease: LeaseConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds a server configuration from the loaded file/env configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            setup_timeout: config.network.setup_timeout(),
            connection: config.connection.clone(),
            lease: config.lease.clone(),
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub setup_failures: AtomicU64,
    pub errors_total: AtomicU64,
}

/// A connection currently served.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub connected_at: Instant,
    pub lease: bool,
}

/// TCP server accepting RSocket connections.
pub struct Server {
    config: ServerConfig,
    responder: Arc<dyn Responder>,
    stats: Arc<ServerStats>,
    connections: Arc<DashMap<Uuid, ConnectionInfo>>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Creates a new server answering requests with `responder`.
    pub fn new(config: ServerConfig, responder: Arc<dyn Responder>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            responder,
            stats: Arc::new(ServerStats::default()),
            connections: Arc::new(DashMap::new()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        let local_addr = listener.local_addr()?;
        let mut shutdown_rx = self.shutdown.subscribe();
        *self.local_addr.lock() = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", local_addr);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            tcp_stream.set_nodelay(true).ok();

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let config = self.config.clone();
                            let responder = self.responder.clone();
                            let stats = self.stats.clone();
                            let connections = self.connections.clone();
                            let conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let accepted = Connection::accept(
                                    tcp_stream,
                                    &config.connection,
                                    &config.lease,
                                    config.setup_timeout,
                                    responder,
                                )
                                .await;

                                match accepted {
                                    Ok((connection, negotiated)) => {
                                        let id = connection.id();
                                        tracing::info!("Client connected: {} ({})", addr, id);
                                        connections.insert(id, ConnectionInfo {
                                            id,
                                            peer: addr,
                                            connected_at: Instant::now(),
                                            lease: negotiated.lease,
                                        });

                                        let result = connection.with_shutdown(conn_shutdown).run().await;
                                        if let Err(e) = result {
                                            tracing::debug!("Connection {} error: {}", addr, e);
                                            stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                        }

                                        connections.remove(&id);
                                        tracing::info!("Client disconnected: {}", addr);
                                    }
                                    Err(e) => {
                                        tracing::warn!("[{}] SETUP failed: {}", addr, e);
                                        stats.setup_failures.fetch_add(1, Ordering::Relaxed);
                                    }
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Initiates server shutdown. Open connections send a CONNECTION_CLOSE
    /// error and stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Snapshot of the connections currently served.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsocket_core::RejectAll;

    #[tokio::test]
    async fn test_server_basic() {
        let server = Server::new(
            ServerConfig::new("127.0.0.1:0".parse().unwrap()),
            Arc::new(RejectAll),
        );
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        assert!(server.connections().is_empty());
    }

    #[tokio::test]
    async fn test_server_shutdown_stops_accept_loop() {
        let server = Arc::new(Server::new(
            ServerConfig::new("127.0.0.1:0".parse().unwrap()),
            Arc::new(RejectAll),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        while !server.is_running() {
            tokio::task::yield_now().await;
        }
        assert_eq!(server.local_addr(), Some(addr));

        server.shutdown();
        task.await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[test]
    fn test_config_from_file_config() {
        let mut config = Config::default();
        config.network.max_connections = 3;
        config.lease.enabled = true;
        let server_config = ServerConfig::from_config(&config);
        assert_eq!(server_config.max_connections, 3);
        assert!(server_config.lease.enabled);
        assert_eq!(server_config.setup_timeout, Duration::from_secs(10));
    }
}

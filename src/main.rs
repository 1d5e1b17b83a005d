//! rsocket - RSocket echo server
//!
//! Serves every interaction model over TCP by echoing requests back.

use rsocket_core::{ChannelSubscriber, NoopSubscription, Responder, StreamHandle, Subscription};
use rsocket_protocol::Payload;
use rsocket_transport::{Config, Server, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Echoes every request back to the requester.
///
/// A request-stream payload is repeated `initial_request_n` times, capped
/// at [`MAX_STREAM_ECHOES`].
struct EchoResponder;

const MAX_STREAM_ECHOES: u32 = 1024;

impl Responder for EchoResponder {
    fn fire_and_forget(&self, payload: Payload) {
        tracing::info!(
            data = payload.data_len(),
            metadata = payload.metadata_len(),
            "fire_and_forget received"
        );
    }

    fn request_response(&self, payload: Payload, sender: StreamHandle) -> Box<dyn Subscription> {
        sender.next(payload, true);
        Box::new(NoopSubscription)
    }

    fn request_stream(
        &self,
        payload: Payload,
        initial_request_n: u32,
        sender: StreamHandle,
    ) -> Box<dyn Subscription> {
        for _ in 0..initial_request_n.min(MAX_STREAM_ECHOES) {
            sender.next(payload.clone(), false);
        }
        sender.complete();
        Box::new(NoopSubscription)
    }

    fn request_channel(
        &self,
        payload: Payload,
        initial_request_n: u32,
        is_complete: bool,
        sender: StreamHandle,
    ) -> Box<dyn ChannelSubscriber> {
        sender.next(payload, is_complete);
        sender.request(initial_request_n);
        Box::new(sender)
    }

    fn metadata_push(&self, metadata: bytes::Bytes) {
        tracing::info!(len = metadata.len(), "metadata_push received");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if RSOCKET_CONFIG is set, then env overrides)
    let config_path = std::env::var("RSOCKET_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting rsocket echo server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Keepalive: {}ms, max lifetime: {}ms",
        config.connection.keepalive_interval_ms,
        config.connection.max_lifetime_ms
    );
    if config.connection.fragment_size == 0 {
        tracing::info!("  Fragmentation: only beyond the frame length limit");
    } else {
        tracing::info!("  Fragmentation: {} bytes", config.connection.fragment_size);
    }
    if config.lease.enabled {
        tracing::info!(
            "  Lease: enabled ({} requests per {}ms, {:?} mode)",
            config.lease.grant_requests,
            config.lease.ttl_ms,
            config.lease.mode
        );
    } else {
        tracing::info!("  Lease: disabled");
    }

    let server = Arc::new(Server::new(
        ServerConfig::from_config(&config),
        Arc::new(EchoResponder),
    ));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}

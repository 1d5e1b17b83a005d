//! TCP transport for the RSocket engine.
//!
//! A [`Connection`] couples a byte stream with a
//! [`Multiplexer`](rsocket_core::Multiplexer): it performs SETUP, decodes
//! frames, drives keepalive and lease, and writes whatever the multiplexer
//! produces. [`Server`] and [`Client`] wrap it for TCP.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod server;
pub mod setup;

pub use client::{Channel, Client, ClientConfig, ResponseStream};
pub use config::{Config, ConfigError, ConnectionConfig, LeaseConfig, LeaseMode, NetworkConfig};
pub use connection::Connection;
pub use error::TransportError;
pub use server::{ConnectionInfo, Server, ServerConfig, ServerStats};
pub use setup::{accept_setup, client_setup, Negotiated};

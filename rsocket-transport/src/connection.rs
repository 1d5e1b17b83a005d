//! Connection driver.
//!
//! A [`Connection`] owns one byte stream and the [`Multiplexer`] for it. A
//! single `select!` loop serializes inbound frames, local signals,
//! keepalive ticks, lease renewal and shutdown; outbound frames are written
//! after every step.

use crate::config::{ConnectionConfig, LeaseConfig};
use crate::error::TransportError;
use crate::setup::{accept_setup, client_setup, is_setup_error, Negotiated};
use bytes::{Bytes, BytesMut};
use rsocket_core::{Multiplexer, MultiplexerConfig, RSocketError, Requester, Responder, Role};
use rsocket_protocol::{Decoder, Encoder, ErrorCode, Frame, Payload};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

/// Socket read buffer size (8 KiB).
pub const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Lease grant this side issues to its peer.
#[derive(Debug, Clone, Copy)]
struct LeaseGrant {
    requests: u32,
    ttl_ms: u32,
}

/// One established RSocket connection over `T`.
pub struct Connection<T> {
    id: Uuid,
    io: T,
    decoder: Decoder,
    mux: Multiplexer,
    /// Client side sends KEEPALIVE with RESPOND at this interval.
    keepalive: Option<Duration>,
    max_lifetime: Duration,
    tick: Duration,
    lease_grant: Option<LeaseGrant>,
    shutdown: Option<broadcast::Receiver<()>>,
    last_received: Instant,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Opens the client side: writes SETUP and returns without waiting,
    /// since the protocol has no SETUP acknowledgement. A rejection arrives
    /// later as a connection ERROR and ends [`Connection::run`].
    pub async fn client(
        mut io: T,
        config: &ConnectionConfig,
        lease: &LeaseConfig,
        setup_payload: Payload,
        responder: Arc<dyn Responder>,
    ) -> Result<Self, TransportError> {
        let setup = client_setup(config, lease.enabled, setup_payload);
        let encoded = Encoder::encode_frame(&setup)?;
        io.write_all(&encoded).await?;
        io.flush().await?;

        let mut mux_config =
            MultiplexerConfig::new(Role::Client).with_fragment_size(config.fragment_size);
        if lease.enabled {
            mux_config = mux_config.with_lease(lease.policy());
        }

        let id = Uuid::new_v4();
        tracing::debug!(conn = %id, lease = lease.enabled, "SETUP sent");
        Ok(Self {
            id,
            io,
            decoder: Decoder::new(),
            mux: Multiplexer::new(mux_config, responder),
            keepalive: Some(config.keepalive_interval()),
            max_lifetime: config.max_lifetime(),
            tick: config.keepalive_interval(),
            lease_grant: lease.enabled.then_some(LeaseGrant {
                requests: lease.grant_requests,
                ttl_ms: lease.ttl_ms,
            }),
            shutdown: None,
            last_received: Instant::now(),
        })
    }

    /// Accepts the server side: requires SETUP as the first frame. A
    /// rejected SETUP is answered with a connection ERROR before returning.
    pub async fn accept(
        mut io: T,
        config: &ConnectionConfig,
        lease: &LeaseConfig,
        setup_timeout: Duration,
        responder: Arc<dyn Responder>,
    ) -> Result<(Self, Negotiated), TransportError> {
        let mut decoder = Decoder::new();
        let first = read_first_frame(&mut io, &mut decoder, setup_timeout).await?;

        let negotiated = match accept_setup(first, lease.enabled) {
            Ok(negotiated) => negotiated,
            Err(error) => {
                tracing::warn!(%error, "rejecting SETUP");
                let encoded = Encoder::encode_frame(&error.to_frame(0))?;
                io.write_all(&encoded).await?;
                io.flush().await?;
                return Err(TransportError::SetupRejected {
                    code: error.code,
                    message: error.message,
                });
            }
        };

        let mut mux_config =
            MultiplexerConfig::new(Role::Server).with_fragment_size(config.fragment_size);
        if negotiated.lease {
            mux_config = mux_config.with_lease(lease.policy());
        }

        let id = Uuid::new_v4();
        tracing::debug!(
            conn = %id,
            keepalive = ?negotiated.keepalive_interval,
            max_lifetime = ?negotiated.max_lifetime,
            lease = negotiated.lease,
            "SETUP accepted"
        );
        let connection = Self {
            id,
            io,
            decoder,
            mux: Multiplexer::new(mux_config, responder),
            keepalive: None,
            max_lifetime: negotiated.max_lifetime,
            tick: negotiated.keepalive_interval,
            lease_grant: negotiated.lease.then_some(LeaseGrant {
                requests: lease.grant_requests,
                ttl_ms: lease.ttl_ms,
            }),
            shutdown: None,
            last_received: Instant::now(),
        };
        Ok((connection, negotiated))
    }

    /// Stops the connection when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Handle for opening streams towards the peer.
    pub fn requester(&self) -> Requester {
        self.mux.requester()
    }

    /// Drives the connection until it closes.
    ///
    /// Returns `Ok` for an orderly close by either side, including local
    /// shutdown.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut ticker = interval_after(self.tick);
        let mut lease_ticker = self.lease_grant.map(|grant| {
            interval_after(Duration::from_millis(u64::from(grant.ttl_ms)))
        });

        self.grant_lease();
        self.flush().await?;

        loop {
            tokio::select! {
                result = self.io.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!(conn = %self.id, "connection closed by peer");
                            self.mux.close(RSocketError::connection_close("connection closed by peer"));
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::trace!(conn = %self.id, bytes = n, "received");
                            self.last_received = Instant::now();
                            self.decoder.extend(&buf[..n]);
                            self.dispatch_buffered().await?;
                        }
                        Err(e) => {
                            tracing::debug!(conn = %self.id, "read error: {}", e);
                            self.mux.close(RSocketError::connection_close(e.to_string()));
                            return Err(TransportError::Io(e));
                        }
                    }
                }

                Some(signal) = self.mux.recv_signal() => {
                    self.mux.apply(signal);
                    self.mux.poll_signals();
                }

                _ = ticker.tick() => {
                    if self.last_received.elapsed() > self.max_lifetime {
                        tracing::warn!(conn = %self.id, "peer silent for longer than max lifetime");
                        let error = RSocketError::connection_error("keepalive timeout");
                        self.mux.close(error.clone());
                        self.send_now(error.to_frame(0)).await?;
                        return Err(TransportError::Timeout);
                    }
                    if self.keepalive.is_some() {
                        self.send_now(Frame::keepalive(0, Bytes::new(), true)).await?;
                    }
                }

                _ = tick_optional(&mut lease_ticker) => {
                    self.grant_lease();
                }

                _ = recv_shutdown(&mut self.shutdown) => {
                    tracing::debug!(conn = %self.id, "shutdown requested");
                    let error = RSocketError::connection_close("shutting down");
                    self.flush().await?;
                    self.send_now(error.to_frame(0)).await?;
                    self.mux.close(error);
                    return Ok(());
                }
            }

            self.flush().await?;

            if let Some(reason) = self.mux.close_reason() {
                tracing::info!(conn = %self.id, %reason, "connection closed");
                return match reason.code {
                    ErrorCode::ConnectionClose => Ok(()),
                    code if is_setup_error(code) => Err(TransportError::SetupRejected {
                        code,
                        message: reason.message.clone(),
                    }),
                    _ => Err(TransportError::Stream(reason.clone())),
                };
            }
        }
    }

    /// Dispatches every complete frame in the decoder.
    async fn dispatch_buffered(&mut self) -> Result<(), TransportError> {
        loop {
            match self.decoder.decode_frame() {
                Ok(Some(frame)) => self.mux.dispatch(frame),
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::warn!(conn = %self.id, "undecodable frame: {}", e);
                    let error = RSocketError::connection_error(e.to_string());
                    self.mux.close(error.clone());
                    self.flush().await?;
                    self.send_now(error.to_frame(0)).await?;
                    return Err(TransportError::Protocol(e));
                }
            }
        }
    }

    fn grant_lease(&mut self) {
        if let Some(grant) = self.lease_grant {
            tracing::debug!(conn = %self.id, requests = grant.requests, ttl_ms = grant.ttl_ms, "granting lease");
            self.mux.grant_lease(grant.requests, grant.ttl_ms, None);
        }
    }

    /// Writes every frame the multiplexer has queued.
    async fn flush(&mut self) -> Result<(), TransportError> {
        if !self.mux.has_outbound() {
            return Ok(());
        }
        let mut buf = BytesMut::new();
        for frame in self.mux.take_outbound() {
            tracing::trace!(
                conn = %self.id,
                stream_id = frame.stream_id,
                frame_type = %frame.frame_type(),
                "send"
            );
            Encoder::encode_into(&frame, &mut buf)?;
        }
        self.io.write_all(&buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn send_now(&mut self, frame: Frame) -> Result<(), TransportError> {
        let encoded = Encoder::encode_frame(&frame)?;
        self.io.write_all(&encoded).await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// Reads until the decoder yields the first frame.
async fn read_first_frame<T>(
    io: &mut T,
    decoder: &mut Decoder,
    timeout: Duration,
) -> Result<Frame, TransportError>
where
    T: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, async {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(frame) = decoder.decode_frame()? {
                return Ok(frame);
            }
            let n = io.read(&mut buf).await?;
            if n == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            decoder.extend(&buf[..n]);
        }
    })
    .await
    .map_err(|_| TransportError::Timeout)?
}

/// An interval whose first tick fires after one period.
fn interval_after(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn recv_shutdown(shutdown: &mut Option<broadcast::Receiver<()>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending().await,
    }
}

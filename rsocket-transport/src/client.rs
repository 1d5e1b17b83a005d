//! High-level client API.

use crate::config::{ConnectionConfig, LeaseConfig};
use crate::connection::Connection;
use crate::error::TransportError;
use bytes::Bytes;
use rsocket_core::{
    ExtensionReceiver, RSocketError, RejectAll, Requester, Responder, StreamHandle, Subscriber,
    Subscription,
};
use rsocket_protocol::Payload;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Timeout for single-response interactions.
    pub request_timeout: Duration,
    /// Per-connection protocol settings.
    pub connection: ConnectionConfig,
    /// Lease settings; enabled asks the server for lease semantics.
    pub lease: LeaseConfig,
    /// Payload sent with SETUP.
    pub setup_payload: Payload,
}

impl ClientConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            connection: ConnectionConfig::default(),
            lease: LeaseConfig::default(),
            setup_payload: Payload::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
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

    pub fn with_setup_payload(mut self, payload: Payload) -> Self {
        self.setup_payload = payload;
        self
    }
}

/// An RSocket client connection.
///
/// The connection is driven by a background task; every method only
/// enqueues work for it.
pub struct Client {
    config: ClientConfig,
    requester: Requester,
    shutdown: broadcast::Sender<()>,
    task: parking_lot::Mutex<Option<JoinHandle<Result<(), TransportError>>>>,
}

impl Client {
    /// Connects over TCP and performs SETUP. Requests from the server are
    /// rejected.
    pub async fn connect(config: ClientConfig) -> Result<Self, TransportError> {
        Self::connect_with_responder(config, Arc::new(RejectAll)).await
    }

    /// Connects over TCP; requests from the server go to `responder`.
    pub async fn connect_with_responder(
        config: ClientConfig,
        responder: Arc<dyn Responder>,
    ) -> Result<Self, TransportError> {
        tracing::debug!("Connecting to {}...", config.addr);
        let tcp_stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        tcp_stream.set_nodelay(true).ok();
        Self::over(tcp_stream, config, responder).await
    }

    /// Runs the client over an arbitrary byte stream.
    pub async fn over<T>(
        io: T,
        config: ClientConfig,
        responder: Arc<dyn Responder>,
    ) -> Result<Self, TransportError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let connection = Connection::client(
            io,
            &config.connection,
            &config.lease,
            config.setup_payload.clone(),
            responder,
        )
        .await?
        .with_shutdown(shutdown_rx);
        let requester = connection.requester();

        let task = tokio::spawn(async move {
            let result = connection.run().await;
            if let Err(ref e) = result {
                tracing::debug!("client connection ended: {}", e);
            }
            result
        });

        Ok(Self {
            config,
            requester,
            shutdown: shutdown_tx,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    /// Handle for opening streams with custom subscribers.
    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    /// Returns whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.requester.is_closed()
    }

    /// Sends a fire-and-forget request. Resolves once the request has been
    /// handed to the connection.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<(), TransportError> {
        let (subscriber, rx) = SingleSubscriber::new();
        let handle = self.requester.fire_and_forget(payload, Box::new(subscriber));
        self.await_single(handle, rx).await.map(|_| ())
    }

    /// Sends a request and waits for its single response. `None` means
    /// the responder completed without a payload.
    pub async fn request_response(&self, payload: Payload) -> Result<Option<Payload>, TransportError> {
        let (subscriber, rx) = SingleSubscriber::new();
        let handle = self.requester.request_response(payload, Box::new(subscriber));
        self.await_single(handle, rx).await
    }

    /// Opens a stream with the configured initial request N.
    pub fn request_stream(&self, payload: Payload) -> ResponseStream {
        self.request_stream_with(payload, self.config.connection.initial_request_n)
    }

    /// Opens a stream asking for `initial_request_n` items up front.
    pub fn request_stream_with(&self, payload: Payload, initial_request_n: u32) -> ResponseStream {
        let (subscriber, items) = ForwardingSubscriber::new();
        let handle = self
            .requester
            .request_stream(payload, initial_request_n, Box::new(subscriber));
        ResponseStream { handle, items }
    }

    /// Opens a channel. With `is_complete` the outbound side ends with the
    /// first payload.
    pub fn request_channel(
        &self,
        payload: Payload,
        initial_request_n: u32,
        is_complete: bool,
    ) -> Channel {
        let (subscriber, items) = ForwardingSubscriber::new();
        let outbound_cancelled = subscriber.cancelled.clone();
        let handle = self.requester.request_channel(
            payload,
            initial_request_n,
            is_complete,
            Box::new(subscriber),
        );
        Channel {
            inbound: ResponseStream { handle, items },
            outbound_cancelled,
        }
    }

    /// Sends connection-level metadata.
    pub fn metadata_push(&self, metadata: Bytes) {
        self.requester.metadata_push(metadata);
    }

    /// Closes the connection and waits for the driver to stop.
    pub async fn close(&self) -> Result<(), TransportError> {
        let _ = self.shutdown.send(());
        let task = self.task.lock().take();
        match task {
            Some(task) => task.await.map_err(|_| TransportError::ConnectionClosed)?,
            None => Ok(()),
        }
    }

    async fn await_single(
        &self,
        handle: StreamHandle,
        rx: oneshot::Receiver<Result<Option<Payload>, RSocketError>>,
    ) -> Result<Option<Payload>, TransportError> {
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                tracing::debug!(key = %handle.key(), "request timed out");
                handle.cancel();
                Err(TransportError::Timeout)
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Resolves a oneshot with the first terminal signal.
struct SingleSubscriber {
    tx: Option<oneshot::Sender<Result<Option<Payload>, RSocketError>>>,
}

impl SingleSubscriber {
    fn new() -> (Self, oneshot::Receiver<Result<Option<Payload>, RSocketError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    fn resolve(&mut self, result: Result<Option<Payload>, RSocketError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }
}

impl ExtensionReceiver for SingleSubscriber {}

impl Subscriber for SingleSubscriber {
    fn on_next(&mut self, payload: Payload, _is_complete: bool) {
        self.resolve(Ok(Some(payload)));
    }

    fn on_complete(&mut self) {
        self.resolve(Ok(None));
    }

    fn on_error(&mut self, error: RSocketError) {
        self.resolve(Err(error));
    }
}

/// Forwards inbound items to a [`ResponseStream`].
struct ForwardingSubscriber {
    tx: mpsc::UnboundedSender<Result<Payload, RSocketError>>,
    cancelled: Arc<AtomicBool>,
}

impl ForwardingSubscriber {
    fn new() -> (Self, mpsc::UnboundedReceiver<Result<Payload, RSocketError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Self {
            tx,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        (subscriber, rx)
    }
}

impl ExtensionReceiver for ForwardingSubscriber {
    fn on_extension(&mut self, extended_type: u32, _content: Bytes, can_be_ignored: bool) {
        tracing::debug!(extended_type, can_be_ignored, "ignoring stream extension");
    }
}

impl Subscriber for ForwardingSubscriber {
    fn on_next(&mut self, payload: Payload, _is_complete: bool) {
        let _ = self.tx.send(Ok(payload));
    }

    fn on_complete(&mut self) {}

    fn on_error(&mut self, error: RSocketError) {
        let _ = self.tx.send(Err(error));
    }
}

impl Subscription for ForwardingSubscriber {
    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Inbound side of a request-stream or request-channel.
///
/// Items arrive as credit allows. [`ResponseStream::recv`] returns `None`
/// after completion and yields an `Err` item once if the stream failed.
/// Dropping it cancels a stream that is still running.
pub struct ResponseStream {
    handle: StreamHandle,
    items: mpsc::UnboundedReceiver<Result<Payload, RSocketError>>,
}

impl ResponseStream {
    pub async fn recv(&mut self) -> Option<Result<Payload, RSocketError>> {
        self.items.recv().await
    }

    /// Grants the responder `n` more items.
    pub fn request(&self, n: u32) {
        self.handle.request(n);
    }

    /// Cancels the stream. No further items are delivered.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Collects every remaining item, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<Payload>, RSocketError> {
        let mut payloads = Vec::new();
        while let Some(item) = self.recv().await {
            payloads.push(item?);
        }
        Ok(payloads)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        // No-op once the stream has terminated.
        self.handle.cancel();
    }
}

/// Both directions of a locally-opened request-channel.
///
/// Dropping it cancels both directions.
pub struct Channel {
    inbound: ResponseStream,
    outbound_cancelled: Arc<AtomicBool>,
}

impl Channel {
    /// Sends one payload; it goes out as the peer grants credit.
    pub fn send(&self, payload: Payload) {
        self.inbound.handle.next(payload, false);
    }

    /// Sends a final payload and completes the outbound side.
    pub fn send_last(&self, payload: Payload) {
        self.inbound.handle.next(payload, true);
    }

    /// Completes the outbound side.
    pub fn complete(&self) {
        self.inbound.handle.complete();
    }

    /// Fails the whole channel.
    pub fn error(&self, error: RSocketError) {
        self.inbound.handle.error(error);
    }

    /// Returns true once the peer cancelled the outbound side.
    pub fn is_outbound_cancelled(&self) -> bool {
        self.outbound_cancelled.load(Ordering::SeqCst)
    }

    pub async fn recv(&mut self) -> Option<Result<Payload, RSocketError>> {
        self.inbound.recv().await
    }

    pub fn request(&self, n: u32) {
        self.inbound.request(n);
    }

    pub fn cancel(&self) {
        self.inbound.cancel();
    }

    /// Splits off the inbound side, keeping a handle for sending.
    pub fn into_inbound(self) -> ResponseStream {
        self.inbound
    }
}

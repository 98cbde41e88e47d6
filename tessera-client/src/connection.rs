//! Connection management.
//!
//! One [`ConnectionManager`] multiplexes requests to any number of
//! destinations. Each destination has a single persistent TCP connection
//! ("wire"), created lazily on first use and re-dialled after teardown.
//! Sends on a wire are serialized by a single-permit lock; responses are read
//! by one background task per live socket and matched to pending requests by
//! request id, in whatever order they arrive.
//!
//! A wire carries an epoch that is bumped on teardown. Readers and writers
//! belonging to an older epoch are stale: a reader exits at its next poll and
//! a writer is dropped by the next submit.

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tessera_protocol::{FrameDecoder, ProtocolError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};

/// A request that can travel through a [`ConnectionManager`].
///
/// Implementations use interior mutability: the manager and the reader task
/// share the request behind an `Arc`.
pub trait Request: Send + Sync {
    /// Absolute deadline for the whole exchange.
    fn deadline(&self) -> Instant;

    /// Signal fired by the reader when the response has been delivered.
    fn completion(&self) -> &Completion;

    /// Id assigned by the most recent [`Request::serialize`].
    fn request_id(&self) -> u64;

    /// Produces the wire bytes for an attempt with the given ids.
    fn serialize(&self, request_id: u64, client_id: u64) -> Result<Bytes, ProtocolError>;

    /// Absorbs a response frame.
    fn deserialize(&self, frame: &Bytes) -> Result<(), ProtocolError>;
}

#[derive(Debug, Clone)]
struct Signal {
    request_id: u64,
    result: Result<(), ProtocolError>,
}

/// Single-slot completion signal, keyed by request id.
///
/// A completion for one request id never satisfies a wait for another, so a
/// late response to an abandoned attempt cannot wake a later one.
#[derive(Debug)]
pub struct Completion {
    tx: watch::Sender<Option<Signal>>,
}

impl Completion {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Records the outcome of delivering the response to `request_id`.
    pub fn complete(&self, request_id: u64, result: Result<(), ProtocolError>) {
        self.tx.send_replace(Some(Signal { request_id, result }));
    }

    /// Waits until `request_id` has been completed.
    pub async fn wait(&self, request_id: u64) -> Result<(), ProtocolError> {
        let mut rx = self.tx.subscribe();
        let signal = rx
            .wait_for(|s| matches!(s, Some(s) if s.request_id == request_id))
            .await;
        match signal {
            Ok(signal) => match signal.as_ref() {
                Some(s) => s.result.clone(),
                None => Err(ProtocolError::Malformed("empty completion")),
            },
            // Unreachable while `self` holds the sender.
            Err(_) => Err(ProtocolError::Malformed("completion dropped")),
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

struct SendState {
    writer: Option<OwnedWriteHalf>,
    epoch: u64,
}

/// Per-destination connection state.
struct Wire {
    addr: SocketAddr,
    /// The send token; whoever holds it owns the write half.
    send: tokio::sync::Mutex<SendState>,
    epoch: AtomicU64,
    connected: AtomicBool,
}

impl Wire {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            send: tokio::sync::Mutex::new(SendState {
                writer: None,
                epoch: 0,
            }),
            epoch: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// Retires the connection of `epoch`. Only the first caller for a given
    /// epoch has any effect.
    fn teardown(&self, epoch: u64, reason: &str) {
        if self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.connected.store(false, Ordering::Release);
            tracing::info!(addr = %self.addr, epoch, reason, "end of connection");
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }
}

#[derive(Default)]
struct Registry {
    next_request_id: u64,
    wires: HashMap<SocketAddr, Arc<Wire>>,
    pending: HashMap<u64, Arc<dyn Request>>,
}

struct Shared {
    config: ConnectionConfig,
    client_id: u64,
    registry: Mutex<Registry>,
}

impl Shared {
    /// Delivers a response frame to its pending request, if any.
    ///
    /// Runs under the registry lock so that a request cannot be abandoned
    /// while its response is being written into it.
    fn dispatch(&self, wire: &Wire, epoch: u64, request_id: u64, frame: &Bytes) {
        let registry = self.registry.lock();
        let Some(request) = registry.pending.get(&request_id) else {
            tracing::debug!(addr = %wire.addr, request_id, "no pending request for response");
            return;
        };

        let result = request.deserialize(frame);
        if let Err(e) = &result {
            tracing::warn!(addr = %wire.addr, request_id, error = %e, "malformed response");
            wire.teardown(epoch, "malformed message received");
        }
        request.completion().complete(request_id, result);
    }
}

/// Multiplexes requests over one persistent connection per destination.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Creates a manager with a random client id.
    pub fn new(config: ConnectionConfig) -> Self {
        let (hi, lo) = uuid::Uuid::new_v4().as_u64_pair();
        Self::with_client_id(config, hi ^ lo)
    }

    pub fn with_client_id(config: ConnectionConfig, client_id: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                client_id,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.shared.client_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Number of requests submitted and not yet waited for.
    pub fn pending_count(&self) -> usize {
        self.shared.registry.lock().pending.len()
    }

    /// Returns whether a live connection to `addr` exists.
    pub fn connected(&self, addr: SocketAddr) -> bool {
        self.shared
            .registry
            .lock()
            .wires
            .get(&addr)
            .map(|wire| wire.connected.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn wire(&self, addr: SocketAddr) -> (u64, Arc<Wire>) {
        let mut registry = self.shared.registry.lock();
        registry.next_request_id += 1;
        let request_id = registry.next_request_id;
        let wire = registry
            .wires
            .entry(addr)
            .or_insert_with(|| Arc::new(Wire::new(addr)))
            .clone();
        (request_id, wire)
    }

    async fn dial(&self, addr: SocketAddr, deadline: Instant) -> Result<TcpStream, ClientError> {
        let connect = timeout(self.shared.config.connect_timeout, TcpStream::connect(addr));
        let stream = match timeout_at(deadline, connect).await {
            Err(_) => return Err(ClientError::Timeout),
            Ok(Err(_)) => {
                return Err(ClientError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timeout",
                )))
            }
            Ok(Ok(result)) => result?,
        };
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    /// Sends `request` to `addr`.
    ///
    /// On success the request is pending and must be passed to
    /// [`ConnectionManager::wait_for_completion`]. On failure nothing is
    /// pending; a connection that may have seen a partial write is torn down.
    pub async fn submit(&self, request: Arc<dyn Request>, addr: SocketAddr) -> Result<(), ClientError> {
        let deadline = request.deadline();
        if Instant::now() >= deadline {
            return Err(ClientError::Timeout);
        }
        let (request_id, wire) = self.wire(addr);

        let mut state = timeout_at(deadline, wire.send.lock())
            .await
            .map_err(|_| ClientError::Timeout)?;

        let bytes = request.serialize(request_id, self.shared.client_id)?;

        let current = wire.epoch.load(Ordering::Acquire);
        if state.epoch != current {
            // Torn down since the last send.
            state.writer = None;
        }

        let (mut writer, fresh) = match state.writer.take() {
            Some(writer) => (writer, None),
            None => {
                let stream = self.dial(addr, deadline).await.map_err(|e| {
                    tracing::warn!(%addr, error = %e, "dial failed");
                    e
                })?;
                tracing::info!(%addr, epoch = current, "connected");
                let (reader, writer) = stream.into_split();
                (writer, Some(reader))
            }
        };

        self.shared
            .registry
            .lock()
            .pending
            .insert(request_id, request.clone());

        let written = match timeout_at(deadline, writer.write_all(&bytes)).await {
            Ok(result) => result.map_err(ClientError::Io),
            Err(_) => Err(ClientError::Timeout),
        };

        if let Err(e) = written {
            self.shared.registry.lock().pending.remove(&request_id);
            drop(writer);
            wire.teardown(current, "send failed");
            tracing::warn!(%addr, request_id, error = %e, "send failed");
            return Err(e);
        }

        tracing::debug!(%addr, request_id, bytes = bytes.len(), "request sent");
        state.writer = Some(writer);
        state.epoch = current;

        if let Some(reader) = fresh {
            wire.connected.store(true, Ordering::Release);
            tokio::spawn(read_loop(
                self.shared.clone(),
                wire.clone(),
                reader,
                current,
            ));
        }
        Ok(())
    }

    /// Waits for the response to a submitted request, or its deadline.
    ///
    /// The request is removed from the pending table either way.
    pub async fn wait_for_completion(&self, request: &dyn Request) -> Result<(), ClientError> {
        let request_id = request.request_id();
        let result = timeout_at(request.deadline(), request.completion().wait(request_id)).await;

        self.shared.registry.lock().pending.remove(&request_id);

        match result {
            Ok(delivered) => delivered.map_err(ClientError::from),
            Err(_) => {
                tracing::debug!(request_id, "request timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    /// Submits `request` and waits for its response.
    pub async fn rpc(&self, request: Arc<dyn Request>, addr: SocketAddr) -> Result<(), ClientError> {
        self.submit(request.clone(), addr).await?;
        self.wait_for_completion(&*request).await
    }

    /// Tears down every connection. Pending requests run into their deadlines.
    pub async fn close(&self) {
        let wires: Vec<_> = self.shared.registry.lock().wires.values().cloned().collect();
        for wire in wires {
            let mut state = wire.send.lock().await;
            if let Some(mut writer) = state.writer.take() {
                let _ = writer.shutdown().await;
            }
            wire.teardown(state.epoch, "closed by client");
        }
    }
}

/// Reads responses from one socket until it is torn down or superseded.
async fn read_loop(shared: Arc<Shared>, wire: Arc<Wire>, mut reader: OwnedReadHalf, epoch: u64) {
    let read_buffer_size = shared.config.read_buffer_size;
    let mut decoder = FrameDecoder::with_capacity(shared.config.magic, read_buffer_size);

    tracing::debug!(addr = %wire.addr, epoch, "reader started");
    loop {
        if !wire.is_current(epoch) {
            tracing::debug!(addr = %wire.addr, epoch, "reader superseded");
            return;
        }

        let buffer = decoder.buffer_mut();
        if buffer.capacity() - buffer.len() < MIN_READ_SPARE {
            buffer.reserve(read_buffer_size);
        }

        match timeout(shared.config.read_poll_interval, reader.read_buf(buffer)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                wire.teardown(epoch, "closed by peer");
                return;
            }
            Ok(Ok(n)) => tracing::trace!(addr = %wire.addr, bytes = n, "read"),
            Ok(Err(e)) => {
                tracing::warn!(addr = %wire.addr, error = %e, "read failed");
                wire.teardown(epoch, "read failed");
                return;
            }
        }

        loop {
            match decoder.next_frame() {
                Ok(None) => break,
                Ok(Some((info, frame))) => {
                    if info.client_id != shared.client_id {
                        tracing::warn!(
                            addr = %wire.addr,
                            client_id = info.client_id,
                            "response for another client"
                        );
                        wire.teardown(epoch, "client id mismatch");
                        return;
                    }
                    shared.dispatch(&wire, epoch, info.request_id, &frame);
                }
                Err(e) => {
                    tracing::warn!(addr = %wire.addr, error = %e, "corrupt stream");
                    wire.teardown(epoch, "corrupt stream");
                    return;
                }
            }
        }
    }
}

const MIN_READ_SPARE: usize = 512;

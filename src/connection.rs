//! A single connection to one gateway.
//!
//! Each [`GatewayConnection`] runs two tasks. The send task is the only writer of the socket: it drains the outbound
//! queue in order, encoding and writing one frame at a time. The receive task is the only reader: it decodes frames
//! as bytes arrive and hands every message to the message center. Both tasks take their half of the current socket
//! from a shared slot and go back to it when the socket is replaced, so neither holds a lock while doing I/O.
//!
//! A connection that cannot be (re)established after its retry budget is dead for good. It reports the gateway dead,
//! hands everything still queued back to the message center for rerouting and never connects again. Routing to that
//! gateway later takes a new connection.

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    runtime::Handle,
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

mod handshake;
mod transport;

pub use handshake::{read_preamble, write_preamble, Preamble};
pub use transport::{BoxGatewayStream, GatewayStream, GatewayTransport, TcpTransport};

use crate::{
    buffer::{BufferPool, SegmentList},
    config::GatewayClientConfig,
    error::{GatewayError, Result},
    framing::{encode_message, FrameReader, FrameReaderSettings},
    gateway::{GatewayAddress, GatewayManager},
    message::{BodySerializer, Message, RejectionType},
    stats::MessagingStats,
};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Callbacks from a connection into the component that owns it.
pub(crate) trait ConnectionEvents: Send + Sync {
    /// A message was received from the gateway.
    fn deliver(&self, message: Message);

    /// A message could not be sent on this connection and must be routed again.
    fn reroute(&self, message: Message);

    /// A message can never be sent and its sender should get a rejection.
    fn reject(&self, message: Message, rejection: RejectionType, info: String);

    /// The connection was declared dead.
    fn connection_dead(&self, connection: &GatewayConnection);
}

/// Connect and read settings shared by every connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub retry_count: usize,
    pub min_interconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub reader: FrameReaderSettings,
}

impl From<&GatewayClientConfig> for ConnectionSettings {
    fn from(config: &GatewayClientConfig) -> Self {
        ConnectionSettings {
            retry_count: config.connect_retry_count,
            min_interconnect_delay: config.min_interconnect_delay,
            connect_timeout: config.connect_timeout,
            reader: FrameReaderSettings::from(config),
        }
    }
}

/// Everything a connection needs from the message center.
pub(crate) struct ConnectionContext {
    pub gateways: Arc<GatewayManager>,
    pub transport: Arc<dyn GatewayTransport>,
    pub events: Weak<dyn ConnectionEvents>,
    pub pool: Arc<BufferPool>,
    pub serializer: Arc<dyn BodySerializer>,
    pub preamble: Preamble,
    pub settings: ConnectionSettings,
    pub stats: Arc<MessagingStats>,
    pub shutdown: CancellationToken,
    pub runtime: Handle,
}

/// Lifecycle of a [`GatewayConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No socket is open.
    Disconnected = 0,
    /// A connection attempt is in progress.
    Connecting = 1,
    /// A socket is open and the preamble was sent.
    Connected = 2,
    /// The retry budget was exhausted. Terminal.
    Dead = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Dead,
        }
    }
}

struct ActiveSocket {
    id: u64,
    reader: Option<ReadHalf<BoxGatewayStream>>,
    writer: Option<WriteHalf<BoxGatewayStream>>,
    closed: CancellationToken,
}

/// One half of the active socket, as taken by a loop.
struct SocketHalf<T> {
    socket_id: u64,
    half: T,
    closed: CancellationToken,
}

struct ConnectAttempts {
    last_attempt: Option<Instant>,
}

/// A connection to one gateway.
pub struct GatewayConnection {
    address: GatewayAddress,
    generation: u64,
    context: Arc<ConnectionContext>,
    is_live: AtomicBool,
    state: AtomicU8,
    outbound: mpsc::UnboundedSender<Message>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    socket: Mutex<Option<ActiveSocket>>,
    next_socket_id: AtomicU64,
    attempts: tokio::sync::Mutex<ConnectAttempts>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayConnection {
    pub(crate) fn new(address: GatewayAddress, context: Arc<ConnectionContext>) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = context.shutdown.child_token();
        context.stats.record_connection_created();
        Arc::new(GatewayConnection {
            address,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            context,
            is_live: AtomicBool::new(true),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            socket: Mutex::new(None),
            next_socket_id: AtomicU64::new(1),
            attempts: tokio::sync::Mutex::new(ConnectAttempts { last_attempt: None }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The gateway this connection talks to.
    pub fn address(&self) -> GatewayAddress {
        self.address
    }

    /// Distinguishes this connection from every other connection created in the process.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the connection may still be used. Once false, never true again.
    pub fn is_live(&self) -> bool {
        self.is_live.load(Ordering::Acquire)
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    /// Id of the open socket, if any.
    pub fn active_socket_id(&self) -> Option<u64> {
        self.socket.lock().as_ref().map(|socket| socket.id)
    }

    /// Spawns the send and receive tasks. Does nothing if they were already spawned.
    pub(crate) fn start(self: &Arc<Self>) {
        let Some(outbound) = self.outbound_rx.lock().take() else {
            return;
        };
        let runtime = &self.context.runtime;
        let send = runtime.spawn(self.clone().send_loop(outbound));
        let receive = runtime.spawn(self.clone().receive_loop());
        self.tasks.lock().extend([send, receive]);
    }

    /// Queues `message` for sending.
    ///
    /// The message is handed back if the connection is dead or shutting down.
    #[allow(clippy::result_large_err)]
    pub fn enqueue(&self, message: Message) -> std::result::Result<(), Message> {
        if !self.is_live() {
            return Err(message);
        }
        self.outbound.send(message).map_err(|err| err.0)
    }

    /// Makes sure a socket is open, connecting if needed. Returns the open socket's id.
    ///
    /// Only one caller connects at a time. Attempts are spaced by at least the minimum interconnect delay, even
    /// across calls. Once the retry budget is exhausted, or the gateway leaves the live list between two attempts,
    /// the connection is declared dead.
    pub async fn connect(&self) -> Result<u64> {
        let mut attempts = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(GatewayError::Shutdown),
            attempts = self.attempts.lock() => attempts,
        };
        if let Some(socket_id) = self.active_socket_id() {
            return Ok(socket_id);
        }
        if !self.is_live() {
            return Err(GatewayError::GatewayDead(self.address));
        }

        let settings = &self.context.settings;
        for attempt in 1..=settings.retry_count {
            if attempt > 1 && !self.context.gateways.is_live(&self.address) {
                info!(gateway = %self.address, "gateway is no longer live, abandoning reconnect");
                break;
            }
            if let Some(last_attempt) = attempts.last_attempt {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return Err(GatewayError::Shutdown),
                    _ = time::sleep_until(last_attempt + settings.min_interconnect_delay) => {}
                }
            }
            attempts.last_attempt = Some(Instant::now());
            self.set_state(ConnectionState::Connecting);
            debug!(gateway = %self.address, attempt, "connecting to gateway");

            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(GatewayError::Shutdown),
                result = self.open_socket() => result,
            };
            match result {
                Ok(stream) => return Ok(self.install_socket(stream)),
                Err(err) => {
                    warn!(gateway = %self.address, attempt, error = %err, "failed to connect to gateway");
                }
            }
        }

        // Still holding the attempt lock, so a concurrent caller sees the connection dead rather than retrying.
        self.mark_dead();
        drop(attempts);
        Err(GatewayError::GatewayDead(self.address))
    }

    /// Closes the socket identified by `socket_id` if it is still the active one.
    ///
    /// Both loops may observe the same failure. Only the first report for a socket tears it down; reports about a
    /// socket that was already replaced are ignored. Returns whether the socket was closed.
    pub fn mark_as_disconnected(&self, socket_id: u64) -> bool {
        let removed = {
            let mut socket = self.socket.lock();
            if socket.as_ref().map(|active| active.id) != Some(socket_id) {
                return false;
            }
            socket.take()
        };
        if let Some(active) = removed {
            active.closed.cancel();
        }
        self.set_state(ConnectionState::Disconnected);
        warn!(gateway = %self.address, socket_id, "gateway connection lost");
        true
    }

    /// Stops both tasks. Messages still queued are handed back for rerouting.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Waits for both tasks to finish.
    pub(crate) async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!(gateway = %self.address, "gateway connection task panicked");
                }
            }
        }
    }

    fn mark_dead(&self) {
        if !self.is_live.swap(false, Ordering::AcqRel) {
            return;
        }
        self.state
            .store(ConnectionState::Dead as u8, Ordering::Release);
        warn!(gateway = %self.address, "gateway connection is dead");

        self.context.gateways.mark_dead(self.address);
        if let Some(active) = self.socket.lock().take() {
            active.closed.cancel();
        }
        self.shutdown.cancel();
        self.context.stats.record_connection_dead();
        if let Some(events) = self.context.events.upgrade() {
            events.connection_dead(self);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectionState::Dead as u8).then_some(state as u8)
            });
    }

    async fn open_socket(&self) -> Result<BoxGatewayStream> {
        let connect = self.context.transport.connect(self.address);
        let mut stream = match time::timeout(self.context.settings.connect_timeout, connect).await {
            Ok(stream) => stream?,
            Err(_) => return Err(GatewayError::Timeout),
        };
        write_preamble(&mut stream, &self.context.preamble).await?;
        Ok(stream)
    }

    fn install_socket(&self, stream: BoxGatewayStream) -> u64 {
        let (reader, writer) = tokio::io::split(stream);
        let id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        let previous = self.socket.lock().replace(ActiveSocket {
            id,
            reader: Some(reader),
            writer: Some(writer),
            closed: self.shutdown.child_token(),
        });
        if let Some(previous) = previous {
            previous.closed.cancel();
        }
        self.set_state(ConnectionState::Connected);
        info!(gateway = %self.address, socket_id = id, "connected to gateway");
        id
    }

    fn take_half<T>(
        &self,
        take: impl FnOnce(&mut ActiveSocket) -> Option<T>,
    ) -> Option<SocketHalf<T>> {
        let mut socket = self.socket.lock();
        let active = socket.as_mut()?;
        let half = take(active)?;
        Some(SocketHalf {
            socket_id: active.id,
            half,
            closed: active.closed.clone(),
        })
    }

    async fn acquire_writer(&self) -> Option<SocketHalf<WriteHalf<BoxGatewayStream>>> {
        loop {
            if let Some(writer) = self.take_half(|socket| socket.writer.take()) {
                return Some(writer);
            }
            let socket_id = self.connect().await.ok()?;
            if let Some(writer) = self.take_half(|socket| socket.writer.take()) {
                return Some(writer);
            }
            // The write half of this socket was lost; replace the socket.
            self.mark_as_disconnected(socket_id);
        }
    }

    async fn send_loop(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<Message>) {
        let mut writer: Option<SocketHalf<WriteHalf<BoxGatewayStream>>> = None;
        loop {
            let message = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                message = outbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let frame = match encode_message(&message, &self.context.pool, &*self.context.serializer) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(gateway = %self.address, id = ?message.id(), error = %err, "failed to encode message");
                    let info = format!("failed to serialize message: {err}");
                    self.reject(message, RejectionType::Unrecoverable, info);
                    continue;
                }
            };

            if writer
                .as_ref()
                .is_some_and(|writer| writer.closed.is_cancelled())
            {
                writer = None;
            }
            if writer.is_none() {
                writer = self.acquire_writer().await;
            }
            let Some(current) = writer.as_mut() else {
                frame.release(&self.context.pool);
                self.reroute(message);
                break;
            };

            let result = tokio::select! {
                _ = current.closed.cancelled() => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
                result = write_frame(&mut current.half, &frame) => result,
            };
            frame.release(&self.context.pool);
            match result {
                Ok(()) => {
                    self.context.stats.record_sent();
                    trace!(gateway = %self.address, id = ?message.id(), "sent message");
                    message.release(&self.context.pool);
                }
                Err(err) => {
                    let socket_id = current.socket_id;
                    writer = None;
                    warn!(gateway = %self.address, error = %err, "failed to send message, rerouting");
                    self.mark_as_disconnected(socket_id);
                    self.reroute(message);
                }
            }
        }

        outbound.close();
        let mut drained = 0;
        while let Ok(message) = outbound.try_recv() {
            drained += 1;
            self.reroute(message);
        }
        if drained > 0 {
            debug!(gateway = %self.address, drained, "rerouted queued messages");
        }
        debug!(gateway = %self.address, "send loop stopped");
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut frames = FrameReader::new(
            self.context.pool.clone(),
            self.context.settings.reader.clone(),
        );
        while !self.shutdown.is_cancelled() {
            let Some(mut reader) = self.take_half(|socket| socket.reader.take()) else {
                if self.connect().await.is_err() {
                    break;
                }
                continue;
            };

            frames.reset();
            if let Some(err) = self.read_frames(&mut frames, &mut reader).await {
                warn!(gateway = %self.address, error = %err, "failed to receive from gateway");
                self.mark_as_disconnected(reader.socket_id);
            }
        }
        debug!(gateway = %self.address, "receive loop stopped");
    }

    /// Reads and delivers messages until the socket fails or is closed. Returns the failure, if any.
    async fn read_frames(
        &self,
        frames: &mut FrameReader,
        reader: &mut SocketHalf<ReadHalf<BoxGatewayStream>>,
    ) -> Option<GatewayError> {
        loop {
            loop {
                let frame = match frames.try_decode_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(err) => return Some(err),
                };
                // The frame boundaries are intact, so a bad header only costs this one message.
                match Message::from_frame(frame, &self.context.pool) {
                    Ok(message) => {
                        self.context.stats.record_received();
                        trace!(gateway = %self.address, id = ?message.id(), "received message");
                        self.deliver(message);
                    }
                    Err(err) => {
                        warn!(gateway = %self.address, error = %err, "dropping message with undecodable headers");
                        self.context.stats.record_dropped();
                    }
                }
            }

            tokio::select! {
                biased;
                _ = reader.closed.cancelled() => return None,
                read = frames.fill_from(&mut reader.half) => match read {
                    Ok(0) => {
                        return Some(GatewayError::Network(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "gateway closed the connection",
                        )))
                    }
                    Ok(_) => {}
                    Err(err) => return Some(err.into()),
                },
            }
        }
    }

    fn deliver(&self, message: Message) {
        match self.context.events.upgrade() {
            Some(events) => events.deliver(message),
            None => message.release(&self.context.pool),
        }
    }

    fn reroute(&self, message: Message) {
        match self.context.events.upgrade() {
            Some(events) => events.reroute(message),
            None => message.release(&self.context.pool),
        }
    }

    fn reject(&self, message: Message, rejection: RejectionType, info: String) {
        match self.context.events.upgrade() {
            Some(events) => events.reject(message, rejection, info),
            None => message.release(&self.context.pool),
        }
    }
}

async fn write_frame(
    writer: &mut WriteHalf<BoxGatewayStream>,
    frame: &SegmentList,
) -> io::Result<()> {
    for chunk in frame.chunks() {
        writer.write_all(chunk).await?;
    }
    writer.flush().await
}

impl fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConnection")
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

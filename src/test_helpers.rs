//! In-memory gateways and recording collaborators for tests.

use std::{
    collections::{HashMap, HashSet},
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::{mpsc, Notify},
    time::Instant,
};

use crate::{
    buffer::BufferPool,
    connection::{
        read_preamble, BoxGatewayStream, ConnectionEvents, GatewayConnection, GatewayTransport,
        Preamble,
    },
    error::{BoxError, Result},
    framing::{encode_message, FrameReader, FrameReaderSettings},
    gateway::{GatewayAddress, GatewayDirectory, GatewayListListener},
    message::{BytesBodySerializer, Message, RejectionType},
};

const DUPLEX_CAPACITY: usize = 256 * 1024;

/// `127.0.0.1:(30000 + n)`.
pub fn gateway_addr(n: u16) -> GatewayAddress {
    GatewayAddress::new(SocketAddr::from(([127, 0, 0, 1], 30_000 + n)))
}

#[derive(Debug, Default)]
struct MemoryState {
    listeners: HashMap<GatewayAddress, mpsc::UnboundedSender<DuplexStream>>,
    refused: HashSet<GatewayAddress>,
    attempts: Vec<(GatewayAddress, Instant)>,
}

/// A transport connecting to in-process gateways over duplex pipes.
///
/// Connections to an address nobody [listens](MemoryTransport::listen) on are refused.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    /// Creates a transport with no listeners.
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryTransport::default())
    }

    /// Accepts connections to `address`, replacing any previous listener.
    pub fn listen(&self, address: GatewayAddress) -> MockGatewayListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().listeners.insert(address, tx);
        MockGatewayListener { incoming: rx }
    }

    /// Refuses or allows connections to `address` regardless of listeners.
    pub fn set_refused(&self, address: GatewayAddress, refused: bool) {
        let mut state = self.state.lock();
        if refused {
            state.refused.insert(address);
        } else {
            state.refused.remove(&address);
        }
    }

    /// When each connection attempt to `address` was made.
    pub fn attempts(&self, address: GatewayAddress) -> Vec<Instant> {
        self.state
            .lock()
            .attempts
            .iter()
            .filter(|(attempted, _)| *attempted == address)
            .map(|(_, at)| *at)
            .collect()
    }

    fn open(&self, address: GatewayAddress) -> io::Result<BoxGatewayStream> {
        let mut state = self.state.lock();
        state.attempts.push((address, Instant::now()));
        if state.refused.contains(&address) {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        let listener = state
            .listeners
            .get(&address)
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        listener
            .send(server)
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(Box::new(client))
    }
}

impl GatewayTransport for MemoryTransport {
    fn connect(&self, address: GatewayAddress) -> BoxFuture<'_, io::Result<BoxGatewayStream>> {
        futures::future::ready(self.open(address)).boxed()
    }
}

/// Server side of a [`MemoryTransport`] address.
#[derive(Debug)]
pub struct MockGatewayListener {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MockGatewayListener {
    /// Waits for the next client and reads its preamble.
    pub async fn accept(&mut self) -> Option<MockGateway> {
        loop {
            let mut stream = self.incoming.recv().await?;
            // Clients that vanished before finishing the preamble are skipped.
            if let Ok(preamble) = read_preamble(&mut stream).await {
                return Some(MockGateway::new(stream, preamble));
            }
        }
    }
}

/// One accepted client connection, seen from the gateway.
#[derive(Debug)]
pub struct MockGateway {
    stream: DuplexStream,
    preamble: Preamble,
    pool: Arc<BufferPool>,
    frames: FrameReader,
}

impl MockGateway {
    fn new(stream: DuplexStream, preamble: Preamble) -> Self {
        let pool = Arc::new(BufferPool::new(256, None));
        let frames = FrameReader::new(
            pool.clone(),
            FrameReaderSettings {
                sustained_size: 1024,
                ..FrameReaderSettings::default()
            },
        );
        MockGateway {
            stream,
            preamble,
            pool,
            frames,
        }
    }

    /// The preamble the client sent.
    pub fn preamble(&self) -> &Preamble {
        &self.preamble
    }

    /// Receives the next message. `None` once the client disconnects or sends garbage.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.frames.try_decode_message() {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(_) => return None,
            }
            match self.frames.fill_from(&mut self.stream).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Sends `message` to the client.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let frame = encode_message(message, &self.pool, &BytesBodySerializer)?;
        for chunk in frame.chunks() {
            self.stream.write_all(chunk).await?;
        }
        self.stream.flush().await?;
        frame.release(&self.pool);
        Ok(())
    }

    /// Writes raw bytes to the client.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }
}

/// Everything a [`RecordingEvents`] has seen.
#[derive(Debug, Default)]
pub struct Recorded {
    /// Messages received from gateways.
    pub delivered: Vec<Message>,
    /// Messages handed back for rerouting.
    pub rerouted: Vec<Message>,
    /// Messages rejected, with the rejection.
    pub rejected: Vec<(Message, RejectionType, String)>,
    /// Gateways whose connections died.
    pub dead: Vec<GatewayAddress>,
}

/// Records connection events instead of acting on them.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    recorded: Mutex<Recorded>,
    notify: Notify,
}

impl RecordingEvents {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingEvents::default())
    }

    /// Inspects what was recorded so far.
    pub fn snapshot<R>(&self, inspect: impl FnOnce(&Recorded) -> R) -> R {
        inspect(&self.recorded.lock())
    }

    /// Takes the delivered messages.
    pub fn take_delivered(&self) -> Vec<Message> {
        std::mem::take(&mut self.recorded.lock().delivered)
    }

    /// Waits until `condition` holds.
    pub async fn wait_until(&self, condition: impl Fn(&Recorded) -> bool) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if condition(&self.recorded.lock()) {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, record: impl FnOnce(&mut Recorded)) {
        record(&mut self.recorded.lock());
        self.notify.notify_waiters();
    }
}

impl ConnectionEvents for RecordingEvents {
    fn deliver(&self, message: Message) {
        self.record(|recorded| recorded.delivered.push(message));
    }

    fn reroute(&self, message: Message) {
        self.record(|recorded| recorded.rerouted.push(message));
    }

    fn reject(&self, message: Message, rejection: RejectionType, info: String) {
        self.record(|recorded| recorded.rejected.push((message, rejection, info)));
    }

    fn connection_dead(&self, connection: &GatewayConnection) {
        let address = connection.address();
        self.record(|recorded| recorded.dead.push(address));
    }
}

/// A directory whose contents, latency and failures are controlled by the test.
pub struct TestDirectory {
    gateways: Mutex<Vec<GatewayAddress>>,
    max_staleness: Duration,
    updatable: bool,
    delay: Duration,
    failing: AtomicBool,
    calls: AtomicUsize,
    listeners: Mutex<Vec<Arc<dyn GatewayListListener>>>,
}

impl TestDirectory {
    /// A polled directory listing `gateways`.
    pub fn new(gateways: impl IntoIterator<Item = GatewayAddress>) -> Self {
        TestDirectory {
            gateways: Mutex::new(gateways.into_iter().collect()),
            max_staleness: Duration::from_secs(60),
            updatable: false,
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Accepts push subscriptions.
    pub fn updatable(mut self) -> Self {
        self.updatable = true;
        self
    }

    /// Sets the staleness window.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = max_staleness;
        self
    }

    /// Makes every listing take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Replaces the listed gateways without notifying anyone.
    pub fn set_gateways(&self, gateways: impl IntoIterator<Item = GatewayAddress>) {
        *self.gateways.lock() = gateways.into_iter().collect();
    }

    /// Replaces the listed gateways and pushes them to subscribers.
    pub fn push(&self, gateways: impl IntoIterator<Item = GatewayAddress>) {
        self.set_gateways(gateways);
        let gateways = self.gateways.lock().clone();
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.gateway_list_updated(gateways.clone());
        }
    }

    /// Makes listings fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of listings requested.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TestDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDirectory")
            .field("gateways", &*self.gateways.lock())
            .field("updatable", &self.updatable)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl GatewayDirectory for TestDirectory {
    fn get_gateways(&self) -> BoxFuture<'_, std::result::Result<Vec<GatewayAddress>, BoxError>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.load(Ordering::Relaxed) {
                return Err("directory unavailable".into());
            }
            Ok(self.gateways.lock().clone())
        }
        .boxed()
    }

    fn max_staleness(&self) -> Duration {
        self.max_staleness
    }

    fn is_updatable(&self) -> bool {
        self.updatable
    }

    fn subscribe(&self, listener: Arc<dyn GatewayListListener>) -> bool {
        if !self.updatable {
            return false;
        }
        self.listeners.lock().push(listener);
        true
    }
}

/// A body of `len` bytes, each equal to its index modulo 251.
pub fn patterned_body(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect()
}

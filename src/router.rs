//! The client's message center.
//!
//! [`GatewayMessageCenter`] is the application-facing side of the messaging layer. Outbound messages are routed to a
//! gateway connection by the first rule that applies:
//!
//! 1. A message naming a target silo goes to the connection for that address, created on demand.
//! 2. Messages to system targets, and messages marked unordered, go to the next live gateway in round-robin order.
//! 3. Everything else is hashed by target grain into a fixed bucket table. A bucket keeps its connection for as long
//!    as that connection lives, so ordered messages to one grain always travel over the same socket.
//!
//! Inbound messages are delivered into one queue per [`Category`].
//!
//! When no gateway is live, requests are answered locally with a rejection and everything else is dropped. A message
//! whose connection failed is routed again, up to the configured reroute bound.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock, Weak,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

mod buckets;

use buckets::{BucketSlot, BucketTable};

use crate::{
    buffer::BufferPool,
    config::GatewayClientConfig,
    connection::{
        ConnectionContext, ConnectionEvents, ConnectionSettings, GatewayConnection,
        GatewayTransport, Preamble, TcpTransport,
    },
    error::{GatewayError, Result},
    gateway::{GatewayAddress, GatewayDirectory, GatewayManager},
    message::{BodySerializer, BytesBodySerializer, Category, GrainId, Message, RejectionType},
    stats::{MessagingStats, MessagingStatsSnapshot},
};

/// Per-category inbound queues.
struct InboundQueues {
    senders: Mutex<Option<[flume::Sender<Message>; 3]>>,
    receivers: [flume::Receiver<Message>; 3],
}

impl InboundQueues {
    fn new() -> Self {
        let (ping_tx, ping_rx) = flume::unbounded();
        let (system_tx, system_rx) = flume::unbounded();
        let (app_tx, app_rx) = flume::unbounded();
        InboundQueues {
            senders: Mutex::new(Some([ping_tx, system_tx, app_tx])),
            receivers: [ping_rx, system_rx, app_rx],
        }
    }

    fn sender(&self, category: Category) -> Option<flume::Sender<Message>> {
        self.senders
            .lock()
            .as_ref()
            .map(|senders| senders[category as usize].clone())
    }

    fn receiver(&self, category: Category) -> &flume::Receiver<Message> {
        &self.receivers[category as usize]
    }

    /// Marks every queue complete. Consumers drain what is left, then see the queue closed.
    fn close(&self) {
        self.senders.lock().take();
    }
}

/// Routes outbound messages to gateways and queues inbound messages for the application.
///
/// Built with [`GatewayMessageCenterBuilder`].
pub struct GatewayMessageCenter {
    config: GatewayClientConfig,
    client_id: GrainId,
    pool: Arc<BufferPool>,
    serializer: Arc<dyn BodySerializer>,
    transport: Arc<dyn GatewayTransport>,
    gateways: Arc<GatewayManager>,
    connections: DashMap<GatewayAddress, Arc<GatewayConnection>>,
    buckets: BucketTable,
    inbound: InboundQueues,
    stats: Arc<MessagingStats>,
    context: OnceLock<Arc<ConnectionContext>>,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    weak_self: Weak<GatewayMessageCenter>,
}

impl GatewayMessageCenter {
    /// Loads the gateway list and makes the message center ready to send.
    ///
    /// Connections are opened lazily, on the first message routed to each gateway. Calling `start` again is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(GatewayError::Shutdown);
        }
        if self.context.get().is_some() {
            return Ok(());
        }

        self.gateways.start().await?;

        let events: Weak<dyn ConnectionEvents> = self.weak_self.clone();
        let context = Arc::new(ConnectionContext {
            gateways: self.gateways.clone(),
            transport: self.transport.clone(),
            events,
            pool: self.pool.clone(),
            serializer: self.serializer.clone(),
            preamble: Preamble::Client(self.client_id.clone()),
            settings: ConnectionSettings::from(&self.config),
            stats: self.stats.clone(),
            shutdown: self.shutdown.clone(),
            runtime: Handle::current(),
        });
        let _ = self.context.set(context);
        info!(
            client = %self.client_id,
            gateways = self.gateways.live_count(),
            "gateway message center started"
        );
        Ok(())
    }

    /// Stops every connection and completes the inbound queues.
    ///
    /// Messages still queued on a connection are routed again, which now fails them: requests get a rejection that
    /// is still delivered to the inbound queue before it completes.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(client = %self.client_id, "stopping gateway message center");
        self.shutdown.cancel();
        self.gateways.stop();

        let connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in &connections {
            connection.close();
        }
        join_all(connections.iter().map(|connection| connection.join())).await;
        self.connections.clear();

        self.inbound.close();
        info!(client = %self.client_id, "gateway message center stopped");
    }

    /// Routes `message` to a gateway.
    ///
    /// Never fails to the caller. A message that cannot be sent is answered with a rejection on the inbound queue if
    /// it is a request, and dropped otherwise.
    pub fn send(&self, message: Message) {
        self.route(message);
    }

    /// Receives the next inbound message of `category`.
    ///
    /// A received body is a view into the connection's receive buffers. Hand the message back with
    /// [`Message::release`] on [`buffer_pool`](Self::buffer_pool), or consume its body with
    /// [`Message::body_object`], so those buffers return to the pool. A message that is simply dropped frees its
    /// memory but leaves the pool's outstanding count raised.
    ///
    /// Returns [`GatewayError::Shutdown`] once the message center is stopped and the queue is drained.
    pub async fn receive(&self, category: Category) -> Result<Message> {
        self.inbound
            .receiver(category)
            .recv_async()
            .await
            .map_err(|_| GatewayError::Shutdown)
    }

    /// Blocks the current thread until an inbound message of `category` is available.
    ///
    /// The message should be released the same way as one from [`receive`](Self::receive).
    ///
    /// Must not be called from within an async context.
    pub fn blocking_receive(&self, category: Category) -> Result<Message> {
        self.inbound
            .receiver(category)
            .recv()
            .map_err(|_| GatewayError::Shutdown)
    }

    /// Takes an inbound message of `category` if one is queued.
    pub fn try_receive(&self, category: Category) -> Option<Message> {
        self.inbound.receiver(category).try_recv().ok()
    }

    /// Current counters.
    pub fn stats(&self) -> MessagingStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of gateways currently considered live.
    pub fn live_gateway_count(&self) -> usize {
        self.gateways.live_count()
    }

    /// Subscribes to changes in the number of live gateways.
    pub fn watch_gateway_count(&self) -> watch::Receiver<usize> {
        self.gateways.watch_live_count()
    }

    /// Gateways with a live connection.
    pub fn connected_gateways(&self) -> Vec<GatewayAddress> {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_live())
            .map(|entry| *entry.key())
            .collect()
    }

    /// The identity this client presents to gateways.
    pub fn client_id(&self) -> &GrainId {
        &self.client_id
    }

    /// The pool every frame buffer is drawn from.
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    fn running_context(&self) -> Option<&Arc<ConnectionContext>> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        self.context.get()
    }

    fn route(&self, mut message: Message) {
        loop {
            let Some(context) = self.running_context() else {
                let info = if self.stopped.load(Ordering::Acquire) {
                    "message center is stopped"
                } else {
                    "message center is not started"
                };
                return self.fail(message, RejectionType::Unrecoverable, info);
            };

            let (connection, pinned) = match self.select_connection(&message, context) {
                Ok(selected) => selected,
                Err(err) => {
                    return self.fail(message, RejectionType::Unrecoverable, err.to_string())
                }
            };

            match connection.enqueue(message) {
                Ok(()) => {
                    trace!(gateway = %connection.address(), "routed message");
                    return;
                }
                Err(returned) => {
                    if pinned {
                        let info = GatewayError::GatewayDead(connection.address()).to_string();
                        return self.fail(returned, RejectionType::Unrecoverable, info);
                    }
                    debug!(gateway = %connection.address(), "connection closed while routing, routing again");
                    match self.count_reroute(returned) {
                        Some(again) => message = again,
                        None => return,
                    }
                }
            }
        }
    }

    /// Picks the connection for `message`. The flag is set when the message is pinned to its target silo.
    fn select_connection(
        &self,
        message: &Message,
        context: &Arc<ConnectionContext>,
    ) -> Result<(Arc<GatewayConnection>, bool)> {
        let headers = message.headers();
        if let Some(silo) = headers.target_silo {
            let address = GatewayAddress::from(silo);
            if message.reroute_attempts() > 0 && !self.gateways.is_live(&address) {
                return Err(GatewayError::GatewayDead(address));
            }
            return Ok((self.connection_for(address, context), true));
        }

        let ordered_target = headers
            .target_grain
            .as_ref()
            .filter(|grain| !headers.unordered && !grain.is_system_target());
        let connection = match ordered_target {
            Some(grain) => self.bucket_connection(grain.uniform_hash(), context)?,
            None => {
                let address = self.gateways.next_gateway().ok_or(GatewayError::NoGateways)?;
                self.connection_for(address, context)
            }
        };
        Ok((connection, false))
    }

    fn bucket_connection(
        &self,
        hash: u32,
        context: &Arc<ConnectionContext>,
    ) -> Result<Arc<GatewayConnection>> {
        let index = self.buckets.index(hash);
        let mut current = self.buckets.get(index);
        loop {
            if let Some(connection) = current.and_then(|slot| self.live_connection(slot)) {
                return Ok(connection);
            }

            let address = self.gateways.next_gateway().ok_or(GatewayError::NoGateways)?;
            let connection = self.connection_for(address, context);
            let slot = BucketSlot {
                address,
                generation: connection.generation(),
            };
            match self.buckets.compare_and_set(index, current, slot) {
                Ok(()) => {
                    debug!(bucket = index, gateway = %address, "assigned bucket to gateway");
                    return Ok(connection);
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn live_connection(&self, slot: BucketSlot) -> Option<Arc<GatewayConnection>> {
        self.connections
            .get(&slot.address)
            .filter(|connection| connection.generation() == slot.generation && connection.is_live())
            .map(|connection| connection.value().clone())
    }

    /// The live connection to `address`, replacing a dead one or creating it if needed.
    fn connection_for(
        &self,
        address: GatewayAddress,
        context: &Arc<ConnectionContext>,
    ) -> Arc<GatewayConnection> {
        if let Some(connection) = self.connections.get(&address) {
            if connection.is_live() {
                return connection.value().clone();
            }
        }

        let (connection, created) = match self.connections.entry(address) {
            Entry::Occupied(entry) if entry.get().is_live() => (entry.get().clone(), false),
            Entry::Occupied(mut entry) => {
                let connection = GatewayConnection::new(address, context.clone());
                entry.insert(connection.clone());
                (connection, true)
            }
            Entry::Vacant(entry) => {
                let connection = GatewayConnection::new(address, context.clone());
                entry.insert(connection.clone());
                (connection, true)
            }
        };
        if created {
            debug!(gateway = %address, generation = connection.generation(), "created gateway connection");
            connection.start();
        }
        connection
    }

    /// Counts a reroute of `message`. Fails and consumes it once the bound is exceeded.
    fn count_reroute(&self, mut message: Message) -> Option<Message> {
        let attempts = message.record_reroute();
        if attempts > self.config.max_reroute_attempts {
            let info = format!("message was rerouted {attempts} times");
            self.fail(message, RejectionType::Transient, info);
            return None;
        }
        self.stats.record_rerouted();
        Some(message)
    }

    fn fail(&self, message: Message, rejection: RejectionType, info: impl Into<String>) {
        let info = info.into();
        if message.is_request() {
            warn!(id = ?message.id(), ?rejection, %info, "rejecting request");
            let response = message.create_rejection(rejection, info);
            message.release(&self.pool);
            self.stats.record_rejected();
            self.enqueue_inbound(response);
        } else {
            warn!(id = ?message.id(), direction = ?message.direction(), %info, "dropping message");
            self.stats.record_dropped();
            message.release(&self.pool);
        }
    }

    fn enqueue_inbound(&self, message: Message) {
        let result = match self.inbound.sender(message.category()) {
            Some(sender) => sender.send(message).map_err(|err| err.0),
            None => Err(message),
        };
        if let Err(message) = result {
            debug!(id = ?message.id(), "inbound queue closed, dropping message");
            self.stats.record_dropped();
            message.release(&self.pool);
        }
    }
}

impl ConnectionEvents for GatewayMessageCenter {
    fn deliver(&self, message: Message) {
        self.enqueue_inbound(message);
    }

    fn reroute(&self, message: Message) {
        if let Some(message) = self.count_reroute(message) {
            self.route(message);
        }
    }

    fn reject(&self, message: Message, rejection: RejectionType, info: String) {
        self.fail(message, rejection, info);
    }

    fn connection_dead(&self, connection: &GatewayConnection) {
        let address = connection.address();
        let generation = connection.generation();
        let removed = self
            .connections
            .remove_if(&address, |_, current| current.generation() == generation)
            .is_some();
        let buckets = self.buckets.invalidate(generation);
        info!(gateway = %address, removed, buckets, "dropped dead gateway connection");
    }
}

impl fmt::Debug for GatewayMessageCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayMessageCenter")
            .field("client_id", &self.client_id)
            .field("connections", &self.connections.len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

/// Builder for a [`GatewayMessageCenter`].
pub struct GatewayMessageCenterBuilder {
    directory: Arc<dyn GatewayDirectory>,
    config: GatewayClientConfig,
    transport: Option<Arc<dyn GatewayTransport>>,
    serializer: Option<Arc<dyn BodySerializer>>,
    pool: Option<Arc<BufferPool>>,
    client_id: Option<GrainId>,
}

impl GatewayMessageCenterBuilder {
    /// Creates a builder discovering gateways through `directory`.
    pub fn new(directory: Arc<dyn GatewayDirectory>) -> Self {
        GatewayMessageCenterBuilder {
            directory,
            config: GatewayClientConfig::default(),
            transport: None,
            serializer: None,
            pool: None,
            client_id: None,
        }
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: GatewayClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets how gateways are connected to. Defaults to [`TcpTransport`].
    pub fn with_transport(mut self, transport: Arc<dyn GatewayTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the body serializer. Defaults to [`BytesBodySerializer`].
    pub fn with_serializer(mut self, serializer: Arc<dyn BodySerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Shares an existing buffer pool instead of creating one from the configuration.
    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets the client identity. Defaults to a fresh random client id.
    pub fn with_client_id(mut self, client_id: GrainId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Validates the configuration and builds the message center. Nothing is connected until
    /// [`start`](GatewayMessageCenter::start).
    pub fn build(self) -> Result<Arc<GatewayMessageCenter>> {
        self.config.validate()?;
        let client_id = match self.client_id {
            Some(client_id) if !client_id.is_client() => {
                return Err(GatewayError::InvalidConfig(format!(
                    "client id {client_id} is not a client grain id"
                )))
            }
            Some(client_id) => client_id,
            None => GrainId::new_client(),
        };
        let pool = self.pool.unwrap_or_else(|| {
            Arc::new(BufferPool::new(
                self.config.buffer_size,
                self.config.max_pooled_buffers,
            ))
        });

        let shutdown = CancellationToken::new();
        let gateways = GatewayManager::new(
            self.directory,
            self.config.gateway_list_refresh_period,
            shutdown.child_token(),
        );
        let buckets = BucketTable::new(self.config.bucket_count);

        Ok(Arc::new_cyclic(|weak_self| GatewayMessageCenter {
            client_id,
            pool,
            serializer: self
                .serializer
                .unwrap_or_else(|| Arc::new(BytesBodySerializer)),
            transport: self.transport.unwrap_or_else(|| Arc::new(TcpTransport)),
            gateways,
            connections: DashMap::new(),
            buckets,
            inbound: InboundQueues::new(),
            stats: Arc::new(MessagingStats::default()),
            context: OnceLock::new(),
            stopped: AtomicBool::new(false),
            shutdown,
            weak_self: weak_self.clone(),
            config: self.config,
        }))
    }
}

impl fmt::Debug for GatewayMessageCenterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayMessageCenterBuilder")
            .field("config", &self.config)
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use bytes::Bytes;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    use super::*;
    use crate::{
        message::{Body, ResponseKind, SiloAddress},
        test_helpers::{gateway_addr, MemoryTransport, MockGatewayListener, TestDirectory},
    };

    struct Cluster {
        transport: Arc<MemoryTransport>,
        directory: Arc<TestDirectory>,
        listeners: HashMap<GatewayAddress, MockGatewayListener>,
        center: Arc<GatewayMessageCenter>,
    }

    fn test_config() -> GatewayClientConfig {
        GatewayClientConfig {
            buffer_size: 256,
            receive_buffer_sustained_size: 1024,
            connect_retry_count: 1,
            min_interconnect_delay: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(1),
            bucket_count: 64,
            ..GatewayClientConfig::default()
        }
    }

    async fn cluster(count: u16, refused: &[u16]) -> Cluster {
        cluster_with(test_config(), count, refused).await
    }

    /// Gateways `1..=count` are listed. Those in `refused` reject every connection.
    async fn cluster_with(config: GatewayClientConfig, count: u16, refused: &[u16]) -> Cluster {
        let transport = MemoryTransport::new();
        let addresses: Vec<_> = (1..=count).map(gateway_addr).collect();
        let directory = Arc::new(TestDirectory::new(addresses.iter().copied()));
        let mut listeners = HashMap::new();
        for (n, address) in (1..=count).zip(&addresses) {
            if refused.contains(&n) {
                transport.set_refused(*address, true);
            } else {
                listeners.insert(*address, transport.listen(*address));
            }
        }
        let center = GatewayMessageCenterBuilder::new(directory.clone())
            .with_config(config)
            .with_transport(transport.clone())
            .build()
            .unwrap();
        center.start().await.unwrap();
        Cluster {
            transport,
            directory,
            listeners,
            center,
        }
    }

    fn to_grain(key: u128, body: &'static [u8]) -> Message {
        Message::one_way(GrainId::new(7, key), Body::object(Bytes::from_static(body)))
    }

    fn bucket_of(center: &GatewayMessageCenter, grain: &GrainId) -> Option<BucketSlot> {
        center
            .buckets
            .get(center.buckets.index(grain.uniform_hash()))
    }

    #[tokio::test]
    async fn test_same_grain_stays_on_one_connection() {
        let mut cluster = cluster(3, &[]).await;
        let grain = GrainId::new(7, 42);
        for _ in 0..10 {
            cluster.center.send(to_grain(42, b"ordered"));
        }

        let slot = bucket_of(&cluster.center, &grain).unwrap();
        assert_eq!(cluster.center.connected_gateways(), vec![slot.address]);

        let listener = cluster.listeners.get_mut(&slot.address).unwrap();
        let mut gateway = listener.accept().await.unwrap();
        for _ in 0..10 {
            let received = gateway.recv().await.unwrap();
            assert_eq!(received.headers().target_grain.as_ref(), Some(&grain));
        }
        assert_eq!(bucket_of(&cluster.center, &grain), Some(slot));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_moves_off_dead_connection() {
        let mut cluster = cluster(2, &[1]).await;
        let grain = GrainId::new(7, 1);
        let request = Message::request(grain.clone(), Body::object(Bytes::from_static(b"retry me")));
        let id = request.id();
        cluster.center.send(request);

        // Round-robin starts with gateway 1, which refuses the connection.
        assert_eq!(bucket_of(&cluster.center, &grain).unwrap().address, gateway_addr(1));

        let listener = cluster.listeners.get_mut(&gateway_addr(2)).unwrap();
        let mut gateway = listener.accept().await.unwrap();
        let received = gateway.recv().await.unwrap();
        assert_eq!(received.id(), id);

        assert_eq!(bucket_of(&cluster.center, &grain).unwrap().address, gateway_addr(2));
        assert_eq!(cluster.transport.attempts(gateway_addr(1)).len(), 1);
        let stats = cluster.center.stats();
        assert_eq!(stats.connections_dead, 1);
        assert_eq!(stats.rerouted, 1);
        assert_eq!(stats.rejected, 0);
    }

    #[tokio::test]
    async fn test_system_targets_are_spread_round_robin() {
        let mut cluster = cluster(3, &[]).await;
        for key in 0..6 {
            cluster.center.send(Message::one_way(
                GrainId::system_target(3, key),
                Body::object(Bytes::from_static(b"sys")),
            ));
        }

        for n in 1..=3 {
            let listener = cluster.listeners.get_mut(&gateway_addr(n)).unwrap();
            let mut gateway = listener.accept().await.unwrap();
            assert!(gateway.recv().await.is_some());
            assert!(gateway.recv().await.is_some());
        }
        assert_eq!(cluster.center.stats().sent, 6);
    }

    #[tokio::test]
    async fn test_unordered_messages_skip_buckets() {
        let cluster = cluster(2, &[]).await;
        let mut message = to_grain(5, b"any gateway");
        message.headers_mut().unordered = true;
        cluster.center.send(message);

        assert_eq!(bucket_of(&cluster.center, &GrainId::new(7, 5)), None);
        assert_eq!(cluster.center.connected_gateways(), vec![gateway_addr(1)]);
    }

    #[tokio::test]
    async fn test_no_gateways_rejects_requests_and_drops_others() {
        let directory = Arc::new(TestDirectory::new([]));
        let center = GatewayMessageCenterBuilder::new(directory)
            .with_config(test_config())
            .with_transport(MemoryTransport::new())
            .build()
            .unwrap();
        center.start().await.unwrap();

        let request = Message::request(GrainId::new(1, 1), Body::Empty);
        let id = request.id();
        center.send(request);
        center.send(to_grain(1, b"one way"));

        let rejection = center.receive(Category::Application).await.unwrap();
        assert_eq!(rejection.id(), id);
        assert_eq!(rejection.headers().result, ResponseKind::Rejection);
        assert_eq!(
            rejection.headers().rejection_type,
            Some(RejectionType::Unrecoverable)
        );
        assert!(center.try_receive(Category::Application).is_none());

        let stats = center.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_message_to_dead_gateway_is_rejected() {
        let cluster = cluster(1, &[]).await;
        let pinned = gateway_addr(9);
        cluster.transport.set_refused(pinned, true);

        let mut request = Message::request(GrainId::new(1, 1), Body::Empty);
        request.headers_mut().target_silo = Some(SiloAddress::new(pinned.endpoint(), 1));
        let id = request.id();
        cluster.center.send(request);

        let rejection = cluster.center.receive(Category::Application).await.unwrap();
        assert_eq!(rejection.id(), id);
        assert_eq!(
            rejection.headers().rejection_type,
            Some(RejectionType::Unrecoverable)
        );
        // Only the pinned gateway was tried.
        assert!(cluster.center.connected_gateways().is_empty());
        assert_eq!(cluster.transport.attempts(gateway_addr(1)).len(), 0);
    }

    #[tokio::test]
    async fn test_reroute_bound_rejects_as_transient() {
        let cluster = cluster(1, &[]).await;
        let mut request = Message::request(GrainId::new(1, 1), Body::Empty);
        for _ in 0..test_config().max_reroute_attempts {
            request.record_reroute();
        }
        let id = request.id();
        ConnectionEvents::reroute(&*cluster.center, request);

        let rejection = cluster.center.receive(Category::Application).await.unwrap();
        assert_eq!(rejection.id(), id);
        assert_eq!(
            rejection.headers().rejection_type,
            Some(RejectionType::Transient)
        );
        assert!(cluster.center.connected_gateways().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_messages_are_queued_by_category() {
        let mut cluster = cluster(1, &[]).await;
        cluster.center.send(to_grain(1, b"hello"));
        let listener = cluster.listeners.get_mut(&gateway_addr(1)).unwrap();
        let mut gateway = listener.accept().await.unwrap();
        assert!(gateway.recv().await.is_some());

        let mut ping = task::spawn(cluster.center.receive(Category::Ping));
        assert_pending!(ping.poll());

        let mut system = to_grain(2, b"system");
        system.headers_mut().category = Category::System;
        gateway.send(&system).await.unwrap();
        let mut probe = Message::one_way(GrainId::new(1, 3), Body::Empty);
        probe.headers_mut().category = Category::Ping;
        gateway.send(&probe).await.unwrap();

        let received = cluster.center.receive(Category::System).await.unwrap();
        assert_eq!(received.category(), Category::System);
        while !ping.is_woken() {
            tokio::task::yield_now().await;
        }
        let received = assert_ready_ok!(ping.poll());
        assert_eq!(received.category(), Category::Ping);
        assert!(cluster.center.try_receive(Category::Application).is_none());
    }

    #[tokio::test]
    async fn test_released_inbound_messages_return_their_buffers() {
        let mut cluster = cluster(1, &[]).await;
        cluster.center.send(to_grain(1, b"hello"));
        let listener = cluster.listeners.get_mut(&gateway_addr(1)).unwrap();
        let mut gateway = listener.accept().await.unwrap();
        assert!(gateway.recv().await.is_some());

        gateway.send(&to_grain(2, b"inbound body")).await.unwrap();
        let received = cluster.center.receive(Category::Application).await.unwrap();
        assert!(matches!(received.body(), Body::Raw(_)));
        received.release(cluster.center.buffer_pool());

        cluster.center.stop().await;
        assert_eq!(cluster.center.buffer_pool().stats().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_send_after_stop_rejects_requests() {
        let cluster = cluster(1, &[]).await;
        cluster.center.stop().await;

        cluster
            .center
            .send(Message::request(GrainId::new(1, 1), Body::Empty));
        cluster.center.send(to_grain(1, b"late"));

        let stats = cluster.center.stats();
        assert_eq!(stats.rejected, 1);
        // The rejection itself cannot be queued once the queues are complete.
        assert_eq!(stats.dropped, 2);
        assert!(matches!(
            cluster.center.receive(Category::Application).await,
            Err(GatewayError::Shutdown)
        ));
        assert!(matches!(
            cluster.center.start().await,
            Err(GatewayError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_send_before_start_rejects_requests() {
        let directory = Arc::new(TestDirectory::new([gateway_addr(1)]));
        let center = GatewayMessageCenterBuilder::new(directory)
            .with_transport(MemoryTransport::new())
            .build()
            .unwrap();
        center.send(Message::request(GrainId::new(1, 1), Body::Empty));

        let rejection = center.try_receive(Category::Application).unwrap();
        assert!(rejection.is_rejection());
    }

    #[tokio::test]
    async fn test_stop_rejects_messages_waiting_to_connect() {
        let config = GatewayClientConfig {
            connect_retry_count: 3,
            min_interconnect_delay: Duration::from_secs(30),
            ..test_config()
        };
        let cluster = cluster_with(config, 1, &[1]).await;
        let request = Message::request(GrainId::new(1, 1), Body::Empty);
        let id = request.id();
        cluster.center.send(request);
        while cluster.transport.attempts(gateway_addr(1)).is_empty() {
            tokio::task::yield_now().await;
        }

        // The connection is waiting out the interconnect delay; stopping hands the request back.
        cluster.center.stop().await;

        let rejection = cluster.center.receive(Category::Application).await.unwrap();
        assert_eq!(rejection.id(), id);
        assert!(rejection.is_rejection());
        assert!(matches!(
            cluster.center.receive(Category::Application).await,
            Err(GatewayError::Shutdown)
        ));
        assert!(cluster.center.connected_gateways().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_count_follows_directory() {
        let cluster = cluster(2, &[]).await;
        let mut count = cluster.center.watch_gateway_count();
        assert_eq!(*count.borrow_and_update(), 2);

        cluster
            .directory
            .set_gateways([gateway_addr(1), gateway_addr(2), gateway_addr(3)]);
        cluster.center.gateways.refresh().await.unwrap();

        assert_eq!(cluster.center.live_gateway_count(), 3);
        assert!(count.has_changed().unwrap());
        assert_eq!(*count.borrow(), 3);
    }

    #[test]
    fn test_builder_rejects_non_client_id() {
        let directory = Arc::new(TestDirectory::new([]));
        let result = GatewayMessageCenterBuilder::new(directory)
            .with_client_id(GrainId::new(1, 1))
            .build();
        assert!(matches!(result, Err(GatewayError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_validates_config() {
        let directory = Arc::new(TestDirectory::new([]));
        let result = GatewayMessageCenterBuilder::new(directory)
            .with_config(GatewayClientConfig {
                bucket_count: 0,
                ..GatewayClientConfig::default()
            })
            .build();
        assert!(matches!(result, Err(GatewayError::InvalidConfig(_))));
    }
}

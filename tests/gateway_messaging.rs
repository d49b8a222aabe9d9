//! End-to-end behavior of the message center against in-memory gateways.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use kameo_gateway::{
    connection::Preamble,
    message::{BytesBodySerializer, RejectionType},
    test_helpers::{gateway_addr, patterned_body, MemoryTransport, TestDirectory},
    Body, Category, GatewayClientConfig, GatewayMessageCenter, GatewayMessageCenterBuilder,
    GrainId, Message,
};
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("kameo_gateway=debug")
        .try_init();
}

fn config() -> GatewayClientConfig {
    GatewayClientConfig {
        buffer_size: 1024,
        receive_buffer_sustained_size: 4 * 1024,
        receive_buffer_grow_max: 64 * 1024,
        receive_buffer_grow_block: 64 * 1024,
        min_interconnect_delay: Duration::from_millis(10),
        connect_timeout: Duration::from_secs(1),
        ..GatewayClientConfig::default()
    }
}

fn center(
    directory: Arc<TestDirectory>,
    transport: Arc<MemoryTransport>,
) -> Arc<GatewayMessageCenter> {
    GatewayMessageCenterBuilder::new(directory)
        .with_config(config())
        .with_transport(transport)
        .build()
        .unwrap()
}

fn body_bytes(center: &GatewayMessageCenter, message: &mut Message) -> Bytes {
    let object = message
        .body_object(&BytesBodySerializer, center.buffer_pool())
        .unwrap()
        .expect("message has a body");
    object.downcast_ref::<Bytes>().unwrap().clone()
}

#[tokio::test]
async fn test_request_response_round_trip() {
    init_tracing();
    let transport = MemoryTransport::new();
    let mut listener = transport.listen(gateway_addr(1));
    let directory = Arc::new(TestDirectory::new([gateway_addr(1)]));
    let center = center(directory, transport);
    center.start().await.unwrap();

    let request = Message::request(
        GrainId::new(10, 1),
        Body::object(Bytes::from_static(b"ping")),
    );
    let id = request.id();
    center.send(request);

    let mut gateway = listener.accept().await.unwrap();
    assert_eq!(gateway.preamble(), &Preamble::Client(center.client_id().clone()));
    let mut received = gateway.recv().await.unwrap();
    assert_eq!(received.id(), id);
    assert_eq!(body_bytes(&center, &mut received), Bytes::from_static(b"ping"));

    let mut response = received.create_response();
    response.set_body(Body::object(Bytes::from_static(b"pong")));
    gateway.send(&response).await.unwrap();

    let mut answer = timeout(Duration::from_secs(5), center.receive(Category::Application))
        .await
        .expect("response never arrived")
        .unwrap();
    assert_eq!(answer.id(), id);
    assert!(!answer.is_rejection());
    assert_eq!(body_bytes(&center, &mut answer), Bytes::from_static(b"pong"));

    center.stop().await;
}

#[tokio::test]
async fn test_large_bodies_cross_many_buffers() {
    let transport = MemoryTransport::new();
    let mut listener = transport.listen(gateway_addr(1));
    let directory = Arc::new(TestDirectory::new([gateway_addr(1)]));
    let center = center(directory, transport);
    center.start().await.unwrap();

    let payload = patterned_body(300 * 1024);
    center.send(Message::one_way(
        GrainId::new(10, 2),
        Body::object(payload.clone()),
    ));

    let mut gateway = listener.accept().await.unwrap();
    let received = gateway.recv().await.unwrap();

    // Echo it back so the client's receive buffer has to grow past its sustained size.
    let mut echo = Message::one_way(GrainId::new(10, 3), received.body().clone());
    echo.headers_mut().category = Category::Application;
    gateway.send(&echo).await.unwrap();

    let mut answer = center.receive(Category::Application).await.unwrap();
    assert_eq!(body_bytes(&center, &mut answer), payload);
    assert_eq!(center.stats().received, 1);

    center.stop().await;
}

#[tokio::test]
async fn test_failover_moves_ordered_traffic_to_another_gateway() {
    init_tracing();
    let transport = MemoryTransport::new();
    let mut first = transport.listen(gateway_addr(1));
    let mut second = transport.listen(gateway_addr(2));
    let directory = Arc::new(TestDirectory::new([gateway_addr(1), gateway_addr(2)]));
    let center = center(directory, transport.clone());
    center.start().await.unwrap();
    let mut live = center.watch_gateway_count();

    let grain = GrainId::new(10, 99);
    center.send(Message::one_way(grain.clone(), Body::object(Bytes::from_static(b"one"))));
    let mut gateway = first.accept().await.unwrap();
    assert!(gateway.recv().await.is_some());

    // Gateway 1 goes away for good.
    transport.set_refused(gateway_addr(1), true);
    drop(gateway);
    timeout(Duration::from_secs(5), live.wait_for(|count| *count == 1))
        .await
        .expect("gateway 1 was never marked dead")
        .unwrap();

    center.send(Message::one_way(grain.clone(), Body::object(Bytes::from_static(b"two"))));
    let mut gateway = second.accept().await.unwrap();
    let mut received = gateway.recv().await.unwrap();
    assert_eq!(received.headers().target_grain.as_ref(), Some(&grain));
    assert_eq!(body_bytes(&center, &mut received), Bytes::from_static(b"two"));

    assert_eq!(center.connected_gateways(), vec![gateway_addr(2)]);
    assert_eq!(center.stats().connections_dead, 1);
    center.stop().await;
}

#[tokio::test]
async fn test_unreachable_cluster_degrades_to_rejections() {
    let transport = MemoryTransport::new();
    transport.set_refused(gateway_addr(1), true);
    let directory = Arc::new(TestDirectory::new([gateway_addr(1)]));
    let center = center(directory, transport);
    center.start().await.unwrap();

    for key in 0..3 {
        center.send(Message::request(GrainId::new(10, key), Body::Empty));
    }
    for _ in 0..3 {
        let rejection = timeout(Duration::from_secs(5), center.receive(Category::Application))
            .await
            .expect("request was neither sent nor rejected")
            .unwrap();
        assert!(rejection.is_rejection());
        assert!(matches!(
            rejection.headers().rejection_type,
            Some(RejectionType::Unrecoverable | RejectionType::Transient)
        ));
    }

    assert_eq!(center.stats().rejected, 3);
    center.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_receive_from_a_plain_thread() {
    let transport = MemoryTransport::new();
    let mut listener = transport.listen(gateway_addr(1));
    let directory = Arc::new(TestDirectory::new([gateway_addr(1)]));
    let center = center(directory, transport);
    center.start().await.unwrap();

    let consumer = {
        let center = center.clone();
        std::thread::spawn(move || center.blocking_receive(Category::System))
    };

    center.send(Message::one_way(GrainId::new(10, 1), Body::Empty));
    let mut gateway = listener.accept().await.unwrap();
    assert!(gateway.recv().await.is_some());

    let mut system = Message::one_way(GrainId::new(10, 2), Body::Empty);
    system.headers_mut().category = Category::System;
    gateway.send(&system).await.unwrap();

    let received = tokio::task::spawn_blocking(move || consumer.join().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.category(), Category::System);

    center.stop().await;
}

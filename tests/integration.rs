//! Integration tests for the MQTT client
//!
//! These tests run the real client against a scripted broker: a TCP listener
//! that speaks the wire protocol through the crate's own codec and asserts
//! on exactly the packets a conforming server would see.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use vibemq_client::codec::{Decoder, Encoder};
use vibemq_client::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, SubAck,
    SubscribeReturnCode,
};
use vibemq_client::{
    AsyncClient, BufferOptions, ClientError, ConnectOptions, ConnectionState, ErrorKind,
    EventHandler, MemoryPersistence, Message, QoS, Token,
};

/// One accepted client connection, driven from the broker side
struct BrokerLink {
    stream: TcpStream,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
}

impl BrokerLink {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf).expect("encode");
        self.stream.write_all(&buf).await.expect("broker write");
    }

    async fn recv(&mut self) -> Packet {
        loop {
            if let Some((packet, consumed)) =
                self.decoder.decode(&self.read_buf).expect("broker decode")
            {
                self.read_buf.advance(consumed);
                return packet;
            }
            let n = timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.read_buf))
                .await
                .expect("broker read timed out")
                .expect("broker read");
            assert!(n > 0, "client closed the connection unexpectedly");
        }
    }

    /// Read the CONNECT and answer with an accepting CONNACK
    async fn accept_connect(&mut self, session_present: bool) -> Connect {
        let connect = match self.recv().await {
            Packet::Connect(connect) => *connect,
            other => panic!("expected CONNECT, got {:?}", other),
        };
        self.send(&Packet::ConnAck(ConnAck {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await;
        connect
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }
}

/// Scripted broker listening on an ephemeral localhost port
struct TestBroker {
    listener: TcpListener,
    uri: String,
}

impl TestBroker {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let uri = format!("tcp://127.0.0.1:{}", listener.local_addr().unwrap().port());
        Self { listener, uri }
    }

    async fn accept(&self) -> BrokerLink {
        let (stream, _) = timeout(Duration::from_secs(5), self.listener.accept())
            .await
            .expect("accept timed out")
            .expect("accept");
        BrokerLink::new(stream)
    }
}

async fn client_for(broker: &TestBroker, client_id: &str) -> AsyncClient {
    AsyncClient::new(&broker.uri, client_id, Arc::new(MemoryPersistence::new()))
        .await
        .expect("client")
}

/// Event handler feeding connection-lost and fallthrough messages to a test
struct Recorder {
    lost: mpsc::UnboundedSender<ClientError>,
    arrived: mpsc::UnboundedSender<Message>,
    deliveries: AtomicUsize,
}

impl Recorder {
    fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<ClientError>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (arrived_tx, arrived_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                lost: lost_tx,
                arrived: arrived_tx,
                deliveries: AtomicUsize::new(0),
            }),
            lost_rx,
            arrived_rx,
        )
    }
}

impl EventHandler for Recorder {
    fn connection_lost(&self, error: &ClientError) {
        let _ = self.lost.send(error.clone());
    }

    fn message_arrived(&self, message: &Message) {
        let _ = self.arrived.send(message.clone());
    }

    fn delivery_complete(&self, _token: &Token) {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Connect / handshake
// ============================================================================

#[tokio::test]
async fn test_connect_handshake_fields() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "handshake-test").await;

    let server = tokio::spawn(async move { broker.accept().await.accept_connect(false).await });

    let options = ConnectOptions {
        clean_session: true,
        keep_alive: Duration::from_secs(30),
        username: Some("user".to_string()),
        password: Some("secret".to_string()),
        ..Default::default()
    };
    let token = client.connect(options).await.expect("connect");
    assert!(!token.session_present());
    assert!(client.is_connected());

    let connect = server.await.unwrap();
    assert_eq!(connect.client_id, "handshake-test");
    assert!(connect.clean_session);
    assert_eq!(connect.keep_alive, 30);
    assert_eq!(connect.username.as_deref(), Some("user"));
    assert_eq!(connect.password.as_deref(), Some(b"secret".as_ref()));
}

#[tokio::test]
async fn test_connect_rejection_is_classified() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "rejected").await;

    tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.recv().await;
        link.send(&Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::NotAuthorized,
        }))
        .await;
    });

    let err = client.connect(ConnectOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);
    assert_eq!(err.code(), 5);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_tries_uri_list_in_order() {
    // First URI points at a port nothing listens on, second at the broker
    let dead_uri = "tcp://127.0.0.1:1".to_string();

    let broker = TestBroker::start().await;
    let good_uri = broker.uri.clone();
    let client = client_for(&broker, "fallback").await;

    tokio::spawn(async move {
        broker.accept().await.accept_connect(false).await;
    });

    let options = ConnectOptions {
        server_uris: vec![dead_uri, good_uri.clone()],
        connection_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    client.connect(options).await.expect("connect");
    assert_eq!(client.current_server_uri(), Some(good_uri));
}

// ============================================================================
// Publishing
// ============================================================================

#[tokio::test]
async fn test_publish_qos1_completes_on_puback() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "qos1").await;

    let server = tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.accept_connect(false).await;
        let publish = link.expect_publish().await;
        let id = publish.packet_id.expect("QoS 1 publish carries an id");
        link.send(&Packet::PubAck(PubAck::new(id))).await;
        publish
    });

    client.connect(ConnectOptions::default()).await.unwrap();
    let token = client
        .publish(Message::new("sensors/temp", "21.5", QoS::AtLeastOnce))
        .await
        .unwrap();
    token.wait().await.expect("delivery");

    let publish = server.await.unwrap();
    assert_eq!(publish.topic, "sensors/temp");
    assert_eq!(publish.payload.as_ref(), b"21.5");
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(!publish.dup);
}

#[tokio::test]
async fn test_publish_qos2_full_cycle() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "qos2").await;

    let server = tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.accept_connect(false).await;

        let publish = link.expect_publish().await;
        let id = publish.packet_id.unwrap();
        link.send(&Packet::PubRec(PubRec::new(id))).await;

        match link.recv().await {
            Packet::PubRel(rel) => assert_eq!(rel.packet_id, id),
            other => panic!("expected PUBREL, got {:?}", other),
        }
        link.send(&Packet::PubComp(PubComp::new(id))).await;
    });

    client.connect(ConnectOptions::default()).await.unwrap();
    let token = client
        .publish(Message::new("x", "", QoS::ExactlyOnce))
        .await
        .unwrap();
    token.wait().await.expect("exactly-once delivery");
    server.await.unwrap();
}

#[tokio::test]
async fn test_publish_qos0_completes_on_write() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "qos0").await;

    let server = tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.accept_connect(false).await;
        link.expect_publish().await
    });

    client.connect(ConnectOptions::default()).await.unwrap();
    let token = client
        .publish(Message::new("fire/and/forget", "x", QoS::AtMostOnce))
        .await
        .unwrap();
    token
        .wait_timeout(Duration::from_secs(2))
        .await
        .expect("QoS 0 completes after the write");

    let publish = server.await.unwrap();
    assert_eq!(publish.packet_id, None);
}

#[tokio::test]
async fn test_payload_bytes_roundtrip_through_echo() {
    use rand::RngCore;

    let broker = TestBroker::start().await;
    let client = client_for(&broker, "echo").await;

    let mut payload = vec![0u8; 512];
    rand::thread_rng().fill_bytes(&mut payload);
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.accept_connect(false).await;

        let subscribe = match link.recv().await {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        link.send(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes: vec![SubscribeReturnCode::GrantedQoS1],
        }))
        .await;

        // Echo the publish straight back at QoS 0
        let publish = link.expect_publish().await;
        let id = publish.packet_id.unwrap();
        link.send(&Packet::Publish(Publish {
            qos: QoS::AtMostOnce,
            packet_id: None,
            dup: false,
            ..publish
        }))
        .await;
        link.send(&Packet::PubAck(PubAck::new(id))).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    client.connect(ConnectOptions::default()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    client
        .subscribe_with(
            "echo/topic",
            QoS::AtLeastOnce,
            Arc::new(move |message| {
                let _ = tx.send(message);
            }),
        )
        .await
        .unwrap();

    client
        .publish(Message::new("echo/topic", payload, QoS::AtLeastOnce))
        .await
        .unwrap();

    let echoed = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed.payload(), &expected[..]);
    drop(server);
}

// ============================================================================
// Subscribing and dispatch
// ============================================================================

#[tokio::test]
async fn test_subscribe_grant_and_wildcard_dispatch() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "subs").await;

    let server = tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.accept_connect(false).await;

        let subscribe = match link.recv().await {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        };
        assert_eq!(subscribe.subscriptions.len(), 2);
        assert_eq!(subscribe.subscriptions[0].filter, "a/+");
        assert_eq!(subscribe.subscriptions[1].filter, "a/#");
        link.send(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes: vec![
                SubscribeReturnCode::GrantedQoS1,
                SubscribeReturnCode::GrantedQoS2,
            ],
        }))
        .await;

        // One message matching both filters, one matching only a/#
        link.send(&Packet::Publish(Publish {
            topic: "a/b".to_string(),
            payload: "both".into(),
            ..Default::default()
        }))
        .await;
        link.send(&Packet::Publish(Publish {
            topic: "a/b/c".to_string(),
            payload: "deep".into(),
            ..Default::default()
        }))
        .await;
        link
    });

    client.connect(ConnectOptions::default()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, Message)>();
    let tx_plus = tx.clone();
    let tx_hash = tx;
    let token = client
        .subscribe_many_with(
            &[("a/+", QoS::AtLeastOnce), ("a/#", QoS::ExactlyOnce)],
            vec![
                Some(Arc::new(move |m: Message| {
                    let _ = tx_plus.send(("a/+", m));
                })),
                Some(Arc::new(move |m: Message| {
                    let _ = tx_hash.send(("a/#", m));
                })),
            ],
        )
        .await
        .unwrap();
    token.wait().await.unwrap();
    assert_eq!(
        token.granted_qos(),
        vec![
            SubscribeReturnCode::GrantedQoS1,
            SubscribeReturnCode::GrantedQoS2
        ]
    );

    let mut received = Vec::new();
    for _ in 0..3 {
        let (who, message) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("dispatch timed out")
            .unwrap();
        received.push((who, message.topic().to_string()));
    }
    // a/b matched both filters once each; a/b/c matched only a/#
    assert_eq!(
        received.iter().filter(|(_, t)| t == "a/b").count(),
        2,
        "a/b arrives once per matching filter"
    );
    assert_eq!(received.iter().filter(|(_, t)| t == "a/b/c").count(), 1);
    assert!(received
        .iter()
        .all(|(who, t)| t != "a/b/c" || *who == "a/#"));

    drop(server);
}

#[tokio::test]
async fn test_unmatched_message_goes_to_global_handler() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "global").await;
    let (recorder, _lost_rx, mut arrived_rx) = Recorder::new();
    client.set_event_handler(recorder);

    tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.accept_connect(false).await;
        link.send(&Packet::Publish(Publish {
            topic: "unclaimed/topic".to_string(),
            payload: "hello".into(),
            ..Default::default()
        }))
        .await;
        // Keep the link alive until the test finishes
        tokio::time::sleep(Duration::from_secs(3)).await;
    });

    client.connect(ConnectOptions::default()).await.unwrap();

    let message = timeout(Duration::from_secs(2), arrived_rx.recv())
        .await
        .expect("fallthrough dispatch timed out")
        .unwrap();
    assert_eq!(message.topic(), "unclaimed/topic");
}

// ============================================================================
// Inbound QoS 2
// ============================================================================

#[tokio::test]
async fn test_inbound_qos2_dispatched_exactly_once() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "inbound-qos2").await;
    let (recorder, _lost_rx, mut arrived_rx) = Recorder::new();
    client.set_event_handler(recorder);

    let server = tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.accept_connect(false).await;

        let publish = Publish {
            qos: QoS::ExactlyOnce,
            topic: "once".to_string(),
            packet_id: Some(5),
            payload: "exactly".into(),
            ..Default::default()
        };
        link.send(&Packet::Publish(publish.clone())).await;
        match link.recv().await {
            Packet::PubRec(rec) => assert_eq!(rec.packet_id, 5),
            other => panic!("expected PUBREC, got {:?}", other),
        }

        // Retransmit before releasing; the client must re-answer PUBREC
        // without a second dispatch
        link.send(&Packet::Publish(Publish {
            dup: true,
            ..publish
        }))
        .await;
        match link.recv().await {
            Packet::PubRec(rec) => assert_eq!(rec.packet_id, 5),
            other => panic!("expected second PUBREC, got {:?}", other),
        }

        link.send(&Packet::PubRel(PubRel::new(5))).await;
        match link.recv().await {
            Packet::PubComp(comp) => assert_eq!(comp.packet_id, 5),
            other => panic!("expected PUBCOMP, got {:?}", other),
        }
    });

    client.connect(ConnectOptions::default()).await.unwrap();
    server.await.unwrap();

    let first = timeout(Duration::from_secs(2), arrived_rx.recv())
        .await
        .expect("dispatch timed out")
        .unwrap();
    assert_eq!(first.topic(), "once");
    // No second dispatch for the duplicate
    assert!(
        timeout(Duration::from_millis(200), arrived_rx.recv())
            .await
            .is_err(),
        "duplicate QoS 2 publish must not dispatch again"
    );
}

#[tokio::test]
async fn test_manual_acks_defer_puback() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "manual").await;
    let (recorder, _lost_rx, mut arrived_rx) = Recorder::new();
    client.set_event_handler(recorder);
    client.set_manual_acks(true);

    let server = tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.accept_connect(false).await;
        link.send(&Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            topic: "manual/topic".to_string(),
            packet_id: Some(3),
            payload: "x".into(),
            ..Default::default()
        }))
        .await;

        // Nothing must arrive until the application completes the delivery
        let mut buf = [0u8; 64];
        let silent =
            timeout(Duration::from_millis(300), link.stream.read(&mut buf)).await;
        assert!(silent.is_err(), "PUBACK must wait for manual completion");

        match link.recv().await {
            Packet::PubAck(ack) => assert_eq!(ack.packet_id, 3),
            other => panic!("expected PUBACK, got {:?}", other),
        }
    });

    client.connect(ConnectOptions::default()).await.unwrap();

    let message = timeout(Duration::from_secs(2), arrived_rx.recv())
        .await
        .expect("dispatch timed out")
        .unwrap();
    assert_eq!(message.topic(), "manual/topic");

    // Give the broker a moment to observe the silence, then complete
    tokio::time::sleep(Duration::from_millis(400)).await;
    client
        .message_arrived_complete(3, QoS::AtLeastOnce)
        .await
        .unwrap();

    server.await.unwrap();
}

// ============================================================================
// Disconnect
// ============================================================================

#[tokio::test]
async fn test_disconnect_sends_packet_and_settles_state() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "bye").await;

    let server = tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.accept_connect(false).await;
        match link.recv().await {
            Packet::Disconnect => {}
            other => panic!("expected DISCONNECT, got {:?}", other),
        }
    });

    client.connect(ConnectOptions::default()).await.unwrap();
    client.disconnect(Duration::from_millis(100)).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    server.await.unwrap();

    // A second disconnect is rejected
    assert_eq!(
        client
            .disconnect(Duration::ZERO)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::ClientNotConnected
    );
}

// ============================================================================
// Keepalive
// ============================================================================

#[tokio::test]
async fn test_keepalive_pingreq_and_timeout() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "ping").await;
    let (recorder, mut lost_rx, _arrived_rx) = Recorder::new();
    client.set_event_handler(recorder);

    let server = tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.accept_connect(false).await;

        // First idle interval elapses; answer the ping
        match link.recv().await {
            Packet::PingReq => {}
            other => panic!("expected PINGREQ, got {:?}", other),
        }
        link.send(&Packet::PingResp).await;

        // Ignore the next ping; the client must give up on us
        match link.recv().await {
            Packet::PingReq => {}
            other => panic!("expected second PINGREQ, got {:?}", other),
        }
        // Hold the socket open without answering
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let options = ConnectOptions {
        keep_alive: Duration::from_secs(1),
        ..Default::default()
    };
    client.connect(options).await.unwrap();

    let error = timeout(Duration::from_secs(6), lost_rx.recv())
        .await
        .expect("connection-lost callback timed out")
        .unwrap();
    assert_eq!(error.kind(), ErrorKind::ClientTimeout);
    assert_eq!(error.code(), 32000);
    assert!(!client.is_connected());
    drop(server);
}

// ============================================================================
// Reconnect and replay
// ============================================================================

#[tokio::test]
async fn test_automatic_reconnect_replays_unacked_publish() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "replay").await;
    let (recorder, mut lost_rx, _arrived_rx) = Recorder::new();
    client.set_event_handler(recorder);

    let server = tokio::spawn(async move {
        // First session: swallow the publish, then drop the connection
        let mut link = broker.accept().await;
        let connect = link.accept_connect(false).await;
        assert!(!connect.clean_session);
        let first = link.expect_publish().await;
        let first_id = first.packet_id.unwrap();
        assert!(!first.dup);
        drop(link);

        // Second session: the unacked publish must be retransmitted as a
        // duplicate with the same identifier, before anything else
        let mut link = broker.accept().await;
        link.accept_connect(true).await;
        let replayed = link.expect_publish().await;
        assert_eq!(replayed.packet_id, Some(first_id));
        assert!(replayed.dup, "replayed publish must carry DUP");
        assert_eq!(replayed.payload.as_ref(), b"21.5");
        link.send(&Packet::PubAck(PubAck::new(first_id))).await;
        // Keep the session up while the token settles
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let options = ConnectOptions {
        clean_session: false,
        automatic_reconnect: true,
        ..Default::default()
    };
    client.connect(options).await.unwrap();

    let token = client
        .publish(Message::new("sensors/temp", "21.5", QoS::AtLeastOnce))
        .await
        .unwrap();

    // The connection drops, the callback fires once, and after the 1 s
    // backoff the delivery still completes
    timeout(Duration::from_secs(5), lost_rx.recv())
        .await
        .expect("connection-lost timed out")
        .unwrap();
    timeout(Duration::from_secs(10), token.wait())
        .await
        .expect("delivery after reconnect timed out")
        .expect("delivery");

    server.await.unwrap();
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_offline_buffer_drains_in_order_on_connect() {
    let broker = TestBroker::start().await;
    let client = client_for(&broker, "buffered").await;
    client.set_buffer_options(BufferOptions {
        enabled: true,
        size: 10,
        persist: false,
        delete_oldest: false,
    });

    // Publish while disconnected
    let first = client
        .publish(Message::new("q/1", "one", QoS::AtLeastOnce))
        .await
        .unwrap();
    let second = client
        .publish(Message::new("q/2", "two", QoS::AtLeastOnce))
        .await
        .unwrap();
    assert_eq!(client.buffered_message_count(), 2);

    let server = tokio::spawn(async move {
        let mut link = broker.accept().await;
        link.accept_connect(false).await;
        let a = link.expect_publish().await;
        assert_eq!(a.topic, "q/1");
        link.send(&Packet::PubAck(PubAck::new(a.packet_id.unwrap())))
            .await;
        let b = link.expect_publish().await;
        assert_eq!(b.topic, "q/2");
        link.send(&Packet::PubAck(PubAck::new(b.packet_id.unwrap())))
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    client.connect(ConnectOptions::default()).await.unwrap();
    timeout(Duration::from_secs(2), first.wait())
        .await
        .expect("first buffered delivery timed out")
        .unwrap();
    timeout(Duration::from_secs(2), second.wait())
        .await
        .expect("second buffered delivery timed out")
        .unwrap();
    assert_eq!(client.buffered_message_count(), 0);
    server.await.unwrap();
}

#[tokio::test]
async fn test_restart_with_same_persistence_replays_once() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(TestBroker::start().await);
    let options = ConnectOptions {
        clean_session: false,
        ..Default::default()
    };

    // First process: publish QoS 1, broker never acks, process "crashes"
    {
        let persistence = Arc::new(vibemq_client::FjallPersistence::new(dir.path()));
        let client = AsyncClient::new(&broker.uri, "phoenix", persistence)
            .await
            .unwrap();

        let server = tokio::spawn({
            let broker = broker.clone();
            async move {
                let mut link = broker.accept().await;
                link.accept_connect(false).await;
                let publish = link.expect_publish().await;
                assert_eq!(publish.topic, "durable");
                // No PUBACK; hold the link until the client is torn down
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        });

        client.connect(options.clone()).await.unwrap();
        client
            .publish(Message::new("durable", "payload", QoS::AtLeastOnce))
            .await
            .unwrap();

        // Give the publish time to hit the wire, then crash
        tokio::time::sleep(Duration::from_millis(300)).await;
        client.close(true).await.unwrap();
        server.abort();
    }

    // Second process with the same (client id, server URI, persistence)
    let persistence = Arc::new(vibemq_client::FjallPersistence::new(dir.path()));
    let client = AsyncClient::new(&broker.uri, "phoenix", persistence)
        .await
        .unwrap();

    let server = tokio::spawn({
        let broker = broker.clone();
        async move {
            let mut link = broker.accept().await;
            link.accept_connect(true).await;
            let replayed = link.expect_publish().await;
            assert!(replayed.dup, "restart replay must carry DUP");
            assert_eq!(replayed.topic, "durable");
            assert_eq!(replayed.payload.as_ref(), b"payload");
            link.send(&Packet::PubAck(PubAck::new(replayed.packet_id.unwrap())))
                .await;
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
    });

    client.connect(options).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_clean_session_discards_persisted_state() {
    let broker = Arc::new(TestBroker::start().await);
    let persistence = Arc::new(MemoryPersistence::new());
    let client = AsyncClient::new(&broker.uri, "cleanser", persistence.clone())
        .await
        .unwrap();

    // First session, clean_session=false, publish never acked, link dropped
    let server = tokio::spawn({
        let broker = broker.clone();
        async move {
            let mut link = broker.accept().await;
            link.accept_connect(false).await;
            link.expect_publish().await;
        }
    });
    let options = ConnectOptions {
        clean_session: false,
        ..Default::default()
    };
    client.connect(options).await.unwrap();
    client
        .publish(Message::new("t", "x", QoS::AtLeastOnce))
        .await
        .unwrap();
    server.await.unwrap();

    // Wait for the dropped link to register
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!client.is_connected());

    // Reconnect with clean_session=true: no replay may happen
    let server = tokio::spawn({
        let broker = broker.clone();
        async move {
            let mut link = broker.accept().await;
            let connect = link.accept_connect(false).await;
            assert!(connect.clean_session);

            let mut buf = [0u8; 64];
            let silent =
                timeout(Duration::from_millis(400), link.stream.read(&mut buf)).await;
            assert!(silent.is_err(), "clean session must not replay");
        }
    });
    let options = ConnectOptions {
        clean_session: true,
        ..Default::default()
    };
    client.connect(options).await.unwrap();
    server.await.unwrap();

    use vibemq_client::ClientPersistence;
    assert!(persistence.keys().await.unwrap().is_empty());
}

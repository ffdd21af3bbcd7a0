use std::num::{NonZeroU16, NonZeroU32};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc::UnboundedReceiver;
use futures::{SinkExt, StreamExt};
use rmqtt_codec::types::{Publish, QoS};
use rmqtt_codec::v3::Codec as CodecV3;
use rmqtt_codec::v5::Codec as CodecV5;
use rmqtt_codec::{v3, v5, MqttCodec, MqttPacket};
use tokio::io::DuplexStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use rmqtt_client::store::{MemoryStore, Store, StoredMessage};
use rmqtt_client::transport::DuplexTransport;
use rmqtt_client::{
    Client, ClientError, ConnectOptions, Event, PublishOptions, SubscribeOptions, Subscription,
};

const WAIT: Duration = Duration::from_secs(5);

struct Broker {
    io: Framed<DuplexStream, MqttCodec>,
}

impl Broker {
    fn v3(io: DuplexStream) -> Self {
        Self { io: Framed::new(io, MqttCodec::V3(CodecV3::new(0))) }
    }

    fn v5(io: DuplexStream) -> Self {
        Self { io: Framed::new(io, MqttCodec::V5(CodecV5::new(0, 0))) }
    }

    async fn recv(&mut self) -> MqttPacket {
        timeout(WAIT, self.io.next())
            .await
            .expect("timed out waiting for a packet")
            .expect("connection closed")
            .expect("decode failed")
            .0
    }

    async fn send(&mut self, packet: MqttPacket) {
        self.io.send(packet).await.expect("broker send failed");
    }

    /// CONNECT in, accepting CONNACK out.
    async fn handshake_v3(&mut self) {
        match self.recv().await {
            MqttPacket::V3(v3::Packet::Connect(_)) => {}
            p => panic!("expected CONNECT, got {:?}", p),
        }
        self.send(MqttPacket::V3(v3::Packet::ConnectAck(v3::ConnectAck {
            session_present: false,
            return_code: v3::ConnectAckReason::ConnectionAccepted,
        })))
        .await;
    }

    async fn handshake_v5(&mut self, topic_alias_max: u16) {
        match self.recv().await {
            MqttPacket::V5(v5::Packet::Connect(_)) => {}
            p => panic!("expected CONNECT, got {:?}", p),
        }
        self.send(MqttPacket::V5(v5::Packet::ConnectAck(Box::new(v5::ConnectAck {
            topic_alias_max,
            ..Default::default()
        }))))
        .await;
    }

    async fn recv_publish_v3(&mut self) -> Publish {
        match self.recv().await {
            MqttPacket::V3(v3::Packet::Publish(p)) => *p,
            p => panic!("expected PUBLISH, got {:?}", p),
        }
    }

    async fn recv_publish_v5(&mut self) -> Publish {
        match self.recv().await {
            MqttPacket::V5(v5::Packet::Publish(p)) => *p,
            p => panic!("expected PUBLISH, got {:?}", p),
        }
    }
}

async fn next_event(events: &mut UnboundedReceiver<Event>) -> Event {
    timeout(WAIT, events.next()).await.expect("timed out waiting for an event").expect("event channel closed")
}

/// Waits for the `connect` notification, discarding packet traces on the way.
async fn wait_connected(events: &mut UnboundedReceiver<Event>) {
    loop {
        if let Event::Connect(_) = next_event(events).await {
            return;
        }
    }
}

fn id(v: u16) -> NonZeroU16 {
    NonZeroU16::new(v).unwrap()
}

fn stored_publish(packet_id: u16, qos: QoS, topic: &str, payload: &'static [u8]) -> StoredMessage {
    StoredMessage::Publish(Publish {
        dup: false,
        retain: false,
        qos,
        topic: topic.to_owned().into(),
        packet_id: NonZeroU16::new(packet_id),
        payload: Bytes::from_static(payload),
        properties: None,
        delay_interval: None,
        create_time: None,
    })
}

#[tokio::test]
async fn qos1_happy_path() {
    let (transport, acceptor) = DuplexTransport::pair();
    let outgoing = Arc::new(MemoryStore::new());
    let opts = ConnectOptions::new()
        .keepalive(60)
        .outgoing_store(Box::new(outgoing.clone()));
    let (client, mut events) = Client::connect(transport, opts).unwrap();

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;
    wait_connected(&mut events).await;

    let completion = client
        .publish("t", "hello", PublishOptions::qos(QoS::AtLeastOnce))
        .unwrap();

    let publish = broker.recv_publish_v3().await;
    assert_eq!(publish.topic, "t");
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert_eq!(publish.payload.as_ref(), b"hello");
    let packet_id = publish.packet_id.expect("QoS 1 publish carries an id");

    // persisted while unacknowledged
    assert!(outgoing.get(packet_id).await.unwrap().is_some());

    broker.send(MqttPacket::V3(v3::Packet::PublishAck { packet_id })).await;
    assert!(completion.await.is_ok());

    assert_eq!(client.last_packet_id().await, Some(packet_id));
    // the ack released the stored copy
    for _ in 0..50 {
        if outgoing.get(packet_id).await.unwrap().is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(outgoing.get(packet_id).await.unwrap().is_none());

    // and the session keeps going with fresh ids
    let completion = client.publish("t", "x", PublishOptions::qos(QoS::AtLeastOnce)).unwrap();
    let publish = broker.recv_publish_v3().await;
    let next_id = publish.packet_id.unwrap();
    broker.send(MqttPacket::V3(v3::Packet::PublishAck { packet_id: next_id })).await;
    assert!(completion.await.is_ok());
}

#[tokio::test]
async fn qos2_survives_reconnect() {
    let (transport, acceptor) = DuplexTransport::pair();
    let outgoing = Arc::new(MemoryStore::new());
    let opts = ConnectOptions::new()
        .reconnect_period(Duration::from_millis(50))
        .outgoing_store(Box::new(outgoing.clone()));
    let (client, mut events) = Client::connect(transport, opts).unwrap();

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;
    wait_connected(&mut events).await;

    let completion = client.publish("t", "m", PublishOptions::qos(QoS::ExactlyOnce)).unwrap();
    let publish = broker.recv_publish_v3().await;
    let packet_id = publish.packet_id.unwrap();
    assert_eq!(publish.qos, QoS::ExactlyOnce);
    assert!(!publish.dup);

    // connection dies before PUBREC
    drop(broker);

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;

    // the stored publish is replayed on the new connection
    let replayed = broker.recv_publish_v3().await;
    assert_eq!(replayed.packet_id, Some(packet_id));
    assert_eq!(replayed.payload.as_ref(), b"m");
    assert!(replayed.dup);

    broker.send(MqttPacket::V3(v3::Packet::PublishReceived { packet_id })).await;
    match broker.recv().await {
        MqttPacket::V3(v3::Packet::PublishRelease { packet_id: rel }) => {
            assert_eq!(rel, packet_id)
        }
        p => panic!("expected PUBREL, got {:?}", p),
    }

    // the stored PUBLISH was replaced by a stored PUBREL
    for _ in 0..50 {
        if matches!(outgoing.get(packet_id).await.unwrap(), Some(StoredMessage::Release { .. })) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(
        outgoing.get(packet_id).await.unwrap(),
        Some(StoredMessage::Release { .. })
    ));

    broker.send(MqttPacket::V3(v3::Packet::PublishComplete { packet_id })).await;
    assert!(completion.await.is_ok());
    assert!(outgoing.get(packet_id).await.unwrap().is_none() || {
        tokio::time::sleep(Duration::from_millis(50)).await;
        outgoing.get(packet_id).await.unwrap().is_none()
    });
}

#[tokio::test]
async fn subscribe_with_failed_grant() {
    let (transport, acceptor) = DuplexTransport::pair();
    let opts = ConnectOptions::new().protocol_version(5);
    let (client, mut events) = Client::connect(transport, opts).unwrap();

    let mut broker = Broker::v5(acceptor.accept());
    broker.handshake_v5(0).await;
    wait_connected(&mut events).await;

    let completion = client
        .subscribe(
            vec![
                Subscription::new("a", QoS::AtLeastOnce),
                Subscription::new("b", QoS::ExactlyOnce),
            ],
            SubscribeOptions::default(),
        )
        .unwrap();

    let packet_id = match broker.recv().await {
        MqttPacket::V5(v5::Packet::Subscribe(sub)) => {
            assert_eq!(sub.topic_filters.len(), 2);
            assert_eq!(sub.topic_filters[0].0, "a");
            assert_eq!(sub.topic_filters[1].0, "b");
            sub.packet_id
        }
        p => panic!("expected SUBSCRIBE, got {:?}", p),
    };

    broker
        .send(MqttPacket::V5(v5::Packet::SubscribeAck(v5::SubscribeAck {
            packet_id,
            properties: Vec::new(),
            reason_string: None,
            status: vec![
                v5::SubscribeAckReason::GrantedQos1,
                v5::SubscribeAckReason::UnspecifiedError,
            ],
        })))
        .await;

    let granted = completion.await.unwrap();
    assert_eq!(granted.len(), 2);
    assert_eq!(granted[0].topic_filter, "a");
    assert!(!granted[0].is_failure());
    assert_eq!(granted[1].topic_filter, "b");
    assert!(granted[1].is_failure());
}

#[tokio::test]
async fn topic_alias_round_trip() {
    let (transport, acceptor) = DuplexTransport::pair();
    let opts = ConnectOptions::new()
        .protocol_version(5)
        .topic_alias_maximum(5)
        .auto_assign_topic_alias(true);
    let (client, mut events) = Client::connect(transport, opts).unwrap();

    let mut broker = Broker::v5(acceptor.accept());
    broker.handshake_v5(10).await;
    wait_connected(&mut events).await;

    for _ in 0..3 {
        client.publish("t/1", "x", PublishOptions::default()).unwrap();
    }

    let first = broker.recv_publish_v5().await;
    assert_eq!(first.topic, "t/1");
    let alias = first.properties.as_ref().and_then(|p| p.topic_alias);
    assert!(alias.is_some());

    for _ in 0..2 {
        let next = broker.recv_publish_v5().await;
        assert_eq!(next.topic, "");
        assert_eq!(next.properties.as_ref().and_then(|p| p.topic_alias), alias);
    }
}

#[tokio::test]
async fn keepalive_failure_forces_reconnect() {
    let (transport, acceptor) = DuplexTransport::pair();
    let opts = ConnectOptions::new()
        .keepalive(1)
        .reschedule_pings(false)
        .reconnect_period(Duration::from_millis(100));
    let (_client, mut events) = Client::connect(transport, opts).unwrap();

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;
    wait_connected(&mut events).await;

    // a PINGREQ arrives and goes unanswered
    match broker.recv().await {
        MqttPacket::V3(v3::Packet::PingRequest) => {}
        p => panic!("expected PINGREQ, got {:?}", p),
    }

    let mut saw_keepalive_error = false;
    let mut saw_close = false;
    let mut saw_offline = false;
    loop {
        match next_event(&mut events).await {
            Event::Error(ClientError::KeepAliveTimeout) => saw_keepalive_error = true,
            Event::Closed => saw_close = true,
            Event::Offline => saw_offline = true,
            Event::Reconnect => break,
            _ => {}
        }
    }
    assert!(saw_keepalive_error && saw_close && saw_offline);

    // the reconnect timer produced a fresh connection attempt
    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;
    wait_connected(&mut events).await;
}

#[tokio::test]
async fn oversized_inbound_ends_session() {
    let (transport, acceptor) = DuplexTransport::pair();
    let opts = ConnectOptions::new()
        .protocol_version(5)
        .properties(rmqtt_client::ConnectProperties {
            maximum_packet_size: NonZeroU32::new(100),
            ..Default::default()
        });
    let (_client, mut events) = Client::connect(transport, opts).unwrap();

    let mut broker = Broker::v5(acceptor.accept());
    broker.handshake_v5(0).await;
    wait_connected(&mut events).await;

    broker
        .send(MqttPacket::V5(v5::Packet::Publish(Box::new(Publish {
            dup: false,
            retain: false,
            qos: QoS::AtMostOnce,
            topic: "big".to_owned().into(),
            packet_id: None,
            payload: Bytes::from(vec![0u8; 200]),
            properties: Some(Default::default()),
            delay_interval: None,
            create_time: None,
        }))))
        .await;

    match broker.recv().await {
        MqttPacket::V5(v5::Packet::Disconnect(d)) => {
            assert_eq!(d.reason_code, v5::DisconnectReasonCode::PacketTooLarge);
        }
        p => panic!("expected DISCONNECT, got {:?}", p),
    }

    let mut saw_error = false;
    let mut saw_end = false;
    loop {
        match next_event(&mut events).await {
            Event::Error(ClientError::PacketTooLarge) => saw_error = true,
            Event::End => {
                saw_end = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_error && saw_end);
}

#[tokio::test]
async fn replay_blocks_new_publishes_until_drained() {
    let outgoing = Arc::new(MemoryStore::new());
    outgoing.put(stored_publish(1, QoS::AtLeastOnce, "t/a", b"one")).await.unwrap();
    outgoing.put(stored_publish(2, QoS::AtLeastOnce, "t/b", b"two")).await.unwrap();

    let (transport, acceptor) = DuplexTransport::pair();
    let opts = ConnectOptions::new().outgoing_store(Box::new(outgoing.clone()));
    let (client, mut events) = Client::connect(transport, opts).unwrap();

    // issued before CONNACK: must not overtake the replay
    let completion = client.publish("t/new", "three", PublishOptions::qos(QoS::AtLeastOnce)).unwrap();

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;

    let first = broker.recv_publish_v3().await;
    assert_eq!(first.topic, "t/a");
    assert_eq!(first.packet_id, Some(id(1)));
    broker.send(MqttPacket::V3(v3::Packet::PublishAck { packet_id: id(1) })).await;

    let second = broker.recv_publish_v3().await;
    assert_eq!(second.topic, "t/b");
    assert_eq!(second.packet_id, Some(id(2)));
    broker.send(MqttPacket::V3(v3::Packet::PublishAck { packet_id: id(2) })).await;

    // only after the store drained does the deferred publish go out
    let third = broker.recv_publish_v3().await;
    assert_eq!(third.topic, "t/new");
    let new_id = third.packet_id.unwrap();
    assert!(new_id != id(1) && new_id != id(2));
    broker.send(MqttPacket::V3(v3::Packet::PublishAck { packet_id: new_id })).await;
    assert!(completion.await.is_ok());

    wait_connected(&mut events).await;
}

#[tokio::test]
async fn stored_release_is_replayed() {
    let outgoing = Arc::new(MemoryStore::new());
    outgoing.put(StoredMessage::Release { packet_id: id(7) }).await.unwrap();

    let (transport, acceptor) = DuplexTransport::pair();
    let opts = ConnectOptions::new().outgoing_store(Box::new(outgoing.clone()));
    let (_client, mut events) = Client::connect(transport, opts).unwrap();

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;

    match broker.recv().await {
        MqttPacket::V3(v3::Packet::PublishRelease { packet_id }) => assert_eq!(packet_id, id(7)),
        p => panic!("expected PUBREL, got {:?}", p),
    }
    broker.send(MqttPacket::V3(v3::Packet::PublishComplete { packet_id: id(7) })).await;
    wait_connected(&mut events).await;
}

#[tokio::test]
async fn offline_publishes_queue_and_flush_on_connect() {
    let (transport, acceptor) = DuplexTransport::pair();
    let opts = ConnectOptions::new()
        .connect_timeout(Duration::from_millis(100))
        .reconnect_period(Duration::from_millis(50));
    let (client, mut events) = Client::connect(transport, opts).unwrap();

    // let the first attempt time out so the session is properly offline
    loop {
        match next_event(&mut events).await {
            Event::Error(ClientError::ConnectTimeout) => break,
            _ => {}
        }
    }

    let qos0 = client.publish("t/zero", "z", PublishOptions::default()).unwrap();
    let qos1 = client.publish("t/one", "o", PublishOptions::qos(QoS::AtLeastOnce)).unwrap();

    // give the session a moment to route both into queue and store
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;

    // the offline queue drains first, then the store replays
    let first = broker.recv_publish_v3().await;
    assert_eq!(first.topic, "t/zero");
    assert_eq!(first.qos, QoS::AtMostOnce);
    assert!(qos0.await.is_ok());

    let second = broker.recv_publish_v3().await;
    assert_eq!(second.topic, "t/one");
    let packet_id = second.packet_id.unwrap();
    broker.send(MqttPacket::V3(v3::Packet::PublishAck { packet_id })).await;
    assert!(qos1.await.is_ok());

    wait_connected(&mut events).await;
}

#[tokio::test]
async fn resubscribe_after_clean_reconnect() {
    let (transport, acceptor) = DuplexTransport::pair();
    let opts = ConnectOptions::new().reconnect_period(Duration::from_millis(50));
    let (client, mut events) = Client::connect(transport, opts).unwrap();

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;
    wait_connected(&mut events).await;

    let completion = client
        .subscribe(vec![Subscription::new("s/1", QoS::AtLeastOnce)], SubscribeOptions::default())
        .unwrap();
    let packet_id = match broker.recv().await {
        MqttPacket::V3(v3::Packet::Subscribe { packet_id, topic_filters }) => {
            assert_eq!(topic_filters, vec![("s/1".to_owned().into(), QoS::AtLeastOnce)]);
            packet_id
        }
        p => panic!("expected SUBSCRIBE, got {:?}", p),
    };
    broker
        .send(MqttPacket::V3(v3::Packet::SubscribeAck {
            packet_id,
            status: vec![v3::SubscribeReturnCode::Success(QoS::AtLeastOnce)],
        }))
        .await;
    completion.await.unwrap();

    drop(broker);

    // clean session: the tracked subscription is replayed automatically
    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;
    match broker.recv().await {
        MqttPacket::V3(v3::Packet::Subscribe { topic_filters, .. }) => {
            assert_eq!(topic_filters, vec![("s/1".to_owned().into(), QoS::AtLeastOnce)]);
        }
        p => panic!("expected re-SUBSCRIBE, got {:?}", p),
    }
}

#[tokio::test]
async fn inbound_qos2_delivers_once() {
    let (transport, acceptor) = DuplexTransport::pair();
    let incoming = Arc::new(MemoryStore::new());
    let opts = ConnectOptions::new().incoming_store(Box::new(incoming.clone()));
    let (_client, mut events) = Client::connect(transport, opts).unwrap();

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;
    wait_connected(&mut events).await;

    broker
        .send(MqttPacket::V3(v3::Packet::Publish(Box::new(Publish {
            dup: false,
            retain: false,
            qos: QoS::ExactlyOnce,
            topic: "q2".to_owned().into(),
            packet_id: Some(id(9)),
            payload: Bytes::from_static(b"exactly"),
            properties: None,
            delay_interval: None,
            create_time: None,
        }))))
        .await;

    match broker.recv().await {
        MqttPacket::V3(v3::Packet::PublishReceived { packet_id }) => assert_eq!(packet_id, id(9)),
        p => panic!("expected PUBREC, got {:?}", p),
    }

    // no delivery yet, the message is parked in the incoming store
    assert!(incoming.get(id(9)).await.unwrap().is_some());

    broker.send(MqttPacket::V3(v3::Packet::PublishRelease { packet_id: id(9) })).await;
    match broker.recv().await {
        MqttPacket::V3(v3::Packet::PublishComplete { packet_id }) => assert_eq!(packet_id, id(9)),
        p => panic!("expected PUBCOMP, got {:?}", p),
    }

    let mut deliveries = 0;
    loop {
        match timeout(Duration::from_millis(200), events.next()).await {
            Ok(Some(Event::Message(msg))) => {
                assert_eq!(msg.topic, "q2");
                assert_eq!(msg.payload.as_ref(), b"exactly");
                deliveries += 1;
            }
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    assert_eq!(deliveries, 1);

    // a re-delivered PUBREL after completion is acknowledged without delivery
    broker.send(MqttPacket::V3(v3::Packet::PublishRelease { packet_id: id(9) })).await;
    match broker.recv().await {
        MqttPacket::V3(v3::Packet::PublishComplete { packet_id }) => assert_eq!(packet_id, id(9)),
        p => panic!("expected PUBCOMP, got {:?}", p),
    }
}

#[tokio::test]
async fn end_twice_completes_immediately() {
    let (transport, acceptor) = DuplexTransport::pair();
    let (client, mut events) = Client::connect(transport, ConnectOptions::new()).unwrap();

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;
    wait_connected(&mut events).await;

    let first = client.end(false).unwrap();
    let second = client.end(false).unwrap();
    assert!(timeout(WAIT, second).await.expect("second end timed out").is_ok());
    assert!(timeout(WAIT, first).await.expect("first end timed out").is_ok());

    match broker.recv().await {
        MqttPacket::V3(v3::Packet::Disconnect) => {}
        p => panic!("expected DISCONNECT, got {:?}", p),
    }
}

#[tokio::test]
async fn end_waits_for_inflight_acks() {
    let (transport, acceptor) = DuplexTransport::pair();
    let (client, mut events) = Client::connect(transport, ConnectOptions::new()).unwrap();

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;
    wait_connected(&mut events).await;

    let publish = client.publish("t", "m", PublishOptions::qos(QoS::AtLeastOnce)).unwrap();
    let wire = broker.recv_publish_v3().await;
    let packet_id = wire.packet_id.unwrap();

    let ended = client.end(false).unwrap();

    // new work is refused while ending
    let refused = client.publish("t", "x", PublishOptions::default()).unwrap();
    assert!(matches!(refused.await, Err(ClientError::Disconnecting)));

    // the pending ack still completes before the DISCONNECT goes out
    broker.send(MqttPacket::V3(v3::Packet::PublishAck { packet_id })).await;
    assert!(publish.await.is_ok());
    match broker.recv().await {
        MqttPacket::V3(v3::Packet::Disconnect) => {}
        p => panic!("expected DISCONNECT, got {:?}", p),
    }
    assert!(timeout(WAIT, ended).await.expect("end timed out").is_ok());

    let mut saw_outgoing_empty = false;
    loop {
        match next_event(&mut events).await {
            Event::OutgoingEmpty => saw_outgoing_empty = true,
            Event::End => break,
            _ => {}
        }
    }
    assert!(saw_outgoing_empty);
}

#[tokio::test]
async fn volatile_acks_cancelled_on_close() {
    let (transport, acceptor) = DuplexTransport::pair();
    let opts = ConnectOptions::new()
        .resubscribe(false)
        .reconnect_period(Duration::from_millis(50));
    let (client, mut events) = Client::connect(transport, opts).unwrap();

    let mut broker = Broker::v3(acceptor.accept());
    broker.handshake_v3().await;
    wait_connected(&mut events).await;

    let sub = client
        .subscribe(vec![Subscription::new("v/1", QoS::AtMostOnce)], SubscribeOptions::default())
        .unwrap();
    match broker.recv().await {
        MqttPacket::V3(v3::Packet::Subscribe { .. }) => {}
        p => panic!("expected SUBSCRIBE, got {:?}", p),
    }

    // the broker dies without answering
    drop(broker);

    assert!(matches!(sub.await, Err(ClientError::ConnectionClosed)));
}

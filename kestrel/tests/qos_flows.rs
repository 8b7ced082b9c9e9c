// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! End-to-end acknowledgement flows against a scripted broker.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use codec::{
    ConnectAckPacket, ControlPacket, PacketId, Property, PublishAckPacket, PublishCompletePacket,
    PublishPacket, PublishReceivedPacket, PublishReleasePacket, QoS, ReasonCode,
    SubscribeAckPacket, U16Data,
};
use kestrel::{AsyncClient, PublishOptions, SubscribeOptions};

use common::{client_options, ScriptedBroker};

#[tokio::test]
async fn test_qos1_publish_happy_path() {
    let broker = ScriptedBroker::bind().await;
    let mut client =
        AsyncClient::new(client_options(broker.port(), "kc-qos1")).expect("client");

    let server = tokio::spawn(async move {
        let mut conn = broker.accept().await;
        let connect = conn.accept_connect(false).await;
        assert_eq!(connect.client_id(), "kc-qos1");

        let ControlPacket::Publish(publish) = conn.read_packet().await else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.topic(), "t/1");
        assert_eq!(publish.message(), b"hi");
        assert_eq!(publish.qos(), QoS::AtLeastOnce);
        assert!(!publish.dup());
        assert_ne!(publish.packet_id().value(), 0);

        conn.send_packet(&PublishAckPacket::new(publish.packet_id()))
            .await;
        conn
    });

    let result = client.connect().await.expect("connect");
    assert!(!result.session_present);
    assert_eq!(result.reason_code, ReasonCode::Success);

    let mut options = PublishOptions::new("t/1", b"hi");
    options
        .set_qos(QoS::AtLeastOnce)
        .set_timeout(Some(Duration::from_secs(5)));
    let result = client.publish(options).await.expect("publish");
    assert_eq!(result.reason_code, Some(ReasonCode::Success));
    assert_eq!(client.in_flight(), 0);

    let _conn = server.await.expect("server");
}

#[tokio::test]
async fn test_qos2_four_way_handshake() {
    let broker = ScriptedBroker::bind().await;
    let mut client =
        AsyncClient::new(client_options(broker.port(), "kc-qos2")).expect("client");

    let server = tokio::spawn(async move {
        let mut conn = broker.accept().await;
        conn.accept_connect(false).await;

        let ControlPacket::Publish(publish) = conn.read_packet().await else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.qos(), QoS::ExactOnce);
        let packet_id = publish.packet_id();

        conn.send_packet(&PublishReceivedPacket::new(packet_id)).await;

        let ControlPacket::PublishRelease(release) = conn.read_packet().await else {
            panic!("expected PUBREL");
        };
        assert_eq!(release.packet_id(), packet_id);

        conn.send_packet(&PublishCompletePacket::new(packet_id)).await;
        conn
    });

    client.connect().await.expect("connect");

    let mut options = PublishOptions::new("t/2", b"x");
    options
        .set_qos(QoS::ExactOnce)
        .set_timeout(Some(Duration::from_secs(5)));
    let result = client.publish(options).await.expect("publish");
    assert_eq!(result.reason_code, Some(ReasonCode::Success));
    assert_eq!(client.in_flight(), 0);

    let _conn = server.await.expect("server");
}

#[tokio::test]
async fn test_qos2_pubrec_error_terminates_flow() {
    let broker = ScriptedBroker::bind().await;
    let mut client =
        AsyncClient::new(client_options(broker.port(), "kc-rec-err")).expect("client");

    let server = tokio::spawn(async move {
        let mut conn = broker.accept().await;
        conn.accept_connect(false).await;

        let ControlPacket::Publish(publish) = conn.read_packet().await else {
            panic!("expected PUBLISH");
        };
        let mut received = PublishReceivedPacket::new(publish.packet_id());
        received.set_reason_code(ReasonCode::QuotaExceeded);
        conn.send_packet(&received).await;

        // No PUBREL may follow a refused PUBREC.
        assert!(conn
            .try_read_packet(Duration::from_millis(300))
            .await
            .is_none());
        conn
    });

    client.connect().await.expect("connect");

    let mut options = PublishOptions::new("t/2e", b"x");
    options
        .set_qos(QoS::ExactOnce)
        .set_timeout(Some(Duration::from_secs(5)));
    let result = client.publish(options).await.expect("publish");
    assert_eq!(result.reason_code, Some(ReasonCode::QuotaExceeded));
    assert_eq!(client.in_flight(), 0);

    let _conn = server.await.expect("server");
}

#[tokio::test]
async fn test_inbound_qos2_duplicate_suppression() {
    let broker = ScriptedBroker::bind().await;
    let mut client =
        AsyncClient::new(client_options(broker.port(), "kc-dup")).expect("client");

    let delivered = Arc::new(AtomicUsize::new(0));
    let handler_count = Arc::clone(&delivered);

    let server = tokio::spawn(async move {
        let mut conn = broker.accept().await;
        conn.accept_connect(false).await;

        // Subscribe exchange.
        let ControlPacket::Subscribe(subscribe) = conn.read_packet().await else {
            panic!("expected SUBSCRIBE");
        };
        conn.send_packet(&SubscribeAckPacket::new(
            subscribe.packet_id(),
            ReasonCode::GrantedQos2,
        ))
        .await;

        // First delivery.
        let mut publish = PublishPacket::new("t/dup", QoS::ExactOnce, b"dup").unwrap();
        publish.set_packet_id(PacketId::new(42));
        conn.send_packet(&publish).await;

        let ControlPacket::PublishReceived(first) = conn.read_packet().await else {
            panic!("expected first PUBREC");
        };
        assert_eq!(first.packet_id(), PacketId::new(42));

        // Pretend the PUBREC was lost and deliver again with DUP set.
        publish.set_dup(true).unwrap();
        conn.send_packet(&publish).await;

        let ControlPacket::PublishReceived(second) = conn.read_packet().await else {
            panic!("expected second PUBREC");
        };
        assert_eq!(second.packet_id(), PacketId::new(42));

        // Complete the flow.
        conn.send_packet(&PublishReleasePacket::new(PacketId::new(42)))
            .await;
        let ControlPacket::PublishComplete(complete) = conn.read_packet().await else {
            panic!("expected PUBCOMP");
        };
        assert_eq!(complete.packet_id(), PacketId::new(42));
        conn
    });

    client.connect().await.expect("connect");

    let mut options = SubscribeOptions::new("t/dup", QoS::ExactOnce);
    options.set_handler(move |_message| {
        handler_count.fetch_add(1, Ordering::SeqCst);
    });
    options.set_timeout(Some(Duration::from_secs(5)));
    let codes = client.subscribe(options).await.expect("subscribe");
    assert_eq!(codes, vec![ReasonCode::GrantedQos2]);

    let _conn = server.await.expect("server");

    // Exactly one delivery despite two PUBLISH packets with the same id.
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_in_flight_window_backpressure() {
    let broker = ScriptedBroker::bind().await;
    let mut client =
        AsyncClient::new(client_options(broker.port(), "kc-window")).expect("client");

    let server = tokio::spawn(async move {
        let mut conn = broker.accept().await;
        let _connect = conn.expect_connect().await;
        let mut ack = ConnectAckPacket::new(false, ReasonCode::Success);
        ack.properties_mut()
            .push(Property::ReceiveMaximum(U16Data::new(2)));
        conn.send_packet(&ack).await;

        // Only two publishes may be in flight.
        let mut ids = Vec::new();
        for _ in 0..2 {
            let ControlPacket::Publish(publish) = conn.read_packet().await else {
                panic!("expected PUBLISH");
            };
            ids.push(publish.packet_id());
        }
        assert!(
            conn.try_read_packet(Duration::from_millis(300)).await.is_none(),
            "third publish must wait for a free slot"
        );

        // Acknowledging one admits the next.
        conn.send_packet(&PublishAckPacket::new(ids[0])).await;
        let ControlPacket::Publish(third) = conn.read_packet().await else {
            panic!("expected third PUBLISH");
        };
        conn.send_packet(&PublishAckPacket::new(ids[1])).await;
        conn.send_packet(&PublishAckPacket::new(third.packet_id()))
            .await;

        let ControlPacket::Publish(fourth) = conn.read_packet().await else {
            panic!("expected fourth PUBLISH");
        };
        conn.send_packet(&PublishAckPacket::new(fourth.packet_id()))
            .await;
        conn
    });

    let result = client.connect().await.expect("connect");
    assert_eq!(result.broker.receive_maximum, 2);

    let client = Arc::new(client);
    let mut publishers = Vec::new();
    for i in 0..4 {
        let client = Arc::clone(&client);
        publishers.push(tokio::spawn(async move {
            let mut options = PublishOptions::new("t/window", format!("m{i}").as_bytes());
            options
                .set_qos(QoS::AtLeastOnce)
                .set_timeout(Some(Duration::from_secs(5)));
            client.publish(options).await
        }));
    }
    for publisher in publishers {
        let result = publisher.await.expect("join").expect("publish");
        assert_eq!(result.reason_code, Some(ReasonCode::Success));
    }
    assert_eq!(client.in_flight(), 0);

    let _conn = server.await.expect("server");
}

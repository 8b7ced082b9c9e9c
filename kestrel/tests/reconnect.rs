// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Reconnect with session resume.

mod common;

use std::time::Duration;

use codec::{ControlPacket, PublishAckPacket, QoS, ReasonCode};
use kestrel::{AsyncClient, PublishOptions};

use common::{client_options, ScriptedBroker};

#[tokio::test]
async fn test_reconnect_resends_publish_with_dup() {
    let broker = ScriptedBroker::bind().await;
    let mut options = client_options(broker.port(), "kc-resume");
    options
        .set_clean_start(false)
        .set_auto_reconnect(true)
        .set_reconnect_initial_delay(Duration::from_millis(50))
        .set_session_expiry_interval(Some(300));
    let mut client = AsyncClient::new(options).expect("client");

    let server = tokio::spawn(async move {
        // First connection: swallow the publish, then drop the socket.
        let mut conn = broker.accept().await;
        conn.accept_connect(false).await;
        let ControlPacket::Publish(first) = conn.read_packet().await else {
            panic!("expected PUBLISH");
        };
        assert!(!first.dup());
        let packet_id = first.packet_id();
        conn.close().await;

        // Second connection: resume the session; the client must re-send
        // the same publish with DUP set and the same packet id.
        let mut conn = broker.accept().await;
        let connect = conn.accept_connect(true).await;
        assert!(!connect.clean_start());
        assert_eq!(connect.client_id(), "kc-resume");

        let ControlPacket::Publish(second) = conn.read_packet().await else {
            panic!("expected re-sent PUBLISH");
        };
        assert!(second.dup());
        assert_eq!(second.packet_id(), packet_id);
        assert_eq!(second.message(), first.message());

        conn.send_packet(&PublishAckPacket::new(packet_id)).await;
        conn
    });

    client.connect().await.expect("connect");

    let mut publish = PublishOptions::new("t/resume", b"payload");
    publish
        .set_qos(QoS::AtLeastOnce)
        .set_timeout(Some(Duration::from_secs(10)));
    let result = client.publish(publish).await.expect("publish");
    assert_eq!(result.reason_code, Some(ReasonCode::Success));
    assert_eq!(client.in_flight(), 0);

    let _conn = server.await.expect("server");
}

#[tokio::test]
async fn test_session_lost_fails_pending_publishes() {
    let broker = ScriptedBroker::bind().await;
    let mut options = client_options(broker.port(), "kc-lost");
    options
        .set_clean_start(false)
        .set_auto_reconnect(true)
        .set_reconnect_initial_delay(Duration::from_millis(50));
    let mut client = AsyncClient::new(options).expect("client");

    let server = tokio::spawn(async move {
        let mut conn = broker.accept().await;
        conn.accept_connect(false).await;
        let ControlPacket::Publish(_first) = conn.read_packet().await else {
            panic!("expected PUBLISH");
        };
        conn.close().await;

        // The server forgot the session this time.
        let mut conn = broker.accept().await;
        conn.accept_connect(false).await;
        conn
    });

    client.connect().await.expect("connect");

    let mut publish = PublishOptions::new("t/lost", b"x");
    publish
        .set_qos(QoS::AtLeastOnce)
        .set_timeout(Some(Duration::from_secs(10)));
    let err = client.publish(publish).await.expect_err("session lost");
    assert_eq!(err.kind(), kestrel::ErrorKind::SessionLost);
    assert_eq!(client.in_flight(), 0);

    let _conn = server.await.expect("server");
}

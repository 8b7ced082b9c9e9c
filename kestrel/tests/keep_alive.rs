// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Keep-alive timer behavior.

mod common;

use std::time::{Duration, Instant};

use codec::{ControlPacket, PingResponsePacket, PublishAckPacket, QoS, ReasonCode};
use kestrel::{AsyncClient, PublishOptions};

use common::{client_options, ScriptedBroker};

#[tokio::test]
async fn test_ping_request_sent_within_keep_alive() {
    let broker = ScriptedBroker::bind().await;
    let mut options = client_options(broker.port(), "kc-ping");
    options.set_keep_alive(1);
    let mut client = AsyncClient::new(options).expect("client");

    let server = tokio::spawn(async move {
        let mut conn = broker.accept().await;
        conn.accept_connect(false).await;

        let started = Instant::now();
        let ControlPacket::PingRequest(_) = conn.read_packet().await else {
            panic!("expected PINGREQ");
        };
        // The request must come within the keep-alive interval, with some
        // slack for scheduling.
        assert!(started.elapsed() < Duration::from_millis(1900));
        conn.send_packet(&PingResponsePacket::new()).await;

        // The connection stays usable afterwards.
        let ControlPacket::Publish(publish) = conn.read_packet().await else {
            panic!("expected PUBLISH");
        };
        conn.send_packet(&PublishAckPacket::new(publish.packet_id()))
            .await;
        conn
    });

    client.connect().await.expect("connect");
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let mut publish = PublishOptions::new("t/alive", b"ok");
    publish
        .set_qos(QoS::AtLeastOnce)
        .set_timeout(Some(Duration::from_secs(5)));
    let result = client.publish(publish).await.expect("publish");
    assert_eq!(result.reason_code, Some(ReasonCode::Success));

    let _conn = server.await.expect("server");
}

#[tokio::test]
async fn test_missing_ping_response_drops_connection() {
    let broker = ScriptedBroker::bind().await;
    let mut options = client_options(broker.port(), "kc-deaf");
    options.set_keep_alive(1);
    let mut client = AsyncClient::new(options).expect("client");

    let server = tokio::spawn(async move {
        let mut conn = broker.accept().await;
        conn.accept_connect(false).await;

        let ControlPacket::PingRequest(_) = conn.read_packet().await else {
            panic!("expected PINGREQ");
        };
        // Stay silent; the client must give up after 1.5 keep-alive
        // intervals.
        conn
    });

    client.connect().await.expect("connect");
    let _conn = server.await.expect("server");

    // PINGREQ goes out after ~1s, the response deadline expires 1.5s later.
    tokio::time::sleep(Duration::from_millis(3500)).await;

    let mut publish = PublishOptions::new("t/dead", b"x");
    publish
        .set_qos(QoS::AtLeastOnce)
        .set_timeout(Some(Duration::from_secs(1)));
    assert!(client.publish(publish).await.is_err());
}

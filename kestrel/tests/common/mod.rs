// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! A scripted broker for driving the client through exact packet sequences.

#![allow(dead_code)]

use std::time::Duration;

use codec::{ConnectAckPacket, ConnectPacket, ControlPacket, EncodePacket, ReasonCode};
use kestrel::framer::{Frame, Framer};
use kestrel::ConnectOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct ScriptedBroker {
    listener: TcpListener,
    port: u16,
}

impl ScriptedBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        Self { listener, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn accept(&self) -> BrokerConn {
        let (socket, _addr) = self.listener.accept().await.expect("accept");
        BrokerConn {
            socket,
            framer: Framer::new(1024 * 1024),
        }
    }
}

pub struct BrokerConn {
    socket: TcpStream,
    framer: Framer,
}

impl BrokerConn {
    /// Read one complete control packet from the client.
    pub async fn read_packet(&mut self) -> ControlPacket {
        loop {
            if let Some(frame) = self.framer.next_frame() {
                match frame {
                    Frame::Packet(packet) => return packet,
                    Frame::Malformed(bytes) => panic!("client sent malformed bytes: {bytes:?}"),
                }
            }
            let mut buf = [0_u8; 4096];
            let n_recv = self.socket.read(&mut buf).await.expect("read");
            assert!(n_recv > 0, "client closed the connection");
            self.framer.feed(&buf[..n_recv]);
        }
    }

    /// Read one packet, or `None` when the client stays silent for `wait`.
    pub async fn try_read_packet(&mut self, wait: Duration) -> Option<ControlPacket> {
        tokio::time::timeout(wait, self.read_packet()).await.ok()
    }

    pub async fn send_packet<P: EncodePacket>(&mut self, packet: &P) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).expect("encode");
        self.socket.write_all(&buf).await.expect("write");
        self.socket.flush().await.expect("flush");
    }

    /// Expect the opening CONNECT packet.
    pub async fn expect_connect(&mut self) -> ConnectPacket {
        match self.read_packet().await {
            ControlPacket::Connect(packet) => packet,
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    /// Run the connect exchange with a plain successful CONNACK.
    pub async fn accept_connect(&mut self, session_present: bool) -> ConnectPacket {
        let connect = self.expect_connect().await;
        self.send_packet(&ConnectAckPacket::new(session_present, ReasonCode::Success))
            .await;
        connect
    }

    /// Drop the connection abruptly.
    pub async fn close(self) {
        drop(self.socket);
    }
}

/// Client options for talking to a scripted broker on `port`.
pub fn client_options(port: u16, client_id: &str) -> ConnectOptions {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut options = ConnectOptions::new("127.0.0.1", port);
    options
        .set_client_id(client_id)
        .set_keep_alive(0)
        .set_auto_reconnect(false)
        .set_connect_timeout(Duration::from_secs(5));
    options
}

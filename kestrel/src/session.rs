// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Session state owned by the dispatcher task.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use codec::{ConnectAckPacket, PublishPacket, QoS};

/// Acknowledgement progress of an outgoing `QoS` 1 or `QoS` 2 publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// `QoS` 1, waiting for PUBACK.
    PendingAck,

    /// `QoS` 2, waiting for PUBREC.
    PendingRec,

    /// `QoS` 2, PUBREL sent, waiting for PUBCOMP.
    PendingComp,
}

/// One outgoing publish tracked in the in-flight window from enqueue until
/// terminal acknowledgement.
#[derive(Debug, Clone)]
pub struct OutgoingPublish {
    pub packet: PublishPacket,
    pub qos: QoS,
    pub state: AckState,

    /// Number of times the PUBLISH hit the wire; re-sends carry DUP=1.
    pub send_count: u32,
    pub last_sent_at: Instant,

    /// Enqueue order, used to keep re-sends in the original publish order.
    pub seq: u64,
}

impl OutgoingPublish {
    #[must_use]
    pub fn new(packet: PublishPacket, seq: u64) -> Self {
        let qos = packet.qos();
        let state = if qos == QoS::ExactOnce {
            AckState::PendingRec
        } else {
            AckState::PendingAck
        };
        Self {
            packet,
            qos,
            state,
            send_count: 0,
            last_sent_at: Instant::now(),
            seq,
        }
    }
}

/// Capabilities taken from the most recent CONNACK packet.
#[derive(Debug, Clone)]
pub struct BrokerCapabilities {
    /// Upper bound on concurrently in-flight `QoS` 1/2 publishes from
    /// the client.
    pub receive_maximum: u16,
    pub maximum_qos: QoS,
    pub retain_available: bool,
    pub wildcard_subscription_available: bool,
    pub subscription_identifier_available: bool,
    pub shared_subscription_available: bool,
    pub topic_alias_maximum: u16,
    pub server_keep_alive: Option<u16>,
    pub assigned_client_id: Option<String>,
    pub maximum_packet_size: Option<u32>,
    pub session_expiry_interval: Option<u32>,
}

impl Default for BrokerCapabilities {
    fn default() -> Self {
        Self {
            receive_maximum: u16::MAX,
            maximum_qos: QoS::ExactOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifier_available: true,
            shared_subscription_available: true,
            topic_alias_maximum: 0,
            server_keep_alive: None,
            assigned_client_id: None,
            maximum_packet_size: None,
            session_expiry_interval: None,
        }
    }
}

impl BrokerCapabilities {
    /// Read capability properties out of a CONNACK packet; absent
    /// properties keep their protocol defined defaults.
    #[must_use]
    pub fn from_connect_ack(packet: &ConnectAckPacket) -> Self {
        let properties = packet.properties();
        let maximum_qos = match properties.maximum_qos() {
            Some(0) => QoS::AtMostOnce,
            Some(1) => QoS::AtLeastOnce,
            _ => QoS::ExactOnce,
        };
        Self {
            receive_maximum: properties.receive_maximum().unwrap_or(u16::MAX),
            maximum_qos,
            retain_available: properties.retain_available().unwrap_or(true),
            wildcard_subscription_available: properties
                .wildcard_subscription_available()
                .unwrap_or(true),
            subscription_identifier_available: properties
                .subscription_identifier_available()
                .unwrap_or(true),
            shared_subscription_available: properties
                .shared_subscription_available()
                .unwrap_or(true),
            topic_alias_maximum: properties.topic_alias_maximum().unwrap_or(0),
            server_keep_alive: properties.server_keep_alive(),
            assigned_client_id: properties
                .assigned_client_identifier()
                .map(ToString::to_string),
            maximum_packet_size: properties.maximum_packet_size(),
            session_expiry_interval: properties.session_expiry_interval(),
        }
    }
}

/// Per-connection protocol state, owned by the dispatcher.
///
/// The incoming in-flight set survives reconnects when the session is
/// resumed; the topic alias table is bound to one network connection and
/// is reset on every reconnect.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Packet ids of inbound `QoS` 2 publishes for which a PUBREC went out
    /// and the PUBREL has not yet arrived. Used for duplicate suppression.
    incoming_in_flight: HashSet<u16>,

    /// Inbound topic alias table, alias -> topic name.
    alias_table: HashMap<u16, String>,

    pub broker_caps: BrokerCapabilities,
}

impl SessionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn incoming_contains(&self, packet_id: u16) -> bool {
        self.incoming_in_flight.contains(&packet_id)
    }

    /// Record an inbound `QoS` 2 publish; returns false if the id was
    /// already present.
    pub fn incoming_insert(&mut self, packet_id: u16) -> bool {
        self.incoming_in_flight.insert(packet_id)
    }

    /// Forget an inbound `QoS` 2 publish after its PUBREL.
    pub fn incoming_remove(&mut self, packet_id: u16) -> bool {
        self.incoming_in_flight.remove(&packet_id)
    }

    #[must_use]
    pub fn incoming_len(&self) -> usize {
        self.incoming_in_flight.len()
    }

    /// Look up an inbound topic alias.
    #[must_use]
    pub fn alias_lookup(&self, alias: u16) -> Option<&str> {
        self.alias_table.get(&alias).map(String::as_str)
    }

    /// Record an inbound topic alias mapping.
    pub fn alias_insert(&mut self, alias: u16, topic: String) {
        self.alias_table.insert(alias, topic);
    }

    /// Drop state bound to a single network connection.
    ///
    /// The duplicate-suppression set is kept: it is part of the session and
    /// resumes together with it.
    pub fn reset_connection_state(&mut self) {
        self.alias_table.clear();
    }

    /// Drop all session state after the server started a fresh session.
    pub fn reset_session(&mut self) {
        self.incoming_in_flight.clear();
        self.alias_table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{PacketId, Property, ReasonCode, U16Data};

    #[test]
    fn test_outgoing_publish_initial_state() {
        let mut packet = PublishPacket::new("a/b", QoS::AtLeastOnce, b"x").unwrap();
        packet.set_packet_id(PacketId::new(1));
        let record = OutgoingPublish::new(packet, 0);
        assert_eq!(record.state, AckState::PendingAck);
        assert_eq!(record.send_count, 0);

        let packet = PublishPacket::new("a/b", QoS::ExactOnce, b"x").unwrap();
        let record = OutgoingPublish::new(packet, 1);
        assert_eq!(record.state, AckState::PendingRec);
    }

    #[test]
    fn test_broker_capabilities_from_connect_ack() {
        let mut ack = ConnectAckPacket::new(false, ReasonCode::Success);
        ack.properties_mut()
            .push(Property::ReceiveMaximum(U16Data::new(4)));
        ack.properties_mut()
            .push(Property::ServerKeepAlive(U16Data::new(20)));

        let caps = BrokerCapabilities::from_connect_ack(&ack);
        assert_eq!(caps.receive_maximum, 4);
        assert_eq!(caps.server_keep_alive, Some(20));
        assert_eq!(caps.maximum_qos, QoS::ExactOnce);
        assert!(caps.retain_available);
    }

    #[test]
    fn test_incoming_dedup_set() {
        let mut session = SessionState::new();
        assert!(session.incoming_insert(42));
        assert!(!session.incoming_insert(42));
        assert!(session.incoming_contains(42));
        assert!(session.incoming_remove(42));
        assert!(!session.incoming_remove(42));
    }

    #[test]
    fn test_reset_connection_state_keeps_dedup_set() {
        let mut session = SessionState::new();
        session.incoming_insert(7);
        session.alias_insert(1, "sensor/temp".to_string());

        session.reset_connection_state();
        assert!(session.incoming_contains(7));
        assert!(session.alias_lookup(1).is_none());

        session.reset_session();
        assert!(!session.incoming_contains(7));
    }
}

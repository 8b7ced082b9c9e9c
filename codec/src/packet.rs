// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use crate::{
    AuthPacket, ByteArray, ConnectAckPacket, ConnectPacket, DecodeError, DecodePacket,
    DisconnectPacket, EncodeError, EncodePacket, PacketType, PingRequestPacket, PingResponsePacket,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket,
    UnsubscribePacket,
};

/// Tagged union over the fifteen MQTT control packet types.
///
/// One whole packet's bytes go in, one variant comes out; the per-packet
/// structs hold the fields. Dispatch is keyed on the type nibble of the
/// first byte.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPacket {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
    Auth(AuthPacket),
}

impl ControlPacket {
    /// Decode one complete packet from `bytes`.
    ///
    /// `bytes` must hold exactly the packet, fixed header included; the
    /// framer layer above is responsible for cutting the stream at packet
    /// boundaries.
    ///
    /// # Errors
    ///
    /// Returns error if `bytes` is not a well formed packet.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let Some(first_byte) = bytes.first() else {
            return Err(DecodeError::OutOfRange);
        };
        let type_bits = (first_byte & 0b1111_0000) >> 4;

        let mut ba = ByteArray::new(bytes);
        match type_bits {
            1 => Ok(Self::Connect(ConnectPacket::decode(&mut ba)?)),
            2 => Ok(Self::ConnectAck(ConnectAckPacket::decode(&mut ba)?)),
            3 => Ok(Self::Publish(PublishPacket::decode(&mut ba)?)),
            4 => Ok(Self::PublishAck(PublishAckPacket::decode(&mut ba)?)),
            5 => Ok(Self::PublishReceived(PublishReceivedPacket::decode(
                &mut ba,
            )?)),
            6 => Ok(Self::PublishRelease(PublishReleasePacket::decode(&mut ba)?)),
            7 => Ok(Self::PublishComplete(PublishCompletePacket::decode(
                &mut ba,
            )?)),
            8 => Ok(Self::Subscribe(SubscribePacket::decode(&mut ba)?)),
            9 => Ok(Self::SubscribeAck(SubscribeAckPacket::decode(&mut ba)?)),
            10 => Ok(Self::Unsubscribe(UnsubscribePacket::decode(&mut ba)?)),
            11 => Ok(Self::UnsubscribeAck(UnsubscribeAckPacket::decode(&mut ba)?)),
            12 => Ok(Self::PingRequest(PingRequestPacket::decode(&mut ba)?)),
            13 => Ok(Self::PingResponse(PingResponsePacket::decode(&mut ba)?)),
            14 => Ok(Self::Disconnect(DisconnectPacket::decode(&mut ba)?)),
            15 => Ok(Self::Auth(AuthPacket::decode(&mut ba)?)),
            _ => Err(DecodeError::InvalidPacketType),
        }
    }

    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        use crate::Packet;
        match self {
            Self::Connect(p) => p.packet_type(),
            Self::ConnectAck(p) => p.packet_type(),
            Self::Publish(p) => p.packet_type(),
            Self::PublishAck(p) => p.packet_type(),
            Self::PublishReceived(p) => p.packet_type(),
            Self::PublishRelease(p) => p.packet_type(),
            Self::PublishComplete(p) => p.packet_type(),
            Self::Subscribe(p) => p.packet_type(),
            Self::SubscribeAck(p) => p.packet_type(),
            Self::Unsubscribe(p) => p.packet_type(),
            Self::UnsubscribeAck(p) => p.packet_type(),
            Self::PingRequest(p) => p.packet_type(),
            Self::PingResponse(p) => p.packet_type(),
            Self::Disconnect(p) => p.packet_type(),
            Self::Auth(p) => p.packet_type(),
        }
    }
}

impl EncodePacket for ControlPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::Connect(p) => p.encode(buf),
            Self::ConnectAck(p) => p.encode(buf),
            Self::Publish(p) => p.encode(buf),
            Self::PublishAck(p) => p.encode(buf),
            Self::PublishReceived(p) => p.encode(buf),
            Self::PublishRelease(p) => p.encode(buf),
            Self::PublishComplete(p) => p.encode(buf),
            Self::Subscribe(p) => p.encode(buf),
            Self::SubscribeAck(p) => p.encode(buf),
            Self::Unsubscribe(p) => p.encode(buf),
            Self::UnsubscribeAck(p) => p.encode(buf),
            Self::PingRequest(p) => p.encode(buf),
            Self::PingResponse(p) => p.encode(buf),
            Self::Disconnect(p) => p.encode(buf),
            Self::Auth(p) => p.encode(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PacketId, QoS};

    #[test]
    fn test_control_packet_decode_dispatch() {
        let mut publish = PublishPacket::new("a/b", QoS::AtLeastOnce, b"hi").unwrap();
        publish.set_packet_id(PacketId::new(1));
        let mut buf = Vec::new();
        publish.encode(&mut buf).unwrap();

        let packet = ControlPacket::decode(&buf).unwrap();
        assert_eq!(packet, ControlPacket::Publish(publish));
    }

    #[test]
    fn test_control_packet_round_trip() {
        let packets = vec![
            ControlPacket::PingRequest(PingRequestPacket::new()),
            ControlPacket::PingResponse(PingResponsePacket::new()),
            ControlPacket::PublishAck(PublishAckPacket::new(PacketId::new(3))),
            ControlPacket::Disconnect(DisconnectPacket::new()),
        ];
        for packet in packets {
            let mut buf = Vec::new();
            packet.encode(&mut buf).unwrap();
            assert_eq!(ControlPacket::decode(&buf).unwrap(), packet);
        }
    }

    #[test]
    fn test_control_packet_rejects_type_zero() {
        let buf = [0x00, 0x00];
        assert_eq!(
            ControlPacket::decode(&buf),
            Err(DecodeError::InvalidPacketType)
        );
    }
}

// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, QoS, VarInt, VarIntError,
};

/// Common methods of all control packet structs.
pub trait Packet: Send {
    fn packet_type(&self) -> PacketType;

    /// Get byte length of the whole packet, fixed header included.
    ///
    /// # Errors
    ///
    /// Returns error if packet length overflows the remaining length field.
    fn bytes(&self) -> Result<usize, VarIntError>;
}

/// MQTT control packet type, the high nibble of the first byte.
///
/// The low nibble carries per-type flags. Only publish packets use them for
/// data; for all other types the flag bits are reserved and MUST match the
/// values listed in the standard [MQTT-2.1.3-1].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    /// Request to connect to server
    Connect,

    /// Server reply to connect request
    ConnectAck,

    /// Publish message
    Publish { dup: bool, qos: QoS, retain: bool },

    /// Publish acknowledgement, `QoS` 1
    PublishAck,

    /// Publish received, first `QoS` 2 response
    PublishReceived,

    /// Publish release, `QoS` 2
    PublishRelease,

    /// Publish complete, final `QoS` 2 response
    PublishComplete,

    /// Client subscribe request
    Subscribe,

    /// Subscribe acknowledgement
    SubscribeAck,

    /// Unsubscribe request
    Unsubscribe,

    /// Unsubscribe acknowledgement
    UnsubscribeAck,

    /// Client ping request
    PingRequest,

    /// Server ping response
    PingResponse,

    /// Connection is being closed
    Disconnect,

    /// Authentication exchange
    Auth,
}

impl Default for PacketType {
    fn default() -> Self {
        Self::Connect
    }
}

impl PacketType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        let type_bits = match packet_type {
            PacketType::Connect => 1,
            PacketType::ConnectAck => 2,
            PacketType::Publish { .. } => 3,
            PacketType::PublishAck => 4,
            PacketType::PublishReceived => 5,
            PacketType::PublishRelease => 6,
            PacketType::PublishComplete => 7,
            PacketType::Subscribe => 8,
            PacketType::SubscribeAck => 9,
            PacketType::Unsubscribe => 10,
            PacketType::UnsubscribeAck => 11,
            PacketType::PingRequest => 12,
            PacketType::PingResponse => 13,
            PacketType::Disconnect => 14,
            PacketType::Auth => 15,
        };

        let flag_bits = match packet_type {
            PacketType::Publish { dup, qos, retain } => {
                let dup = if dup { 0b0000_1000 } else { 0b0000_0000 };
                let qos = match qos {
                    QoS::AtMostOnce => 0b0000_0000,
                    QoS::AtLeastOnce => 0b0000_0010,
                    QoS::ExactOnce => 0b0000_0100,
                };
                let retain = if retain { 0b0000_0001 } else { 0b0000_0000 };
                dup | qos | retain
            }
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => {
                // Reserved
                0b0000_0010
            }
            _ => 0b0000_0000,
        };
        (type_bits << 4) | flag_bits
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let type_bits = (v & 0b1111_0000) >> 4;
        let flag = v & 0b0000_1111;

        if type_bits == 3 {
            let dup = (flag & 0b0000_1000) == 0b0000_1000;
            let retain = (flag & 0b0000_0001) == 0b0000_0001;
            let qos = match flag & 0b0000_0110 {
                0b0000_0000 => QoS::AtMostOnce,
                0b0000_0010 => QoS::AtLeastOnce,
                0b0000_0100 => QoS::ExactOnce,
                _ => return Err(DecodeError::InvalidQoS),
            };

            // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
            if dup && qos == QoS::AtMostOnce {
                log::error!("header: Got DUP flag in QoS 0 publish");
                return Err(DecodeError::InvalidPacketFlags);
            }

            return Ok(Self::Publish { dup, qos, retain });
        }

        let (packet_type, expected_flag) = match type_bits {
            1 => (Self::Connect, 0b0000_0000),
            2 => (Self::ConnectAck, 0b0000_0000),
            4 => (Self::PublishAck, 0b0000_0000),
            5 => (Self::PublishReceived, 0b0000_0000),
            6 => (Self::PublishRelease, 0b0000_0010),
            7 => (Self::PublishComplete, 0b0000_0000),
            8 => (Self::Subscribe, 0b0000_0010),
            9 => (Self::SubscribeAck, 0b0000_0000),
            10 => (Self::Unsubscribe, 0b0000_0010),
            11 => (Self::UnsubscribeAck, 0b0000_0000),
            12 => (Self::PingRequest, 0b0000_0000),
            13 => (Self::PingResponse, 0b0000_0000),
            14 => (Self::Disconnect, 0b0000_0000),
            15 => (Self::Auth, 0b0000_0000),
            t => {
                log::error!("header: Invalid type bits: {t:#b}");
                return Err(DecodeError::InvalidPacketType);
            }
        };

        // Where a flag bit is marked as "Reserved", it is reserved for future use
        // and MUST be set to the value listed [MQTT-2.1.3-1].
        if flag != expected_flag {
            log::error!("header: Got packet flag {flag:#b} in {packet_type:?}");
            return Err(DecodeError::InvalidPacketFlags);
        }
        Ok(packet_type)
    }
}

/// Fixed header part of an MQTT control packet. It consists of at least two bytes.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +-------+-------+
/// | Type  | Flags |
/// +-------+-------+
/// | Remaining Len |
/// +-------+-------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedHeader {
    packet_type: PacketType,

    /// `Remaining Length` uses the variable byte encoding. It does not include
    /// the bytes of the fixed header itself. The maximum value is
    /// `0xFF 0xFF 0xFF 0x7F`, 268,435,455 bytes.
    remaining_length: VarInt,
}

impl FixedHeader {
    /// # Errors
    ///
    /// Returns error if `remaining_length` is invalid.
    pub fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, VarIntError> {
        let remaining_length = VarInt::from(remaining_length)?;
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub const fn remaining_length(&self) -> usize {
        self.remaining_length.value()
    }

    /// Byte length of the encoded remaining-length field.
    #[must_use]
    pub const fn remaining_bytes(&self) -> usize {
        self.remaining_length.bytes()
    }

    #[must_use]
    pub const fn bytes(&self) -> usize {
        PacketType::bytes() + self.remaining_length.bytes()
    }
}

impl DecodePacket for FixedHeader {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flag = ba.read_byte()?;

        let packet_type = PacketType::try_from(flag)?;
        let remaining_length = VarInt::decode(ba)?;

        Ok(Self {
            packet_type,
            remaining_length,
        })
    }
}

impl EncodePacket for FixedHeader {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let packet_type: u8 = self.packet_type.into();
        v.push(packet_type);

        self.remaining_length.encode(v)?;

        Ok(PacketType::bytes() + self.remaining_length.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_round_trip() {
        let publish = PacketType::Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        let byte: u8 = publish.into();
        assert_eq!(byte, 0b0011_1011);
        assert_eq!(PacketType::try_from(byte), Ok(publish));
    }

    #[test]
    fn test_packet_type_rejects_dup_on_qos0() {
        // PUBLISH, DUP=1, QoS=0
        assert_eq!(
            PacketType::try_from(0b0011_1000),
            Err(DecodeError::InvalidPacketFlags)
        );
    }

    #[test]
    fn test_packet_type_reserved_flags() {
        // SUBSCRIBE requires flags 0b0010.
        assert_eq!(PacketType::try_from(0b1000_0010), Ok(PacketType::Subscribe));
        assert_eq!(
            PacketType::try_from(0b1000_0000),
            Err(DecodeError::InvalidPacketFlags)
        );

        // PUBREL requires flags 0b0010.
        assert_eq!(
            PacketType::try_from(0b0110_0000),
            Err(DecodeError::InvalidPacketFlags)
        );
    }

    #[test]
    fn test_fixed_header_round_trip() {
        let header = FixedHeader::new(PacketType::PingRequest, 0).unwrap();
        let mut buf = Vec::new();
        assert_eq!(header.encode(&mut buf).unwrap(), 2);
        assert_eq!(&buf, &[0b1100_0000, 0x00]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(FixedHeader::decode(&mut ba).unwrap(), header);
    }
}

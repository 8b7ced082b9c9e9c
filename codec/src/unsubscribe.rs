// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use crate::property::check_property_type_list;
use crate::topic::SubTopic;
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet, PacketId,
    PacketType, Properties, PropertyType, StringData, VarIntError,
};

/// `UnsubscribePacket` is sent by the Client to the Server to unsubscribe
/// from topics.
///
/// The Topic Filters in an UNSUBSCRIBE packet MUST be compared
/// character-by-character with the current set of Topic Filters; they are
/// not treated as patterns [MQTT-3.10.4-1].
///
/// Basic structure of packet:
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Packet id             |
/// |                       |
/// +-----------------------+
/// | Properties ...        |
/// +-----------------------+
/// | Topic 0 length        |
/// |                       |
/// +-----------------------+
/// | Topic 0 ...           |
/// +-----------------------+
/// | Topic 1 length        |
/// |                       |
/// +-----------------------+
/// | Topic 1 ...           |
/// +-----------------------+
/// | ...                   |
/// +-----------------------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    packet_id: PacketId,
    properties: Properties,
    topics: Vec<StringData>,
}

/// Properties available in unsubscribe packet.
pub const UNSUBSCRIBE_PROPERTIES: &[PropertyType] = &[PropertyType::UserProperty];

impl UnsubscribePacket {
    /// Create an unsubscribe packet for a single `topic`.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic filter.
    pub fn new(topic: &str, packet_id: PacketId) -> Result<Self, EncodeError> {
        SubTopic::parse(topic).map_err(|_e| EncodeError::InvalidTopic)?;
        let topic = StringData::from(topic)?;
        Ok(Self {
            packet_id,
            properties: Properties::new(),
            topics: vec![topic],
        })
    }

    /// Create an unsubscribe packet for a list of topic filters.
    ///
    /// # Errors
    ///
    /// Returns error if some filter is invalid.
    pub fn with_topics(packet_id: PacketId, topics: &[&str]) -> Result<Self, EncodeError> {
        let topics = topics
            .iter()
            .map(|topic| {
                SubTopic::parse(topic).map_err(|_e| EncodeError::InvalidTopic)?;
                StringData::from(topic).map_err(EncodeError::from)
            })
            .collect::<Result<Vec<_>, EncodeError>>()?;
        Ok(Self {
            packet_id,
            properties: Properties::new(),
            topics,
        })
    }

    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn topics(&self) -> &[StringData] {
        &self.topics
    }

    /// Get a mutable reference to property list.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let topics_bytes: usize = self.topics.iter().map(StringData::bytes).sum();
        let remaining_length = PacketId::bytes() + self.properties.bytes() + topics_bytes;
        FixedHeader::new(PacketType::Unsubscribe, remaining_length)
    }
}

impl DecodePacket for UnsubscribePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Unsubscribe {
            return Err(DecodeError::InvalidPacketType);
        }

        let body_start = ba.offset();
        let packet_id = PacketId::decode(ba)?;
        if packet_id.value() == 0 {
            return Err(DecodeError::InvalidPacketId);
        }

        let properties = Properties::decode(ba)?;
        if let Err(property_type) =
            check_property_type_list(properties.props(), UNSUBSCRIBE_PROPERTIES)
        {
            log::error!("UnsubscribePacket: property type {property_type:?} cannot be used here");
            return Err(DecodeError::InvalidPropertyType);
        }

        let mut topics = Vec::new();
        while ba.offset() - body_start < fixed_header.remaining_length() {
            topics.push(StringData::decode(ba)?);
        }
        // An UNSUBSCRIBE packet with no Payload is a Protocol Error
        // [MQTT-3.10.3-2].
        if topics.is_empty() {
            return Err(DecodeError::InvalidRemainingLength);
        }

        Ok(Self {
            packet_id,
            properties,
            topics,
        })
    }
}

impl EncodePacket for UnsubscribePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;
        self.packet_id.encode(buf)?;
        self.properties.encode(buf)?;
        for topic in &self.topics {
            topic.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl Packet for UnsubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Unsubscribe
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsubscribe_round_trip() {
        let packet =
            UnsubscribePacket::with_topics(PacketId::new(11), &["sensor/+/temp", "state/#"])
                .unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = UnsubscribePacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.topics().len(), 2);
    }
}

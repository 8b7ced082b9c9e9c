// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::property::{check_multiple_subscription_identifiers, check_property_type_list};
use crate::topic::SubTopic;
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet, PacketId,
    PacketType, Properties, PropertyType, QoS, StringData, VarIntError,
};

/// Retain Handling option of a subscription [MQTT-3.8.3.1].
///
/// This option specifies whether retained messages are sent when the
/// subscription is established.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RetainHandling {
    /// Send retained messages at the time of the subscribe.
    #[default]
    SendAtSubscribe = 0,

    /// Send retained messages at subscribe only if the subscription
    /// does not currently exist.
    SendIfNotExist = 1,

    /// Do not send retained messages at the time of the subscribe.
    DoNotSend = 2,
}

impl TryFrom<u8> for RetainHandling {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::SendAtSubscribe),
            1 => Ok(Self::SendIfNotExist),
            2 => Ok(Self::DoNotSend),
            _ => Err(DecodeError::InvalidSubscriptionOptions),
        }
    }
}

/// One topic filter with its subscription options byte.
///
/// ```txt
///  7 6            5 4               3          2  1 0
/// +----------------+-----------------+----------+-----+
/// | Reserved       | Retain Handling | RAP | NL | QoS |
/// +----------------+-----------------+----------+-----+
/// ```
///
/// Bits 6 and 7 are reserved; the Server MUST treat a SUBSCRIBE packet as
/// malformed if any of the reserved bits are non-zero [MQTT-3.8.3-5].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscribeTopic {
    filter: StringData,
    qos: QoS,
    no_local: bool,
    retain_as_published: bool,
    retain_handling: RetainHandling,
}

impl SubscribeTopic {
    /// Create a new subscription entry for `filter` with maximum `qos`.
    ///
    /// # Errors
    ///
    /// Returns error if `filter` is not a valid topic filter.
    pub fn new(filter: &str, qos: QoS) -> Result<Self, EncodeError> {
        SubTopic::parse(filter).map_err(|_e| EncodeError::InvalidTopic)?;
        let filter = StringData::from(filter)?;
        Ok(Self {
            filter,
            qos,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn filter(&self) -> &str {
        self.filter.as_ref()
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// If no-local is set, application messages MUST NOT be forwarded to a
    /// connection with a ClientID equal to the publisher [MQTT-3.8.3-3].
    pub fn set_no_local(&mut self, no_local: bool) -> &mut Self {
        self.no_local = no_local;
        self
    }

    #[must_use]
    pub const fn no_local(&self) -> bool {
        self.no_local
    }

    pub fn set_retain_as_published(&mut self, retain_as_published: bool) -> &mut Self {
        self.retain_as_published = retain_as_published;
        self
    }

    #[must_use]
    pub const fn retain_as_published(&self) -> bool {
        self.retain_as_published
    }

    pub fn set_retain_handling(&mut self, retain_handling: RetainHandling) -> &mut Self {
        self.retain_handling = retain_handling;
        self
    }

    #[must_use]
    pub const fn retain_handling(&self) -> RetainHandling {
        self.retain_handling
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.filter.bytes() + 1
    }
}

impl DecodePacket for SubscribeTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let filter = StringData::decode(ba)?;
        SubTopic::parse(filter.as_ref()).map_err(|_e| DecodeError::InvalidTopic)?;

        let options = ba.read_byte()?;
        if options & 0b1100_0000 != 0 {
            return Err(DecodeError::InvalidSubscriptionOptions);
        }
        let qos = QoS::try_from(options & 0b0000_0011)?;
        let no_local = options & 0b0000_0100 != 0;
        let retain_as_published = options & 0b0000_1000 != 0;
        let retain_handling = RetainHandling::try_from((options & 0b0011_0000) >> 4)?;

        Ok(Self {
            filter,
            qos,
            no_local,
            retain_as_published,
            retain_handling,
        })
    }
}

impl EncodePacket for SubscribeTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.filter.encode(buf)?;

        let mut options = self.qos as u8;
        if self.no_local {
            options |= 0b0000_0100;
        }
        if self.retain_as_published {
            options |= 0b0000_1000;
        }
        options |= (self.retain_handling as u8) << 4;
        buf.push(options);

        Ok(self.bytes())
    }
}

/// `SubscribePacket` is sent from the Client to the Server to create one or
/// more subscriptions.
///
/// Each subscription registers a Client's interest in one or more topics.
///
/// Basic structure of packet:
///
/// ```txt
///  7                      0
/// +------------------------+
/// | Fixed header           |
/// |                        |
/// +------------------------+
/// | Packet id              |
/// |                        |
/// +------------------------+
/// | Properties ...         |
/// +------------------------+
/// | Topic 0 length         |
/// |                        |
/// +------------------------+
/// | Topic 0 ...            |
/// +------------------------+
/// | Topic 0 options        |
/// +------------------------+
/// | Topic 1 length         |
/// |                        |
/// +------------------------+
/// | Topic 1 ...            |
/// +------------------------+
/// | Topic 1 options        |
/// +------------------------+
/// | ...                    |
/// +------------------------+
/// ```
///
/// The payload MUST contain at least one Topic Filter and Subscription
/// Options pair [MQTT-3.8.3-2].
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    packet_id: PacketId,
    properties: Properties,
    topics: Vec<SubscribeTopic>,
}

/// Properties available in subscribe packet.
pub const SUBSCRIBE_PROPERTIES: &[PropertyType] = &[
    // The Subscription Identifier can have the value of 1 to 268,435,455.
    // It is a Protocol Error if the Subscription Identifier has a value of 0.
    PropertyType::SubscriptionIdentifier,
    PropertyType::UserProperty,
];

impl SubscribePacket {
    /// Create a new subscribe packet with a single `topic` entry.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic filter.
    pub fn new(topic: &str, qos: QoS, packet_id: PacketId) -> Result<Self, EncodeError> {
        let topic = SubscribeTopic::new(topic, qos)?;
        Ok(Self {
            packet_id,
            properties: Properties::new(),
            topics: vec![topic],
        })
    }

    /// Create a new subscribe packet with a list of topic entries.
    #[must_use]
    pub fn with_topics(packet_id: PacketId, topics: Vec<SubscribeTopic>) -> Self {
        Self {
            packet_id,
            properties: Properties::new(),
            topics,
        }
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
    pub fn topics(&self) -> &[SubscribeTopic] {
        &self.topics
    }

    pub fn topics_mut(&mut self) -> &mut Vec<SubscribeTopic> {
        &mut self.topics
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
        let topics_bytes: usize = self.topics.iter().map(SubscribeTopic::bytes).sum();
        let remaining_length = PacketId::bytes() + self.properties.bytes() + topics_bytes;
        FixedHeader::new(PacketType::Subscribe, remaining_length)
    }
}

impl DecodePacket for SubscribePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Subscribe {
            return Err(DecodeError::InvalidPacketType);
        }

        let body_start = ba.offset();
        let packet_id = PacketId::decode(ba)?;
        if packet_id.value() == 0 {
            return Err(DecodeError::InvalidPacketId);
        }

        let properties = Properties::decode(ba)?;
        if let Err(property_type) =
            check_property_type_list(properties.props(), SUBSCRIBE_PROPERTIES)
        {
            log::error!("SubscribePacket: property type {property_type:?} cannot be used here");
            return Err(DecodeError::InvalidPropertyType);
        }
        if check_multiple_subscription_identifiers(properties.props()).is_err() {
            log::error!("SubscribePacket: multiple subscription identifiers");
            return Err(DecodeError::DuplicatedProperty);
        }

        let mut topics = Vec::new();
        while ba.offset() - body_start < fixed_header.remaining_length() {
            topics.push(SubscribeTopic::decode(ba)?);
        }
        if topics.is_empty() {
            // [MQTT-3.8.3-2]
            return Err(DecodeError::InvalidRemainingLength);
        }

        Ok(Self {
            packet_id,
            properties,
            topics,
        })
    }
}

impl EncodePacket for SubscribePacket {
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

impl Packet for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
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
    fn test_subscribe_round_trip() {
        let mut packet =
            SubscribePacket::new("sensor/+/temp", QoS::AtLeastOnce, PacketId::new(3)).unwrap();
        packet.topics_mut()[0]
            .set_no_local(true)
            .set_retain_handling(RetainHandling::DoNotSend);

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = SubscribePacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.topics().len(), 1);
        assert!(decoded.topics()[0].no_local());
        assert_eq!(
            decoded.topics()[0].retain_handling(),
            RetainHandling::DoNotSend
        );
    }

    #[test]
    fn test_subscribe_rejects_invalid_filter() {
        assert!(SubscribePacket::new("a/#/b", QoS::AtMostOnce, PacketId::new(1)).is_err());
    }

    #[test]
    fn test_subscribe_rejects_reserved_option_bits() {
        // packet id 1, empty properties, filter "a" with reserved bit 6 set.
        let buf = [0x82, 0x07, 0x00, 0x01, 0x00, 0x00, 0x01, b'a', 0b0100_0000];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            SubscribePacket::decode(&mut ba),
            Err(DecodeError::InvalidSubscriptionOptions)
        );
    }
}

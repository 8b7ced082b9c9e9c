// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    BinaryData, BoolData, ByteArray, ByteData, DecodeError, DecodePacket, EncodeError,
    EncodePacket, StringData, StringPairData, U16Data, U32Data, VarInt,
};

/// Properties which may appear more than once in a property list.
///
/// The Subscription Identifier repeats only in publish packets sent by the
/// server when several overlapping subscriptions match [MQTT-3.3.4-4];
/// subscribe packets still allow at most one, which
/// [`check_multiple_subscription_identifiers`] enforces.
pub const MULTIPLE_PROPERTIES: &[PropertyType] = &[
    PropertyType::UserProperty,
    PropertyType::SubscriptionIdentifier,
];

/// Check that Subscription Identifier appears at most once.
///
/// # Errors
///
/// Returns the offending property type.
pub fn check_multiple_subscription_identifiers(
    properties: &[Property],
) -> Result<(), PropertyType> {
    let count = properties
        .iter()
        .filter(|p| p.property_type() == PropertyType::SubscriptionIdentifier)
        .count();
    if count > 1 {
        return Err(PropertyType::SubscriptionIdentifier);
    }
    Ok(())
}

/// Check that every property in `properties` is in the `types` allow-list and
/// that no non-repeatable property occurs more than once.
///
/// # Errors
///
/// Returns the offending property type.
pub fn check_property_type_list(
    properties: &[Property],
    types: &[PropertyType],
) -> Result<(), PropertyType> {
    if properties.is_empty() {
        return Ok(());
    }

    for property in properties {
        if !types.contains(&property.property_type()) {
            return Err(property.property_type());
        }
    }

    for property_type in types {
        let count = properties
            .iter()
            .filter(|p| p.property_type() == *property_type)
            .count();
        if count > 1 && !MULTIPLE_PROPERTIES.contains(property_type) {
            return Err(*property_type);
        }
    }

    Ok(())
}

/// Property identifier byte, defined in MQTT 2.2.2.2.
#[allow(clippy::module_name_repetitions)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0b,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1a,
    ServerReference = 0x1c,
    ReasonString = 0x1f,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2a,
}

impl PropertyType {
    /// Get byte length used in packet.
    ///
    /// Identifiers are Variable Byte Integers on the wire, but every defined
    /// identifier fits into one byte.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for PropertyType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x01 => Ok(Self::PayloadFormatIndicator),
            0x02 => Ok(Self::MessageExpiryInterval),
            0x03 => Ok(Self::ContentType),
            0x08 => Ok(Self::ResponseTopic),
            0x09 => Ok(Self::CorrelationData),
            0x0b => Ok(Self::SubscriptionIdentifier),
            0x11 => Ok(Self::SessionExpiryInterval),
            0x12 => Ok(Self::AssignedClientIdentifier),
            0x13 => Ok(Self::ServerKeepAlive),
            0x15 => Ok(Self::AuthenticationMethod),
            0x16 => Ok(Self::AuthenticationData),
            0x17 => Ok(Self::RequestProblemInformation),
            0x18 => Ok(Self::WillDelayInterval),
            0x19 => Ok(Self::RequestResponseInformation),
            0x1a => Ok(Self::ResponseInformation),
            0x1c => Ok(Self::ServerReference),
            0x1f => Ok(Self::ReasonString),
            0x21 => Ok(Self::ReceiveMaximum),
            0x22 => Ok(Self::TopicAliasMaximum),
            0x23 => Ok(Self::TopicAlias),
            0x24 => Ok(Self::MaximumQoS),
            0x25 => Ok(Self::RetainAvailable),
            0x26 => Ok(Self::UserProperty),
            0x27 => Ok(Self::MaximumPacketSize),
            0x28 => Ok(Self::WildcardSubscriptionAvailable),
            0x29 => Ok(Self::SubscriptionIdentifierAvailable),
            0x2a => Ok(Self::SharedSubscriptionAvailable),
            _ => Err(DecodeError::InvalidPropertyType),
        }
    }
}

/// A single property with its typed value, per MQTT 2.2.2.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    /// Byte. Used in PUBLISH, Will Properties.
    ///
    /// 0 means the payload is unspecified bytes, 1 means UTF-8 encoded
    /// character data.
    PayloadFormatIndicator(BoolData),

    /// Four Byte Integer. Used in PUBLISH, Will Properties.
    ///
    /// Lifetime of the message in seconds.
    MessageExpiryInterval(U32Data),

    /// UTF-8 Encoded String. Used in PUBLISH, Will Properties.
    ContentType(StringData),

    /// UTF-8 Encoded String. Used in PUBLISH, Will Properties.
    ///
    /// Topic name for the response message in a request/response exchange.
    ResponseTopic(StringData),

    /// Binary Data. Used in PUBLISH, Will Properties.
    CorrelationData(BinaryData),

    /// Variable Byte Integer. Used in PUBLISH, SUBSCRIBE.
    ///
    /// It is a Protocol Error if the Subscription Identifier has a value of 0.
    SubscriptionIdentifier(VarInt),

    /// Four Byte Integer. Used in CONNECT, CONNACK, DISCONNECT.
    ///
    /// Session Expiry Interval in seconds.
    SessionExpiryInterval(U32Data),

    /// UTF-8 Encoded String. Used in CONNACK.
    ///
    /// The Client Identifier which was assigned by the Server because a zero
    /// length Client Identifier was found in the CONNECT packet.
    AssignedClientIdentifier(StringData),

    /// Two Byte Integer. Used in CONNACK.
    ///
    /// If present, the Client MUST use this value instead of the Keep Alive
    /// it sent in CONNECT [MQTT-3.1.2-21].
    ServerKeepAlive(U16Data),

    /// UTF-8 Encoded String. Used in CONNECT, CONNACK, AUTH.
    AuthenticationMethod(StringData),

    /// Binary Data. Used in CONNECT, CONNACK, AUTH.
    AuthenticationData(BinaryData),

    /// Byte. Used in CONNECT.
    RequestProblemInformation(BoolData),

    /// Four Byte Integer. Used in Will Properties.
    ///
    /// Delay in seconds before the Server publishes the Will Message.
    WillDelayInterval(U32Data),

    /// Byte. Used in CONNECT.
    RequestResponseInformation(BoolData),

    /// UTF-8 Encoded String. Used in CONNACK.
    ResponseInformation(StringData),

    /// UTF-8 Encoded String. Used in CONNACK, DISCONNECT.
    ServerReference(StringData),

    /// UTF-8 Encoded String. Used in all acknowledgement packets.
    ///
    /// Human readable diagnostic, not parsed by the receiver.
    ReasonString(StringData),

    /// Two Byte Integer. Used in CONNECT, CONNACK.
    ///
    /// Maximum number of QoS 1 and QoS 2 publications the sender is willing
    /// to process concurrently. It is a Protocol Error to include a value of 0.
    ReceiveMaximum(U16Data),

    /// Two Byte Integer. Used in CONNECT, CONNACK.
    TopicAliasMaximum(U16Data),

    /// Two Byte Integer. Used in PUBLISH.
    TopicAlias(U16Data),

    /// Byte. Used in CONNACK. Legal values are 0 and 1.
    MaximumQoS(ByteData),

    /// Byte. Used in CONNACK.
    RetainAvailable(BoolData),

    /// UTF-8 String Pair. Used everywhere, may appear multiple times;
    /// order is preserved.
    UserProperty(StringPairData),

    /// Four Byte Integer. Used in CONNECT, CONNACK.
    ///
    /// It is a Protocol Error to include a value of 0.
    MaximumPacketSize(U32Data),

    /// Byte. Used in CONNACK.
    WildcardSubscriptionAvailable(BoolData),

    /// Byte. Used in CONNACK.
    SubscriptionIdentifierAvailable(BoolData),

    /// Byte. Used in CONNACK.
    SharedSubscriptionAvailable(BoolData),
}

impl Property {
    #[must_use]
    pub const fn property_type(&self) -> PropertyType {
        match self {
            Self::PayloadFormatIndicator(_) => PropertyType::PayloadFormatIndicator,
            Self::MessageExpiryInterval(_) => PropertyType::MessageExpiryInterval,
            Self::ContentType(_) => PropertyType::ContentType,
            Self::ResponseTopic(_) => PropertyType::ResponseTopic,
            Self::CorrelationData(_) => PropertyType::CorrelationData,
            Self::SubscriptionIdentifier(_) => PropertyType::SubscriptionIdentifier,
            Self::SessionExpiryInterval(_) => PropertyType::SessionExpiryInterval,
            Self::AssignedClientIdentifier(_) => PropertyType::AssignedClientIdentifier,
            Self::ServerKeepAlive(_) => PropertyType::ServerKeepAlive,
            Self::AuthenticationMethod(_) => PropertyType::AuthenticationMethod,
            Self::AuthenticationData(_) => PropertyType::AuthenticationData,
            Self::RequestProblemInformation(_) => PropertyType::RequestProblemInformation,
            Self::WillDelayInterval(_) => PropertyType::WillDelayInterval,
            Self::RequestResponseInformation(_) => PropertyType::RequestResponseInformation,
            Self::ResponseInformation(_) => PropertyType::ResponseInformation,
            Self::ServerReference(_) => PropertyType::ServerReference,
            Self::ReasonString(_) => PropertyType::ReasonString,
            Self::ReceiveMaximum(_) => PropertyType::ReceiveMaximum,
            Self::TopicAliasMaximum(_) => PropertyType::TopicAliasMaximum,
            Self::TopicAlias(_) => PropertyType::TopicAlias,
            Self::MaximumQoS(_) => PropertyType::MaximumQoS,
            Self::RetainAvailable(_) => PropertyType::RetainAvailable,
            Self::UserProperty(_) => PropertyType::UserProperty,
            Self::MaximumPacketSize(_) => PropertyType::MaximumPacketSize,
            Self::WildcardSubscriptionAvailable(_) => PropertyType::WildcardSubscriptionAvailable,
            Self::SubscriptionIdentifierAvailable(_) => {
                PropertyType::SubscriptionIdentifierAvailable
            }
            Self::SharedSubscriptionAvailable(_) => PropertyType::SharedSubscriptionAvailable,
        }
    }

    /// Get byte length in packet, identifier byte included.
    #[must_use]
    pub fn bytes(&self) -> usize {
        let value_bytes = match self {
            Self::PayloadFormatIndicator(_)
            | Self::RequestProblemInformation(_)
            | Self::RequestResponseInformation(_)
            | Self::RetainAvailable(_)
            | Self::WildcardSubscriptionAvailable(_)
            | Self::SubscriptionIdentifierAvailable(_)
            | Self::SharedSubscriptionAvailable(_) => BoolData::bytes(),
            Self::MaximumQoS(_) => ByteData::bytes(),
            Self::ServerKeepAlive(_)
            | Self::ReceiveMaximum(_)
            | Self::TopicAliasMaximum(_)
            | Self::TopicAlias(_) => U16Data::bytes(),
            Self::MessageExpiryInterval(_)
            | Self::SessionExpiryInterval(_)
            | Self::WillDelayInterval(_)
            | Self::MaximumPacketSize(_) => U32Data::bytes(),
            Self::SubscriptionIdentifier(v) => v.bytes(),
            Self::ContentType(v)
            | Self::ResponseTopic(v)
            | Self::AssignedClientIdentifier(v)
            | Self::AuthenticationMethod(v)
            | Self::ResponseInformation(v)
            | Self::ServerReference(v)
            | Self::ReasonString(v) => v.bytes(),
            Self::CorrelationData(v) | Self::AuthenticationData(v) => v.bytes(),
            Self::UserProperty(v) => v.bytes(),
        };
        PropertyType::bytes() + value_bytes
    }
}

impl DecodePacket for Property {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let property_type = PropertyType::try_from(ba.read_byte()?)?;
        match property_type {
            PropertyType::PayloadFormatIndicator => {
                Ok(Self::PayloadFormatIndicator(BoolData::decode(ba)?))
            }
            PropertyType::MessageExpiryInterval => {
                Ok(Self::MessageExpiryInterval(U32Data::decode(ba)?))
            }
            PropertyType::ContentType => Ok(Self::ContentType(StringData::decode(ba)?)),
            PropertyType::ResponseTopic => Ok(Self::ResponseTopic(StringData::decode(ba)?)),
            PropertyType::CorrelationData => Ok(Self::CorrelationData(BinaryData::decode(ba)?)),
            PropertyType::SubscriptionIdentifier => {
                let value = VarInt::decode(ba)?;
                if value.is_empty() {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::SubscriptionIdentifier(value))
            }
            PropertyType::SessionExpiryInterval => {
                Ok(Self::SessionExpiryInterval(U32Data::decode(ba)?))
            }
            PropertyType::AssignedClientIdentifier => {
                Ok(Self::AssignedClientIdentifier(StringData::decode(ba)?))
            }
            PropertyType::ServerKeepAlive => Ok(Self::ServerKeepAlive(U16Data::decode(ba)?)),
            PropertyType::AuthenticationMethod => {
                Ok(Self::AuthenticationMethod(StringData::decode(ba)?))
            }
            PropertyType::AuthenticationData => {
                Ok(Self::AuthenticationData(BinaryData::decode(ba)?))
            }
            PropertyType::RequestProblemInformation => {
                Ok(Self::RequestProblemInformation(BoolData::decode(ba)?))
            }
            PropertyType::WillDelayInterval => Ok(Self::WillDelayInterval(U32Data::decode(ba)?)),
            PropertyType::RequestResponseInformation => {
                Ok(Self::RequestResponseInformation(BoolData::decode(ba)?))
            }
            PropertyType::ResponseInformation => {
                Ok(Self::ResponseInformation(StringData::decode(ba)?))
            }
            PropertyType::ServerReference => Ok(Self::ServerReference(StringData::decode(ba)?)),
            PropertyType::ReasonString => Ok(Self::ReasonString(StringData::decode(ba)?)),
            PropertyType::ReceiveMaximum => {
                let value = U16Data::decode(ba)?;
                if value.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::ReceiveMaximum(value))
            }
            PropertyType::TopicAliasMaximum => Ok(Self::TopicAliasMaximum(U16Data::decode(ba)?)),
            PropertyType::TopicAlias => Ok(Self::TopicAlias(U16Data::decode(ba)?)),
            PropertyType::MaximumQoS => {
                let value = ByteData::decode(ba)?;
                if value.value() > 1 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumQoS(value))
            }
            PropertyType::RetainAvailable => Ok(Self::RetainAvailable(BoolData::decode(ba)?)),
            PropertyType::UserProperty => Ok(Self::UserProperty(StringPairData::decode(ba)?)),
            PropertyType::MaximumPacketSize => {
                let value = U32Data::decode(ba)?;
                if value.value() == 0 {
                    return Err(DecodeError::InvalidPropertyValue);
                }
                Ok(Self::MaximumPacketSize(value))
            }
            PropertyType::WildcardSubscriptionAvailable => {
                Ok(Self::WildcardSubscriptionAvailable(BoolData::decode(ba)?))
            }
            PropertyType::SubscriptionIdentifierAvailable => Ok(
                Self::SubscriptionIdentifierAvailable(BoolData::decode(ba)?),
            ),
            PropertyType::SharedSubscriptionAvailable => {
                Ok(Self::SharedSubscriptionAvailable(BoolData::decode(ba)?))
            }
        }
    }
}

impl EncodePacket for Property {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(self.property_type() as u8);
        let value_bytes = match self {
            Self::PayloadFormatIndicator(v)
            | Self::RequestProblemInformation(v)
            | Self::RequestResponseInformation(v)
            | Self::RetainAvailable(v)
            | Self::WildcardSubscriptionAvailable(v)
            | Self::SubscriptionIdentifierAvailable(v)
            | Self::SharedSubscriptionAvailable(v) => v.encode(buf)?,
            Self::MaximumQoS(v) => v.encode(buf)?,
            Self::ServerKeepAlive(v)
            | Self::ReceiveMaximum(v)
            | Self::TopicAliasMaximum(v)
            | Self::TopicAlias(v) => v.encode(buf)?,
            Self::MessageExpiryInterval(v)
            | Self::SessionExpiryInterval(v)
            | Self::WillDelayInterval(v)
            | Self::MaximumPacketSize(v) => v.encode(buf)?,
            Self::SubscriptionIdentifier(v) => v.encode(buf)?,
            Self::ContentType(v)
            | Self::ResponseTopic(v)
            | Self::AssignedClientIdentifier(v)
            | Self::AuthenticationMethod(v)
            | Self::ResponseInformation(v)
            | Self::ServerReference(v)
            | Self::ReasonString(v) => v.encode(buf)?,
            Self::CorrelationData(v) | Self::AuthenticationData(v) => v.encode(buf)?,
            Self::UserProperty(v) => v.encode(buf)?,
        };
        Ok(PropertyType::bytes() + value_bytes)
    }
}

/// A property list: a Variable Byte Integer byte count followed by that many
/// bytes of properties.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Properties {
    props: Vec<Property>,
}

impl Properties {
    /// Create an empty property list.
    #[must_use]
    pub const fn new() -> Self {
        Self { props: Vec::new() }
    }

    /// Get a reference to inner property list.
    #[must_use]
    pub fn props(&self) -> &[Property] {
        &self.props
    }

    /// Append a property.
    pub fn push(&mut self, property: Property) -> &mut Self {
        self.props.push(property);
        self
    }

    /// Returns true if no property is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Get number of properties.
    #[must_use]
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Get byte length in packet, length prefix included.
    #[must_use]
    pub fn bytes(&self) -> usize {
        let payload: usize = self.props.iter().map(Property::bytes).sum();
        let prefix = VarInt::from(payload).map_or(4, |v| v.bytes());
        prefix + payload
    }

    fn first(&self, property_type: PropertyType) -> Option<&Property> {
        self.props
            .iter()
            .find(|p| p.property_type() == property_type)
    }

    #[must_use]
    pub fn session_expiry_interval(&self) -> Option<u32> {
        match self.first(PropertyType::SessionExpiryInterval) {
            Some(Property::SessionExpiryInterval(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn receive_maximum(&self) -> Option<u16> {
        match self.first(PropertyType::ReceiveMaximum) {
            Some(Property::ReceiveMaximum(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn maximum_qos(&self) -> Option<u8> {
        match self.first(PropertyType::MaximumQoS) {
            Some(Property::MaximumQoS(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn retain_available(&self) -> Option<bool> {
        match self.first(PropertyType::RetainAvailable) {
            Some(Property::RetainAvailable(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn maximum_packet_size(&self) -> Option<u32> {
        match self.first(PropertyType::MaximumPacketSize) {
            Some(Property::MaximumPacketSize(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn assigned_client_identifier(&self) -> Option<&str> {
        match self.first(PropertyType::AssignedClientIdentifier) {
            Some(Property::AssignedClientIdentifier(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn topic_alias_maximum(&self) -> Option<u16> {
        match self.first(PropertyType::TopicAliasMaximum) {
            Some(Property::TopicAliasMaximum(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn topic_alias(&self) -> Option<u16> {
        match self.first(PropertyType::TopicAlias) {
            Some(Property::TopicAlias(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn server_keep_alive(&self) -> Option<u16> {
        match self.first(PropertyType::ServerKeepAlive) {
            Some(Property::ServerKeepAlive(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn wildcard_subscription_available(&self) -> Option<bool> {
        match self.first(PropertyType::WildcardSubscriptionAvailable) {
            Some(Property::WildcardSubscriptionAvailable(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn subscription_identifier_available(&self) -> Option<bool> {
        match self.first(PropertyType::SubscriptionIdentifierAvailable) {
            Some(Property::SubscriptionIdentifierAvailable(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn shared_subscription_available(&self) -> Option<bool> {
        match self.first(PropertyType::SharedSubscriptionAvailable) {
            Some(Property::SharedSubscriptionAvailable(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn authentication_method(&self) -> Option<&str> {
        match self.first(PropertyType::AuthenticationMethod) {
            Some(Property::AuthenticationMethod(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn authentication_data(&self) -> Option<&[u8]> {
        match self.first(PropertyType::AuthenticationData) {
            Some(Property::AuthenticationData(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    #[must_use]
    pub fn reason_string(&self) -> Option<&str> {
        match self.first(PropertyType::ReasonString) {
            Some(Property::ReasonString(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn message_expiry_interval(&self) -> Option<u32> {
        match self.first(PropertyType::MessageExpiryInterval) {
            Some(Property::MessageExpiryInterval(v)) => Some(v.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        match self.first(PropertyType::ContentType) {
            Some(Property::ContentType(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn response_topic(&self) -> Option<&str> {
        match self.first(PropertyType::ResponseTopic) {
            Some(Property::ResponseTopic(v)) => Some(v.as_ref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn correlation_data(&self) -> Option<&[u8]> {
        match self.first(PropertyType::CorrelationData) {
            Some(Property::CorrelationData(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Get all subscription identifiers, in packet order.
    #[must_use]
    pub fn subscription_identifiers(&self) -> Vec<usize> {
        self.props
            .iter()
            .filter_map(|p| match p {
                Property::SubscriptionIdentifier(v) => Some(v.value()),
                _ => None,
            })
            .collect()
    }

    /// Get all user properties, in packet order.
    #[must_use]
    pub fn user_properties(&self) -> Vec<(String, String)> {
        self.props
            .iter()
            .filter_map(|p| match p {
                Property::UserProperty(pair) => Some((
                    pair.key().as_ref().to_string(),
                    pair.value().as_ref().to_string(),
                )),
                _ => None,
            })
            .collect()
    }

    /// Append a user property pair.
    ///
    /// # Errors
    ///
    /// Returns error if key or value is not a valid MQTT UTF-8 string.
    pub fn add_user_property(&mut self, key: &str, value: &str) -> Result<&mut Self, EncodeError> {
        let pair = StringPairData::new(key, value)?;
        self.props.push(Property::UserProperty(pair));
        Ok(self)
    }
}

impl DecodePacket for Properties {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let payload_len = VarInt::decode(ba)?.value();
        let end_offset = ba.offset() + payload_len;

        let mut props = Vec::new();
        while ba.offset() < end_offset {
            props.push(Property::decode(ba)?);
        }
        if ba.offset() != end_offset {
            return Err(DecodeError::InvalidRemainingLength);
        }
        Ok(Self { props })
    }
}

impl EncodePacket for Properties {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let payload: usize = self.props.iter().map(Property::bytes).sum();
        VarInt::from(payload)?.encode(buf)?;
        for property in &self.props {
            property.encode(buf)?;
        }
        Ok(buf.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_round_trip() {
        let mut properties = Properties::new();
        properties.push(Property::ReceiveMaximum(U16Data::new(16)));
        properties.push(Property::SessionExpiryInterval(U32Data::new(300)));
        properties.add_user_property("origin", "kestrel").unwrap();
        properties.add_user_property("origin", "second").unwrap();

        let mut buf = Vec::new();
        let written = properties.encode(&mut buf).unwrap();
        assert_eq!(written, properties.bytes());

        let mut ba = ByteArray::new(&buf);
        let decoded = Properties::decode(&mut ba).unwrap();
        assert_eq!(decoded, properties);
        assert_eq!(decoded.receive_maximum(), Some(16));
        assert_eq!(decoded.session_expiry_interval(), Some(300));
        // User property order is preserved.
        assert_eq!(
            decoded.user_properties(),
            vec![
                ("origin".to_string(), "kestrel".to_string()),
                ("origin".to_string(), "second".to_string()),
            ]
        );
    }

    #[test]
    fn test_properties_reject_zero_receive_maximum() {
        // ReceiveMaximum = 0 is a protocol error.
        let buf = [0x03, 0x21, 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert!(Properties::decode(&mut ba).is_err());
    }

    #[test]
    fn test_check_property_type_list() {
        let mut properties = Properties::new();
        properties.push(Property::ReceiveMaximum(U16Data::new(16)));
        properties.push(Property::ReceiveMaximum(U16Data::new(32)));
        assert_eq!(
            check_property_type_list(properties.props(), &[PropertyType::ReceiveMaximum]),
            Err(PropertyType::ReceiveMaximum)
        );

        let mut properties = Properties::new();
        properties.push(Property::TopicAlias(U16Data::new(4)));
        assert_eq!(
            check_property_type_list(properties.props(), &[PropertyType::ReceiveMaximum]),
            Err(PropertyType::TopicAlias)
        );
    }

    #[test]
    fn test_check_multiple_subscription_identifiers() {
        let mut properties = Properties::new();
        properties.push(Property::SubscriptionIdentifier(VarInt::from(1).unwrap()));
        properties.push(Property::SubscriptionIdentifier(VarInt::from(2).unwrap()));
        assert!(check_multiple_subscription_identifiers(properties.props()).is_err());
    }
}

// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use byteorder::{BigEndian, WriteBytesExt};

use crate::property::check_property_type_list;
use crate::topic::PubTopic;
use crate::utils::validate_client_id;
use crate::{
    BinaryData, ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader,
    Packet, PacketType, Properties, PropertyType, ProtocolLevel, QoS, StringData, VarIntError,
    PROTOCOL_NAME,
};

/// Structure of the Connect Flags byte:
///
/// ```txt
///  7               6                5            4 3      2          1              0
/// +---------------+----------------+------------+--------+----------+--------------+----------+
/// | Username Flag | Password Flag  | Will Retain| WillQoS| Will Flag| Clean Start  | Reserved |
/// +---------------+----------------+------------+--------+----------+--------------+----------+
/// ```
///
/// The Server MUST validate that the reserved flag in the CONNECT packet
/// is set to 0 [MQTT-3.1.2-3].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFlags {
    clean_start: bool,
    will: bool,
    will_qos: QoS,
    will_retain: bool,
    has_password: bool,
    has_username: bool,
}

impl ConnectFlags {
    pub fn set_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.clean_start = clean_start;
        self
    }

    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.clean_start
    }

    pub fn set_will(&mut self, will: bool) -> &mut Self {
        self.will = will;
        self
    }

    #[must_use]
    pub const fn will(&self) -> bool {
        self.will
    }

    pub fn set_will_qos(&mut self, qos: QoS) -> &mut Self {
        self.will_qos = qos;
        self
    }

    #[must_use]
    pub const fn will_qos(&self) -> QoS {
        self.will_qos
    }

    pub fn set_will_retain(&mut self, retain: bool) -> &mut Self {
        self.will_retain = retain;
        self
    }

    #[must_use]
    pub const fn will_retain(&self) -> bool {
        self.will_retain
    }

    pub fn set_has_password(&mut self, has_password: bool) -> &mut Self {
        self.has_password = has_password;
        self
    }

    #[must_use]
    pub const fn has_password(&self) -> bool {
        self.has_password
    }

    pub fn set_has_username(&mut self, has_username: bool) -> &mut Self {
        self.has_username = has_username;
        self
    }

    #[must_use]
    pub const fn has_username(&self) -> bool {
        self.has_username
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl DecodePacket for ConnectFlags {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flags = ba.read_byte()?;
        if flags & 0b0000_0001 != 0 {
            return Err(DecodeError::InvalidConnectFlags);
        }

        let clean_start = flags & 0b0000_0010 != 0;
        let will = flags & 0b0000_0100 != 0;
        let will_qos = QoS::try_from((flags & 0b0001_1000) >> 3)?;
        let will_retain = flags & 0b0010_0000 != 0;
        let has_password = flags & 0b0100_0000 != 0;
        let has_username = flags & 0b1000_0000 != 0;

        Ok(Self {
            clean_start,
            will,
            will_qos,
            will_retain,
            has_password,
            has_username,
        })
    }
}

impl EncodePacket for ConnectFlags {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let mut flags = 0_u8;
        if self.clean_start {
            flags |= 0b0000_0010;
        }
        if self.will {
            flags |= 0b0000_0100;
        }
        flags |= (self.will_qos as u8) << 3;
        if self.will_retain {
            flags |= 0b0010_0000;
        }
        if self.has_password {
            flags |= 0b0100_0000;
        }
        if self.has_username {
            flags |= 0b1000_0000;
        }
        buf.push(flags);
        Ok(Self::bytes())
    }
}

/// `ConnectPacket` is the first packet sent to the Server after the network
/// connection is established.
///
/// A Client can only send the CONNECT packet once over a Network Connection
/// [MQTT-3.1.0-2].
///
/// Basic structure of packet:
///
/// ```txt
///  7                          0
/// +----------------------------+
/// | Fixed header               |
/// |                            |
/// +----------------------------+
/// | Protocol name length       |
/// |                            |
/// +----------------------------+
/// | Protocol name ...          |
/// +----------------------------+
/// | Protocol level             |
/// +----------------------------+
/// | Connect flags              |
/// +----------------------------+
/// | Keep alive                 |
/// |                            |
/// +----------------------------+
/// | Properties ...             |
/// +----------------------------+
/// | Client id length           |
/// |                            |
/// +----------------------------+
/// | Client id ...              |
/// +----------------------------+
/// | Will properties ...        |
/// +----------------------------+
/// | Will topic length          |
/// |                            |
/// +----------------------------+
/// | Will topic ...             |
/// +----------------------------+
/// | Will payload length        |
/// |                            |
/// +----------------------------+
/// | Will payload ...           |
/// +----------------------------+
/// | Username length            |
/// |                            |
/// +----------------------------+
/// | Username ...               |
/// +----------------------------+
/// | Password length            |
/// |                            |
/// +----------------------------+
/// | Password ...               |
/// +----------------------------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    /// Protocol name can only be "MQTT".
    protocol_name: StringData,

    protocol_level: ProtocolLevel,

    connect_flags: ConnectFlags,

    /// Maximum time interval in seconds that is permitted to elapse between
    /// two control packets sent by the Client. If Keep Alive is non-zero and
    /// the Client sends nothing else, it MUST send a PINGREQ packet
    /// [MQTT-3.1.2-20]. A value of 0 turns the mechanism off.
    keep_alive: u16,

    properties: Properties,

    /// The Client Identifier MUST be present and is the first field in the
    /// CONNECT packet Payload [MQTT-3.1.3-3].
    client_id: StringData,

    will_properties: Properties,
    will_topic: Option<PubTopic>,
    will_message: BinaryData,

    username: StringData,
    password: BinaryData,
}

/// Properties available in connect packet.
pub const CONNECT_PROPERTIES: &[PropertyType] = &[
    PropertyType::SessionExpiryInterval,
    // The value of Receive Maximum applies only to the current Network
    // Connection [MQTT-3.1.2-36].
    PropertyType::ReceiveMaximum,
    PropertyType::MaximumPacketSize,
    PropertyType::TopicAliasMaximum,
    PropertyType::RequestResponseInformation,
    PropertyType::RequestProblemInformation,
    PropertyType::UserProperty,
    PropertyType::AuthenticationMethod,
    // It is a Protocol Error to include Authentication Data if there is
    // no Authentication Method [MQTT-3.1.2-27].
    PropertyType::AuthenticationData,
];

/// Properties available in the will message block.
pub const CONNECT_WILL_PROPERTIES: &[PropertyType] = &[
    PropertyType::WillDelayInterval,
    PropertyType::PayloadFormatIndicator,
    PropertyType::MessageExpiryInterval,
    PropertyType::ContentType,
    PropertyType::ResponseTopic,
    PropertyType::CorrelationData,
    PropertyType::UserProperty,
];

impl ConnectPacket {
    /// Create a new connect packet with `client_id`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        validate_client_id(client_id).map_err(|_e| EncodeError::InvalidClientId)?;
        let protocol_name = StringData::from(PROTOCOL_NAME)?;
        let client_id = StringData::from(client_id)?;
        Ok(Self {
            protocol_name,
            protocol_level: ProtocolLevel::V5,
            keep_alive: 60,
            client_id,
            ..Self::default()
        })
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    /// Update connect flags.
    pub fn set_connect_flags(&mut self, connect_flags: ConnectFlags) -> &mut Self {
        self.connect_flags = connect_flags;
        self
    }

    #[must_use]
    pub const fn connect_flags(&self) -> ConnectFlags {
        self.connect_flags
    }

    /// Update clean start flag.
    pub fn set_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.connect_flags.set_clean_start(clean_start);
        self
    }

    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.connect_flags.clean_start()
    }

    /// Update keep alive value, in seconds.
    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        self.client_id.as_ref()
    }

    /// Update client id.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn set_client_id(&mut self, client_id: &str) -> Result<&mut Self, EncodeError> {
        validate_client_id(client_id).map_err(|_e| EncodeError::InvalidClientId)?;
        self.client_id = StringData::from(client_id)?;
        Ok(self)
    }

    /// Update username.
    ///
    /// # Errors
    ///
    /// Returns error if `username` is not a valid MQTT UTF-8 string.
    pub fn set_username(&mut self, username: Option<&str>) -> Result<&mut Self, EncodeError> {
        match username {
            Some(username) => {
                self.username = StringData::from(username)?;
                self.connect_flags.set_has_username(true);
            }
            None => {
                self.username = StringData::new();
                self.connect_flags.set_has_username(false);
            }
        }
        Ok(self)
    }

    #[must_use]
    pub fn username(&self) -> &str {
        self.username.as_ref()
    }

    /// Update password.
    ///
    /// # Errors
    ///
    /// Returns error if `password` is longer than 65535 bytes.
    pub fn set_password(&mut self, password: Option<&[u8]>) -> Result<&mut Self, EncodeError> {
        match password {
            Some(password) => {
                self.password = BinaryData::from_slice(password)?;
                self.connect_flags.set_has_password(true);
            }
            None => {
                self.password = BinaryData::new();
                self.connect_flags.set_has_password(false);
            }
        }
        Ok(self)
    }

    #[must_use]
    pub fn password(&self) -> &[u8] {
        self.password.as_slice()
    }

    /// Set the will message carried in the packet payload.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid or `message` is too long.
    pub fn set_will(
        &mut self,
        topic: &str,
        message: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<&mut Self, EncodeError> {
        self.will_topic = Some(PubTopic::new(topic)?);
        self.will_message = BinaryData::from_slice(message)?;
        self.connect_flags.set_will(true);
        self.connect_flags.set_will_qos(qos);
        self.connect_flags.set_will_retain(retain);
        Ok(self)
    }

    #[must_use]
    pub fn will_topic(&self) -> Option<&str> {
        self.will_topic.as_ref().map(AsRef::as_ref)
    }

    #[must_use]
    pub fn will_message(&self) -> &[u8] {
        self.will_message.as_slice()
    }

    /// Get a mutable reference to will property list.
    pub fn will_properties_mut(&mut self) -> &mut Properties {
        &mut self.will_properties
    }

    #[must_use]
    pub const fn will_properties(&self) -> &Properties {
        &self.will_properties
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
        let mut remaining_length = self.protocol_name.bytes()
            + 1
            + ConnectFlags::bytes()
            + 2
            + self.properties.bytes()
            + self.client_id.bytes();

        if self.connect_flags.will() {
            remaining_length += self.will_properties.bytes();
            if let Some(will_topic) = &self.will_topic {
                remaining_length += will_topic.bytes();
            }
            remaining_length += self.will_message.bytes();
        }
        if self.connect_flags.has_username() {
            remaining_length += self.username.bytes();
        }
        if self.connect_flags.has_password() {
            remaining_length += self.password.bytes();
        }

        FixedHeader::new(PacketType::Connect, remaining_length)
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        // The protocol name MUST be the UTF-8 String "MQTT" [MQTT-3.1.2-1].
        let protocol_name = StringData::decode(ba)?;
        if protocol_name.as_ref() != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }

        let protocol_level = ProtocolLevel::try_from(ba.read_byte()?)?;
        if protocol_level != ProtocolLevel::V5 {
            return Err(DecodeError::InvalidProtocolLevel);
        }

        let connect_flags = ConnectFlags::decode(ba)?;
        // If the Will Flag is set to 0, then Will QoS MUST be 0 and Will Retain
        // MUST be 0 [MQTT-3.1.2-11].
        if !connect_flags.will()
            && (connect_flags.will_qos() != QoS::AtMostOnce || connect_flags.will_retain())
        {
            return Err(DecodeError::InvalidConnectFlags);
        }
        // If the User Name Flag is set to 0, the Password Flag MAY still be
        // set in v5; no check between them is required here.

        let keep_alive = ba.read_u16()?;

        let properties = Properties::decode(ba)?;
        if let Err(property_type) = check_property_type_list(properties.props(), CONNECT_PROPERTIES)
        {
            log::error!("ConnectPacket: property type {property_type:?} cannot be used here");
            return Err(DecodeError::InvalidPropertyType);
        }

        let client_id = StringData::decode(ba).map_err(|_err| DecodeError::InvalidClientId)?;
        if client_id.is_empty() && !connect_flags.clean_start() {
            return Err(DecodeError::InvalidClientId);
        }

        let will_properties = if connect_flags.will() {
            let will_properties = Properties::decode(ba)?;
            if let Err(property_type) =
                check_property_type_list(will_properties.props(), CONNECT_WILL_PROPERTIES)
            {
                log::error!(
                    "ConnectPacket: property type {property_type:?} cannot be used in will properties"
                );
                return Err(DecodeError::InvalidPropertyType);
            }
            will_properties
        } else {
            Properties::new()
        };

        let will_topic = if connect_flags.will() {
            Some(PubTopic::decode(ba)?)
        } else {
            None
        };
        let will_message = if connect_flags.will() {
            BinaryData::decode(ba)?
        } else {
            BinaryData::new()
        };

        let username = if connect_flags.has_username() {
            StringData::decode(ba)?
        } else {
            StringData::new()
        };
        let password = if connect_flags.has_password() {
            BinaryData::decode(ba)?
        } else {
            BinaryData::new()
        };

        Ok(Self {
            protocol_name,
            protocol_level,
            connect_flags,
            keep_alive,
            properties,
            client_id,
            will_properties,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        // Write variable header
        self.protocol_name.encode(buf)?;
        self.protocol_level.encode(buf)?;
        self.connect_flags.encode(buf)?;
        buf.write_u16::<BigEndian>(self.keep_alive)?;
        self.properties.encode(buf)?;

        // Write payload
        self.client_id.encode(buf)?;
        if self.connect_flags.will() {
            self.will_properties.encode(buf)?;
            if let Some(will_topic) = &self.will_topic {
                will_topic.encode(buf)?;
            }
            self.will_message.encode(buf)?;
        }
        if self.connect_flags.has_username() {
            self.username.encode(buf)?;
        }
        if self.connect_flags.has_password() {
            self.password.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl Packet for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Property, U16Data};

    #[test]
    fn test_connect_packet_round_trip() {
        let mut packet = ConnectPacket::new("kestrel-1").unwrap();
        packet.set_clean_start(true).set_keep_alive(30);
        packet.set_username(Some("user")).unwrap();
        packet.set_password(Some(b"secret")).unwrap();
        packet
            .properties_mut()
            .push(Property::ReceiveMaximum(U16Data::new(8)));

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.client_id(), "kestrel-1");
        assert_eq!(decoded.keep_alive(), 30);
        assert_eq!(decoded.properties().receive_maximum(), Some(8));
    }

    #[test]
    fn test_connect_packet_with_will() {
        let mut packet = ConnectPacket::new("kestrel-2").unwrap();
        packet
            .set_will("state/kestrel-2", b"offline", QoS::AtLeastOnce, true)
            .unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.will_topic(), Some("state/kestrel-2"));
        assert_eq!(decoded.will_message(), b"offline");
        assert!(decoded.connect_flags().will_retain());
        assert_eq!(decoded.connect_flags().will_qos(), QoS::AtLeastOnce);
    }

    #[test]
    fn test_connect_packet_rejects_bad_client_id() {
        assert!(ConnectPacket::new("contains space").is_err());
    }
}

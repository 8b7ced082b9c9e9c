// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::path::PathBuf;
use std::time::Duration;

use codec::utils::{random_client_id, validate_client_id};
use codec::{
    BinaryData, BoolData, ConnectPacket, Properties, Property, PubTopic, QoS, StringData, U16Data,
    U32Data,
};

use crate::error::{Error, ErrorKind};

/// TLS certificate verification policy.
#[derive(Clone, Debug)]
pub enum TlsType {
    /// Certificate chain is verified against the system web trust roots,
    /// like `Let's Encrypt`.
    CASigned,

    /// Chain is verified against a self signed root certificate generated
    /// with `openssl` or other tools.
    SelfSigned {
        /// Path to the root ca file, in PEM format.
        root_ca_pem: PathBuf,
    },

    /// Accept any certificate without verification.
    ///
    /// Only for testing against local brokers.
    AllowInvalid,
}

#[derive(Clone, Debug)]
pub struct MqttsConnect {
    /// Server name used for SNI and certificate verification.
    pub domain: String,
    pub tls_type: TlsType,
}

/// Transport used to reach the server.
#[derive(Clone, Debug)]
pub enum ConnectType {
    /// Plain TCP.
    Mqtt,

    /// TLS over TCP.
    Mqtts(MqttsConnect),
}

/// Will message stored by the Server and published when the network
/// connection is closed abnormally.
#[derive(Clone, Debug)]
pub struct LastWill {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,

    /// Will properties, like Will Delay Interval or Message Expiry Interval.
    pub properties: Properties,
}

impl LastWill {
    /// Create a new will message.
    #[must_use]
    pub fn new(topic: &str, message: &[u8], qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.to_string(),
            message: message.to_vec(),
            qos,
            retain,
            properties: Properties::new(),
        }
    }
}

/// Client connection configuration.
///
/// Immutable once `connect()` is called.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    host: String,
    port: u16,
    connect_type: ConnectType,
    client_id: String,
    clean_start: bool,
    keep_alive: u16,
    session_expiry_interval: Option<u32>,
    receive_maximum: u16,
    maximum_packet_size: Option<u32>,
    topic_alias_maximum: u16,
    request_response_information: bool,
    request_problem_information: bool,
    username: Option<String>,
    password: Option<Vec<u8>>,
    authentication_method: Option<String>,
    authentication_data: Option<Vec<u8>>,
    last_will: Option<LastWill>,
    user_properties: Vec<(String, String)>,
    connect_timeout: Duration,
    auto_reconnect: bool,
    reconnect_initial_delay: Duration,
    reconnect_max_delay: Duration,
    reconnect_attempt_ceiling: Option<u32>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            connect_type: ConnectType::Mqtt,
            client_id: random_client_id(),
            clean_start: true,
            keep_alive: 60,
            session_expiry_interval: None,
            receive_maximum: u16::MAX,
            maximum_packet_size: None,
            topic_alias_maximum: 0,
            request_response_information: false,
            request_problem_information: true,
            username: None,
            password: None,
            authentication_method: None,
            authentication_data: None,
            last_will: None,
            user_properties: Vec::new(),
            connect_timeout: Duration::from_secs(60),
            auto_reconnect: true,
            reconnect_initial_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_attempt_ceiling: None,
        }
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn set_connect_type(&mut self, connect_type: ConnectType) -> &mut Self {
        self.connect_type = connect_type;
        self
    }

    #[must_use]
    pub const fn connect_type(&self) -> &ConnectType {
        &self.connect_type
    }

    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_string();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.clean_start = clean_start;
        self
    }

    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.clean_start
    }

    /// Update keep alive interval, in seconds.
    ///
    /// Out of range values are clamped; 0 disables the keep alive mechanism.
    pub fn set_keep_alive(&mut self, keep_alive: u64) -> &mut Self {
        self.keep_alive = u16::try_from(keep_alive).unwrap_or(u16::MAX);
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_session_expiry_interval(&mut self, seconds: Option<u32>) -> &mut Self {
        self.session_expiry_interval = seconds;
        self
    }

    #[must_use]
    pub const fn session_expiry_interval(&self) -> Option<u32> {
        self.session_expiry_interval
    }

    /// Update the maximum number of inbound `QoS` 1 and `QoS` 2 publications
    /// the client is willing to process concurrently.
    ///
    /// Zero is invalid and is rejected by [`ConnectOptions::validate`].
    pub fn set_receive_maximum(&mut self, receive_maximum: u16) -> &mut Self {
        self.receive_maximum = receive_maximum;
        self
    }

    #[must_use]
    pub const fn receive_maximum(&self) -> u16 {
        self.receive_maximum
    }

    pub fn set_maximum_packet_size(&mut self, bytes: Option<u32>) -> &mut Self {
        self.maximum_packet_size = bytes;
        self
    }

    #[must_use]
    pub const fn maximum_packet_size(&self) -> Option<u32> {
        self.maximum_packet_size
    }

    pub fn set_topic_alias_maximum(&mut self, topic_alias_maximum: u16) -> &mut Self {
        self.topic_alias_maximum = topic_alias_maximum;
        self
    }

    #[must_use]
    pub const fn topic_alias_maximum(&self) -> u16 {
        self.topic_alias_maximum
    }

    pub fn set_request_response_information(&mut self, request: bool) -> &mut Self {
        self.request_response_information = request;
        self
    }

    #[must_use]
    pub const fn request_response_information(&self) -> bool {
        self.request_response_information
    }

    pub fn set_request_problem_information(&mut self, request: bool) -> &mut Self {
        self.request_problem_information = request;
        self
    }

    #[must_use]
    pub const fn request_problem_information(&self) -> bool {
        self.request_problem_information
    }

    pub fn set_username(&mut self, username: Option<&str>) -> &mut Self {
        self.username = username.map(ToString::to_string);
        self
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn set_password(&mut self, password: Option<&[u8]>) -> &mut Self {
        self.password = password.map(<[u8]>::to_vec);
        self
    }

    pub fn set_authentication_method(&mut self, method: Option<&str>) -> &mut Self {
        self.authentication_method = method.map(ToString::to_string);
        self
    }

    #[must_use]
    pub fn authentication_method(&self) -> Option<&str> {
        self.authentication_method.as_deref()
    }

    pub fn set_authentication_data(&mut self, data: Option<&[u8]>) -> &mut Self {
        self.authentication_data = data.map(<[u8]>::to_vec);
        self
    }

    #[must_use]
    pub fn authentication_data(&self) -> Option<&[u8]> {
        self.authentication_data.as_deref()
    }

    pub fn set_last_will(&mut self, last_will: Option<LastWill>) -> &mut Self {
        self.last_will = last_will;
        self
    }

    #[must_use]
    pub const fn last_will(&self) -> Option<&LastWill> {
        self.last_will.as_ref()
    }

    pub fn add_user_property(&mut self, key: &str, value: &str) -> &mut Self {
        self.user_properties.push((key.to_string(), value.to_string()));
        self
    }

    /// Update the time to wait for the CONNACK packet.
    pub fn set_connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn set_auto_reconnect(&mut self, auto_reconnect: bool) -> &mut Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    #[must_use]
    pub const fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn set_reconnect_initial_delay(&mut self, delay: Duration) -> &mut Self {
        self.reconnect_initial_delay = delay;
        self
    }

    #[must_use]
    pub const fn reconnect_initial_delay(&self) -> Duration {
        self.reconnect_initial_delay
    }

    pub fn set_reconnect_max_delay(&mut self, delay: Duration) -> &mut Self {
        self.reconnect_max_delay = delay;
        self
    }

    #[must_use]
    pub const fn reconnect_max_delay(&self) -> Duration {
        self.reconnect_max_delay
    }

    /// Update maximum number of consecutive reconnect attempts; `None` means
    /// unbounded.
    pub fn set_reconnect_attempt_ceiling(&mut self, ceiling: Option<u32>) -> &mut Self {
        self.reconnect_attempt_ceiling = ceiling;
        self
    }

    #[must_use]
    pub const fn reconnect_attempt_ceiling(&self) -> Option<u32> {
        self.reconnect_attempt_ceiling
    }

    /// Check options before any network activity.
    ///
    /// # Errors
    ///
    /// Returns error if some field is out of its legal range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::new(ErrorKind::Validation, "host must not be empty"));
        }
        if self.receive_maximum == 0 {
            return Err(Error::new(
                ErrorKind::Validation,
                "receive maximum must be in 1..=65535",
            ));
        }
        if validate_client_id(&self.client_id).is_err() {
            return Err(Error::from_string(
                ErrorKind::Validation,
                format!("invalid client id: {}", self.client_id),
            ));
        }
        if let Some(will) = &self.last_will {
            if PubTopic::new(&will.topic).is_err() {
                return Err(Error::from_string(
                    ErrorKind::Validation,
                    format!("invalid will topic: {}", will.topic),
                ));
            }
        }
        if self.authentication_method.is_none() && self.authentication_data.is_some() {
            // [MQTT-3.1.2-27]
            return Err(Error::new(
                ErrorKind::Validation,
                "authentication data requires an authentication method",
            ));
        }
        Ok(())
    }

    /// Build the CONNECT packet described by these options.
    ///
    /// # Errors
    ///
    /// Returns error if some field cannot be encoded.
    pub(crate) fn to_connect_packet(&self) -> Result<ConnectPacket, Error> {
        let mut packet = ConnectPacket::new(&self.client_id)?;
        packet
            .set_clean_start(self.clean_start)
            .set_keep_alive(self.keep_alive);

        let properties = packet.properties_mut();
        if let Some(seconds) = self.session_expiry_interval {
            properties.push(Property::SessionExpiryInterval(U32Data::new(seconds)));
        }
        if self.receive_maximum != u16::MAX {
            properties.push(Property::ReceiveMaximum(U16Data::new(self.receive_maximum)));
        }
        if let Some(bytes) = self.maximum_packet_size {
            properties.push(Property::MaximumPacketSize(U32Data::new(bytes)));
        }
        if self.topic_alias_maximum > 0 {
            properties.push(Property::TopicAliasMaximum(U16Data::new(
                self.topic_alias_maximum,
            )));
        }
        if self.request_response_information {
            properties.push(Property::RequestResponseInformation(BoolData::new(true)));
        }
        if !self.request_problem_information {
            properties.push(Property::RequestProblemInformation(BoolData::new(false)));
        }
        if let Some(method) = &self.authentication_method {
            properties.push(Property::AuthenticationMethod(
                StringData::from(method).map_err(codec::EncodeError::from)?,
            ));
        }
        if let Some(data) = &self.authentication_data {
            properties.push(Property::AuthenticationData(BinaryData::from_slice(data)?));
        }
        for (key, value) in &self.user_properties {
            properties.add_user_property(key, value)?;
        }

        if let Some(will) = &self.last_will {
            packet.set_will(&will.topic, &will.message, will.qos, will.retain)?;
            *packet.will_properties_mut() = will.properties.clone();
        }
        packet.set_username(self.username.as_deref())?;
        packet.set_password(self.password.as_deref())?;

        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_id_is_valid() {
        let options = ConnectOptions::default();
        assert!(validate_client_id(options.client_id()).is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_receive_maximum() {
        let mut options = ConnectOptions::new("localhost", 1883);
        options.set_receive_maximum(0);
        let err = options.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_keep_alive_clamped() {
        let mut options = ConnectOptions::default();
        options.set_keep_alive(1_000_000);
        assert_eq!(options.keep_alive(), u16::MAX);
    }

    #[test]
    fn test_to_connect_packet() {
        let mut options = ConnectOptions::new("localhost", 1883);
        options
            .set_client_id("kestrel-test")
            .set_clean_start(false)
            .set_keep_alive(30)
            .set_receive_maximum(16)
            .set_username(Some("user"));
        let packet = options.to_connect_packet().unwrap();
        assert_eq!(packet.client_id(), "kestrel-test");
        assert!(!packet.clean_start());
        assert_eq!(packet.keep_alive(), 30);
        assert_eq!(packet.properties().receive_maximum(), Some(16));
        assert_eq!(packet.username(), "user");
    }
}

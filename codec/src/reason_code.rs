// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// A Reason Code is a one byte unsigned value that indicates the result of an operation.
///
/// Reason Codes less than 0x80 indicate successful completion of an operation.
/// The normal Reason Code for success is 0. Reason Code values of 0x80 or greater
/// indicate failure.
///
/// The CONNACK, PUBACK, PUBREC, PUBREL, PUBCOMP, DISCONNECT and AUTH Control Packets
/// have a single Reason Code as part of the Variable Header. The SUBACK and UNSUBACK
/// packets contain a list of one or more Reason Codes in the Payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    /// - Success: CONNACK, PUBACK, PUBREC, PUBREL, PUBCOMP, UNSUBACK, AUTH
    /// - Normal disconnection: DISCONNECT
    /// - Granted QoS 0: SUBACK
    #[default]
    Success,

    /// Granted QoS 1: SUBACK
    GrantedQos1,

    /// Granted QoS 2: SUBACK
    GrantedQos2,

    /// Disconnect with Will Message: DISCONNECT
    DisconnectWithWillMessage,

    /// No matching subscribers: PUBACK, PUBREC
    NoMatchingSubscribers,

    /// No subscription existed: UNSUBACK
    NoSubscriptionExisted,

    /// Continue authentication: AUTH
    ContinueAuthentication,

    /// Re-authenticate: AUTH
    ReAuthenticate,

    /// Unspecified error: CONNACK, PUBACK, PUBREC, SUBACK, UNSUBACK, DISCONNECT
    UnspecifiedError,

    /// Malformed Packet: CONNACK, DISCONNECT
    MalformedPacket,

    /// Protocol Error: CONNACK, DISCONNECT
    ProtocolError,

    /// Implementation specific error: CONNACK, PUBACK, PUBREC, SUBACK, UNSUBACK, DISCONNECT
    ImplementationSpecificError,

    /// Unsupported Protocol Version: CONNACK
    UnsupportedProtocolVersion,

    /// Client Identifier not valid: CONNACK
    ClientIdentifierNotValid,

    /// Bad User Name or Password: CONNACK
    BadUserNameOrPassword,

    /// Not authorized: CONNACK, PUBACK, PUBREC, SUBACK, UNSUBACK, DISCONNECT
    NotAuthorized,

    /// Server unavailable: CONNACK
    ServerUnavailable,

    /// Server busy: CONNACK, DISCONNECT
    ServerBusy,

    /// Banned: CONNACK
    Banned,

    /// Server shutting down: DISCONNECT
    ServerShuttingDown,

    /// Bad authentication method: CONNACK, DISCONNECT
    BadAuthenticationMethod,

    /// Keep Alive timeout: DISCONNECT
    KeepAliveTimeout,

    /// Session taken over: DISCONNECT
    SessionTakenOver,

    /// Topic Filter invalid: SUBACK, UNSUBACK, DISCONNECT
    TopicFilterInvalid,

    /// Topic Name invalid: CONNACK, PUBACK, PUBREC, DISCONNECT
    TopicNameInvalid,

    /// Packet Identifier in use: PUBACK, PUBREC, SUBACK, UNSUBACK
    PacketIdentifierInUse,

    /// Packet Identifier not found: PUBREL, PUBCOMP
    PacketIdentifierNotFound,

    /// Receive Maximum exceeded: DISCONNECT
    ReceiveMaximumExceeded,

    /// Topic Alias invalid: DISCONNECT
    TopicAliasInvalid,

    /// Packet too large: CONNACK, DISCONNECT
    PacketTooLarge,

    /// Message rate too high: DISCONNECT
    MessageRateTooHigh,

    /// Quota exceeded: CONNACK, PUBACK, PUBREC, SUBACK, DISCONNECT
    QuotaExceeded,

    /// Administrative action: DISCONNECT
    AdministrativeAction,

    /// Payload format invalid: CONNACK, PUBACK, PUBREC, DISCONNECT
    PayloadFormatInvalid,

    /// Retain not supported: CONNACK, DISCONNECT
    RetainNotSupported,

    /// QoS not supported: CONNACK, DISCONNECT
    QosNotSupported,

    /// Use another server: CONNACK, DISCONNECT
    UseAnotherServer,

    /// Server moved: CONNACK, DISCONNECT
    ServerMoved,

    /// Shared Subscriptions not supported: SUBACK, DISCONNECT
    SharedSubscriptionNotSupported,

    /// Connection rate exceeded: CONNACK, DISCONNECT
    ConnectionRateExceeded,

    /// Maximum connect time: DISCONNECT
    MaximumConnectTime,

    /// Subscription Identifiers not supported: SUBACK, DISCONNECT
    SubscriptionIdentifiersNotSupported,

    /// Wildcard Subscriptions not supported: SUBACK, DISCONNECT
    WildcardSubscriptionsNotSupported,
}

impl ReasonCode {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }

    /// Reason Code values of 0x80 or greater indicate failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        u8::from(*self) >= 0x80
    }
}

impl From<ReasonCode> for u8 {
    fn from(code: ReasonCode) -> Self {
        match code {
            ReasonCode::Success => 0x00,
            ReasonCode::GrantedQos1 => 0x01,
            ReasonCode::GrantedQos2 => 0x02,
            ReasonCode::DisconnectWithWillMessage => 0x04,
            ReasonCode::NoMatchingSubscribers => 0x10,
            ReasonCode::NoSubscriptionExisted => 0x11,
            ReasonCode::ContinueAuthentication => 0x18,
            ReasonCode::ReAuthenticate => 0x19,

            ReasonCode::UnspecifiedError => 0x80,
            ReasonCode::MalformedPacket => 0x81,
            ReasonCode::ProtocolError => 0x82,
            ReasonCode::ImplementationSpecificError => 0x83,
            ReasonCode::UnsupportedProtocolVersion => 0x84,
            ReasonCode::ClientIdentifierNotValid => 0x85,
            ReasonCode::BadUserNameOrPassword => 0x86,
            ReasonCode::NotAuthorized => 0x87,
            ReasonCode::ServerUnavailable => 0x88,
            ReasonCode::ServerBusy => 0x89,
            ReasonCode::Banned => 0x8a,
            ReasonCode::ServerShuttingDown => 0x8b,
            ReasonCode::BadAuthenticationMethod => 0x8c,
            ReasonCode::KeepAliveTimeout => 0x8d,
            ReasonCode::SessionTakenOver => 0x8e,
            ReasonCode::TopicFilterInvalid => 0x8f,
            ReasonCode::TopicNameInvalid => 0x90,
            ReasonCode::PacketIdentifierInUse => 0x91,
            ReasonCode::PacketIdentifierNotFound => 0x92,
            ReasonCode::ReceiveMaximumExceeded => 0x93,
            ReasonCode::TopicAliasInvalid => 0x94,
            ReasonCode::PacketTooLarge => 0x95,
            ReasonCode::MessageRateTooHigh => 0x96,
            ReasonCode::QuotaExceeded => 0x97,
            ReasonCode::AdministrativeAction => 0x98,
            ReasonCode::PayloadFormatInvalid => 0x99,
            ReasonCode::RetainNotSupported => 0x9a,
            ReasonCode::QosNotSupported => 0x9b,
            ReasonCode::UseAnotherServer => 0x9c,
            ReasonCode::ServerMoved => 0x9d,
            ReasonCode::SharedSubscriptionNotSupported => 0x9e,
            ReasonCode::ConnectionRateExceeded => 0x9f,
            ReasonCode::MaximumConnectTime => 0xa0,
            ReasonCode::SubscriptionIdentifiersNotSupported => 0xa1,
            ReasonCode::WildcardSubscriptionsNotSupported => 0xa2,
        }
    }
}

impl TryFrom<u8> for ReasonCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x00 => Ok(Self::Success),
            0x01 => Ok(Self::GrantedQos1),
            0x02 => Ok(Self::GrantedQos2),
            0x04 => Ok(Self::DisconnectWithWillMessage),
            0x10 => Ok(Self::NoMatchingSubscribers),
            0x11 => Ok(Self::NoSubscriptionExisted),
            0x18 => Ok(Self::ContinueAuthentication),
            0x19 => Ok(Self::ReAuthenticate),
            0x80 => Ok(Self::UnspecifiedError),
            0x81 => Ok(Self::MalformedPacket),
            0x82 => Ok(Self::ProtocolError),
            0x83 => Ok(Self::ImplementationSpecificError),
            0x84 => Ok(Self::UnsupportedProtocolVersion),
            0x85 => Ok(Self::ClientIdentifierNotValid),
            0x86 => Ok(Self::BadUserNameOrPassword),
            0x87 => Ok(Self::NotAuthorized),
            0x88 => Ok(Self::ServerUnavailable),
            0x89 => Ok(Self::ServerBusy),
            0x8a => Ok(Self::Banned),
            0x8b => Ok(Self::ServerShuttingDown),
            0x8c => Ok(Self::BadAuthenticationMethod),
            0x8d => Ok(Self::KeepAliveTimeout),
            0x8e => Ok(Self::SessionTakenOver),
            0x8f => Ok(Self::TopicFilterInvalid),
            0x90 => Ok(Self::TopicNameInvalid),
            0x91 => Ok(Self::PacketIdentifierInUse),
            0x92 => Ok(Self::PacketIdentifierNotFound),
            0x93 => Ok(Self::ReceiveMaximumExceeded),
            0x94 => Ok(Self::TopicAliasInvalid),
            0x95 => Ok(Self::PacketTooLarge),
            0x96 => Ok(Self::MessageRateTooHigh),
            0x97 => Ok(Self::QuotaExceeded),
            0x98 => Ok(Self::AdministrativeAction),
            0x99 => Ok(Self::PayloadFormatInvalid),
            0x9a => Ok(Self::RetainNotSupported),
            0x9b => Ok(Self::QosNotSupported),
            0x9c => Ok(Self::UseAnotherServer),
            0x9d => Ok(Self::ServerMoved),
            0x9e => Ok(Self::SharedSubscriptionNotSupported),
            0x9f => Ok(Self::ConnectionRateExceeded),
            0xa0 => Ok(Self::MaximumConnectTime),
            0xa1 => Ok(Self::SubscriptionIdentifiersNotSupported),
            0xa2 => Ok(Self::WildcardSubscriptionsNotSupported),
            _ => Err(DecodeError::InvalidReasonCode),
        }
    }
}

impl DecodePacket for ReasonCode {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let byte = ba.read_byte()?;
        Self::try_from(byte)
    }
}

impl EncodePacket for ReasonCode {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(u8::from(*self));
        Ok(Self::bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_round_trip() {
        for byte in 0x00..=0xa2_u8 {
            if let Ok(code) = ReasonCode::try_from(byte) {
                assert_eq!(u8::from(code), byte);
            }
        }
    }

    #[test]
    fn test_is_error() {
        assert!(!ReasonCode::Success.is_error());
        assert!(!ReasonCode::GrantedQos2.is_error());
        assert!(ReasonCode::UnspecifiedError.is_error());
        assert!(ReasonCode::QuotaExceeded.is_error());
    }
}

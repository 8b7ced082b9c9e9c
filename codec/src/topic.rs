// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Topic names and topic filters, with the matching rules from MQTT 4.7.

use std::fmt;
use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};

use crate::utils::validate_utf8_string;
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Prefix of shared subscription filters [MQTT-4.8.2].
pub const SHARE_PREFIX: &str = "$share/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// Topic or filter is an empty string.
    IsEmpty,

    /// Longer than 65535 bytes, or not a valid MQTT UTF-8 string.
    InvalidString,

    /// Topic name contains `+` or `#` [MQTT-3.3.2-2].
    ContainsWildcard,

    /// `#` is not the last level, `+` is mixed into a level,
    /// or a shared subscription has an empty or wildcard group name.
    InvalidWildcard,
}

impl From<TopicError> for EncodeError {
    fn from(_e: TopicError) -> Self {
        Self::InvalidTopic
    }
}

impl From<TopicError> for DecodeError {
    fn from(_e: TopicError) -> Self {
        Self::InvalidTopic
    }
}

/// A topic name in a publish packet.
///
/// The Topic Name MUST NOT contain wildcard characters [MQTT-3.3.2-2].
/// A zero length topic name is only valid on the wire when a Topic Alias
/// property supplies the real name, so the decode path accepts it while
/// [`PubTopic::new`] does not.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PubTopic(String);

impl PubTopic {
    /// Create a new topic name from a string slice.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is empty, invalid or contains wildcards.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        if topic.is_empty() {
            return Err(TopicError::IsEmpty);
        }
        validate_utf8_string(topic).map_err(|_e| TopicError::InvalidString)?;
        if topic.contains(['+', '#']) {
            return Err(TopicError::ContainsWildcard);
        }
        Ok(Self(topic.to_string()))
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }

    /// Returns true if topic name is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get length of topic name.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        if s.contains(['+', '#']) {
            return Err(DecodeError::InvalidTopic);
        }
        Ok(Self(s))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

/// One level of a parsed topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPart {
    /// Normal level string, may be empty.
    Normal(String),

    /// `+` matches exactly one non-empty level.
    SingleWildcard,

    /// `#` matches any number of trailing levels, including zero.
    /// Only valid as the last level [MQTT-4.7.1-1].
    MultiWildcard,
}

impl TopicPart {
    fn parse(part: &str, is_last: bool) -> Result<Self, TopicError> {
        match part {
            "+" => Ok(Self::SingleWildcard),
            "#" => {
                if is_last {
                    Ok(Self::MultiWildcard)
                } else {
                    Err(TopicError::InvalidWildcard)
                }
            }
            _ => {
                if part.contains(['+', '#']) {
                    Err(TopicError::InvalidWildcard)
                } else {
                    Ok(Self::Normal(part.to_string()))
                }
            }
        }
    }

    const fn is_wildcard(&self) -> bool {
        matches!(self, Self::SingleWildcard | Self::MultiWildcard)
    }
}

/// A topic filter in a subscribe packet.
///
/// Supports the `+` single level wildcard, the `#` multi level wildcard and
/// the `$share/<group>/<filter>` shared subscription form. With a shared
/// subscription, the group part is stripped before matching; the server does
/// the load balancing between group members [MQTT-4.8.2].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubTopic {
    filter: String,
    shared_group: Option<String>,
    parts: Vec<TopicPart>,
}

impl SubTopic {
    /// Parse a topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `filter` violates the wildcard placement rules.
    pub fn parse(filter: &str) -> Result<Self, TopicError> {
        if filter.is_empty() {
            return Err(TopicError::IsEmpty);
        }
        validate_utf8_string(filter).map_err(|_e| TopicError::InvalidString)?;

        let (shared_group, effective) = if let Some(rest) = filter.strip_prefix(SHARE_PREFIX) {
            let Some((group, effective)) = rest.split_once('/') else {
                return Err(TopicError::InvalidWildcard);
            };
            if group.is_empty() || group.contains(['+', '#']) {
                return Err(TopicError::InvalidWildcard);
            }
            if effective.is_empty() {
                return Err(TopicError::IsEmpty);
            }
            (Some(group.to_string()), effective)
        } else {
            (None, filter)
        };

        let levels: Vec<&str> = effective.split('/').collect();
        let last = levels.len() - 1;
        let parts = levels
            .iter()
            .enumerate()
            .map(|(i, part)| TopicPart::parse(part, i == last))
            .collect::<Result<Vec<_>, TopicError>>()?;

        Ok(Self {
            filter: filter.to_string(),
            shared_group,
            parts,
        })
    }

    /// Get the filter string as subscribed, including any `$share` prefix.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Get the group name of a shared subscription.
    #[must_use]
    pub fn shared_group(&self) -> Option<&str> {
        self.shared_group.as_deref()
    }

    /// Returns true if this is a shared subscription filter.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.shared_group.is_some()
    }

    /// Returns true if the filter contains `+` or `#`.
    #[must_use]
    pub fn has_wildcard(&self) -> bool {
        self.parts.iter().any(TopicPart::is_wildcard)
    }

    /// Match a topic name against this filter.
    ///
    /// Topics beginning with `$` are not matched by a filter whose first
    /// level is a wildcard [MQTT-4.7.2-1].
    #[must_use]
    pub fn is_match(&self, topic: &str) -> bool {
        if topic.starts_with('$')
            && matches!(
                self.parts.first(),
                Some(TopicPart::SingleWildcard | TopicPart::MultiWildcard)
            )
        {
            return false;
        }

        let levels: Vec<&str> = topic.split('/').collect();
        let mut i = 0;
        for part in &self.parts {
            match part {
                TopicPart::MultiWildcard => return true,
                TopicPart::SingleWildcard => {
                    if i >= levels.len() || levels[i].is_empty() {
                        return false;
                    }
                    i += 1;
                }
                TopicPart::Normal(s) => {
                    if i >= levels.len() || levels[i] != s {
                        return false;
                    }
                    i += 1;
                }
            }
        }
        i == levels.len()
    }
}

impl fmt::Display for SubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pub_topic_rejects_wildcards() {
        assert!(PubTopic::new("sensor/+/temp").is_err());
        assert!(PubTopic::new("sensor/#").is_err());
        assert!(PubTopic::new("").is_err());
        assert!(PubTopic::new("sensor/kitchen/temp").is_ok());
    }

    #[test]
    fn test_sub_topic_parse() {
        assert!(SubTopic::parse("sensor/+/temp").is_ok());
        assert!(SubTopic::parse("sensor/#").is_ok());
        assert!(SubTopic::parse("#").is_ok());

        // `#` must be the last level.
        assert!(SubTopic::parse("sensor/#/temp").is_err());
        // `+` must occupy a whole level.
        assert!(SubTopic::parse("sensor/temp+").is_err());
        assert!(SubTopic::parse("").is_err());
    }

    #[test]
    fn test_sub_topic_shared() {
        let filter = SubTopic::parse("$share/group-a/sensor/+/temp").unwrap();
        assert!(filter.is_shared());
        assert_eq!(filter.shared_group(), Some("group-a"));
        assert!(filter.is_match("sensor/kitchen/temp"));

        assert!(SubTopic::parse("$share//sensor").is_err());
        assert!(SubTopic::parse("$share/group").is_err());
    }

    #[test]
    fn test_sub_topic_match() {
        let filter = SubTopic::parse("sport/tennis/player1/#").unwrap();
        assert!(filter.is_match("sport/tennis/player1"));
        assert!(filter.is_match("sport/tennis/player1/ranking"));
        assert!(filter.is_match("sport/tennis/player1/score/wimbledon"));
        assert!(!filter.is_match("sport/tennis/player2"));

        let filter = SubTopic::parse("sport/+/player1").unwrap();
        assert!(filter.is_match("sport/tennis/player1"));
        assert!(!filter.is_match("sport/player1"));
        // `+` requires one non-empty level.
        assert!(!filter.is_match("sport//player1"));

        let filter = SubTopic::parse("sport/tennis").unwrap();
        assert!(filter.is_match("sport/tennis"));
        assert!(!filter.is_match("sport/tennis/score"));
    }

    #[test]
    fn test_sub_topic_dollar_topics() {
        let filter = SubTopic::parse("#").unwrap();
        assert!(!filter.is_match("$SYS/broker/load"));

        let filter = SubTopic::parse("+/broker/load").unwrap();
        assert!(!filter.is_match("$SYS/broker/load"));

        let filter = SubTopic::parse("$SYS/broker/+").unwrap();
        assert!(filter.is_match("$SYS/broker/load"));
    }
}

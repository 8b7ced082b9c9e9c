// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// The server MUST allow client ids which are between 1 and 23 UTF-8 encoded
/// bytes in length [MQTT-3.1.3-5].
pub const CLIENT_ID_MAX_LEN: usize = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// Length of string exceeds 65535 bytes.
    TooLong,

    /// Bytes are not well formed UTF-8.
    IllFormed,

    /// String contains the null character U+0000 [MQTT-1.5.4-2].
    ContainsNull,
}

/// Validate a string slice against the MQTT UTF-8 string rules.
///
/// Code points between U+D800 and U+DFFF cannot occur in a rust `&str`,
/// so only the null character and the length limit are checked here.
///
/// # Errors
///
/// Returns error if `s` is too long or contains U+0000.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > u16::MAX as usize {
        return Err(StringError::TooLong);
    }
    if s.contains('\u{0000}') {
        return Err(StringError::ContainsNull);
    }
    Ok(())
}

/// Convert raw bytes into an MQTT UTF-8 string.
///
/// Ill-formed UTF-8, including encodings of UTF-16 surrogates, is rejected
/// [MQTT-1.5.4-1].
///
/// # Errors
///
/// Returns error if bytes are not a valid MQTT UTF-8 string.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = std::str::from_utf8(bytes).map_err(|_e| StringError::IllFormed)?;
    validate_utf8_string(s)?;
    Ok(s.to_string())
}

/// Generate a random alphanumeric string.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a client id from the process id and a random suffix,
/// truncated to 23 bytes.
#[must_use]
pub fn random_client_id() -> String {
    let mut client_id = format!("{}-{}", std::process::id(), random_string(12));
    client_id.truncate(CLIENT_ID_MAX_LEN);
    client_id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    IsEmpty,

    /// Longer than 23 bytes.
    TooLong,

    /// Contains characters outside of `[0-9a-zA-Z_-]`.
    InvalidChars,
}

/// Validate a client id.
///
/// The identifier charset is the one every conformant server is required to
/// accept [MQTT-3.1.3-5], extended with `-` and `_` which are in common use.
///
/// # Errors
///
/// Returns error if `client_id` is empty, too long or contains invalid characters.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.is_empty() {
        return Err(ClientIdError::IsEmpty);
    }
    if client_id.len() > CLIENT_ID_MAX_LEN {
        return Err(ClientIdError::TooLong);
    }
    if !client_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(ClientIdError::InvalidChars);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_string() {
        let s = random_string(8);
        assert_eq!(s.len(), 8);
        assert!(s.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_random_client_id() {
        let client_id = random_client_id();
        assert!(!client_id.is_empty());
        assert!(client_id.len() <= CLIENT_ID_MAX_LEN);
        assert!(validate_client_id(&client_id).is_ok());
    }

    #[test]
    fn test_validate_utf8_string() {
        assert!(validate_utf8_string("sensor/kitchen").is_ok());
        assert_eq!(
            validate_utf8_string("a\u{0000}b"),
            Err(StringError::ContainsNull)
        );
    }

    #[test]
    fn test_validate_client_id() {
        assert!(validate_client_id("node-42_a").is_ok());
        assert_eq!(validate_client_id(""), Err(ClientIdError::IsEmpty));
        assert_eq!(
            validate_client_id("abcdefghijklmnopqrstuvwxyz"),
            Err(ClientIdError::TooLong)
        );
        assert_eq!(
            validate_client_id("bad id"),
            Err(ClientIdError::InvalidChars)
        );
    }
}

// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

use codec::{DecodeError, EncodeError, ReasonCode};

/// Represent the types of errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// DNS, socket connect, read, write or TLS failure.
    Transport,

    /// Peer violated the protocol; the connection is closed with
    /// a DISCONNECT packet carrying the matching reason code.
    Protocol,

    /// The server answered an operation with a reason code >= 0x80.
    BrokerRefusal,

    /// Local in-flight window is exhausted.
    QuotaExceeded,

    /// Operation was canceled through its cancel token.
    Canceled,

    /// Operation did not finish within its timeout.
    Timeout,

    /// A session resume was expected but the server started a fresh session.
    SessionLost,

    /// Caller supplied arguments are invalid; nothing was sent.
    Validation,

    /// Packet encode error.
    Encode,

    /// Packet decode error.
    Decode,

    /// Internal channel error, the connection task is gone.
    Channel,

    /// Operation requires an established connection.
    NotConnected,
}

/// Error type of this client.
#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,

    /// Reason code attached to broker refusals.
    reason_code: Option<ReasonCode>,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
            reason_code: None,
        }
    }

    #[must_use]
    pub const fn from_string(kind: ErrorKind, message: String) -> Self {
        Self {
            kind,
            message,
            reason_code: None,
        }
    }

    /// Create a broker refusal error carrying `reason_code`.
    #[must_use]
    pub fn refused(reason_code: ReasonCode, message: &str) -> Self {
        Self {
            kind: ErrorKind::BrokerRefusal,
            message: message.to_owned(),
            reason_code: Some(reason_code),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub const fn reason_code(&self) -> Option<ReasonCode> {
        self.reason_code
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::Transport, format!("IoError {err}"))
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Self::from_string(ErrorKind::Decode, format!("Decode error {err:?}"))
    }
}

impl From<EncodeError> for Error {
    fn from(err: EncodeError) -> Self {
        Self::from_string(ErrorKind::Encode, format!("Encode error {err:?}"))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorKind::Timeout, "Operation timed out")
    }
}

//! Error types for the EtherNet/IP client.
//!
//! Errors are layered the same way the client is:
//!
//! | Type | Raised by | Meaning |
//! |------|-----------|---------|
//! | [`ConnectionError`] | [`Session::open`] | the registration handshake failed |
//! | [`TransportError`] | [`Session::send_request`] | one exchange failed |
//! | [`DecodeError`] | [`codec`](crate::codec) | bytes and types do not agree |
//! | [`OperationError`] | [`Executor`], [`Client`] | a tag operation failed |
//!
//! [`Session::open`]: crate::Session::open
//! [`Session::send_request`]: crate::Session::send_request
//! [`Executor`]: crate::Executor
//! [`Client`]: crate::Client
//!
//! All error types are `Clone` so that batch results and subscription events
//! can carry them.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for tag operations.
pub type Result<T, E = OperationError> = std::result::Result<T, E>;

/// Errors raised while opening a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ConnectionError {
    /// The controller did not complete the handshake in time.
    #[error("connection to {address} timed out after {timeout:?}")]
    Timeout {
        /// Controller address.
        address: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// The TCP connection was refused or could not be established.
    #[error("connection to {address} refused: {reason}")]
    Refused {
        /// Controller address.
        address: String,
        /// Description of the failure.
        reason: String,
    },

    /// The peer answered, but not with a valid RegisterSession reply.
    #[error("protocol mismatch: {reason}")]
    ProtocolMismatch {
        /// Description of the mismatch.
        reason: String,
    },

    /// The controller address could not be parsed or resolved.
    #[error("invalid controller address '{address}': {reason}")]
    InvalidAddress {
        /// Address as given by the caller.
        address: String,
        /// Description of the problem.
        reason: String,
    },
}

impl ConnectionError {
    /// Creates a new `Refused` error.
    pub fn refused(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Refused {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `ProtocolMismatch` error.
    ///
    /// # Example
    ///
    /// ```
    /// use enip::ConnectionError;
    ///
    /// let err = ConnectionError::protocol_mismatch("unexpected command 0x0066");
    /// assert_eq!(err.to_string(), "protocol mismatch: unexpected command 0x0066");
    /// ```
    pub fn protocol_mismatch(reason: impl Into<String>) -> Self {
        Self::ProtocolMismatch {
            reason: reason.into(),
        }
    }
}

/// Errors raised by a single request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TransportError {
    /// The session is not connected, or was lost during the exchange.
    #[error("session is disconnected")]
    Disconnected,

    /// No matching response arrived in time.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The response could not be parsed as a well-formed frame.
    #[error("malformed response: {reason}")]
    Malformed {
        /// Description of the parse failure.
        reason: String,
    },
}

impl TransportError {
    /// Creates a new `Malformed` error.
    ///
    /// # Example
    ///
    /// ```
    /// use enip::TransportError;
    ///
    /// let err = TransportError::malformed("CPF item count is zero");
    /// assert_eq!(err.to_string(), "malformed response: CPF item count is zero");
    /// ```
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Errors raised while converting between bytes and [`TaggedValue`](crate::TaggedValue)s.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DecodeError {
    /// Too few bytes for the declared type.
    #[error("truncated {data_type}: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Name of the type being decoded.
        data_type: String,
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The value or bytes do not match the expected type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type.
        expected: String,
        /// Type found.
        actual: String,
    },

    /// The bytes have the right shape but hold an invalid value.
    #[error("invalid value: {reason}")]
    InvalidValue {
        /// Description of the problem.
        reason: String,
    },
}

impl DecodeError {
    /// Creates a new `Truncated` error.
    pub fn truncated(data_type: impl ToString, expected: usize, actual: usize) -> Self {
        Self::Truncated {
            data_type: data_type.to_string(),
            expected,
            actual,
        }
    }

    /// Creates a new `TypeMismatch` error.
    ///
    /// # Example
    ///
    /// ```
    /// use enip::DecodeError;
    ///
    /// let err = DecodeError::type_mismatch("DINT", "LINT");
    /// assert_eq!(err.to_string(), "type mismatch: expected DINT, got LINT");
    /// ```
    pub fn type_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        Self::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Creates a new `InvalidValue` error.
    pub fn invalid_value(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }
}

/// Errors raised by tag operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum OperationError {
    /// The session is disconnected; an explicit reconnect is required.
    #[error("session lost")]
    SessionLost,

    /// The address is malformed, unknown to the controller, or names a
    /// member that the composite does not have.
    #[error("address not found: '{address}' ({reason})")]
    AddressNotFound {
        /// Address as given by the caller.
        address: String,
        /// Description of why it could not be resolved.
        reason: String,
    },

    /// The request/response exchange failed.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// The value could not be encoded or decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The controller answered with a CIP error status.
    #[error(
        "controller rejected request: CIP status 0x{status:02X} ({})",
        cip_status_description(*status)
    )]
    Rejected {
        /// CIP general status.
        status: u8,
        /// First extended status word, if any.
        extended: Option<u16>,
    },

    /// A caller-supplied parameter is out of range.
    #[error("invalid parameter '{parameter}': {reason}")]
    InvalidArgument {
        /// Parameter name.
        parameter: String,
        /// Description of why it is invalid.
        reason: String,
    },
}

impl OperationError {
    /// Creates a new `AddressNotFound` error.
    ///
    /// # Example
    ///
    /// ```
    /// use enip::OperationError;
    ///
    /// let err = OperationError::address_not_found("Motor.Speed", "no member 'Speed'");
    /// assert_eq!(err.to_string(), "address not found: 'Motor.Speed' (no member 'Speed')");
    /// ```
    pub fn address_not_found(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AddressNotFound {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `Rejected` error.
    pub fn rejected(status: u8, extended: Option<u16>) -> Self {
        Self::Rejected { status, extended }
    }

    /// Creates a new `InvalidArgument` error.
    pub fn invalid_argument(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error means the session is gone.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::SessionLost)
    }
}

impl From<TransportError> for OperationError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => Self::SessionLost,
            other => Self::Transport(other),
        }
    }
}

/// Returns a human-readable description of a CIP general status code.
///
/// # Example
///
/// ```
/// use enip::cip_status_description;
///
/// assert_eq!(cip_status_description(0x05), "Path destination unknown");
/// assert_eq!(cip_status_description(0x99), "Unknown CIP status");
/// ```
pub fn cip_status_description(status: u8) -> &'static str {
    match status {
        0x00 => "Success",
        0x01 => "Connection failure",
        0x02 => "Resource unavailable",
        0x03 => "Invalid parameter value",
        0x04 => "Path segment error",
        0x05 => "Path destination unknown",
        0x06 => "Partial transfer",
        0x07 => "Connection lost",
        0x08 => "Service not supported",
        0x09 => "Invalid attribute value",
        0x0A => "Attribute list error",
        0x0B => "Already in requested mode/state",
        0x0C => "Object state conflict",
        0x0D => "Object already exists",
        0x0E => "Attribute not settable",
        0x0F => "Privilege violation",
        0x10 => "Device state conflict",
        0x11 => "Reply data too large",
        0x12 => "Fragmentation of a primitive value",
        0x13 => "Not enough data",
        0x14 => "Attribute not supported",
        0x15 => "Too much data",
        0x16 => "Object does not exist",
        0x17 => "Service fragmentation sequence not in progress",
        0x18 => "No stored attribute data",
        0x19 => "Store operation failure",
        0x1A => "Routing failure, request packet too large",
        0x1B => "Routing failure, response packet too large",
        0x1C => "Missing attribute list entry data",
        0x1D => "Invalid attribute value list",
        0x1E => "Embedded service error",
        0x1F => "Vendor specific error",
        0x20 => "Invalid parameter",
        0x26 => "Path size invalid",
        0xFF => "General error (see extended status)",
        _ => "Unknown CIP status",
    }
}

/// Returns a human-readable description of an encapsulation status code.
pub fn encapsulation_status_description(status: u32) -> &'static str {
    match status {
        0x0000 => "Success",
        0x0001 => "Invalid or unsupported command",
        0x0002 => "Insufficient memory",
        0x0003 => "Incorrect data",
        0x0064 => "Invalid session handle",
        0x0065 => "Invalid length",
        0x0069 => "Unsupported protocol revision",
        _ => "Unknown encapsulation status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_display() {
        let err = OperationError::rejected(0x0F, None);
        assert_eq!(
            err.to_string(),
            "controller rejected request: CIP status 0x0F (Privilege violation)"
        );
    }

    #[test]
    fn test_disconnected_becomes_session_lost() {
        let err: OperationError = TransportError::Disconnected.into();
        assert!(err.is_session_lost());

        let err: OperationError = TransportError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(
            err,
            OperationError::Transport(TransportError::Timeout(Duration::from_secs(1)))
        );
    }

    #[test]
    fn test_truncated_display() {
        let err = DecodeError::truncated("DINT", 4, 2);
        assert_eq!(err.to_string(), "truncated DINT: expected 4 bytes, got 2");
    }

    #[test]
    fn test_connection_timeout_display() {
        let err = ConnectionError::Timeout {
            address: "10.0.0.5:44818".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "connection to 10.0.0.5:44818 timed out after 250ms"
        );
    }

    #[test]
    fn test_encapsulation_status_description() {
        assert_eq!(encapsulation_status_description(0x64), "Invalid session handle");
        assert_eq!(
            encapsulation_status_description(0x1234),
            "Unknown encapsulation status"
        );
    }
}

//! CIP reply parsing and status mapping.
//!
//! A SendRRData reply carries the CIP reply inside its unconnected data item:
//!
//! | Component | Size | Description |
//! |-----------|------|-------------|
//! | Service | 1 byte | Request service with bit 7 set (`0xCC` for Read Tag) |
//! | Reserved | 1 byte | Always 0x00 |
//! | General status | 1 byte | 0x00 = success |
//! | Extended status size | 1 byte | Number of 16-bit extended status words |
//! | Extended status | 2 × size bytes | Vendor/object specific detail |
//! | Data | Variable | Reply data (type descriptor + value for Read Tag) |
//!
//! # Example
//!
//! ```
//! use enip::CipResponse;
//!
//! let reply = [0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00];
//! let response = CipResponse::from_bytes(&reply).unwrap();
//! assert!(response.is_success());
//! assert_eq!(response.data, [0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00]);
//! ```

use crate::command::{ITEM_UNCONNECTED_DATA, SERVICE_REPLY_MASK};
use crate::error::{DecodeError, OperationError, TransportError};

/// Minimum CIP reply size: service, reserved, status, extended size.
pub const MIN_RESPONSE_SIZE: usize = 4;

/// CIP general status: success.
pub const STATUS_SUCCESS: u8 = 0x00;
/// CIP general status: path segment error.
pub const STATUS_PATH_SEGMENT_ERROR: u8 = 0x04;
/// CIP general status: path destination unknown.
pub const STATUS_PATH_DESTINATION_UNKNOWN: u8 = 0x05;
/// CIP general status: object does not exist.
pub const STATUS_OBJECT_DOES_NOT_EXIST: u8 = 0x16;
/// CIP general status: general error, see extended status.
pub const STATUS_GENERAL_ERROR: u8 = 0xFF;
/// Logix extended status: data type used in the request does not match the tag.
pub const EXTENDED_TYPE_MISMATCH: u16 = 0x2107;

/// Parsed CIP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipResponse {
    /// Reply service code (request service | 0x80).
    pub service: u8,
    /// General status.
    pub status: u8,
    /// Extended status words.
    pub extended: Vec<u16>,
    /// Reply data following the status.
    pub data: Vec<u8>,
}

impl CipResponse {
    /// Parses a CIP reply.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Malformed` if the reply is shorter than its
    /// status block claims.
    pub fn from_bytes(reply: &[u8]) -> Result<Self, TransportError> {
        if reply.len() < MIN_RESPONSE_SIZE {
            return Err(TransportError::malformed(format!(
                "CIP reply too short: expected at least {} bytes, got {}",
                MIN_RESPONSE_SIZE,
                reply.len()
            )));
        }
        if reply[0] & SERVICE_REPLY_MASK == 0 {
            return Err(TransportError::malformed(format!(
                "service 0x{:02X} is not a reply",
                reply[0]
            )));
        }

        let extended_words = usize::from(reply[3]);
        let data_start = MIN_RESPONSE_SIZE + extended_words * 2;
        if reply.len() < data_start {
            return Err(TransportError::malformed(format!(
                "CIP reply declares {extended_words} extended status words but has {} bytes",
                reply.len()
            )));
        }
        let extended = reply[MIN_RESPONSE_SIZE..data_start]
            .chunks_exact(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
            .collect();

        Ok(Self {
            service: reply[0],
            status: reply[2],
            extended,
            data: reply[data_start..].to_vec(),
        })
    }

    /// Returns whether the general status is success.
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    /// Checks that this is the reply to `request_service`.
    pub fn check_service(&self, request_service: u8) -> Result<(), TransportError> {
        let expected = request_service | SERVICE_REPLY_MASK;
        if self.service == expected {
            Ok(())
        } else {
            Err(TransportError::malformed(format!(
                "expected reply service 0x{expected:02X}, got 0x{:02X}",
                self.service
            )))
        }
    }

    /// Maps a non-success status to the operation error it stands for.
    ///
    /// # Example
    ///
    /// ```
    /// use enip::{CipResponse, OperationError};
    ///
    /// let reply = CipResponse::from_bytes(&[0xCC, 0x00, 0x05, 0x00]).unwrap();
    /// let err = reply.check_status("NoSuchTag").unwrap_err();
    /// assert!(matches!(err, OperationError::AddressNotFound { .. }));
    /// ```
    pub fn check_status(&self, address: &str) -> Result<(), OperationError> {
        match self.status {
            STATUS_SUCCESS => Ok(()),
            STATUS_PATH_SEGMENT_ERROR
            | STATUS_PATH_DESTINATION_UNKNOWN
            | STATUS_OBJECT_DOES_NOT_EXIST => Err(OperationError::address_not_found(
                address,
                crate::error::cip_status_description(self.status),
            )),
            STATUS_GENERAL_ERROR if self.extended.first() == Some(&EXTENDED_TYPE_MISMATCH) => {
                Err(DecodeError::type_mismatch(
                    format!("native type of '{address}'"),
                    "type in request",
                )
                .into())
            }
            status => Err(OperationError::rejected(status, self.extended.first().copied())),
        }
    }
}

/// Extracts the CIP reply from SendRRData reply data.
///
/// Walks the CPF item list and returns the contents of the first
/// unconnected data item.
///
/// # Errors
///
/// Returns `TransportError::Malformed` if the item list is truncated or has
/// no unconnected data item.
pub fn extract_cip(data: &[u8]) -> Result<Vec<u8>, TransportError> {
    // interface handle (4) + timeout (2)
    let mut pos = 6;
    let count = read_u16(data, pos)?;
    pos += 2;

    for _ in 0..count {
        let item_type = read_u16(data, pos)?;
        let length = usize::from(read_u16(data, pos + 2)?);
        pos += 4;
        let body = data.get(pos..pos + length).ok_or_else(|| {
            TransportError::malformed(format!(
                "CPF item 0x{item_type:04X} of {length} bytes exceeds reply"
            ))
        })?;
        if item_type == ITEM_UNCONNECTED_DATA {
            return Ok(body.to_vec());
        }
        pos += length;
    }

    Err(TransportError::malformed("no unconnected data item in reply"))
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16, TransportError> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| TransportError::malformed("CPF item list truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::send_rr_data;

    #[test]
    fn test_response_with_extended_status() {
        let reply = [0xCD, 0x00, 0xFF, 0x01, 0x07, 0x21];
        let response = CipResponse::from_bytes(&reply).unwrap();
        assert_eq!(response.extended, vec![EXTENDED_TYPE_MISMATCH]);
        assert!(response.data.is_empty());
        assert!(matches!(
            response.check_status("Tag"),
            Err(OperationError::Decode(DecodeError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_response_too_short() {
        assert!(CipResponse::from_bytes(&[0xCC, 0x00]).is_err());
        // claims two extended words, has one
        assert!(CipResponse::from_bytes(&[0xCC, 0x00, 0xFF, 0x02, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_request_is_not_a_reply() {
        assert!(CipResponse::from_bytes(&[0x4C, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_check_service() {
        let response = CipResponse::from_bytes(&[0xCC, 0x00, 0x00, 0x00]).unwrap();
        assert!(response.check_service(0x4C).is_ok());
        assert!(response.check_service(0x4D).is_err());
    }

    #[test]
    fn test_status_mapping() {
        for status in [0x04, 0x05, 0x16] {
            let response = CipResponse::from_bytes(&[0xCC, 0x00, status, 0x00]).unwrap();
            assert!(matches!(
                response.check_status("Missing"),
                Err(OperationError::AddressNotFound { .. })
            ));
        }

        let response = CipResponse::from_bytes(&[0xCD, 0x00, 0x0F, 0x00]).unwrap();
        assert_eq!(
            response.check_status("Locked"),
            Err(OperationError::rejected(0x0F, None))
        );

        let response = CipResponse::from_bytes(&[0xCD, 0x00, 0xFF, 0x01, 0x05, 0x21]).unwrap();
        assert_eq!(
            response.check_status("Tag"),
            Err(OperationError::rejected(0xFF, Some(0x2105)))
        );
    }

    #[test]
    fn test_extract_cip() {
        let data = send_rr_data(&[0xCC, 0x00, 0x00, 0x00]);
        assert_eq!(extract_cip(&data).unwrap(), [0xCC, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_extract_cip_malformed() {
        assert!(extract_cip(&[0; 6]).is_err());

        let mut data = send_rr_data(&[0xCC, 0x00, 0x00, 0x00]);
        data.truncate(data.len() - 2);
        assert!(extract_cip(&data).is_err());

        // only a null address item
        let data = hex::decode("000000000000010000000000").unwrap();
        assert!(extract_cip(&data).is_err());
    }
}

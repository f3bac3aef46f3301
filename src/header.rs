//! EtherNet/IP encapsulation header.
//!
//! Every frame exchanged with the controller over TCP starts with a 24-byte
//! encapsulation header, followed by `length` bytes of command data:
//!
//! | Offset | Size | Field | Description |
//! |--------|------|-------|-------------|
//! | 0 | 2 | Command | Encapsulation command code |
//! | 2 | 2 | Length | Length of the data that follows the header |
//! | 4 | 4 | Session handle | Issued by the controller on RegisterSession |
//! | 8 | 4 | Status | 0 on success |
//! | 12 | 8 | Sender context | Echoed unchanged in the reply |
//! | 20 | 4 | Options | Always 0 |
//!
//! All fields are little-endian.
//!
//! # Example
//!
//! ```
//! use enip::{EncapsulationHeader, COMMAND_SEND_RR_DATA};
//!
//! let header = EncapsulationHeader::new(COMMAND_SEND_RR_DATA, 0x1234_5678, 16, 7);
//! let bytes = header.to_bytes();
//! assert_eq!(bytes.len(), 24);
//! assert_eq!(EncapsulationHeader::from_bytes(&bytes).unwrap(), header);
//! ```

use crate::error::TransportError;

/// Encapsulation header size in bytes.
pub const ENCAPSULATION_HEADER_SIZE: usize = 24;

/// NOP: no reply is sent. Used as the keepalive.
pub const COMMAND_NOP: u16 = 0x0000;
/// RegisterSession: opens a session and returns its handle.
pub const COMMAND_REGISTER_SESSION: u16 = 0x0065;
/// UnRegisterSession: closes a session. No reply is sent.
pub const COMMAND_UNREGISTER_SESSION: u16 = 0x0066;
/// SendRRData: carries an unconnected CIP request or reply.
pub const COMMAND_SEND_RR_DATA: u16 = 0x006F;

/// Encapsulation status reported when the session handle is not recognised.
pub const STATUS_INVALID_SESSION: u32 = 0x0064;

/// EtherNet/IP encapsulation header (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapsulationHeader {
    /// Encapsulation command code.
    pub command: u16,
    /// Length of the data following the header.
    pub length: u16,
    /// Session handle (0 before registration).
    pub session_handle: u32,
    /// Encapsulation status (0 = success).
    pub status: u32,
    /// Opaque request identifier echoed by the controller.
    pub sender_context: u64,
    /// Options (always 0).
    pub options: u32,
}

impl EncapsulationHeader {
    /// Creates a request header with zero status and options.
    pub fn new(command: u16, session_handle: u32, length: u16, sender_context: u64) -> Self {
        Self {
            command,
            length,
            session_handle,
            status: 0,
            sender_context,
            options: 0,
        }
    }

    /// Serializes the header.
    pub fn to_bytes(self) -> [u8; ENCAPSULATION_HEADER_SIZE] {
        let mut out = [0u8; ENCAPSULATION_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.command.to_le_bytes());
        out[2..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..8].copy_from_slice(&self.session_handle.to_le_bytes());
        out[8..12].copy_from_slice(&self.status.to_le_bytes());
        out[12..20].copy_from_slice(&self.sender_context.to_le_bytes());
        out[20..24].copy_from_slice(&self.options.to_le_bytes());
        out
    }

    /// Parses a header from the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Malformed` if the slice is too short.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < ENCAPSULATION_HEADER_SIZE {
            return Err(TransportError::malformed(format!(
                "encapsulation header too short: expected {} bytes, got {}",
                ENCAPSULATION_HEADER_SIZE,
                data.len()
            )));
        }

        let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
        let u32_at =
            |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let mut context = [0u8; 8];
        context.copy_from_slice(&data[12..20]);

        Ok(Self {
            command: u16_at(0),
            length: u16_at(2),
            session_handle: u32_at(4),
            status: u32_at(8),
            sender_context: u64::from_le_bytes(context),
            options: u32_at(20),
        })
    }
}

/// Builds a complete frame: header followed by `data`.
///
/// `data` must fit the 16-bit length field; callers check this against
/// [`MAX_ENCAPSULATION_LENGTH`](crate::MAX_ENCAPSULATION_LENGTH) first.
pub fn frame(command: u16, session_handle: u32, sender_context: u64, data: &[u8]) -> Vec<u8> {
    let length = u16::try_from(data.len()).unwrap_or(u16::MAX);
    let header = EncapsulationHeader::new(command, session_handle, length, sender_context);
    let mut out = Vec::with_capacity(ENCAPSULATION_HEADER_SIZE + data.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(data);
    out
}

/// RegisterSession data: protocol version 1, options 0.
pub fn register_session_data() -> [u8; 4] {
    [0x01, 0x00, 0x00, 0x00]
}

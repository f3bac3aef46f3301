//! CIP request structures and serialization.
//!
//! Each request type serializes itself to the bytes of one CIP message. The
//! [`Session`](crate::Session) then wraps those bytes in the encapsulation
//! layers:
//!
//! ```text
//! EncapsulationHeader (SendRRData)
//! └─ send_rr_data: interface handle, timeout, CPF items
//!    ├─ Null address item
//!    └─ Unconnected data item
//!       └─ [UnconnectedSend, when routed]
//!          └─ ReadTagCommand / WriteTagCommand
//! ```
//!
//! # Example
//!
//! ```
//! use enip::{ReadTagCommand, TagAddress};
//!
//! let addr = TagAddress::parse("Counter").unwrap();
//! let cmd = ReadTagCommand::new(&addr);
//! assert_eq!(cmd.to_bytes()[0], 0x4C);
//! ```

use std::time::Duration;

use crate::address::TagAddress;
use crate::codec::WireType;
use crate::error::OperationError;

/// CIP Read Tag service.
pub const SERVICE_READ_TAG: u8 = 0x4C;
/// CIP Write Tag service.
pub const SERVICE_WRITE_TAG: u8 = 0x4D;
/// CIP Unconnected Send service (Connection Manager).
pub const SERVICE_UNCONNECTED_SEND: u8 = 0x52;
/// Bit set in a service code to mark a reply.
pub const SERVICE_REPLY_MASK: u8 = 0x80;

/// CPF null address item type.
pub const ITEM_NULL_ADDRESS: u16 = 0x0000;
/// CPF unconnected data item type.
pub const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;

/// Connection Manager path: class 0x06, instance 1.
const CONNECTION_MANAGER_PATH: [u8; 4] = [0x20, 0x06, 0x24, 0x01];
/// Priority/time tick byte: normal priority, 1024 ms per tick.
const PRIORITY_TIME_TICK: u8 = 0x0A;
const TICK_MILLIS: u128 = 1024;
/// Port segment for the backplane.
const DEFAULT_BACKPLANE_PORT: u8 = 0x01;

/// Route from the Ethernet module to the controller through a chassis.
///
/// Chassis-based controllers (ControlLogix) are reached through the Ethernet
/// module's backplane port and the controller's slot. Compact controllers
/// need no route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoutePath {
    /// Port number on the module (1 = backplane).
    pub port: u8,
    /// Slot or link address on that port.
    pub slot: u8,
}

impl RoutePath {
    /// Route through the backplane to `slot`.
    ///
    /// # Example
    ///
    /// ```
    /// use enip::RoutePath;
    ///
    /// let route = RoutePath::backplane(0);
    /// assert_eq!(route.port, 1);
    /// assert_eq!(route.to_bytes(), [0x01, 0x00]);
    /// ```
    pub fn backplane(slot: u8) -> Self {
        Self {
            port: DEFAULT_BACKPLANE_PORT,
            slot,
        }
    }

    /// Encodes the route as a port segment.
    pub fn to_bytes(self) -> [u8; 2] {
        [self.port, self.slot]
    }
}

/// Read Tag request for one element.
#[derive(Debug, Clone)]
pub struct ReadTagCommand {
    path: Vec<u8>,
    elements: u16,
}

impl ReadTagCommand {
    /// Creates a request reading one element of `address`.
    pub fn new(address: &TagAddress) -> Self {
        Self {
            path: address.to_path(),
            elements: 1,
        }
    }

    /// Serializes the request.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.path.len());
        out.push(SERVICE_READ_TAG);
        push_path(&mut out, &self.path);
        out.extend_from_slice(&self.elements.to_le_bytes());
        out
    }
}

/// Write Tag request for one element.
#[derive(Debug, Clone)]
pub struct WriteTagCommand {
    path: Vec<u8>,
    wire_type: WireType,
    elements: u16,
    data: Vec<u8>,
}

impl WriteTagCommand {
    /// Creates a request writing already-encoded `data` of `wire_type`.
    pub fn new(address: &TagAddress, wire_type: WireType, data: Vec<u8>) -> Self {
        Self {
            path: address.to_path(),
            wire_type,
            elements: 1,
            data,
        }
    }

    /// Serializes the request.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.path.len() + self.data.len());
        out.push(SERVICE_WRITE_TAG);
        push_path(&mut out, &self.path);
        out.extend_from_slice(&self.wire_type.to_bytes());
        out.extend_from_slice(&self.elements.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Unconnected Send wrapper that routes a message through a chassis.
#[derive(Debug, Clone)]
pub struct UnconnectedSend<'a> {
    message: &'a [u8],
    route: RoutePath,
    timeout_ticks: u8,
}

impl<'a> UnconnectedSend<'a> {
    /// Wraps `message` for delivery along `route`.
    ///
    /// # Errors
    ///
    /// Returns `OperationError::InvalidArgument` if the message is longer than
    /// the 16-bit length field allows.
    pub fn new(
        message: &'a [u8],
        route: RoutePath,
        timeout: Duration,
    ) -> Result<Self, OperationError> {
        if message.len() > usize::from(u16::MAX) {
            return Err(OperationError::invalid_argument(
                "message",
                format!("{} bytes exceeds the Unconnected Send limit", message.len()),
            ));
        }
        let ticks = timeout.as_millis().div_ceil(TICK_MILLIS).clamp(1, 255);
        Ok(Self {
            message,
            route,
            // Clamped to 1..=255.
            timeout_ticks: ticks as u8,
        })
    }

    /// Serializes the request.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.message.len());
        out.push(SERVICE_UNCONNECTED_SEND);
        push_path(&mut out, &CONNECTION_MANAGER_PATH);
        out.push(PRIORITY_TIME_TICK);
        out.push(self.timeout_ticks);
        // Length checked in new().
        out.extend_from_slice(&(self.message.len() as u16).to_le_bytes());
        out.extend_from_slice(self.message);
        if self.message.len() % 2 == 1 {
            out.push(0x00);
        }
        let route = self.route.to_bytes();
        out.push((route.len() / 2) as u8);
        out.push(0x00);
        out.extend_from_slice(&route);
        out
    }
}

/// Builds SendRRData command data around a CIP message.
///
/// Interface handle 0, timeout 0, and two CPF items: a null address item
/// followed by an unconnected data item holding `message`.
pub fn send_rr_data(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + message.len());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&ITEM_NULL_ADDRESS.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&ITEM_UNCONNECTED_DATA.to_le_bytes());
    let length = u16::try_from(message.len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(message);
    out
}

/// Appends the path size (in 16-bit words) and the path.
fn push_path(out: &mut Vec<u8>, path: &[u8]) {
    // TagAddress::parse bounds tag paths to 255 words.
    out.push((path.len() / 2) as u8);
    out.extend_from_slice(path);
}

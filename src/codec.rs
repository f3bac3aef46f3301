//! Conversion between [`TaggedValue`]s and the CIP wire encoding.
//!
//! All multi-byte values are little-endian. Structures are laid out with
//! natural alignment: each member starts at a multiple of its own alignment
//! and the total size is padded to the largest member alignment.
//!
//! | Type | Code | Size | Alignment |
//! |------|------|------|-----------|
//! | BOOL | `0xC1` | 1 | 1 |
//! | SINT | `0xC2` | 1 | 1 |
//! | INT | `0xC3` | 2 | 2 |
//! | DINT | `0xC4` | 4 | 4 |
//! | LINT | `0xC5` | 8 | 8 |
//! | REAL | `0xCA` | 4 | 4 |
//! | LREAL | `0xCB` | 8 | 8 |
//! | STRING | `0x02A0` + `0x0FCE` | 88 | 4 |
//! | UDT | `0x02A0` + handle | computed | max of members |
//!
//! # Example
//!
//! ```
//! use enip::codec;
//! use enip::{DataType, IntWidth, TaggedValue};
//!
//! let bytes = codec::encode(&TaggedValue::from(-2i16)).unwrap();
//! assert_eq!(bytes, [0xFE, 0xFF]);
//!
//! let value = codec::decode(&bytes, &DataType::SignedInt(IntWidth::W16)).unwrap();
//! assert_eq!(value, TaggedValue::from(-2i16));
//! ```

use std::collections::HashMap;

use crate::error::DecodeError;
use crate::value::{
    Composite, CompositeType, DataType, Float, FloatWidth, IntWidth, SignedInt, TaggedValue,
};

/// BOOL type code.
pub const TYPE_BOOL: u16 = 0x00C1;
/// SINT type code.
pub const TYPE_SINT: u16 = 0x00C2;
/// INT type code.
pub const TYPE_INT: u16 = 0x00C3;
/// DINT type code.
pub const TYPE_DINT: u16 = 0x00C4;
/// LINT type code.
pub const TYPE_LINT: u16 = 0x00C5;
/// REAL type code.
pub const TYPE_REAL: u16 = 0x00CA;
/// LREAL type code.
pub const TYPE_LREAL: u16 = 0x00CB;
/// Structure type code; followed on the wire by a 16-bit structure handle.
pub const TYPE_STRUCTURE: u16 = 0x02A0;
/// Structure handle of the built-in Logix STRING.
pub const STRING_HANDLE: u16 = 0x0FCE;

/// Maximum number of characters a Logix STRING holds.
pub const TEXT_CAPACITY: usize = 82;
/// Encoded size of a Logix STRING: DINT length, 82 data bytes, 2 pad bytes.
pub const TEXT_SIZE: usize = 88;

/// Bytes written for a `true` BOOL.
const BOOL_TRUE: u8 = 0xFF;

/// The type descriptor that precedes data in Read Tag replies and Write Tag
/// requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    /// An atomic type code such as [`TYPE_DINT`].
    Atomic(u16),
    /// A structure, identified by its handle.
    Structure(u16),
}

impl WireType {
    /// Returns the wire type used to write a value of `data_type`.
    pub fn of(data_type: &DataType) -> Self {
        match data_type {
            DataType::Bool => WireType::Atomic(TYPE_BOOL),
            DataType::SignedInt(IntWidth::W8) => WireType::Atomic(TYPE_SINT),
            DataType::SignedInt(IntWidth::W16) => WireType::Atomic(TYPE_INT),
            DataType::SignedInt(IntWidth::W32) => WireType::Atomic(TYPE_DINT),
            DataType::SignedInt(IntWidth::W64) => WireType::Atomic(TYPE_LINT),
            DataType::Float(FloatWidth::W32) => WireType::Atomic(TYPE_REAL),
            DataType::Float(FloatWidth::W64) => WireType::Atomic(TYPE_LREAL),
            DataType::Text => WireType::Structure(STRING_HANDLE),
            DataType::Composite(c) => WireType::Structure(c.handle),
        }
    }

    /// Encoded length: 2 bytes for atomics, 4 for structures.
    pub fn encoded_len(self) -> usize {
        match self {
            WireType::Atomic(_) => 2,
            WireType::Structure(_) => 4,
        }
    }

    /// Serializes the descriptor.
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            WireType::Atomic(code) => code.to_le_bytes().to_vec(),
            WireType::Structure(handle) => {
                let mut out = TYPE_STRUCTURE.to_le_bytes().to_vec();
                out.extend_from_slice(&handle.to_le_bytes());
                out
            }
        }
    }

    /// Parses a descriptor from the start of `data`.
    ///
    /// Returns the descriptor and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        let code = read_u16(data, 0, "type code")?;
        if code == TYPE_STRUCTURE {
            let handle = read_u16(data, 2, "structure handle")?;
            Ok((WireType::Structure(handle), 4))
        } else {
            Ok((WireType::Atomic(code), 2))
        }
    }
}

/// Caller-registered structure definitions, keyed by structure handle.
///
/// Read replies identify a structure only by its handle. Registering the
/// layout lets the codec decode those replies into [`Composite`] values.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<u16, CompositeType>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a structure, replacing any earlier definition with the same
    /// handle.
    pub fn register(&mut self, definition: CompositeType) {
        self.types.insert(definition.handle, definition);
    }

    /// Returns the definition for `handle`.
    pub fn get(&self, handle: u16) -> Option<&CompositeType> {
        self.types.get(&handle)
    }

    /// Resolves a wire descriptor to a decoding hint.
    pub fn resolve(&self, wire: WireType) -> Result<DataType, DecodeError> {
        let data_type = match wire {
            WireType::Atomic(TYPE_BOOL) => DataType::Bool,
            WireType::Atomic(TYPE_SINT) => DataType::SignedInt(IntWidth::W8),
            WireType::Atomic(TYPE_INT) => DataType::SignedInt(IntWidth::W16),
            WireType::Atomic(TYPE_DINT) => DataType::SignedInt(IntWidth::W32),
            WireType::Atomic(TYPE_LINT) => DataType::SignedInt(IntWidth::W64),
            WireType::Atomic(TYPE_REAL) => DataType::Float(FloatWidth::W32),
            WireType::Atomic(TYPE_LREAL) => DataType::Float(FloatWidth::W64),
            WireType::Atomic(code) => {
                return Err(DecodeError::invalid_value(format!(
                    "unsupported type code 0x{code:04X}"
                )))
            }
            WireType::Structure(STRING_HANDLE) => DataType::Text,
            WireType::Structure(handle) => match self.types.get(&handle) {
                Some(def) => DataType::Composite(def.clone()),
                None => {
                    return Err(DecodeError::invalid_value(format!(
                        "unregistered structure handle 0x{handle:04X}"
                    )))
                }
            },
        };
        Ok(data_type)
    }

    /// Number of registered structures.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if no structure is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Encoded size of `data_type`, including trailing structure padding.
pub fn size_of(data_type: &DataType) -> usize {
    match data_type {
        DataType::Bool => 1,
        DataType::SignedInt(w) => w.bytes(),
        DataType::Float(w) => w.bytes(),
        DataType::Text => TEXT_SIZE,
        DataType::Composite(c) => {
            let mut offset = 0;
            let mut align = 1;
            for member in &c.members {
                let member_align = align_of(&member.data_type);
                align = align.max(member_align);
                offset = align_up(offset, member_align) + size_of(&member.data_type);
            }
            align_up(offset, align)
        }
    }
}

fn align_of(data_type: &DataType) -> usize {
    match data_type {
        DataType::Bool => 1,
        DataType::SignedInt(w) => w.bytes(),
        DataType::Float(w) => w.bytes(),
        DataType::Text => 4,
        DataType::Composite(c) => c
            .members
            .iter()
            .map(|m| align_of(&m.data_type))
            .max()
            .unwrap_or(1),
    }
}

fn value_align(value: &TaggedValue) -> usize {
    match value {
        TaggedValue::Bool(_) => 1,
        TaggedValue::SignedInt(v) => v.width().bytes(),
        TaggedValue::Float(v) => v.width().bytes(),
        TaggedValue::Text(_) => 4,
        TaggedValue::Composite(c) => c.iter().map(|(_, v)| value_align(v)).max().unwrap_or(1),
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

/// Encodes a value.
///
/// Fails only for text longer than [`TEXT_CAPACITY`] bytes.
pub fn encode(value: &TaggedValue) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    encode_into(value, &mut out)?;
    Ok(out)
}

fn encode_into(value: &TaggedValue, out: &mut Vec<u8>) -> Result<(), DecodeError> {
    match value {
        TaggedValue::Bool(v) => out.push(if *v { BOOL_TRUE } else { 0x00 }),
        TaggedValue::SignedInt(SignedInt::Sint(v)) => out.extend_from_slice(&v.to_le_bytes()),
        TaggedValue::SignedInt(SignedInt::Int(v)) => out.extend_from_slice(&v.to_le_bytes()),
        TaggedValue::SignedInt(SignedInt::Dint(v)) => out.extend_from_slice(&v.to_le_bytes()),
        TaggedValue::SignedInt(SignedInt::Lint(v)) => out.extend_from_slice(&v.to_le_bytes()),
        TaggedValue::Float(Float::Real(v)) => out.extend_from_slice(&v.to_le_bytes()),
        TaggedValue::Float(Float::Lreal(v)) => out.extend_from_slice(&v.to_le_bytes()),
        TaggedValue::Text(text) => {
            let bytes = text.as_bytes();
            if bytes.len() > TEXT_CAPACITY {
                return Err(DecodeError::invalid_value(format!(
                    "string of {} bytes exceeds capacity of {TEXT_CAPACITY}",
                    bytes.len()
                )));
            }
            // Bounded by TEXT_CAPACITY above.
            out.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
            out.extend_from_slice(bytes);
            out.resize(out.len() + TEXT_SIZE - 4 - bytes.len(), 0);
        }
        TaggedValue::Composite(c) => {
            let start = out.len();
            let mut align = 1;
            for (_, member) in c.iter() {
                let member_align = value_align(member);
                align = align.max(member_align);
                pad_to(out, start, member_align);
                encode_into(member, out)?;
            }
            pad_to(out, start, align);
        }
    }
    Ok(())
}

fn pad_to(out: &mut Vec<u8>, start: usize, align: usize) {
    let offset = out.len() - start;
    out.resize(start + align_up(offset, align), 0);
}

/// Decodes `bytes` as a value of type `hint`.
///
/// `bytes` must be exactly [`size_of`]`(hint)` long: fewer bytes fail with
/// [`DecodeError::Truncated`], more with [`DecodeError::TypeMismatch`].
pub fn decode(bytes: &[u8], hint: &DataType) -> Result<TaggedValue, DecodeError> {
    let expected = size_of(hint);
    if bytes.len() < expected {
        return Err(DecodeError::truncated(hint, expected, bytes.len()));
    }
    if bytes.len() > expected {
        return Err(DecodeError::type_mismatch(
            format!("{hint} ({expected} bytes)"),
            format!("{} bytes", bytes.len()),
        ));
    }
    decode_at(bytes, 0, hint)
}

fn decode_at(bytes: &[u8], offset: usize, hint: &DataType) -> Result<TaggedValue, DecodeError> {
    let size = size_of(hint);
    let data = bytes
        .get(offset..offset + size)
        .ok_or_else(|| DecodeError::truncated(hint, offset + size, bytes.len()))?;

    let value = match hint {
        DataType::Bool => TaggedValue::Bool(data[0] != 0),
        DataType::SignedInt(IntWidth::W8) => i8::from_le_bytes([data[0]]).into(),
        DataType::SignedInt(IntWidth::W16) => i16::from_le_bytes([data[0], data[1]]).into(),
        DataType::SignedInt(IntWidth::W32) => i32::from_le_bytes(fixed(data)).into(),
        DataType::SignedInt(IntWidth::W64) => i64::from_le_bytes(fixed(data)).into(),
        DataType::Float(FloatWidth::W32) => f32::from_le_bytes(fixed(data)).into(),
        DataType::Float(FloatWidth::W64) => f64::from_le_bytes(fixed(data)).into(),
        DataType::Text => TaggedValue::Text(decode_text(data)?),
        DataType::Composite(def) => {
            let mut composite = Composite::new();
            let mut member_offset = 0;
            for member in &def.members {
                member_offset = align_up(member_offset, align_of(&member.data_type));
                let value = decode_at(data, member_offset, &member.data_type)?;
                composite.insert(member.name.clone(), value);
                member_offset += size_of(&member.data_type);
            }
            TaggedValue::Composite(composite)
        }
    };
    Ok(value)
}

fn decode_text(data: &[u8]) -> Result<String, DecodeError> {
    let len = i32::from_le_bytes(fixed(&data[..4]));
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= TEXT_CAPACITY)
        .ok_or_else(|| {
            DecodeError::invalid_value(format!(
                "string length {len} outside 0..={TEXT_CAPACITY}"
            ))
        })?;
    String::from_utf8(data[4..4 + len].to_vec())
        .map_err(|e| DecodeError::invalid_value(format!("string is not valid UTF-8: {e}")))
}

/// Copies the first `N` bytes of an already length-checked slice.
fn fixed<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&data[..N]);
    buf
}

fn read_u16(data: &[u8], offset: usize, what: &str) -> Result<u16, DecodeError> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| DecodeError::truncated(what, offset + 2, data.len()))
}

/// Checks that `value` may be written to a tag whose native type is `native`.
///
/// Types must match exactly. There is no widening or narrowing: a `DINT` tag
/// accepts only `SignedInt::Dint`. Composite values must carry the same member
/// names, in the same order, with matching member types.
///
/// # Example
///
/// ```
/// use enip::codec::check_assignable;
/// use enip::{DataType, IntWidth, TaggedValue};
///
/// let dint = DataType::SignedInt(IntWidth::W32);
/// assert!(check_assignable(&TaggedValue::from(7i32), &dint).is_ok());
/// assert!(check_assignable(&TaggedValue::from(7i64), &dint).is_err());
/// assert!(check_assignable(&TaggedValue::from(7i16), &dint).is_err());
/// ```
pub fn check_assignable(value: &TaggedValue, native: &DataType) -> Result<(), DecodeError> {
    let mismatch = || DecodeError::type_mismatch(native, value.type_name());
    match (value, native) {
        (TaggedValue::Bool(_), DataType::Bool) => Ok(()),
        (TaggedValue::SignedInt(v), DataType::SignedInt(w)) if v.width() == *w => Ok(()),
        (TaggedValue::Float(v), DataType::Float(w)) if v.width() == *w => Ok(()),
        (TaggedValue::Text(_), DataType::Text) => Ok(()),
        (TaggedValue::Composite(c), DataType::Composite(def)) => {
            if c.len() != def.members.len() {
                return Err(DecodeError::type_mismatch(
                    format!("{} with {} members", def.name, def.members.len()),
                    format!("composite with {} members", c.len()),
                ));
            }
            for ((name, member), expected) in c.iter().zip(&def.members) {
                if name != expected.name {
                    return Err(DecodeError::type_mismatch(
                        format!("member '{}' of {}", expected.name, def.name),
                        format!("member '{name}'"),
                    ));
                }
                check_assignable(member, &expected.data_type)?;
            }
            Ok(())
        }
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motor_type() -> CompositeType {
        CompositeType::new("Motor_UDT", 0x1A2B)
            .member("Running", DataType::Bool)
            .member("Speed", DataType::Float(FloatWidth::W32))
            .member("Faults", DataType::SignedInt(IntWidth::W16))
    }

    fn motor_value() -> TaggedValue {
        Composite::new()
            .with("Running", true)
            .with("Speed", 12.5f32)
            .with("Faults", 3i16)
            .into()
    }

    #[test]
    fn test_round_trip_every_variant() {
        let cases = [
            (TaggedValue::from(true), DataType::Bool),
            (TaggedValue::from(false), DataType::Bool),
            (TaggedValue::from(i8::MIN), DataType::SignedInt(IntWidth::W8)),
            (TaggedValue::from(-300i16), DataType::SignedInt(IntWidth::W16)),
            (TaggedValue::from(i32::MAX), DataType::SignedInt(IntWidth::W32)),
            (TaggedValue::from(i64::MIN), DataType::SignedInt(IntWidth::W64)),
            (TaggedValue::from(3.25f32), DataType::Float(FloatWidth::W32)),
            (TaggedValue::from(-1e300f64), DataType::Float(FloatWidth::W64)),
            (TaggedValue::from("Line 3 ready"), DataType::Text),
            (TaggedValue::from(""), DataType::Text),
            (motor_value(), DataType::Composite(motor_type())),
        ];
        for (value, hint) in cases {
            let bytes = encode(&value).unwrap();
            assert_eq!(bytes.len(), size_of(&hint), "size of {hint}");
            assert_eq!(decode(&bytes, &hint).unwrap(), value, "round trip of {hint}");
        }
    }

    #[test]
    fn test_bool_encoding() {
        assert_eq!(encode(&true.into()).unwrap(), [0xFF]);
        assert_eq!(encode(&false.into()).unwrap(), [0x00]);
        assert_eq!(decode(&[0x01], &DataType::Bool).unwrap(), true.into());
    }

    #[test]
    fn test_dint_wire_bytes() {
        let bytes = encode(&TaggedValue::from(0x12345678i32)).unwrap();
        assert_eq!(hex::encode(bytes), "78563412");
    }

    #[test]
    fn test_composite_layout_padding() {
        // BOOL at 0, REAL aligned to 4, INT at 8, total padded to 12.
        let bytes = encode(&motor_value()).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[0], 0xFF);
        assert_eq!(&bytes[1..4], &[0, 0, 0]);
        assert_eq!(&bytes[4..8], &12.5f32.to_le_bytes());
        assert_eq!(&bytes[8..10], &3i16.to_le_bytes());
        assert_eq!(size_of(&DataType::Composite(motor_type())), 12);
    }

    #[test]
    fn test_nested_composite() {
        let inner = CompositeType::new("Limits", 0x0100)
            .member("Lo", DataType::SignedInt(IntWidth::W8))
            .member("Hi", DataType::SignedInt(IntWidth::W64));
        let outer = CompositeType::new("Axis", 0x0200)
            .member("Enabled", DataType::Bool)
            .member("Limits", DataType::Composite(inner));
        let value: TaggedValue = Composite::new()
            .with("Enabled", true)
            .with(
                "Limits",
                Composite::new().with("Lo", -1i8).with("Hi", 1_000_000i64),
            )
            .into();

        let hint = DataType::Composite(outer);
        let bytes = encode(&value).unwrap();
        assert_eq!(bytes.len(), 24);
        assert_eq!(decode(&bytes, &hint).unwrap(), value);
    }

    #[test]
    fn test_decode_truncated() {
        let err = decode(&[0x01, 0x02], &DataType::SignedInt(IntWidth::W32)).unwrap_err();
        assert_eq!(err, DecodeError::truncated("DINT", 4, 2));

        let err = decode(&[], &DataType::Bool).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn test_decode_oversized_is_type_mismatch() {
        let err = decode(&[0; 8], &DataType::SignedInt(IntWidth::W32)).unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_text_too_long() {
        let long = "x".repeat(TEXT_CAPACITY + 1);
        let err = encode(&TaggedValue::from(long)).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidValue { .. }));

        let max = "y".repeat(TEXT_CAPACITY);
        assert_eq!(encode(&TaggedValue::from(max)).unwrap().len(), TEXT_SIZE);
    }

    #[test]
    fn test_text_invalid_length_and_utf8() {
        let mut bytes = vec![0u8; TEXT_SIZE];
        bytes[..4].copy_from_slice(&100i32.to_le_bytes());
        assert!(matches!(
            decode(&bytes, &DataType::Text),
            Err(DecodeError::InvalidValue { .. })
        ));

        bytes[..4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            decode(&bytes, &DataType::Text),
            Err(DecodeError::InvalidValue { .. })
        ));

        bytes[..4].copy_from_slice(&2i32.to_le_bytes());
        bytes[4] = 0xC3;
        bytes[5] = 0x28;
        assert!(matches!(
            decode(&bytes, &DataType::Text),
            Err(DecodeError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_check_assignable_no_widening() {
        let int = DataType::SignedInt(IntWidth::W16);
        assert!(check_assignable(&TaggedValue::from(1i16), &int).is_ok());
        assert!(check_assignable(&TaggedValue::from(1i8), &int).is_err());
        assert!(check_assignable(&TaggedValue::from(1i32), &int).is_err());

        let real = DataType::Float(FloatWidth::W32);
        assert!(check_assignable(&TaggedValue::from(1.0f64), &real).is_err());
        assert!(check_assignable(&TaggedValue::from("1.0"), &real).is_err());
        assert_eq!(
            check_assignable(&TaggedValue::from(1i64), &DataType::SignedInt(IntWidth::W32)),
            Err(DecodeError::type_mismatch("DINT", "LINT"))
        );
    }

    #[test]
    fn test_check_assignable_composite() {
        let hint = DataType::Composite(motor_type());
        assert!(check_assignable(&motor_value(), &hint).is_ok());

        let reordered: TaggedValue = Composite::new()
            .with("Speed", 12.5f32)
            .with("Running", true)
            .with("Faults", 3i16)
            .into();
        assert!(check_assignable(&reordered, &hint).is_err());

        let wrong_member: TaggedValue = Composite::new()
            .with("Running", true)
            .with("Speed", 12.5f64)
            .with("Faults", 3i16)
            .into();
        assert!(check_assignable(&wrong_member, &hint).is_err());
    }

    #[test]
    fn test_wire_type_bytes() {
        assert_eq!(WireType::of(&DataType::Bool).to_bytes(), [0xC1, 0x00]);
        assert_eq!(
            WireType::of(&DataType::Text).to_bytes(),
            [0xA0, 0x02, 0xCE, 0x0F]
        );
        let (wire, used) = WireType::parse(&[0xA0, 0x02, 0x2B, 0x1A, 0xFF]).unwrap();
        assert_eq!(wire, WireType::Structure(0x1A2B));
        assert_eq!(used, 4);
        assert!(WireType::parse(&[0xA0, 0x02, 0x2B]).is_err());
    }

    #[test]
    fn test_registry_resolve() {
        let mut registry = TypeRegistry::new();
        assert!(registry
            .resolve(WireType::Structure(0x1A2B))
            .is_err());
        registry.register(motor_type());
        assert_eq!(
            registry.resolve(WireType::Structure(0x1A2B)).unwrap(),
            DataType::Composite(motor_type())
        );
        assert_eq!(
            registry.resolve(WireType::Atomic(TYPE_LREAL)).unwrap(),
            DataType::Float(FloatWidth::W64)
        );
        assert_eq!(
            registry.resolve(WireType::Structure(STRING_HANDLE)).unwrap(),
            DataType::Text
        );
        assert!(registry.resolve(WireType::Atomic(0x00D3)).is_err());
    }
}

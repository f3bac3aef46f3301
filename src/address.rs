//! Tag addresses and their CIP path encoding.
//!
//! A tag address is a dotted path:
//!
//! ```text
//! [Program:<program>.]<tag>[<i>[,<j>[,<k>]]][.<member>...]
//! ```
//!
//! - `Motor_Speed` is a controller-scoped tag
//! - `Program:MainProgram.Counter` is a program-scoped tag
//! - `Recipes[3]` is the fourth element of an array tag
//! - `Line1.Motor.Running` is a member of a structure tag
//! - `Status.15` is bit 15 of an integer tag
//!
//! On the wire each name becomes an ANSI extended symbolic segment (`0x91`)
//! and each index an element segment (`0x28`, `0x29` or `0x2A` depending on
//! its magnitude). A trailing bit number is not sent: the request names the
//! integer holding the bit, and the bit is picked out of the reply.
//!
//! # Example
//!
//! ```
//! use enip::TagAddress;
//!
//! let addr: TagAddress = "Program:Main.Motors[2].Speed".parse().unwrap();
//! assert_eq!(addr.program(), Some("Main"));
//! assert_eq!(addr.root().to_string(), "Program:Main.Motors[2]");
//! assert_eq!(addr.members().len(), 1);
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::OperationError;
use crate::value::{DataType, TaggedValue};

const PROGRAM_PREFIX: &str = "Program:";
const SEGMENT_SYMBOLIC: u8 = 0x91;
const SEGMENT_ELEMENT_8: u8 = 0x28;
const SEGMENT_ELEMENT_16: u8 = 0x29;
const SEGMENT_ELEMENT_32: u8 = 0x2A;
const MAX_DIMENSIONS: usize = 3;
/// Bits in the widest integer (LINT).
const MAX_BITS: u8 = 64;
/// The request path size is a byte counting 16-bit words.
const MAX_PATH_BYTES: usize = 2 * u8::MAX as usize;

/// One dotted segment of an address: a name and optional array indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSegment {
    /// Tag or member name.
    pub name: String,
    /// Array indices, empty for non-array access.
    pub indices: Vec<u32>,
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.indices.is_empty() {
            let indices: Vec<String> = self.indices.iter().map(u32::to_string).collect();
            write!(f, "[{}]", indices.join(","))?;
        }
        Ok(())
    }
}

/// A parsed tag address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagAddress {
    program: Option<String>,
    segments: Vec<PathSegment>,
    bit: Option<u8>,
}

impl TagAddress {
    /// Parses an address.
    ///
    /// # Errors
    ///
    /// Returns `OperationError::AddressNotFound` if the address is empty, has
    /// an empty segment, or contains an invalid name, index or bit number.
    pub fn parse(address: &str) -> Result<Self, OperationError> {
        let invalid = |reason: String| OperationError::address_not_found(address, reason);

        if address.is_empty() {
            return Err(invalid("address is empty".to_string()));
        }

        let (program, rest) = match address.strip_prefix(PROGRAM_PREFIX) {
            Some(scoped) => {
                let (program, rest) = scoped
                    .split_once('.')
                    .ok_or_else(|| invalid("program scope without a tag".to_string()))?;
                validate_name(program).map_err(|e| invalid(format!("program name: {e}")))?;
                (Some(program.to_string()), rest)
            }
            None => (None, address),
        };

        let mut pieces: Vec<&str> = rest.split('.').collect();
        let bit = match pieces.last() {
            Some(last) if pieces.len() > 1 && is_bit_number(last) => {
                let bit = parse_bit(last).map_err(invalid)?;
                pieces.pop();
                Some(bit)
            }
            _ => None,
        };

        let segments = pieces
            .into_iter()
            .map(parse_segment)
            .collect::<Result<Vec<_>, String>>()
            .map_err(invalid)?;

        let parsed = Self {
            program,
            segments,
            bit,
        };
        if parsed.to_path().len() > MAX_PATH_BYTES {
            return Err(invalid(format!(
                "encoded path exceeds {MAX_PATH_BYTES} bytes"
            )));
        }
        Ok(parsed)
    }

    /// Program scope, if the tag is program-scoped.
    pub fn program(&self) -> Option<&str> {
        self.program.as_deref()
    }

    /// All segments, root first.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Member segments below the root tag.
    pub fn members(&self) -> &[PathSegment] {
        &self.segments[1..]
    }

    /// Bit number, if the address names one bit of an integer.
    pub fn bit(&self) -> Option<u8> {
        self.bit
    }

    /// Address of the integer holding the bit, or the address itself.
    pub fn host(&self) -> TagAddress {
        Self {
            bit: None,
            ..self.clone()
        }
    }

    /// Returns true if the address names a member of a structure tag.
    pub fn is_member(&self) -> bool {
        self.segments.len() > 1
    }

    /// Address of the root tag (program scope and first segment).
    pub fn root(&self) -> TagAddress {
        Self {
            program: self.program.clone(),
            segments: self.segments[..1].to_vec(),
            bit: None,
        }
    }

    /// Encodes the address as a CIP request path.
    ///
    /// The result is always an even number of bytes. A bit number is not
    /// part of the path.
    ///
    /// # Example
    ///
    /// ```
    /// use enip::TagAddress;
    ///
    /// let path = TagAddress::parse("Tag[5]").unwrap().to_path();
    /// assert_eq!(path, [0x91, 0x03, b'T', b'a', b'g', 0x00, 0x28, 0x05]);
    /// ```
    pub fn to_path(&self) -> Vec<u8> {
        let mut path = Vec::new();
        if let Some(program) = &self.program {
            push_symbolic(&mut path, &format!("{PROGRAM_PREFIX}{program}"));
        }
        for segment in &self.segments {
            push_symbolic(&mut path, &segment.name);
            for &index in &segment.indices {
                push_element(&mut path, index);
            }
        }
        path
    }

    /// Follows the member segments through a root value. A bit number is
    /// ignored; the result is the integer holding it.
    ///
    /// # Errors
    ///
    /// Returns `OperationError::AddressNotFound` if a segment does not name a
    /// member of the composite it is applied to.
    pub fn resolve<'a>(&self, root: &'a TaggedValue) -> Result<&'a TaggedValue, OperationError> {
        let mut current = root;
        for segment in self.members() {
            self.check_member_segment(segment)?;
            current = match current {
                TaggedValue::Composite(c) => c.get(&segment.name),
                _ => None,
            }
            .ok_or_else(|| self.no_member(segment))?;
        }
        Ok(current)
    }

    /// Mutable form of [`resolve`](Self::resolve).
    pub fn resolve_mut<'a>(
        &self,
        root: &'a mut TaggedValue,
    ) -> Result<&'a mut TaggedValue, OperationError> {
        let mut current = root;
        for segment in self.members() {
            self.check_member_segment(segment)?;
            current = match current {
                TaggedValue::Composite(c) => c.get_mut(&segment.name),
                _ => None,
            }
            .ok_or_else(|| self.no_member(segment))?;
        }
        Ok(current)
    }

    /// Follows the member segments through a root type.
    pub fn resolve_type<'a>(&self, root: &'a DataType) -> Result<&'a DataType, OperationError> {
        let mut current = root;
        for segment in self.members() {
            self.check_member_segment(segment)?;
            current = match current {
                DataType::Composite(c) => c.member_type(&segment.name),
                _ => None,
            }
            .ok_or_else(|| self.no_member(segment))?;
        }
        Ok(current)
    }

    fn check_member_segment(&self, segment: &PathSegment) -> Result<(), OperationError> {
        if segment.indices.is_empty() {
            Ok(())
        } else {
            Err(OperationError::address_not_found(
                self.to_string(),
                format!("indexed member '{segment}' is not supported"),
            ))
        }
    }

    fn no_member(&self, segment: &PathSegment) -> OperationError {
        OperationError::address_not_found(
            self.to_string(),
            format!("no member '{}'", segment.name),
        )
    }
}

impl FromStr for TagAddress {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TagAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(program) = &self.program {
            write!(f, "{PROGRAM_PREFIX}{program}.")?;
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{segment}")?;
        }
        if let Some(bit) = self.bit {
            write!(f, ".{bit}")?;
        }
        Ok(())
    }
}

fn parse_segment(segment: &str) -> Result<PathSegment, String> {
    if segment.is_empty() {
        return Err("empty segment".to_string());
    }

    let (name, indices) = match segment.split_once('[') {
        Some((name, rest)) => {
            let inner = rest
                .strip_suffix(']')
                .ok_or_else(|| format!("unterminated index in '{segment}'"))?;
            (name, parse_indices(inner)?)
        }
        None => (segment, Vec::new()),
    };
    validate_name(name)?;

    Ok(PathSegment {
        name: name.to_string(),
        indices,
    })
}

fn is_bit_number(piece: &str) -> bool {
    !piece.is_empty() && piece.chars().all(|c| c.is_ascii_digit())
}

fn parse_bit(piece: &str) -> Result<u8, String> {
    piece
        .parse::<u8>()
        .ok()
        .filter(|&bit| bit < MAX_BITS)
        .ok_or_else(|| format!("bit number {piece} is out of range"))
}

fn parse_indices(inner: &str) -> Result<Vec<u32>, String> {
    let indices = inner
        .split(',')
        .map(|i| {
            i.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid index '{i}'"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if indices.len() > MAX_DIMENSIONS {
        return Err(format!(
            "{} indices given, at most {MAX_DIMENSIONS} allowed",
            indices.len()
        ));
    }
    Ok(indices)
}

fn validate_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err("empty name".to_string()),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
            return Err(format!("name '{name}' must start with a letter or '_'"))
        }
        _ => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("name '{name}' contains invalid characters"));
    }
    if name.len() > usize::from(u8::MAX) - PROGRAM_PREFIX.len() {
        return Err(format!("name '{name}' is too long"));
    }
    Ok(())
}

fn push_symbolic(path: &mut Vec<u8>, name: &str) {
    let bytes = name.as_bytes();
    path.push(SEGMENT_SYMBOLIC);
    // Names are validated to fit in a byte.
    path.push(bytes.len() as u8);
    path.extend_from_slice(bytes);
    if bytes.len() % 2 == 1 {
        path.push(0x00);
    }
}

fn push_element(path: &mut Vec<u8>, index: u32) {
    if let Ok(index) = u8::try_from(index) {
        path.extend_from_slice(&[SEGMENT_ELEMENT_8, index]);
    } else if let Ok(index) = u16::try_from(index) {
        path.extend_from_slice(&[SEGMENT_ELEMENT_16, 0x00]);
        path.extend_from_slice(&index.to_le_bytes());
    } else {
        path.extend_from_slice(&[SEGMENT_ELEMENT_32, 0x00]);
        path.extend_from_slice(&index.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Composite, CompositeType, IntWidth};

    #[test]
    fn test_parse_simple() {
        let addr = TagAddress::parse("Motor_Speed").unwrap();
        assert_eq!(addr.program(), None);
        assert_eq!(addr.segments().len(), 1);
        assert!(!addr.is_member());
        assert_eq!(addr.to_string(), "Motor_Speed");
    }

    #[test]
    fn test_parse_program_scope_and_indices() {
        let addr = TagAddress::parse("Program:MainProgram.Table[1, 20].Value").unwrap();
        assert_eq!(addr.program(), Some("MainProgram"));
        assert_eq!(addr.segments()[0].indices, vec![1, 20]);
        assert_eq!(addr.members()[0].name, "Value");
        assert_eq!(addr.to_string(), "Program:MainProgram.Table[1,20].Value");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            ".",
            "Tag.",
            ".Tag",
            "A..B",
            "Program:Main",
            "Program:.Tag",
            "1Tag",
            "Tag[",
            "Tag[x]",
            "Tag[1,2,3,4]",
            "Ta-g",
        ] {
            let err = TagAddress::parse(bad).unwrap_err();
            assert!(
                matches!(err, OperationError::AddressNotFound { .. }),
                "expected AddressNotFound for {bad:?}"
            );
        }
    }

    #[test]
    fn test_to_path_symbolic_padding() {
        assert_eq!(
            hex::encode(TagAddress::parse("Tag").unwrap().to_path()),
            "910354616700"
        );
        assert_eq!(
            hex::encode(TagAddress::parse("Ab").unwrap().to_path()),
            "91024162"
        );
    }

    #[test]
    fn test_to_path_program_and_members() {
        let path = TagAddress::parse("Program:P.T.M").unwrap().to_path();
        let mut expected = vec![0x91, 9];
        expected.extend_from_slice(b"Program:P");
        expected.push(0);
        expected.extend_from_slice(&[0x91, 1, b'T', 0, 0x91, 1, b'M', 0]);
        assert_eq!(path, expected);
    }

    #[test]
    fn test_to_path_element_widths() {
        let path = TagAddress::parse("Ab[7,300,70000]").unwrap().to_path();
        assert_eq!(
            hex::encode(path),
            "91024162280729002c012a0070110100"
        );
    }

    #[test]
    fn test_root() {
        let addr = TagAddress::parse("Program:Main.Motors[2].Drive.Speed").unwrap();
        assert_eq!(addr.root().to_string(), "Program:Main.Motors[2]");
        assert_eq!(addr.members().len(), 2);
    }

    #[test]
    fn test_parse_bit() {
        let addr = TagAddress::parse("Program:Main.Flags[2].15").unwrap();
        assert_eq!(addr.bit(), Some(15));
        assert!(!addr.is_member());
        assert_eq!(addr.to_string(), "Program:Main.Flags[2].15");
        assert_eq!(addr.host().to_string(), "Program:Main.Flags[2]");
        assert_eq!(addr.to_path(), addr.host().to_path());

        let member = TagAddress::parse("Motor.Faults.0").unwrap();
        assert_eq!(member.bit(), Some(0));
        assert_eq!(member.members()[0].name, "Faults");
        assert_eq!(member.root().bit(), None);

        assert_eq!(TagAddress::parse("Motor.Faults").unwrap().bit(), None);
        assert_eq!(TagAddress::parse("Flags.63").unwrap().bit(), Some(63));
        for bad in ["Flags.64", "Flags.300", "Flags.1.2", "15", "Flags.-1"] {
            assert!(
                matches!(
                    TagAddress::parse(bad),
                    Err(OperationError::AddressNotFound { .. })
                ),
                "expected AddressNotFound for {bad:?}"
            );
        }
    }

    #[test]
    fn test_resolve_members() {
        let mut root: TaggedValue = Composite::new()
            .with("Drive", Composite::new().with("Speed", 10i32))
            .with("On", true)
            .into();

        let addr = TagAddress::parse("M.Drive.Speed").unwrap();
        assert_eq!(addr.resolve(&root).unwrap(), &TaggedValue::from(10i32));

        *addr.resolve_mut(&mut root).unwrap() = 11i32.into();
        assert_eq!(addr.resolve(&root).unwrap(), &TaggedValue::from(11i32));

        let missing = TagAddress::parse("M.Drive.Torque").unwrap();
        assert!(matches!(
            missing.resolve(&root),
            Err(OperationError::AddressNotFound { .. })
        ));

        let through_scalar = TagAddress::parse("M.On.Bit").unwrap();
        assert!(through_scalar.resolve(&root).is_err());
    }

    #[test]
    fn test_resolve_type() {
        let drive =
            CompositeType::new("Drive", 2).member("Speed", DataType::SignedInt(IntWidth::W32));
        let motor = DataType::Composite(
            CompositeType::new("Motor", 1).member("Drive", DataType::Composite(drive)),
        );
        let addr = TagAddress::parse("M.Drive.Speed").unwrap();
        assert_eq!(
            addr.resolve_type(&motor).unwrap(),
            &DataType::SignedInt(IntWidth::W32)
        );
        assert!(TagAddress::parse("M.Nope").unwrap().resolve_type(&motor).is_err());
    }
}

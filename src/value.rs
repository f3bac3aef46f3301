//! Tagged values and data types.
//!
//! [`TaggedValue`] is the closed set of values a tag can hold. Every consumer
//! can match on it exhaustively; there is no dynamic container.
//!
//! | Variant | CIP types | Wire size |
//! |---------|-----------|-----------|
//! | [`TaggedValue::Bool`] | BOOL | 1 byte |
//! | [`TaggedValue::SignedInt`] | SINT, INT, DINT, LINT | 1, 2, 4, 8 bytes |
//! | [`TaggedValue::Float`] | REAL, LREAL | 4, 8 bytes |
//! | [`TaggedValue::Text`] | Logix STRING | 88 bytes |
//! | [`TaggedValue::Composite`] | UDT / structure | sum of members plus alignment |
//!
//! The width of an integer or float is part of the value. A `DINT` holding
//! `5` and a `LINT` holding `5` are different values, and nothing converts
//! one into the other implicitly.
//!
//! # Example
//!
//! ```
//! use enip::{Composite, SignedInt, TaggedValue};
//!
//! let speed = TaggedValue::from(1500i32);
//! assert_eq!(speed, TaggedValue::SignedInt(SignedInt::Dint(1500)));
//!
//! let motor = Composite::new()
//!     .with("Running", true)
//!     .with("Speed", 1500i32);
//! assert_eq!(motor.get("Speed"), Some(&speed));
//! ```

use std::fmt;

/// Width of a signed integer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IntWidth {
    /// 8-bit (SINT).
    W8,
    /// 16-bit (INT).
    W16,
    /// 32-bit (DINT).
    W32,
    /// 64-bit (LINT).
    W64,
}

impl IntWidth {
    /// Size in bytes.
    pub fn bytes(self) -> usize {
        match self {
            IntWidth::W8 => 1,
            IntWidth::W16 => 2,
            IntWidth::W32 => 4,
            IntWidth::W64 => 8,
        }
    }

    /// Logix type name.
    pub fn type_name(self) -> &'static str {
        match self {
            IntWidth::W8 => "SINT",
            IntWidth::W16 => "INT",
            IntWidth::W32 => "DINT",
            IntWidth::W64 => "LINT",
        }
    }
}

/// Width of a floating point type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FloatWidth {
    /// 32-bit (REAL).
    W32,
    /// 64-bit (LREAL).
    W64,
}

impl FloatWidth {
    /// Size in bytes.
    pub fn bytes(self) -> usize {
        match self {
            FloatWidth::W32 => 4,
            FloatWidth::W64 => 8,
        }
    }

    /// Logix type name.
    pub fn type_name(self) -> &'static str {
        match self {
            FloatWidth::W32 => "REAL",
            FloatWidth::W64 => "LREAL",
        }
    }
}

/// A signed integer of fixed width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SignedInt {
    /// SINT.
    Sint(i8),
    /// INT.
    Int(i16),
    /// DINT.
    Dint(i32),
    /// LINT.
    Lint(i64),
}

impl SignedInt {
    /// Returns the width of this integer.
    pub fn width(self) -> IntWidth {
        match self {
            SignedInt::Sint(_) => IntWidth::W8,
            SignedInt::Int(_) => IntWidth::W16,
            SignedInt::Dint(_) => IntWidth::W32,
            SignedInt::Lint(_) => IntWidth::W64,
        }
    }

    /// Returns the value widened to `i64`. Always lossless.
    pub fn get(self) -> i64 {
        match self {
            SignedInt::Sint(v) => v.into(),
            SignedInt::Int(v) => v.into(),
            SignedInt::Dint(v) => v.into(),
            SignedInt::Lint(v) => v,
        }
    }

    /// Returns bit `index`, or `None` if the integer has no such bit.
    pub fn bit(self, index: u8) -> Option<bool> {
        self.has_bit(index).then(|| (self.get() >> index) & 1 == 1)
    }

    /// Returns a copy of the same width with bit `index` set or cleared.
    pub fn with_bit(self, index: u8, on: bool) -> Option<SignedInt> {
        if !self.has_bit(index) {
            return None;
        }
        let mask = 1i64 << index;
        let raw = if on { self.get() | mask } else { self.get() & !mask };
        // Truncation keeps the bits of the original width.
        Some(match self {
            SignedInt::Sint(_) => SignedInt::Sint(raw as i8),
            SignedInt::Int(_) => SignedInt::Int(raw as i16),
            SignedInt::Dint(_) => SignedInt::Dint(raw as i32),
            SignedInt::Lint(_) => SignedInt::Lint(raw),
        })
    }

    fn has_bit(self, index: u8) -> bool {
        usize::from(index) < self.width().bytes() * 8
    }
}

/// A floating point number of fixed width.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Float {
    /// REAL.
    Real(f32),
    /// LREAL.
    Lreal(f64),
}

impl Float {
    /// Returns the width of this float.
    pub fn width(self) -> FloatWidth {
        match self {
            Float::Real(_) => FloatWidth::W32,
            Float::Lreal(_) => FloatWidth::W64,
        }
    }

    /// Returns the value widened to `f64`. Always lossless.
    pub fn get(self) -> f64 {
        match self {
            Float::Real(v) => v.into(),
            Float::Lreal(v) => v,
        }
    }
}

/// An ordered mapping of member name to value.
///
/// Member order is declaration order and is preserved through encoding,
/// decoding and member replacement.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Composite {
    members: Vec<(String, TaggedValue)>,
}

impl Composite {
    /// Creates an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a member, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<TaggedValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets a member. An existing member keeps its position; a new member is
    /// appended.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<TaggedValue>) {
        let name = name.into();
        let value = value.into();
        match self.members.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.members.push((name, value)),
        }
    }

    /// Returns a member by name.
    pub fn get(&self, name: &str) -> Option<&TaggedValue> {
        self.members.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Returns a mutable member by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut TaggedValue> {
        self.members
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Iterates members in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaggedValue)> {
        self.members.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the composite has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl<N: Into<String>, V: Into<TaggedValue>> FromIterator<(N, V)> for Composite {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut composite = Composite::new();
        for (name, value) in iter {
            composite.insert(name, value);
        }
        composite
    }
}

/// A value held by a tag.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TaggedValue {
    /// BOOL.
    Bool(bool),
    /// SINT, INT, DINT or LINT.
    SignedInt(SignedInt),
    /// REAL or LREAL.
    Float(Float),
    /// Logix STRING.
    Text(String),
    /// Structure / UDT instance.
    Composite(Composite),
}

impl TaggedValue {
    /// Returns the Logix type name of this value (`"DINT"`, `"STRING"`, ...).
    pub fn type_name(&self) -> &'static str {
        match self {
            TaggedValue::Bool(_) => "BOOL",
            TaggedValue::SignedInt(v) => v.width().type_name(),
            TaggedValue::Float(v) => v.width().type_name(),
            TaggedValue::Text(_) => "STRING",
            TaggedValue::Composite(_) => "STRUCT",
        }
    }

    /// Returns true for `SignedInt` and `Float` values.
    pub fn is_numeric(&self) -> bool {
        matches!(self, TaggedValue::SignedInt(_) | TaggedValue::Float(_))
    }

    /// Returns the boolean, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TaggedValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the integer widened to `i64`, if this is a `SignedInt`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TaggedValue::SignedInt(v) => Some(v.get()),
            _ => None,
        }
    }

    /// Returns the float widened to `f64`, if this is a `Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TaggedValue::Float(v) => Some(v.get()),
            _ => None,
        }
    }

    /// Returns the text, if this is a `Text`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TaggedValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the composite, if this is a `Composite`.
    pub fn as_composite(&self) -> Option<&Composite> {
        match self {
            TaggedValue::Composite(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaggedValue::Bool(v) => write!(f, "{v}"),
            TaggedValue::SignedInt(v) => write!(f, "{}", v.get()),
            TaggedValue::Float(Float::Real(v)) => write!(f, "{v}"),
            TaggedValue::Float(Float::Lreal(v)) => write!(f, "{v}"),
            TaggedValue::Text(v) => write!(f, "{v:?}"),
            TaggedValue::Composite(c) => {
                write!(f, "{{")?;
                for (i, (name, value)) in c.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for TaggedValue {
    fn from(v: bool) -> Self {
        TaggedValue::Bool(v)
    }
}

impl From<i8> for TaggedValue {
    fn from(v: i8) -> Self {
        TaggedValue::SignedInt(SignedInt::Sint(v))
    }
}

impl From<i16> for TaggedValue {
    fn from(v: i16) -> Self {
        TaggedValue::SignedInt(SignedInt::Int(v))
    }
}

impl From<i32> for TaggedValue {
    fn from(v: i32) -> Self {
        TaggedValue::SignedInt(SignedInt::Dint(v))
    }
}

impl From<i64> for TaggedValue {
    fn from(v: i64) -> Self {
        TaggedValue::SignedInt(SignedInt::Lint(v))
    }
}

impl From<f32> for TaggedValue {
    fn from(v: f32) -> Self {
        TaggedValue::Float(Float::Real(v))
    }
}

impl From<f64> for TaggedValue {
    fn from(v: f64) -> Self {
        TaggedValue::Float(Float::Lreal(v))
    }
}

impl From<String> for TaggedValue {
    fn from(v: String) -> Self {
        TaggedValue::Text(v)
    }
}

impl From<&str> for TaggedValue {
    fn from(v: &str) -> Self {
        TaggedValue::Text(v.to_string())
    }
}

impl From<Composite> for TaggedValue {
    fn from(v: Composite) -> Self {
        TaggedValue::Composite(v)
    }
}

/// The declared type of a tag or composite member.
///
/// Used as the decoding hint and as the native type that writes are checked
/// against.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataType {
    /// BOOL.
    Bool,
    /// SINT, INT, DINT or LINT.
    SignedInt(IntWidth),
    /// REAL or LREAL.
    Float(FloatWidth),
    /// Logix STRING.
    Text,
    /// A structure with a known layout.
    Composite(CompositeType),
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "BOOL"),
            DataType::SignedInt(w) => write!(f, "{}", w.type_name()),
            DataType::Float(w) => write!(f, "{}", w.type_name()),
            DataType::Text => write!(f, "STRING"),
            DataType::Composite(c) => write!(f, "{}", c.name),
        }
    }
}

/// Layout of a structure (UDT): its name, the controller's structure handle,
/// and its members in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CompositeType {
    /// UDT name.
    pub name: String,
    /// Structure handle reported by the controller in read replies.
    pub handle: u16,
    /// Members in declaration order.
    pub members: Vec<MemberDef>,
}

impl CompositeType {
    /// Creates a structure definition with no members.
    pub fn new(name: impl Into<String>, handle: u16) -> Self {
        Self {
            name: name.into(),
            handle,
            members: Vec::new(),
        }
    }

    /// Appends a member, builder style.
    pub fn member(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.members.push(MemberDef {
            name: name.into(),
            data_type,
        });
        self
    }

    /// Returns a member's type by name.
    pub fn member_type(&self, name: &str) -> Option<&DataType> {
        self.members
            .iter()
            .find(|m| m.name == name)
            .map(|m| &m.data_type)
    }
}

/// A named member of a [`CompositeType`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemberDef {
    /// Member name.
    pub name: String,
    /// Member type.
    pub data_type: DataType,
}

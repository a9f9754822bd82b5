//! In-memory property values of structured records.
//!
//! [`Value`] is the authoring-side representation every PropertyType decodes
//! text into, writes to the wire, and reads back. Scalars carry their exact
//! fixed-width kind so the wire layout never has to guess.

use crate::id::Guid;
use serde::{Deserialize, Serialize};
use std::fmt;

// ===========================================================================
// Scalars
// ===========================================================================

/// Fixed-width numeric and boolean kinds supported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
}

impl ScalarKind {
    /// Map a declared type tag onto a scalar kind. Accepts both the host
    /// language spelling (`int`, `ushort`, ...) and the Rust one (`i32`, `u16`).
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "bool" => ScalarKind::Bool,
            "sbyte" | "i8" => ScalarKind::I8,
            "byte" | "u8" => ScalarKind::U8,
            "short" | "i16" => ScalarKind::I16,
            "ushort" | "u16" => ScalarKind::U16,
            "int" | "i32" => ScalarKind::I32,
            "uint" | "u32" => ScalarKind::U32,
            "long" | "i64" => ScalarKind::I64,
            "ulong" | "u64" => ScalarKind::U64,
            "float" | "f32" => ScalarKind::F32,
            _ => return None,
        })
    }

    /// Canonical type name, as used in the rendered wire schema.
    pub fn tag(self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::I8 => "byte",
            ScalarKind::U8 => "ubyte",
            ScalarKind::I16 => "short",
            ScalarKind::U16 => "ushort",
            ScalarKind::I32 => "int",
            ScalarKind::U32 => "uint",
            ScalarKind::I64 => "long",
            ScalarKind::U64 => "ulong",
            ScalarKind::F32 => "float",
        }
    }

    /// Width in bytes of one value in a fixed-size record.
    pub fn width(self) -> usize {
        match self {
            ScalarKind::Bool | ScalarKind::I8 | ScalarKind::U8 => 1,
            ScalarKind::I16 | ScalarKind::U16 => 2,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::U64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, ScalarKind::Bool | ScalarKind::F32)
    }
}

/// A single fixed-width value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
}

impl Scalar {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::Bool(_) => ScalarKind::Bool,
            Scalar::I8(_) => ScalarKind::I8,
            Scalar::U8(_) => ScalarKind::U8,
            Scalar::I16(_) => ScalarKind::I16,
            Scalar::U16(_) => ScalarKind::U16,
            Scalar::I32(_) => ScalarKind::I32,
            Scalar::U32(_) => ScalarKind::U32,
            Scalar::I64(_) => ScalarKind::I64,
            Scalar::U64(_) => ScalarKind::U64,
            Scalar::F32(_) => ScalarKind::F32,
        }
    }

    /// The default value of a kind: `false` or zero.
    pub fn zero(kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::Bool => Scalar::Bool(false),
            ScalarKind::I8 => Scalar::I8(0),
            ScalarKind::U8 => Scalar::U8(0),
            ScalarKind::I16 => Scalar::I16(0),
            ScalarKind::U16 => Scalar::U16(0),
            ScalarKind::I32 => Scalar::I32(0),
            ScalarKind::U32 => Scalar::U32(0),
            ScalarKind::I64 => Scalar::I64(0),
            ScalarKind::U64 => Scalar::U64(0),
            ScalarKind::F32 => Scalar::F32(0.0),
        }
    }

    /// Integer view, used for enum discriminants. `None` for bool, float,
    /// and `u64` values above `i64::MAX`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Scalar::I8(v) => Some(v.into()),
            Scalar::U8(v) => Some(v.into()),
            Scalar::I16(v) => Some(v.into()),
            Scalar::U16(v) => Some(v.into()),
            Scalar::I32(v) => Some(v.into()),
            Scalar::U32(v) => Some(v.into()),
            Scalar::I64(v) => Some(v),
            Scalar::U64(v) => i64::try_from(v).ok(),
            Scalar::Bool(_) | Scalar::F32(_) => None,
        }
    }

    /// Narrow an integer into `kind`. `None` if it does not fit.
    pub fn from_i64(kind: ScalarKind, v: i64) -> Option<Self> {
        Some(match kind {
            ScalarKind::I8 => Scalar::I8(i8::try_from(v).ok()?),
            ScalarKind::U8 => Scalar::U8(u8::try_from(v).ok()?),
            ScalarKind::I16 => Scalar::I16(i16::try_from(v).ok()?),
            ScalarKind::U16 => Scalar::U16(u16::try_from(v).ok()?),
            ScalarKind::I32 => Scalar::I32(i32::try_from(v).ok()?),
            ScalarKind::U32 => Scalar::U32(u32::try_from(v).ok()?),
            ScalarKind::I64 => Scalar::I64(v),
            ScalarKind::U64 => Scalar::U64(u64::try_from(v).ok()?),
            ScalarKind::Bool | ScalarKind::F32 => return None,
        })
    }

    /// Parse the text form of a scalar. Booleans also accept `0` and `1`.
    pub fn parse(kind: ScalarKind, text: &str) -> Option<Self> {
        let text = text.trim();
        Some(match kind {
            ScalarKind::Bool => {
                if text.eq_ignore_ascii_case("true") || text == "1" {
                    Scalar::Bool(true)
                } else if text.eq_ignore_ascii_case("false") || text == "0" {
                    Scalar::Bool(false)
                } else {
                    return None;
                }
            }
            ScalarKind::I8 => Scalar::I8(text.parse().ok()?),
            ScalarKind::U8 => Scalar::U8(text.parse().ok()?),
            ScalarKind::I16 => Scalar::I16(text.parse().ok()?),
            ScalarKind::U16 => Scalar::U16(text.parse().ok()?),
            ScalarKind::I32 => Scalar::I32(text.parse().ok()?),
            ScalarKind::U32 => Scalar::U32(text.parse().ok()?),
            ScalarKind::I64 => Scalar::I64(text.parse().ok()?),
            ScalarKind::U64 => Scalar::U64(text.parse().ok()?),
            ScalarKind::F32 => Scalar::F32(text.parse().ok()?),
        })
    }

    /// Write the little-endian encoding into `out`, which must be exactly
    /// [`ScalarKind::width`] bytes long.
    pub fn write_le(&self, out: &mut [u8]) {
        match *self {
            Scalar::Bool(v) => out.copy_from_slice(&[u8::from(v)]),
            Scalar::I8(v) => out.copy_from_slice(&v.to_le_bytes()),
            Scalar::U8(v) => out.copy_from_slice(&[v]),
            Scalar::I16(v) => out.copy_from_slice(&v.to_le_bytes()),
            Scalar::U16(v) => out.copy_from_slice(&v.to_le_bytes()),
            Scalar::I32(v) => out.copy_from_slice(&v.to_le_bytes()),
            Scalar::U32(v) => out.copy_from_slice(&v.to_le_bytes()),
            Scalar::I64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Scalar::U64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Scalar::F32(v) => out.copy_from_slice(&v.to_le_bytes()),
        }
    }

    /// Read a little-endian value of `kind` from the front of `bytes`.
    pub fn read_le(kind: ScalarKind, bytes: &[u8]) -> Option<Self> {
        let b = bytes.get(..kind.width())?;
        Some(match kind {
            ScalarKind::Bool => Scalar::Bool(b[0] != 0),
            ScalarKind::I8 => Scalar::I8(i8::from_le_bytes([b[0]])),
            ScalarKind::U8 => Scalar::U8(b[0]),
            ScalarKind::I16 => Scalar::I16(i16::from_le_bytes(b.try_into().ok()?)),
            ScalarKind::U16 => Scalar::U16(u16::from_le_bytes(b.try_into().ok()?)),
            ScalarKind::I32 => Scalar::I32(i32::from_le_bytes(b.try_into().ok()?)),
            ScalarKind::U32 => Scalar::U32(u32::from_le_bytes(b.try_into().ok()?)),
            ScalarKind::I64 => Scalar::I64(i64::from_le_bytes(b.try_into().ok()?)),
            ScalarKind::U64 => Scalar::U64(u64::from_le_bytes(b.try_into().ok()?)),
            ScalarKind::F32 => Scalar::F32(f32::from_le_bytes(b.try_into().ok()?)),
        })
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::I8(v) => write!(f, "{v}"),
            Scalar::U8(v) => write!(f, "{v}"),
            Scalar::I16(v) => write!(f, "{v}"),
            Scalar::U16(v) => write!(f, "{v}"),
            Scalar::I32(v) => write!(f, "{v}"),
            Scalar::U32(v) => write!(f, "{v}"),
            Scalar::I64(v) => write!(f, "{v}"),
            Scalar::U64(v) => write!(f, "{v}"),
            Scalar::F32(v) => write!(f, "{v}"),
        }
    }
}

// ===========================================================================
// Time and multi-component shapes
// ===========================================================================

/// Time-valued properties. Both are stored as `i64` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeKind {
    /// A signed span of time (`TimeSpan`).
    Duration,
    /// A UTC instant, as milliseconds since the Unix epoch (`DateTime`).
    DateTime,
}

impl TimeKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "TimeSpan" => Some(TimeKind::Duration),
            "DateTime" => Some(TimeKind::DateTime),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            TimeKind::Duration => "TimeSpan",
            TimeKind::DateTime => "DateTime",
        }
    }
}

/// Known multi-component value shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositeShape {
    Vector2,
    Vector3,
    Vector2Int,
    Vector3Int,
    Color,
}

impl CompositeShape {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "Vector2" => Some(CompositeShape::Vector2),
            "Vector3" => Some(CompositeShape::Vector3),
            "Vector2Int" => Some(CompositeShape::Vector2Int),
            "Vector3Int" => Some(CompositeShape::Vector3Int),
            "Color" => Some(CompositeShape::Color),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            CompositeShape::Vector2 => "Vector2",
            CompositeShape::Vector3 => "Vector3",
            CompositeShape::Vector2Int => "Vector2Int",
            CompositeShape::Vector3Int => "Vector3Int",
            CompositeShape::Color => "Color",
        }
    }

    /// Component names in declaration order. The order is part of the wire
    /// contract: component `k` always lives in wire field/vector `k`.
    pub fn components(self) -> &'static [&'static str] {
        match self {
            CompositeShape::Vector2 | CompositeShape::Vector2Int => &["x", "y"],
            CompositeShape::Vector3 | CompositeShape::Vector3Int => &["x", "y", "z"],
            CompositeShape::Color => &["r", "g", "b", "a"],
        }
    }

    pub fn arity(self) -> usize {
        self.components().len()
    }

    pub fn component_kind(self) -> ScalarKind {
        match self {
            CompositeShape::Vector2Int | CompositeShape::Vector3Int => ScalarKind::I32,
            CompositeShape::Vector2 | CompositeShape::Vector3 | CompositeShape::Color => {
                ScalarKind::F32
            }
        }
    }

    /// Zero vector, or opaque black for colors.
    pub fn default_components(self) -> Vec<Scalar> {
        match self {
            CompositeShape::Color => vec![
                Scalar::F32(0.0),
                Scalar::F32(0.0),
                Scalar::F32(0.0),
                Scalar::F32(1.0),
            ],
            _ => vec![Scalar::zero(self.component_kind()); self.arity()],
        }
    }
}

// ===========================================================================
// Values
// ===========================================================================

/// A property value held by a structured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Plain, localizable-key, and identifier text.
    Str(String),
    /// Enum member, by name.
    Enum(String),
    Scalar(Scalar),
    /// Milliseconds.
    Duration(i64),
    /// Milliseconds since the Unix epoch, UTC.
    DateTime(i64),
    /// Reference by identity into another top-level record type.
    Ref(Option<Guid>),
    /// Embedded sub-structure.
    Struct(Option<StructValue>),
    /// Components of a multi-component value, in declaration order.
    Composite(Vec<Scalar>),
    /// External asset key.
    Asset(Option<String>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

/// The fields of an embedded sub-structure, in the struct's property order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructValue {
    pub fields: Vec<(String, Value)>,
}

impl StructValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.fields.push((name.to_string(), value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

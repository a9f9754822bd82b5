//! Text codec: one cell of the tabular interchange format to a [`Value`]
//! and back.
//!
//! Top-level cells follow the interchange convention exactly: `,` joins
//! scalar list elements or the components of one tuple, `|` joins whole
//! tuples (lists of multi-component values, references and sub-structures).
//! Lists nested inside a sub-structure tuple are bracketed as `[e1;e2]`.
//!
//! Blank cells decode to the property's default and never fail, except for
//! the identifier, which must not be blank.
//!
//! [`TextCodec::encode`] refuses values whose cell would read back as
//! something else, with [`TextCodecError::Unrepresentable`]: a non-empty
//! list that writes as a blank cell, a non-null struct that writes as a
//! blank cell, a null struct inside a list or another struct, a blank asset
//! key, and text containing a separator reserved at its position.

use crate::id::Guid;
use crate::property::{PropertyType, Shape, ValueType, default_element};
use crate::registry::SchemaRegistry;
use crate::value::{CompositeShape, Scalar, ScalarKind, StructValue, TimeKind, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat};

pub const COMPONENT_SEPARATOR: char = ',';
pub const ELEMENT_SEPARATOR: char = '|';
pub const NESTED_OPEN: char = '[';
pub const NESTED_SEPARATOR: char = ';';
pub const NESTED_CLOSE: char = ']';

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextCodecError {
    #[error("identifier must not be blank")]
    BlankIdentifier,

    #[error("'{text}' is not a valid {kind}")]
    InvalidScalar { kind: &'static str, text: String },

    #[error("'{member}' is not a member of enum {enum_name}")]
    UnknownEnumMember { enum_name: String, member: String },

    #[error("expected {expected} components, found {found} in '{text}'")]
    Arity {
        expected: usize,
        found: usize,
        text: String,
    },

    #[error("no {record_type} record with identifier '{identifier}'")]
    UnresolvedReference {
        record_type: String,
        identifier: String,
    },

    #[error("no {record_type} record with GUID {guid}")]
    UnknownGuid { record_type: String, guid: Guid },

    #[error("invalid duration '{0}', expected [-][d.]hh:mm:ss[.fff]")]
    InvalidDuration(String),

    #[error("invalid date-time '{0}'")]
    InvalidDateTime(String),

    #[error("unbalanced brackets in '{0}'")]
    Unbalanced(String),

    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("value {value} does not fit property type {expected}")]
    TypeMismatch { expected: String, value: String },

    #[error("{value} cannot be written as a cell: {reason}")]
    Unrepresentable { value: String, reason: &'static str },
}

/// Maps record references between their text form (the target's
/// Identifier) and their stored form (the target's GUID).
pub trait ReferenceResolver {
    fn guid_for(&self, record_type: &str, identifier: &str) -> Option<Guid>;
    fn identifier_for(&self, record_type: &str, guid: &Guid) -> Option<String>;
}

/// Resolver for schemas without record references.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReferences;

impl ReferenceResolver for NoReferences {
    fn guid_for(&self, _: &str, _: &str) -> Option<Guid> {
        None
    }

    fn identifier_for(&self, _: &str, _: &Guid) -> Option<String> {
        None
    }
}

// ===========================================================================
// Codec
// ===========================================================================

pub struct TextCodec<'a> {
    registry: &'a SchemaRegistry,
    refs: &'a dyn ReferenceResolver,
}

impl<'a> TextCodec<'a> {
    pub fn new(registry: &'a SchemaRegistry, refs: &'a dyn ReferenceResolver) -> Self {
        Self { registry, refs }
    }

    /// Decode one cell.
    pub fn decode(&self, prop: &PropertyType, cell: &str) -> Result<Value, TextCodecError> {
        match &prop.shape {
            Shape::Identifier => {
                let id = cell.trim();
                if id.is_empty() {
                    Err(TextCodecError::BlankIdentifier)
                } else {
                    Ok(Value::Str(id.to_string()))
                }
            }
            Shape::Single(vt) if is_tuple_element(vt) && cell.trim().is_empty() => {
                Ok(default_element(vt, self.registry))
            }
            Shape::Single(vt) => self.decode_list_element(vt, cell),
            Shape::List(vt) => {
                if cell.trim().is_empty() {
                    return Ok(Value::List(Vec::new()));
                }
                let items = if is_tuple_element(vt) {
                    cell.split(ELEMENT_SEPARATOR)
                        .map(|part| self.decode_list_element(vt, part))
                        .collect::<Result<_, _>>()?
                } else {
                    cell.split(COMPONENT_SEPARATOR)
                        .map(|part| self.decode_element(vt, part))
                        .collect::<Result<_, _>>()?
                };
                Ok(Value::List(items))
            }
        }
    }

    /// Encode one value. The inverse of [`decode`](Self::decode) over the
    /// property's legal domain.
    pub fn encode(&self, prop: &PropertyType, value: &Value) -> Result<String, TextCodecError> {
        match &prop.shape {
            Shape::Identifier => match value {
                Value::Str(s) => Ok(s.clone()),
                other => Err(mismatch("identifier", other)),
            },
            Shape::Single(vt) => match (vt, value) {
                (ValueType::Embedded(_), Value::Struct(None)) => Ok(String::new()),
                (ValueType::Embedded(_), _) => {
                    let cell = self.encode_tuple(vt, value)?;
                    if cell.trim().is_empty() {
                        return Err(unrepresentable(value, "a blank struct cell reads back as null"));
                    }
                    Ok(cell)
                }
                (ValueType::Composite(_), _) => self.encode_tuple(vt, value),
                _ => self.encode_element(vt, value),
            },
            Shape::List(vt) => {
                let items = value
                    .as_list()
                    .ok_or_else(|| mismatch(&format!("List<{}>", vt.host_type()), value))?;
                let sep = if is_tuple_element(vt) {
                    ELEMENT_SEPARATOR
                } else {
                    COMPONENT_SEPARATOR
                };
                let parts = items
                    .iter()
                    .map(|v| {
                        let part = match vt {
                            ValueType::Embedded(_) | ValueType::Composite(_) => {
                                self.encode_tuple(vt, v)?
                            }
                            _ => self.encode_element(vt, v)?,
                        };
                        reserve(part, &[sep], v)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let cell = parts.join(&sep.to_string());
                if !items.is_empty() && cell.trim().is_empty() {
                    return Err(unrepresentable(value, "a blank list cell reads back as empty"));
                }
                Ok(cell)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Elements
    // -----------------------------------------------------------------------

    fn decode_list_element(&self, vt: &ValueType, text: &str) -> Result<Value, TextCodecError> {
        match vt {
            ValueType::Embedded(_) | ValueType::Composite(_) => self.decode_tuple(vt, text),
            _ => self.decode_element(vt, text),
        }
    }

    /// Decode a value that occupies exactly one component.
    fn decode_element(&self, vt: &ValueType, text: &str) -> Result<Value, TextCodecError> {
        let trimmed = text.trim();
        match vt {
            ValueType::String | ValueType::LocalizedText => Ok(Value::Str(text.to_string())),
            ValueType::Enum(name) => {
                let def = self
                    .registry
                    .enum_def(name)
                    .ok_or_else(|| TextCodecError::UnknownType(name.clone()))?;
                if trimmed.is_empty() {
                    return Ok(default_element(vt, self.registry));
                }
                if def.value_of(trimmed).is_some() {
                    return Ok(Value::Enum(trimmed.to_string()));
                }
                trimmed
                    .parse::<i64>()
                    .ok()
                    .and_then(|v| def.name_of(v))
                    .map(|m| Value::Enum(m.to_string()))
                    .ok_or_else(|| TextCodecError::UnknownEnumMember {
                        enum_name: name.clone(),
                        member: trimmed.to_string(),
                    })
            }
            ValueType::Scalar(kind) => parse_scalar(*kind, trimmed).map(Value::Scalar),
            ValueType::Time(TimeKind::Duration) if trimmed.is_empty() => Ok(Value::Duration(0)),
            ValueType::Time(TimeKind::Duration) => parse_duration(trimmed).map(Value::Duration),
            ValueType::Time(TimeKind::DateTime) if trimmed.is_empty() => Ok(Value::DateTime(0)),
            ValueType::Time(TimeKind::DateTime) => parse_date_time(trimmed).map(Value::DateTime),
            ValueType::RecordRef(_) if trimmed.is_empty() => Ok(Value::Ref(None)),
            ValueType::RecordRef(target) => self
                .refs
                .guid_for(target, trimmed)
                .map(|g| Value::Ref(Some(g)))
                .ok_or_else(|| TextCodecError::UnresolvedReference {
                    record_type: target.clone(),
                    identifier: trimmed.to_string(),
                }),
            ValueType::Asset if trimmed.is_empty() => Ok(Value::Asset(None)),
            ValueType::Asset => Ok(Value::Asset(Some(trimmed.to_string()))),
            ValueType::Embedded(_) | ValueType::Composite(_) => self.decode_tuple(vt, text),
        }
    }

    fn encode_element(&self, vt: &ValueType, value: &Value) -> Result<String, TextCodecError> {
        match (vt, value) {
            (ValueType::String | ValueType::LocalizedText, Value::Str(s)) => Ok(s.clone()),
            (ValueType::Enum(name), Value::Enum(member)) => {
                let def = self
                    .registry
                    .enum_def(name)
                    .ok_or_else(|| TextCodecError::UnknownType(name.clone()))?;
                if def.value_of(member).is_none() {
                    return Err(TextCodecError::UnknownEnumMember {
                        enum_name: name.clone(),
                        member: member.clone(),
                    });
                }
                Ok(member.clone())
            }
            (ValueType::Scalar(kind), Value::Scalar(s)) if s.kind() == *kind => Ok(s.to_string()),
            (ValueType::Time(TimeKind::Duration), Value::Duration(ms)) => Ok(format_duration(*ms)),
            (ValueType::Time(TimeKind::DateTime), Value::DateTime(ms)) => format_date_time(*ms),
            (ValueType::RecordRef(_), Value::Ref(None)) => Ok(String::new()),
            (ValueType::RecordRef(target), Value::Ref(Some(guid))) => self
                .refs
                .identifier_for(target, guid)
                .ok_or_else(|| TextCodecError::UnknownGuid {
                    record_type: target.clone(),
                    guid: guid.clone(),
                }),
            (ValueType::Asset, Value::Asset(None)) => Ok(String::new()),
            (ValueType::Asset, Value::Asset(Some(key))) => {
                if key.is_empty() || key.trim() != key {
                    return Err(unrepresentable(value, "asset keys are trimmed and non-blank"));
                }
                Ok(key.clone())
            }
            (ValueType::Embedded(_) | ValueType::Composite(_), _) => self.encode_tuple(vt, value),
            (vt, other) => Err(mismatch(&vt.host_type(), other)),
        }
    }

    // -----------------------------------------------------------------------
    // Tuples
    // -----------------------------------------------------------------------

    fn decode_tuple(&self, vt: &ValueType, text: &str) -> Result<Value, TextCodecError> {
        let parts = split_top_level(text, COMPONENT_SEPARATOR)?;
        let expected = self.tuple_arity(vt)?;
        if parts.len() != expected {
            return Err(TextCodecError::Arity {
                expected,
                found: parts.len(),
                text: text.to_string(),
            });
        }
        let mut cursor = parts.into_iter();
        match vt {
            ValueType::Composite(shape) => decode_components(*shape, &mut cursor, text),
            ValueType::Embedded(name) => {
                Ok(Value::Struct(Some(self.decode_struct(name, &mut cursor, text)?)))
            }
            other => {
                let part = cursor.next().unwrap_or_default();
                self.decode_element(other, part)
            }
        }
    }

    fn encode_tuple(&self, vt: &ValueType, value: &Value) -> Result<String, TextCodecError> {
        let mut parts = Vec::new();
        self.encode_components(vt, value, &mut parts)?;
        Ok(parts.join(&COMPONENT_SEPARATOR.to_string()))
    }

    /// Number of `,`-separated components one value of `vt` occupies.
    fn tuple_arity(&self, vt: &ValueType) -> Result<usize, TextCodecError> {
        match vt {
            ValueType::Composite(shape) => Ok(shape.arity()),
            ValueType::Embedded(name) => {
                let ty = self
                    .registry
                    .resolved_type(name)
                    .ok_or_else(|| TextCodecError::UnknownType(name.clone()))?;
                let mut total = 0;
                for p in &ty.properties {
                    total += match &p.shape {
                        Shape::Single(inner) => self.tuple_arity(inner)?,
                        Shape::Identifier | Shape::List(_) => 1,
                    };
                }
                Ok(total)
            }
            _ => Ok(1),
        }
    }

    fn decode_struct<'t, I>(
        &self,
        name: &str,
        cursor: &mut I,
        text: &str,
    ) -> Result<StructValue, TextCodecError>
    where
        I: Iterator<Item = &'t str>,
    {
        let ty = self
            .registry
            .resolved_type(name)
            .ok_or_else(|| TextCodecError::UnknownType(name.to_string()))?;
        let mut out = StructValue::new();
        for p in &ty.properties {
            let value = match &p.shape {
                Shape::Single(ValueType::Embedded(inner)) => {
                    Value::Struct(Some(self.decode_struct(inner, cursor, text)?))
                }
                Shape::Single(ValueType::Composite(shape)) => {
                    decode_components(*shape, cursor, text)?
                }
                Shape::Single(vt) => self.decode_element(vt, next_part(cursor, text)?)?,
                Shape::Identifier => self.decode(p, next_part(cursor, text)?)?,
                Shape::List(vt) => self.decode_nested_list(vt, next_part(cursor, text)?)?,
            };
            out.fields.push((p.name.clone(), value));
        }
        Ok(out)
    }

    fn encode_components(
        &self,
        vt: &ValueType,
        value: &Value,
        out: &mut Vec<String>,
    ) -> Result<(), TextCodecError> {
        match (vt, value) {
            (ValueType::Composite(shape), Value::Composite(components)) => {
                if components.len() != shape.arity()
                    || components.iter().any(|c| c.kind() != shape.component_kind())
                {
                    return Err(mismatch(shape.tag(), value));
                }
                out.extend(components.iter().map(|c| c.to_string()));
                Ok(())
            }
            (ValueType::Embedded(_), Value::Struct(None)) => Err(unrepresentable(
                value,
                "a null struct inside a list or struct reads back as its defaults",
            )),
            (ValueType::Embedded(name), Value::Struct(Some(s))) => {
                let ty = self
                    .registry
                    .resolved_type(name)
                    .ok_or_else(|| TextCodecError::UnknownType(name.clone()))?;
                for p in &ty.properties {
                    let default;
                    let field = match s.get(&p.name) {
                        Some(v) => v,
                        None => {
                            // An absent nested struct flattens to its defaults.
                            default = match &p.shape {
                                Shape::Single(ValueType::Embedded(_)) => {
                                    Value::Struct(Some(StructValue::new()))
                                }
                                _ => p
                                    .default_value(self.registry)
                                    .unwrap_or(Value::Str(String::new())),
                            };
                            &default
                        }
                    };
                    match &p.shape {
                        Shape::Single(inner @ (ValueType::Embedded(_) | ValueType::Composite(_))) => {
                            self.encode_components(inner, field, out)?
                        }
                        Shape::Single(inner) => {
                            out.push(reserve(self.encode_element(inner, field)?, TUPLE_RESERVED, field)?)
                        }
                        Shape::Identifier => out.push(reserve(self.encode(p, field)?, TUPLE_RESERVED, field)?),
                        Shape::List(inner) => out.push(self.encode_nested_list(inner, field)?),
                    }
                }
                Ok(())
            }
            (ValueType::Composite(shape), other) => Err(mismatch(shape.tag(), other)),
            (ValueType::Embedded(name), other) => Err(mismatch(name, other)),
            (other, v) => {
                out.push(reserve(self.encode_element(other, v)?, TUPLE_RESERVED, v)?);
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lists inside tuples
    // -----------------------------------------------------------------------

    fn decode_nested_list(&self, vt: &ValueType, text: &str) -> Result<Value, TextCodecError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Value::List(Vec::new()));
        }
        let inner = trimmed
            .strip_prefix(NESTED_OPEN)
            .and_then(|rest| rest.strip_suffix(NESTED_CLOSE))
            .ok_or_else(|| TextCodecError::Unbalanced(text.to_string()))?;
        if inner.trim().is_empty() {
            return Ok(Value::List(Vec::new()));
        }
        let items = split_top_level(inner, NESTED_SEPARATOR)?
            .into_iter()
            .map(|part| self.decode_list_element(vt, part))
            .collect::<Result<_, _>>()?;
        Ok(Value::List(items))
    }

    fn encode_nested_list(&self, vt: &ValueType, value: &Value) -> Result<String, TextCodecError> {
        let items = value
            .as_list()
            .ok_or_else(|| mismatch(&format!("List<{}>", vt.host_type()), value))?;
        if items.is_empty() {
            return Ok(String::new());
        }
        let parts = items
            .iter()
            .map(|v| match vt {
                ValueType::Embedded(_) | ValueType::Composite(_) => self.encode_tuple(vt, v),
                _ => reserve(self.encode_element(vt, v)?, TUPLE_RESERVED, v),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if let [only] = parts.as_slice()
            && only.trim().is_empty()
        {
            return Err(unrepresentable(value, "a blank nested list reads back as empty"));
        }
        Ok(format!(
            "{NESTED_OPEN}{}{NESTED_CLOSE}",
            parts.join(&NESTED_SEPARATOR.to_string())
        ))
    }
}

fn is_tuple_element(vt: &ValueType) -> bool {
    matches!(
        vt,
        ValueType::RecordRef(_) | ValueType::Embedded(_) | ValueType::Composite(_)
    )
}

/// Characters that structure a tuple cell and may not appear in its text.
const TUPLE_RESERVED: &[char] = &[
    COMPONENT_SEPARATOR,
    ELEMENT_SEPARATOR,
    NESTED_OPEN,
    NESTED_SEPARATOR,
    NESTED_CLOSE,
];

fn reserve(text: String, reserved: &[char], value: &Value) -> Result<String, TextCodecError> {
    if text.contains(reserved) {
        return Err(unrepresentable(value, "text contains a reserved separator"));
    }
    Ok(text)
}

fn unrepresentable(value: &Value, reason: &'static str) -> TextCodecError {
    TextCodecError::Unrepresentable {
        value: format!("{value:?}"),
        reason,
    }
}

fn mismatch(expected: &str, value: &Value) -> TextCodecError {
    TextCodecError::TypeMismatch {
        expected: expected.to_string(),
        value: format!("{value:?}"),
    }
}

fn next_part<'t, I>(cursor: &mut I, text: &str) -> Result<&'t str, TextCodecError>
where
    I: Iterator<Item = &'t str>,
{
    cursor.next().ok_or_else(|| TextCodecError::Arity {
        expected: 1,
        found: 0,
        text: text.to_string(),
    })
}

fn decode_components<'t, I>(
    shape: CompositeShape,
    cursor: &mut I,
    text: &str,
) -> Result<Value, TextCodecError>
where
    I: Iterator<Item = &'t str>,
{
    let mut components = Vec::with_capacity(shape.arity());
    for _ in 0..shape.arity() {
        let part = next_part(cursor, text)?;
        components.push(parse_scalar(shape.component_kind(), part.trim())?);
    }
    Ok(Value::Composite(components))
}

fn parse_scalar(kind: ScalarKind, text: &str) -> Result<Scalar, TextCodecError> {
    if text.is_empty() {
        return Ok(Scalar::zero(kind));
    }
    Scalar::parse(kind, text).ok_or_else(|| TextCodecError::InvalidScalar {
        kind: kind.tag(),
        text: text.to_string(),
    })
}

/// Split on `sep` wherever the bracket depth is zero.
pub fn split_top_level(text: &str, sep: char) -> Result<Vec<&str>, TextCodecError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            NESTED_OPEN => depth += 1,
            NESTED_CLOSE => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| TextCodecError::Unbalanced(text.to_string()))?;
            }
            c if c == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(TextCodecError::Unbalanced(text.to_string()));
    }
    parts.push(&text[start..]);
    Ok(parts)
}

// ===========================================================================
// Time formats
// ===========================================================================

/// Parse `[-][d.]hh:mm[:ss[.fff]]` into milliseconds.
pub fn parse_duration(text: &str) -> Result<i64, TextCodecError> {
    let invalid = || TextCodecError::InvalidDuration(text.to_string());
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    let fields: Vec<&str> = body.split(':').collect();
    if !(2..=3).contains(&fields.len()) {
        return Err(invalid());
    }
    let (days, hours) = match fields[0].split_once('.') {
        Some((d, h)) => (parse_digits(d).ok_or_else(invalid)?, h),
        None => (0, fields[0]),
    };
    let hours = parse_digits(hours).ok_or_else(invalid)?;
    let minutes = parse_digits(fields[1]).ok_or_else(invalid)?;
    let (seconds, millis) = match fields.get(2) {
        None => (0, 0),
        Some(sec) => match sec.split_once('.') {
            Some((s, frac)) => (
                parse_digits(s).ok_or_else(invalid)?,
                parse_fraction(frac).ok_or_else(invalid)?,
            ),
            None => (parse_digits(sec).ok_or_else(invalid)?, 0),
        },
    };
    if hours >= 24 || minutes >= 60 || seconds >= 60 {
        return Err(invalid());
    }

    let total = days
        .checked_mul(MS_PER_DAY)
        .and_then(|t| t.checked_add(hours * MS_PER_HOUR))
        .and_then(|t| t.checked_add(minutes * MS_PER_MINUTE))
        .and_then(|t| t.checked_add(seconds * MS_PER_SECOND))
        .and_then(|t| t.checked_add(millis))
        .ok_or_else(invalid)?;
    Ok(if negative { -total } else { total })
}

fn parse_digits(s: &str) -> Option<i64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Fractional seconds to milliseconds; digits past the third are dropped.
fn parse_fraction(s: &str) -> Option<i64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(
        s.bytes()
            .chain(std::iter::repeat(b'0'))
            .take(3)
            .fold(0, |ms, b| ms * 10 + i64::from(b - b'0')),
    )
}

/// Format milliseconds as `[-][d.]hh:mm:ss[.fff]`.
pub fn format_duration(ms: i64) -> String {
    let sign = if ms < 0 { "-" } else { "" };
    let abs = ms.unsigned_abs();
    let (day, hour, minute, second) = (
        MS_PER_DAY as u64,
        MS_PER_HOUR as u64,
        MS_PER_MINUTE as u64,
        MS_PER_SECOND as u64,
    );
    let days = abs / day;
    let hours = abs % day / hour;
    let minutes = abs % hour / minute;
    let seconds = abs % minute / second;
    let millis = abs % second;

    let mut out = String::from(sign);
    if days > 0 {
        out.push_str(&format!("{days}."));
    }
    out.push_str(&format!("{hours:02}:{minutes:02}:{seconds:02}"));
    if millis > 0 {
        out.push_str(&format!(".{millis:03}"));
    }
    out
}

/// Parse an RFC 3339 timestamp, or a naive `YYYY-MM-DD[ HH:MM:SS]` taken as
/// UTC, into Unix milliseconds.
pub fn parse_date_time(text: &str) -> Result<i64, TextCodecError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(naive.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
        .ok_or_else(|| TextCodecError::InvalidDateTime(text.to_string()))
}

/// Format Unix milliseconds as RFC 3339 UTC, with milliseconds only when
/// they are non-zero.
pub fn format_date_time(ms: i64) -> Result<String, TextCodecError> {
    let dt = DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| TextCodecError::InvalidDateTime(ms.to_string()))?;
    let precision = if ms.rem_euclid(1_000) == 0 {
        SecondsFormat::Secs
    } else {
        SecondsFormat::Millis
    };
    Ok(dt.to_rfc3339_opts(precision, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MapReferences, fixture_registry, label, sign_registry};

    fn codec_parts() -> (SchemaRegistry, MapReferences) {
        let reg = fixture_registry();
        let mut refs = MapReferences::new();
        refs.insert("Item", "Coin", Guid::new("g-coin"));
        refs.insert("Item", "Gem", Guid::new("g-gem"));
        (reg, refs)
    }

    fn prop<'r>(reg: &'r SchemaRegistry, ty: &str, name: &str) -> &'r PropertyType {
        reg.resolved_type(ty).unwrap().property(name).unwrap()
    }

    // -----------------------------------------------------------------------
    // Delimiter convention
    // -----------------------------------------------------------------------

    #[test]
    fn scalar_lists_use_commas() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        let p = prop(&reg, "Monster", "levels");
        let v = codec.decode(p, "1, 2,3").unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Scalar(Scalar::I32(1)),
                Value::Scalar(Scalar::I32(2)),
                Value::Scalar(Scalar::I32(3)),
            ])
        );
        assert_eq!(codec.encode(p, &v).unwrap(), "1,2,3");
    }

    #[test]
    fn composite_lists_use_pipes_between_tuples() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        let p = prop(&reg, "Monster", "path");
        let v = codec.decode(p, "1,2,3|4.5,5,6").unwrap();
        let items = v.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1],
            Value::Composite(vec![Scalar::F32(4.5), Scalar::F32(5.0), Scalar::F32(6.0)])
        );
        assert_eq!(codec.encode(p, &v).unwrap(), "1,2,3|4.5,5,6");
    }

    #[test]
    fn reference_lists_use_pipes_and_identifiers() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        let p = prop(&reg, "Monster", "drops");
        let v = codec.decode(p, "Coin|Gem").unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Ref(Some(Guid::new("g-coin"))),
                Value::Ref(Some(Guid::new("g-gem"))),
            ])
        );
        assert_eq!(codec.encode(p, &v).unwrap(), "Coin|Gem");
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        let err = codec.decode(prop(&reg, "Monster", "drops"), "Coin|Ruby").unwrap_err();
        assert_eq!(
            err,
            TextCodecError::UnresolvedReference {
                record_type: "Item".into(),
                identifier: "Ruby".into()
            }
        );
    }

    // -----------------------------------------------------------------------
    // Blank cells
    // -----------------------------------------------------------------------

    #[test]
    fn blank_cells_decode_to_defaults() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        assert_eq!(
            codec.decode(prop(&reg, "Item", "price"), "").unwrap(),
            Value::Scalar(Scalar::I32(0))
        );
        assert_eq!(
            codec.decode(prop(&reg, "Item", "rarity"), " ").unwrap(),
            Value::Enum("Common".into())
        );
        assert_eq!(
            codec.decode(prop(&reg, "Monster", "stats"), "").unwrap(),
            Value::Struct(None)
        );
        assert_eq!(
            codec.decode(prop(&reg, "Monster", "drops"), "").unwrap(),
            Value::List(vec![])
        );
        assert_eq!(
            codec.decode(prop(&reg, "Item", "tint"), "").unwrap(),
            Value::Composite(CompositeShape::Color.default_components())
        );
    }

    #[test]
    fn blank_identifier_is_rejected() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        assert_eq!(
            codec.decode(prop(&reg, "Item", "Identifier"), "  "),
            Err(TextCodecError::BlankIdentifier)
        );
    }

    // -----------------------------------------------------------------------
    // Sub-structures
    // -----------------------------------------------------------------------

    #[test]
    fn struct_tuples_flatten_and_bracket_lists() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        let p = prop(&reg, "Monster", "stats");
        // Stats { hp: int, speed: float, offset: Vector2, tags: List<string> }
        let v = codec.decode(p, "10,1.5,0,1,[fast;tough]").unwrap();
        let Value::Struct(Some(s)) = &v else {
            panic!("expected struct, got {v:?}");
        };
        assert_eq!(s.get("hp"), Some(&Value::Scalar(Scalar::I32(10))));
        assert_eq!(
            s.get("offset"),
            Some(&Value::Composite(vec![Scalar::F32(0.0), Scalar::F32(1.0)]))
        );
        assert_eq!(
            s.get("tags"),
            Some(&Value::List(vec![
                Value::Str("fast".into()),
                Value::Str("tough".into())
            ]))
        );
        assert_eq!(codec.encode(p, &v).unwrap(), "10,1.5,0,1,[fast;tough]");
    }

    #[test]
    fn struct_arity_is_checked() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        let err = codec.decode(prop(&reg, "Monster", "stats"), "10,1.5").unwrap_err();
        assert!(matches!(err, TextCodecError::Arity { expected: 5, found: 2, .. }));
    }

    #[test]
    fn unbalanced_brackets_are_rejected() {
        assert!(matches!(
            split_top_level("a,[b;c", ','),
            Err(TextCodecError::Unbalanced(_))
        ));
        assert!(matches!(split_top_level("a]", ','), Err(TextCodecError::Unbalanced(_))));
        assert_eq!(split_top_level("a,[b,c],d", ',').unwrap(), vec!["a", "[b,c]", "d"]);
    }

    // -----------------------------------------------------------------------
    // Scalars, enums, time
    // -----------------------------------------------------------------------

    #[test]
    fn enum_accepts_names_and_discriminants() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        let p = prop(&reg, "Item", "rarity");
        assert_eq!(codec.decode(p, "Rare").unwrap(), Value::Enum("Rare".into()));
        assert_eq!(codec.decode(p, "1").unwrap(), Value::Enum("Rare".into()));
        assert!(matches!(
            codec.decode(p, "Mythic"),
            Err(TextCodecError::UnknownEnumMember { .. })
        ));
    }

    #[test]
    fn invalid_scalar_names_the_kind() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        assert_eq!(
            codec.decode(prop(&reg, "Item", "price"), "lots"),
            Err(TextCodecError::InvalidScalar {
                kind: "int",
                text: "lots".into()
            })
        );
    }

    #[test]
    fn duration_text_format() {
        assert_eq!(parse_duration("00:01:30").unwrap(), 90_000);
        assert_eq!(parse_duration("1.02:00:00").unwrap(), 26 * 3_600_000);
        assert_eq!(parse_duration("-00:00:01.5").unwrap(), -1_500);
        assert_eq!(parse_duration("00:00:00.1234567").unwrap(), 123);
        assert_eq!(parse_duration("01:30").unwrap(), 5_400_000);
        assert!(parse_duration("25:00:00").is_err());
        assert!(parse_duration("abc").is_err());

        assert_eq!(format_duration(90_000), "00:01:30");
        assert_eq!(format_duration(26 * 3_600_000), "1.02:00:00");
        assert_eq!(format_duration(-1_500), "-00:00:01.500");
    }

    #[test]
    fn date_time_text_format() {
        assert_eq!(parse_date_time("1970-01-01T00:00:01Z").unwrap(), 1_000);
        assert_eq!(parse_date_time("1970-01-01T01:00:00+01:00").unwrap(), 0);
        assert_eq!(parse_date_time("1970-01-02").unwrap(), 86_400_000);
        assert_eq!(parse_date_time("1970-01-01 00:00:00.250").unwrap(), 250);
        assert!(parse_date_time("yesterday").is_err());

        assert_eq!(format_date_time(0).unwrap(), "1970-01-01T00:00:00Z");
        assert_eq!(format_date_time(1_250).unwrap(), "1970-01-01T00:00:01.250Z");
    }

    #[test]
    fn encode_rejects_mismatched_values() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        assert!(matches!(
            codec.encode(prop(&reg, "Item", "price"), &Value::Str("x".into())),
            Err(TextCodecError::TypeMismatch { .. })
        ));
        assert!(matches!(
            codec.encode(
                prop(&reg, "Item", "price"),
                &Value::Scalar(Scalar::I64(1))
            ),
            Err(TextCodecError::TypeMismatch { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Unrepresentable values
    // -----------------------------------------------------------------------

    fn assert_unrepresentable(result: Result<String, TextCodecError>) {
        assert!(
            matches!(result, Err(TextCodecError::Unrepresentable { .. })),
            "expected Unrepresentable, got {result:?}"
        );
    }

    #[test]
    fn list_that_writes_blank_is_rejected() {
        let (reg, refs) = codec_parts();
        let codec = TextCodec::new(&reg, &refs);
        let tags = reg.resolved_type("Stats").unwrap().property("tags").unwrap();
        assert_unrepresentable(codec.encode(tags, &Value::List(vec![Value::Str(String::new())])));

        let drops = prop(&reg, "Monster", "drops");
        assert_unrepresentable(codec.encode(drops, &Value::List(vec![Value::Ref(None)])));

        // With a second element the blank one survives.
        let v = Value::List(vec![Value::Ref(None), Value::Ref(Some(Guid::new("g-coin")))]);
        let cell = codec.encode(drops, &v).unwrap();
        assert_eq!(cell, "|Coin");
        assert_eq!(codec.decode(drops, &cell).unwrap(), v);
    }

    #[test]
    fn struct_that_writes_blank_is_rejected() {
        let reg = sign_registry();
        let codec = TextCodec::new(&reg, &NoReferences);
        let p = prop(&reg, "Sign", "label");
        assert_unrepresentable(codec.encode(p, &label("")));
        assert_unrepresentable(codec.encode(p, &label("  ")));
        assert_eq!(codec.encode(p, &Value::Struct(None)).unwrap(), "");
        assert_eq!(codec.decode(p, "hi").unwrap(), label("hi"));
        assert_eq!(codec.encode(p, &label("hi")).unwrap(), "hi");
    }

    #[test]
    fn null_struct_inside_a_list_or_struct_is_rejected() {
        let reg = sign_registry();
        let codec = TextCodec::new(&reg, &NoReferences);
        assert_unrepresentable(codec.encode(
            prop(&reg, "Sign", "labels"),
            &Value::List(vec![label("a"), Value::Struct(None)]),
        ));

        let frame = prop(&reg, "Sign", "frame");
        let with_null = Value::Struct(Some(
            StructValue::new()
                .with("label", Value::Struct(None))
                .with("size", Value::Scalar(Scalar::I32(3))),
        ));
        assert_unrepresentable(codec.encode(frame, &with_null));

        // An absent nested struct is written as its defaults.
        let absent = Value::Struct(Some(
            StructValue::new().with("size", Value::Scalar(Scalar::I32(3))),
        ));
        let cell = codec.encode(frame, &absent).unwrap();
        assert_eq!(cell, ",3");
        assert_eq!(
            codec.decode(frame, &cell).unwrap(),
            Value::Struct(Some(
                StructValue::new()
                    .with("label", label(""))
                    .with("size", Value::Scalar(Scalar::I32(3)))
            ))
        );
    }

    #[test]
    fn reserved_separators_in_text_are_rejected() {
        let reg = sign_registry();
        let codec = TextCodec::new(&reg, &NoReferences);
        assert_unrepresentable(codec.encode(
            prop(&reg, "Sign", "names"),
            &Value::List(vec![Value::Str("a,b".into())]),
        ));
        assert_unrepresentable(codec.encode(prop(&reg, "Sign", "label"), &label("x|y")));
        assert_unrepresentable(codec.encode(
            prop(&reg, "Sign", "labels"),
            &Value::List(vec![label("[x]")]),
        ));
    }
}

//! PropertyType: the codegen strategy for one semantic value category.
//!
//! A [`PropertyType`] is resolved once per property declaration and never
//! mutated. Every capability (storage, wire codegen, text codec) dispatches
//! on [`Shape`] and [`ValueType`] by exhaustive `match`, so adding a variant
//! is a compile error everywhere it has not been handled yet.

use crate::registry::SchemaRegistry;
use crate::value::{CompositeShape, Scalar, ScalarKind, TimeKind, Value};
use serde::Serialize;

/// The semantic category of a single (non-list) value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ValueType {
    String,
    LocalizedText,
    Enum(String),
    Scalar(ScalarKind),
    Time(TimeKind),
    /// Reference by identity into another top-level record type.
    RecordRef(String),
    /// Reference into an embeddable sub-structure type, stored inline.
    Embedded(String),
    Composite(CompositeShape),
    Asset,
}

impl ValueType {
    /// Type of the value in the in-memory authoring representation.
    pub fn host_type(&self) -> String {
        match self {
            ValueType::String => "String".to_string(),
            ValueType::LocalizedText => "LocalizedText".to_string(),
            ValueType::Enum(name) => name.clone(),
            ValueType::Scalar(kind) => scalar_host_type(*kind).to_string(),
            ValueType::Time(TimeKind::Duration) => "Duration".to_string(),
            ValueType::Time(TimeKind::DateTime) => "DateTime".to_string(),
            ValueType::RecordRef(target) => format!("Option<Ref<{target}>>"),
            ValueType::Embedded(target) => format!("Option<{target}>"),
            ValueType::Composite(shape) => shape.tag().to_string(),
            ValueType::Asset => "Option<AssetRef>".to_string(),
        }
    }

    /// Reference-typed values may be null; everything else has a default.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            ValueType::RecordRef(_) | ValueType::Embedded(_) | ValueType::Asset
        )
    }
}

fn scalar_host_type(kind: ScalarKind) -> &'static str {
    match kind {
        ScalarKind::Bool => "bool",
        ScalarKind::I8 => "i8",
        ScalarKind::U8 => "u8",
        ScalarKind::I16 => "i16",
        ScalarKind::U16 => "u16",
        ScalarKind::I32 => "i32",
        ScalarKind::U32 => "u32",
        ScalarKind::I64 => "i64",
        ScalarKind::U64 => "u64",
        ScalarKind::F32 => "f32",
    }
}

/// Cardinality of a property, plus the special identifier case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Shape {
    /// The record's own human key; not a stored field.
    Identifier,
    Single(ValueType),
    List(ValueType),
}

/// A resolved property: its name and codegen strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PropertyType {
    pub name: String,
    pub shape: Shape,
}

/// Field definition in the in-memory authoring representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageField {
    pub name: String,
    pub host_type: String,
    /// Accessor reads the record's identifier instead of a stored field.
    pub backed_by_identifier: bool,
}

impl PropertyType {
    pub fn identifier(name: &str) -> Self {
        Self {
            name: name.to_string(),
            shape: Shape::Identifier,
        }
    }

    pub fn single(name: &str, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            shape: Shape::Single(value_type),
        }
    }

    pub fn list(name: &str, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            shape: Shape::List(value_type),
        }
    }

    pub fn value_type(&self) -> Option<&ValueType> {
        match &self.shape {
            Shape::Identifier => None,
            Shape::Single(vt) | Shape::List(vt) => Some(vt),
        }
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self.shape, Shape::Identifier)
    }

    pub fn is_list(&self) -> bool {
        matches!(self.shape, Shape::List(_))
    }

    pub fn storage(&self) -> StorageField {
        let (host_type, backed_by_identifier) = match &self.shape {
            Shape::Identifier => ("String".to_string(), true),
            Shape::Single(vt) => (vt.host_type(), false),
            Shape::List(vt) => (format!("Vec<{}>", list_element_host_type(vt)), false),
        };
        StorageField {
            name: self.name.clone(),
            host_type,
            backed_by_identifier,
        }
    }

    /// Value a record holds when nothing was authored for this property.
    /// `None` for the identifier, which is never defaulted.
    pub fn default_value(&self, registry: &SchemaRegistry) -> Option<Value> {
        match &self.shape {
            Shape::Identifier => None,
            Shape::Single(vt) => Some(default_element(vt, registry)),
            Shape::List(_) => Some(Value::List(Vec::new())),
        }
    }
}

/// Lists hold non-null elements, so reference wrappers drop their `Option`.
fn list_element_host_type(vt: &ValueType) -> String {
    match vt {
        ValueType::RecordRef(target) => format!("Ref<{target}>"),
        ValueType::Embedded(target) => target.clone(),
        ValueType::Asset => "AssetRef".to_string(),
        other => other.host_type(),
    }
}

/// Default for one element of `vt`.
pub fn default_element(vt: &ValueType, registry: &SchemaRegistry) -> Value {
    match vt {
        ValueType::String | ValueType::LocalizedText => Value::Str(String::new()),
        ValueType::Enum(name) => Value::Enum(
            registry
                .enum_def(name)
                .and_then(|e| e.members.first())
                .map(|m| m.name.clone())
                .unwrap_or_default(),
        ),
        ValueType::Scalar(kind) => Value::Scalar(Scalar::zero(*kind)),
        ValueType::Time(TimeKind::Duration) => Value::Duration(0),
        ValueType::Time(TimeKind::DateTime) => Value::DateTime(0),
        ValueType::RecordRef(_) => Value::Ref(None),
        ValueType::Embedded(_) => Value::Struct(None),
        ValueType::Composite(shape) => Value::Composite(shape.default_components()),
        ValueType::Asset => Value::Asset(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_of_identifier_is_backed_by_record_key() {
        let s = PropertyType::identifier("Identifier").storage();
        assert!(s.backed_by_identifier);
        assert_eq!(s.host_type, "String");
    }

    #[test]
    fn storage_host_types() {
        assert_eq!(
            PropertyType::single("hp", ValueType::Scalar(ScalarKind::I32))
                .storage()
                .host_type,
            "i32"
        );
        assert_eq!(
            PropertyType::list("drops", ValueType::RecordRef("Item".into()))
                .storage()
                .host_type,
            "Vec<Ref<Item>>"
        );
        assert_eq!(
            PropertyType::single("stats", ValueType::Embedded("Stats".into()))
                .storage()
                .host_type,
            "Option<Stats>"
        );
        assert_eq!(
            PropertyType::list("path", ValueType::Composite(CompositeShape::Vector3))
                .storage()
                .host_type,
            "Vec<Vector3>"
        );
    }

    #[test]
    fn reference_types_are_nullable() {
        assert!(ValueType::RecordRef("Item".into()).is_reference());
        assert!(ValueType::Asset.is_reference());
        assert!(!ValueType::Scalar(ScalarKind::F32).is_reference());
        assert!(!ValueType::Composite(CompositeShape::Color).is_reference());
    }
}

//! Wire codegen capability of each PropertyType.
//!
//! [`plan_property`] turns a resolved property into the schema fields it
//! needs, the prepare step that stages variable-length data, the write step
//! that fills the fixed-size record, and the read step of its accessor.
//! The resulting [`CodegenPlan`] is the artifact description handed to the
//! source-emitting step, and the blob builder and reader interpret the very
//! same ops, so generated code and generated data cannot disagree.

use crate::decl::TypeKind;
use crate::fingerprint::Fingerprint;
use crate::property::{PropertyType, Shape, StorageField, ValueType};
use crate::resolver::Declarations;
use crate::value::{CompositeShape, ScalarKind, TimeKind};
use crate::wire::{SchemaField, WireKind};
use serde::Serialize;

/// Offset of component `k` of element `i` inside a flattened list of
/// `arity`-component values. Shared by the writer and the reader.
pub fn component_offset(element: usize, component: usize, arity: usize) -> usize {
    element * arity + component
}

/// Stages a value before the fixed-size record is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PrepareOp {
    /// Fixed-width value(s) written straight into the record.
    Inline,
    /// Enum member name to its discriminant.
    EnumDiscriminant { name: String, repr: ScalarKind },
    InternString,
    InternStringVector,
    ScalarVector(ScalarKind),
    EnumVector { name: String, repr: ScalarKind },
    /// GUID to the target table's row index.
    RowIndex { target: String },
    RowIndexVector { target: String },
    /// Write a sub-structure row into its own table first.
    EmbedRow { table: String },
    EmbedRowVector { table: String },
    /// One component vector per component, strided by element.
    StridedVectors { shape: CompositeShape },
}

/// Fills the property's slots in the record under construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOp {
    /// Field names, in slot order.
    pub slots: Vec<String>,
    /// `Some` for values stored inline, `None` for staged `u32` indices.
    pub inline: Option<ScalarKind>,
}

/// How the accessor turns slots back into a value. Accessors always check
/// the override layer before running this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReadOp {
    Text,
    Enum { name: String, repr: ScalarKind },
    Scalar(ScalarKind),
    Time(TimeKind),
    Ref { target: String },
    Embedded { table: String },
    Components { shape: CompositeShape },
    Asset,
}

/// Everything generated for one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyCodegen {
    pub property: PropertyType,
    pub storage: StorageField,
    pub fields: Vec<SchemaField>,
    pub prepare: PrepareOp,
    pub write: WriteOp,
    pub read: ReadOp,
    pub list: bool,
}

/// Everything generated for one record type or sub-structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCodegen {
    pub table: String,
    pub kind: TypeKind,
    pub properties: Vec<PropertyCodegen>,
}

impl TableCodegen {
    pub fn property(&self, name: &str) -> Option<&PropertyCodegen> {
        self.properties.iter().find(|p| p.property.name == name)
    }
}

/// The artifact description for the source-emitting step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodegenPlan {
    pub namespace: String,
    pub fingerprint: Fingerprint,
    pub tables: Vec<TableCodegen>,
}

fn enum_repr(decls: &Declarations, name: &str) -> ScalarKind {
    decls
        .enum_decl(name)
        .map(|e| e.repr)
        .unwrap_or(ScalarKind::I32)
}

/// Wire kind of one element of `vt`.
fn element_kind(vt: &ValueType, decls: &Declarations) -> WireKind {
    match vt {
        ValueType::String | ValueType::LocalizedText | ValueType::Asset => WireKind::String,
        ValueType::Enum(name) => WireKind::Scalar(enum_repr(decls, name)),
        ValueType::Scalar(kind) => WireKind::Scalar(*kind),
        ValueType::Time(_) => WireKind::Scalar(ScalarKind::I64),
        ValueType::RecordRef(target) | ValueType::Embedded(target) => {
            WireKind::Table(target.clone())
        }
        ValueType::Composite(shape) => WireKind::Scalar(shape.component_kind()),
    }
}

fn read_op(vt: &ValueType, decls: &Declarations) -> ReadOp {
    match vt {
        ValueType::String | ValueType::LocalizedText => ReadOp::Text,
        ValueType::Enum(name) => ReadOp::Enum {
            name: name.clone(),
            repr: enum_repr(decls, name),
        },
        ValueType::Scalar(kind) => ReadOp::Scalar(*kind),
        ValueType::Time(kind) => ReadOp::Time(*kind),
        ValueType::RecordRef(target) => ReadOp::Ref {
            target: target.clone(),
        },
        ValueType::Embedded(table) => ReadOp::Embedded {
            table: table.clone(),
        },
        ValueType::Composite(shape) => ReadOp::Components { shape: *shape },
        ValueType::Asset => ReadOp::Asset,
    }
}

/// Generate the wire side of one property of `table`.
pub fn plan_property(table: &str, prop: &PropertyType, decls: &Declarations) -> PropertyCodegen {
    let storage = prop.storage();
    let name = prop.name.as_str();

    let (fields, prepare, inline, read, list) = match &prop.shape {
        Shape::Identifier => (
            vec![SchemaField::new(table, name, WireKind::String, false)],
            PrepareOp::InternString,
            None,
            ReadOp::Text,
            false,
        ),
        Shape::Single(vt) => {
            let (fields, prepare, inline) = match vt {
                ValueType::String | ValueType::LocalizedText | ValueType::Asset => (
                    vec![SchemaField::new(table, name, WireKind::String, false)],
                    PrepareOp::InternString,
                    None,
                ),
                ValueType::Enum(enum_name) => {
                    let repr = enum_repr(decls, enum_name);
                    (
                        vec![SchemaField::new(table, name, WireKind::Scalar(repr), false)],
                        PrepareOp::EnumDiscriminant {
                            name: enum_name.clone(),
                            repr,
                        },
                        Some(repr),
                    )
                }
                ValueType::Scalar(kind) => (
                    vec![SchemaField::new(table, name, WireKind::Scalar(*kind), false)],
                    PrepareOp::Inline,
                    Some(*kind),
                ),
                ValueType::Time(_) => (
                    vec![SchemaField::new(table, name, WireKind::Scalar(ScalarKind::I64), false)],
                    PrepareOp::Inline,
                    Some(ScalarKind::I64),
                ),
                ValueType::RecordRef(target) => (
                    vec![SchemaField::new(table, name, WireKind::Table(target.clone()), false)],
                    PrepareOp::RowIndex {
                        target: target.clone(),
                    },
                    None,
                ),
                ValueType::Embedded(target) => (
                    vec![SchemaField::new(table, name, WireKind::Table(target.clone()), false)],
                    PrepareOp::EmbedRow {
                        table: target.clone(),
                    },
                    None,
                ),
                ValueType::Composite(shape) => (
                    composite_fields(table, name, *shape, false),
                    PrepareOp::Inline,
                    Some(shape.component_kind()),
                ),
            };
            (fields, prepare, inline, read_op(vt, decls), false)
        }
        Shape::List(vt) => {
            let prepare = match vt {
                ValueType::String | ValueType::LocalizedText | ValueType::Asset => {
                    PrepareOp::InternStringVector
                }
                ValueType::Enum(enum_name) => PrepareOp::EnumVector {
                    name: enum_name.clone(),
                    repr: enum_repr(decls, enum_name),
                },
                ValueType::Scalar(kind) => PrepareOp::ScalarVector(*kind),
                ValueType::Time(_) => PrepareOp::ScalarVector(ScalarKind::I64),
                ValueType::RecordRef(target) => PrepareOp::RowIndexVector {
                    target: target.clone(),
                },
                ValueType::Embedded(target) => PrepareOp::EmbedRowVector {
                    table: target.clone(),
                },
                ValueType::Composite(shape) => PrepareOp::StridedVectors { shape: *shape },
            };
            let fields = match vt {
                ValueType::Composite(shape) => composite_fields(table, name, *shape, true),
                other => vec![SchemaField::new(table, name, element_kind(other, decls), true)],
            };
            (fields, prepare, None, read_op(vt, decls), true)
        }
    };

    let write = WriteOp {
        slots: fields.iter().map(|f| f.field.clone()).collect(),
        inline,
    };
    PropertyCodegen {
        property: prop.clone(),
        storage,
        fields,
        prepare,
        write,
        read,
        list,
    }
}

/// `{name}_{component}` fields, in component declaration order.
fn composite_fields(table: &str, name: &str, shape: CompositeShape, is_array: bool) -> Vec<SchemaField> {
    shape
        .components()
        .iter()
        .map(|c| {
            SchemaField::new(
                table,
                &format!("{name}_{c}"),
                WireKind::Scalar(shape.component_kind()),
                is_array,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::EnumDeclaration;

    fn decls_with_enum() -> Declarations {
        let mut d = Declarations::new();
        d.add_enum(EnumDeclaration::new("Rarity").repr(ScalarKind::U8).member("Common"));
        d
    }

    #[test]
    fn component_offsets_are_strided() {
        // Three Vector3 elements: component y of element 2 lives at 2*3+1.
        assert_eq!(component_offset(2, 1, 3), 7);
        assert_eq!(component_offset(0, 0, 4), 0);
        assert_eq!(component_offset(1, 3, 4), 7);
    }

    #[test]
    fn composite_list_gets_one_vector_per_component() {
        let d = Declarations::new();
        let p = PropertyType::list("path", ValueType::Composite(CompositeShape::Vector3));
        let cg = plan_property("Route", &p, &d);
        let names: Vec<&str> = cg.fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(names, vec!["path_x", "path_y", "path_z"]);
        assert!(cg.fields.iter().all(|f| f.is_array));
        assert_eq!(cg.prepare, PrepareOp::StridedVectors { shape: CompositeShape::Vector3 });
        assert_eq!(cg.write.inline, None);
    }

    #[test]
    fn single_composite_is_inline() {
        let d = Declarations::new();
        let p = PropertyType::single("tint", ValueType::Composite(CompositeShape::Color));
        let cg = plan_property("Item", &p, &d);
        assert_eq!(cg.write.slots, vec!["tint_r", "tint_g", "tint_b", "tint_a"]);
        assert_eq!(cg.write.inline, Some(ScalarKind::F32));
    }

    #[test]
    fn enums_use_their_repr() {
        let d = decls_with_enum();
        let single = plan_property("Item", &PropertyType::single("r", ValueType::Enum("Rarity".into())), &d);
        assert_eq!(single.fields[0].kind, WireKind::Scalar(ScalarKind::U8));
        assert_eq!(single.write.inline, Some(ScalarKind::U8));

        let list = plan_property("Item", &PropertyType::list("rs", ValueType::Enum("Rarity".into())), &d);
        assert_eq!(list.fields[0].kind, WireKind::Scalar(ScalarKind::U8));
        assert!(list.fields[0].is_array);
    }

    #[test]
    fn references_are_table_slots() {
        let d = Declarations::new();
        let r = plan_property("Monster", &PropertyType::list("drops", ValueType::RecordRef("Item".into())), &d);
        assert_eq!(r.fields[0].kind, WireKind::Table("Item".into()));
        assert_eq!(r.prepare, PrepareOp::RowIndexVector { target: "Item".into() });
        assert_eq!(r.read, ReadOp::Ref { target: "Item".into() });

        let e = plan_property("Monster", &PropertyType::single("stats", ValueType::Embedded("Stats".into())), &d);
        assert_eq!(e.prepare, PrepareOp::EmbedRow { table: "Stats".into() });
    }

    #[test]
    fn identifier_is_an_interned_string() {
        let d = Declarations::new();
        let cg = plan_property("Item", &PropertyType::identifier("Identifier"), &d);
        assert_eq!(cg.fields[0].kind, WireKind::String);
        assert!(cg.storage.backed_by_identifier);
        assert_eq!(cg.read, ReadOp::Text);
    }

    #[test]
    fn durations_are_long_milliseconds() {
        let d = Declarations::new();
        let cg = plan_property("Item", &PropertyType::single("cd", ValueType::Time(TimeKind::Duration)), &d);
        assert_eq!(cg.fields[0].kind, WireKind::Scalar(ScalarKind::I64));
        assert_eq!(cg.read, ReadOp::Time(TimeKind::Duration));
    }
}

//! Shared test helpers for unit and integration tests.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so the fixture
//! schema and catalog are available to other crates' tests through the
//! `test-utils` feature.

use crate::decl::{EnumDeclaration, PropertyDeclaration, TypeDeclaration};
use crate::id::{Guid, GuidSource};
use crate::reconcile::TabularRow;
use crate::record::{RecordCatalog, RecordSet, StructuredRecord};
use crate::registry::{SchemaRegistry, SchemaRegistryBuilder};
use crate::resolver::ResolveOptions;
use crate::text::ReferenceResolver;
use crate::value::{Scalar, StructValue, Value};
use std::collections::HashMap;

// ===========================================================================
// GUIDs and references
// ===========================================================================

/// Deterministic GUIDs: `<prefix>-1`, `<prefix>-2`, ...
#[derive(Debug, Clone)]
pub struct SequentialGuids {
    prefix: String,
    next: u32,
}

impl SequentialGuids {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: 1,
        }
    }
}

impl GuidSource for SequentialGuids {
    fn next_guid(&mut self) -> Guid {
        let guid = Guid::new(format!("{}-{}", self.prefix, self.next));
        self.next += 1;
        guid
    }
}

/// A fixed identifier/GUID table.
#[derive(Debug, Clone, Default)]
pub struct MapReferences {
    entries: HashMap<(String, String), Guid>,
}

impl MapReferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record_type: &str, identifier: &str, guid: Guid) {
        self.entries
            .insert((record_type.to_string(), identifier.to_string()), guid);
    }
}

impl ReferenceResolver for MapReferences {
    fn guid_for(&self, record_type: &str, identifier: &str) -> Option<Guid> {
        self.entries
            .get(&(record_type.to_string(), identifier.to_string()))
            .cloned()
    }

    fn identifier_for(&self, record_type: &str, guid: &Guid) -> Option<String> {
        self.entries
            .iter()
            .find(|((ty, _), g)| ty == record_type && *g == guid)
            .map(|((_, id), _)| id.clone())
    }
}

// ===========================================================================
// Fixture schema
// ===========================================================================

/// Declarations of the fixture schema:
///
/// - `Rarity { Common, Rare }`
/// - `Stats { hp: int, speed: float, offset: Vector2, tags: List<string> }`
/// - `Item { price: int, rarity: Rarity, tint: Color }`
/// - `Monster { levels: List<int>, path: List<Vector3>, drops: List<Item>,
///   stats: Stats, cooldown: TimeSpan }`
pub fn fixture_builder() -> SchemaRegistryBuilder {
    builder_with_item(item_declaration())
}

fn builder_with_item(item: TypeDeclaration) -> SchemaRegistryBuilder {
    let mut b = SchemaRegistryBuilder::new();
    b.register_enum(EnumDeclaration::new("Rarity").member("Common").member("Rare"));
    b.register_type(
        TypeDeclaration::structure("Stats")
            .property(PropertyDeclaration::new("hp", "int"))
            .property(PropertyDeclaration::new("speed", "float"))
            .property(PropertyDeclaration::new("offset", "Vector2"))
            .property(PropertyDeclaration::list("tags", "string")),
    );
    b.register_type(item);
    b.register_type(
        TypeDeclaration::record("Monster")
            .property(PropertyDeclaration::list("levels", "int"))
            .property(PropertyDeclaration::list("path", "Vector3"))
            .property(PropertyDeclaration::list("drops", "Item"))
            .property(PropertyDeclaration::new("stats", "Stats"))
            .property(PropertyDeclaration::new("cooldown", "TimeSpan")),
    );
    b
}

fn item_declaration() -> TypeDeclaration {
    TypeDeclaration::record("Item")
        .property(PropertyDeclaration::new("price", "int"))
        .property(PropertyDeclaration::new("rarity", "Rarity"))
        .property(PropertyDeclaration::new("tint", "Color"))
}

pub fn fixture_registry() -> SchemaRegistry {
    fixture_builder()
        .build(ResolveOptions::default())
        .expect("fixture schema resolves")
}

/// The fixture schema with one more property on `Item`, so its fingerprint
/// differs.
pub fn registry_with_extra_property() -> SchemaRegistry {
    builder_with_item(item_declaration().property(PropertyDeclaration::new("weight", "float")))
        .build(ResolveOptions::default())
        .expect("extended schema resolves")
}

/// A schema of single-component shapes, whose cells can come out blank:
///
/// - `Label { text: string }`
/// - `Frame { label: Label, size: int }`
/// - `Sign { names: List<string>, label: Label, labels: List<Label>,
///   frame: Frame }`
pub fn sign_registry() -> SchemaRegistry {
    let mut b = SchemaRegistryBuilder::new();
    b.register_type(
        TypeDeclaration::structure("Label").property(PropertyDeclaration::new("text", "string")),
    );
    b.register_type(
        TypeDeclaration::structure("Frame")
            .property(PropertyDeclaration::new("label", "Label"))
            .property(PropertyDeclaration::new("size", "int")),
    );
    b.register_type(
        TypeDeclaration::record("Sign")
            .property(PropertyDeclaration::list("names", "string"))
            .property(PropertyDeclaration::new("label", "Label"))
            .property(PropertyDeclaration::list("labels", "Label"))
            .property(PropertyDeclaration::new("frame", "Frame")),
    );
    b.build(ResolveOptions::default())
        .expect("sign schema resolves")
}

pub fn label(text: &str) -> Value {
    Value::Struct(Some(StructValue::new().with("text", Value::Str(text.to_string()))))
}

// ===========================================================================
// Fixture records
// ===========================================================================

pub fn int(v: i32) -> Value {
    Value::Scalar(Scalar::I32(v))
}

pub fn float(v: f32) -> Value {
    Value::Scalar(Scalar::F32(v))
}

pub fn floats(vs: &[f32]) -> Value {
    Value::Composite(vs.iter().map(|v| Scalar::F32(*v)).collect())
}

/// `Coin` and `Gem` items (Gem leaves rarity and tint unset) and one `Orc`
/// monster that uses every value shape.
pub fn fixture_catalog() -> RecordCatalog {
    let items = RecordSet::from_records(
        "Item",
        [
            StructuredRecord::new(Guid::new("g-coin"), "Coin")
                .in_directory("Item")
                .with_value("price", int(10))
                .with_value("rarity", Value::Enum("Rare".into()))
                .with_value("tint", floats(&[1.0, 0.8, 0.0, 1.0])),
            StructuredRecord::new(Guid::new("g-gem"), "Gem")
                .in_directory("Item")
                .with_value("price", int(50)),
        ],
    );
    let stats = StructValue::new()
        .with("hp", int(10))
        .with("speed", float(1.5))
        .with("offset", floats(&[0.0, 1.0]))
        .with(
            "tags",
            Value::List(vec![Value::Str("fast".into()), Value::Str("tough".into())]),
        );
    let monsters = RecordSet::from_records(
        "Monster",
        [StructuredRecord::new(Guid::new("g-orc"), "Orc")
            .in_directory("Monster")
            .with_value("levels", Value::List(vec![int(1), int(2), int(3)]))
            .with_value(
                "path",
                Value::List(vec![floats(&[1.0, 2.0, 3.0]), floats(&[4.0, 5.0, 6.0])]),
            )
            .with_value(
                "drops",
                Value::List(vec![
                    Value::Ref(Some(Guid::new("g-coin"))),
                    Value::Ref(Some(Guid::new("g-gem"))),
                ]),
            )
            .with_value("stats", Value::Struct(Some(stats)))
            .with_value("cooldown", Value::Duration(1_500))],
    );

    let mut catalog = RecordCatalog::new();
    catalog.insert_set(items);
    catalog.insert_set(monsters);
    catalog
}

/// A row with a GUID cell (blank for `""`) and the given property cells.
pub fn row(line: usize, identifier: &str, guid: &str, cells: &[(&str, &str)]) -> TabularRow {
    cells.iter().fold(
        TabularRow::new(line, identifier, Guid::from_cell(guid)),
        |row, (name, text)| row.with_cell(name, text),
    )
}

//! Binary blob: builder, reader, and the live override layer.
//!
//! The blob is a bitcode-encoded container behind a versioned header. Each
//! wire table holds fixed-size little-endian records laid out by
//! [`TableLayout`]; variable-length data lives in a shared string pool and
//! in typed vectors addressed by `u32` index. Record tables are sorted by
//! Identifier so lookups can binary search.
//!
//! Building runs in two passes per record: every property is first
//! *prepared* (strings interned, vectors and sub-structure rows written),
//! then the staged results are *written* into the record's slots.

use crate::codegen::{PrepareOp, PropertyCodegen, ReadOp, TableCodegen, component_offset};
use crate::fingerprint::{CompatibilityError, verify_data, Fingerprint};
use crate::id::Guid;
use crate::property::Shape;
use crate::record::{RecordCatalog, StructuredRecord};
use crate::registry::SchemaRegistry;
use crate::value::{Scalar, ScalarKind, StructValue, TimeKind, Value};
use crate::wire::{NULL_INDEX, TableLayout};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Magic number identifying a parameter blob.
pub const BLOB_MAGIC: u32 = 0x5052_4D42;

/// Current blob container version.
pub const BLOB_FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),

    #[error("bitcode decoding failed: {0}")]
    Decode(String),

    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", BLOB_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("unsupported blob format version {0} (this build reads {BLOB_FORMAT_VERSION})")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Compatibility(#[from] CompatibilityError),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("row {row} out of range for table '{table}' ({len} rows)")]
    RowOutOfRange { table: String, row: u32, len: u32 },

    #[error("table '{table}' has no property '{property}'")]
    UnknownProperty { table: String, property: String },

    #[error("{table}.{property} references {target} record {guid}, which is not in the data set")]
    DanglingReference {
        table: String,
        property: String,
        target: String,
        guid: Guid,
    },

    #[error("{table}.{property}: {detail}")]
    TypeMismatch {
        table: String,
        property: String,
        detail: String,
    },

    #[error("corrupt blob: {0}")]
    Corrupt(String),
}

// ===========================================================================
// Container
// ===========================================================================

/// Header written at the front of every blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHeader {
    pub magic: u32,
    pub version: u32,
    pub fingerprint: u64,
}

impl BlobHeader {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            magic: BLOB_MAGIC,
            version: BLOB_FORMAT_VERSION,
            fingerprint: fingerprint.0,
        }
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.magic != BLOB_MAGIC {
            return Err(WireError::InvalidMagic(self.magic));
        }
        if self.version != BLOB_FORMAT_VERSION {
            return Err(WireError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

/// Element type of a [`WireVector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorElement {
    Scalar(ScalarKind),
    /// A `u32` index into the string pool or a table.
    Index,
}

impl VectorElement {
    fn width(self) -> usize {
        match self {
            VectorElement::Scalar(kind) => kind.width(),
            VectorElement::Index => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireVector {
    pub element: VectorElement,
    pub len: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableData {
    pub name: String,
    pub record_size: u32,
    pub row_count: u32,
    pub rows: Vec<u8>,
    /// GUID of each row. Empty for sub-structure tables.
    pub guids: Vec<String>,
}

impl TableData {
    fn row(&self, row: u32) -> Option<&[u8]> {
        let size = self.record_size as usize;
        let start = row as usize * size;
        self.rows.get(start..start + size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Blob {
    header: BlobHeader,
    strings: Vec<String>,
    vectors: Vec<WireVector>,
    tables: Vec<TableData>,
}

/// Read only the header, e.g. to report what schema a stale blob was built
/// for.
pub fn read_header(bytes: &[u8]) -> Result<BlobHeader, WireError> {
    let blob: Blob = bitcode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))?;
    Ok(blob.header)
}

// ===========================================================================
// Builder
// ===========================================================================

/// Staged result of the prepare pass for one property.
#[derive(Debug, Clone)]
enum Staged {
    Inline(Vec<Scalar>),
    Index(u32),
    /// One vector index per composite component.
    Indices(Vec<u32>),
}

pub struct BlobBuilder<'r> {
    registry: &'r SchemaRegistry,
    strings: Vec<String>,
    string_index: HashMap<String, u32>,
    vectors: Vec<WireVector>,
    tables: Vec<TableData>,
    table_index: HashMap<String, usize>,
    row_maps: HashMap<String, HashMap<Guid, u32>>,
}

impl<'r> BlobBuilder<'r> {
    pub fn new(registry: &'r SchemaRegistry) -> Self {
        let tables: Vec<TableData> = registry
            .wire_schema()
            .tables
            .iter()
            .map(|t| TableData {
                name: t.name.clone(),
                record_size: t.record_size as u32,
                row_count: 0,
                rows: Vec::new(),
                guids: Vec::new(),
            })
            .collect();
        let table_index = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        Self {
            registry,
            strings: Vec::new(),
            string_index: HashMap::new(),
            vectors: Vec::new(),
            tables,
            table_index,
            row_maps: HashMap::new(),
        }
    }

    /// Encode every record of every record type in `catalog`.
    pub fn build(mut self, catalog: &RecordCatalog) -> Result<Vec<u8>, WireError> {
        let registry = self.registry;

        // Row numbers for every record type first, so references resolve
        // regardless of table order.
        let mut ordered: Vec<(String, Vec<&StructuredRecord>)> = Vec::new();
        for ty in registry.record_types() {
            let mut records: Vec<&StructuredRecord> = catalog
                .set(&ty.name)
                .map(|set| set.iter().map(|(_, r)| r).collect())
                .unwrap_or_default();
            records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
            let rows = records
                .iter()
                .enumerate()
                .map(|(i, r)| (r.guid.clone(), i as u32))
                .collect();
            self.row_maps.insert(ty.name.clone(), rows);
            ordered.push((ty.name.clone(), records));
        }

        for (table, records) in &ordered {
            let codegen = registry
                .table_codegen(table)
                .ok_or_else(|| WireError::UnknownTable(table.clone()))?;
            let layout = self.layout(table)?;
            let pos = self.table_pos(table)?;
            self.tables[pos].rows = vec![0; layout.record_size * records.len()];
            self.tables[pos].row_count = records.len() as u32;
            self.tables[pos].guids = records.iter().map(|r| r.guid.to_string()).collect();

            for (i, record) in records.iter().enumerate() {
                let row = self.encode_row(codegen, layout, |name| {
                    if name == registry.identifier_property() {
                        Some(Value::Str(record.identifier.clone()))
                    } else {
                        record.values.get(name).cloned()
                    }
                })?;
                let start = i * layout.record_size;
                self.tables[pos].rows[start..start + layout.record_size].copy_from_slice(&row);
            }
        }

        tracing::debug!(
            tables = self.tables.len(),
            strings = self.strings.len(),
            vectors = self.vectors.len(),
            "blob built"
        );

        let blob = Blob {
            header: BlobHeader::new(registry.fingerprint()),
            strings: self.strings,
            vectors: self.vectors,
            tables: self.tables,
        };
        bitcode::serialize(&blob).map_err(|e| WireError::Encode(e.to_string()))
    }

    fn layout(&self, table: &str) -> Result<&'r TableLayout, WireError> {
        self.registry
            .wire_schema()
            .table(table)
            .ok_or_else(|| WireError::UnknownTable(table.to_string()))
    }

    fn table_pos(&self, table: &str) -> Result<usize, WireError> {
        self.table_index
            .get(table)
            .copied()
            .ok_or_else(|| WireError::UnknownTable(table.to_string()))
    }

    /// Prepare every property, then write the staged values into one
    /// fixed-size record.
    fn encode_row(
        &mut self,
        codegen: &'r TableCodegen,
        layout: &'r TableLayout,
        value_of: impl Fn(&str) -> Option<Value>,
    ) -> Result<Vec<u8>, WireError> {
        let mut staged = Vec::with_capacity(codegen.properties.len());
        for cg in &codegen.properties {
            let value = match value_of(&cg.property.name) {
                Some(v) => v,
                None => cg
                    .property
                    .default_value(self.registry)
                    .ok_or_else(|| self.mismatch(codegen, cg, "identifier is missing"))?,
            };
            staged.push(self.prepare(codegen, cg, &value)?);
        }

        let mut row = vec![0u8; layout.record_size];
        for (cg, staged) in codegen.properties.iter().zip(staged) {
            for (j, slot) in cg.write.slots.iter().enumerate() {
                let range = layout
                    .field_index(slot)
                    .and_then(|i| layout.slot(i))
                    .ok_or_else(|| WireError::Corrupt(format!("no slot for {}.{slot}", layout.name)))?;
                let out = &mut row[range];
                match &staged {
                    Staged::Inline(scalars) => match scalars.get(j) {
                        Some(s) => s.write_le(out),
                        None => return Err(self.mismatch(codegen, cg, "missing component")),
                    },
                    Staged::Index(index) => out.copy_from_slice(&index.to_le_bytes()),
                    Staged::Indices(indices) => {
                        let index = indices.get(j).copied().unwrap_or(NULL_INDEX);
                        out.copy_from_slice(&index.to_le_bytes());
                    }
                }
            }
        }
        Ok(row)
    }

    fn prepare(
        &mut self,
        table: &TableCodegen,
        cg: &PropertyCodegen,
        value: &Value,
    ) -> Result<Staged, WireError> {
        match &cg.prepare {
            PrepareOp::Inline => {
                let kind = cg
                    .write
                    .inline
                    .ok_or_else(|| self.mismatch(table, cg, "inline op without a scalar kind"))?;
                value_scalars(value, kind)
                    .map(Staged::Inline)
                    .ok_or_else(|| self.mismatch(table, cg, &format!("expected {}, got {value:?}", kind.tag())))
            }
            PrepareOp::EnumDiscriminant { name, repr } => {
                Ok(Staged::Inline(vec![self.discriminant(table, cg, name, *repr, value)?]))
            }
            PrepareOp::InternString => match value {
                Value::Str(s) => Ok(Staged::Index(self.intern(s))),
                Value::Asset(Some(key)) => Ok(Staged::Index(self.intern(key))),
                Value::Asset(None) => Ok(Staged::Index(NULL_INDEX)),
                other => Err(self.mismatch(table, cg, &format!("expected text, got {other:?}"))),
            },
            PrepareOp::InternStringVector => {
                let items = self.list(table, cg, value)?;
                let mut indices = Vec::with_capacity(items.len());
                for item in items {
                    indices.push(match item {
                        Value::Str(s) => self.intern(s),
                        Value::Asset(Some(key)) => self.intern(key),
                        Value::Asset(None) => NULL_INDEX,
                        other => {
                            return Err(self.mismatch(table, cg, &format!("expected text, got {other:?}")));
                        }
                    });
                }
                Ok(Staged::Index(self.push_indices(indices)))
            }
            PrepareOp::ScalarVector(kind) => {
                let items = self.list(table, cg, value)?;
                let mut scalars = Vec::with_capacity(items.len());
                for item in items {
                    let mut s = value_scalars(item, *kind).ok_or_else(|| {
                        self.mismatch(table, cg, &format!("expected {}, got {item:?}", kind.tag()))
                    })?;
                    scalars.append(&mut s);
                }
                Ok(Staged::Index(self.push_scalars(*kind, &scalars)))
            }
            PrepareOp::EnumVector { name, repr } => {
                let items = self.list(table, cg, value)?;
                let mut scalars = Vec::with_capacity(items.len());
                for item in items {
                    scalars.push(self.discriminant(table, cg, name, *repr, item)?);
                }
                Ok(Staged::Index(self.push_scalars(*repr, &scalars)))
            }
            PrepareOp::RowIndex { target } => Ok(Staged::Index(self.row_of(table, cg, target, value)?)),
            PrepareOp::RowIndexVector { target } => {
                let items = self.list(table, cg, value)?;
                let mut indices = Vec::with_capacity(items.len());
                for item in items {
                    indices.push(self.row_of(table, cg, target, item)?);
                }
                Ok(Staged::Index(self.push_indices(indices)))
            }
            PrepareOp::EmbedRow { table: target } => match value {
                Value::Struct(None) => Ok(Staged::Index(NULL_INDEX)),
                Value::Struct(Some(s)) => Ok(Staged::Index(self.embed(target, s)?)),
                other => Err(self.mismatch(table, cg, &format!("expected {target}, got {other:?}"))),
            },
            PrepareOp::EmbedRowVector { table: target } => {
                let items = self.list(table, cg, value)?;
                let mut indices = Vec::with_capacity(items.len());
                for item in items {
                    indices.push(match item {
                        Value::Struct(None) => NULL_INDEX,
                        Value::Struct(Some(s)) => self.embed(target, s)?,
                        other => {
                            return Err(self.mismatch(table, cg, &format!("expected {target}, got {other:?}")));
                        }
                    });
                }
                Ok(Staged::Index(self.push_indices(indices)))
            }
            PrepareOp::StridedVectors { shape } => {
                let items = self.list(table, cg, value)?;
                let arity = shape.arity();
                if items.is_empty() {
                    return Ok(Staged::Indices(vec![NULL_INDEX; arity]));
                }
                let kind = shape.component_kind();
                let mut vectors = vec![vec![Scalar::zero(kind); items.len() * arity]; arity];
                for (i, item) in items.iter().enumerate() {
                    let components = value_scalars(item, kind)
                        .filter(|c| c.len() == arity)
                        .ok_or_else(|| self.mismatch(table, cg, &format!("expected {}, got {item:?}", shape.tag())))?;
                    for (k, c) in components.into_iter().enumerate() {
                        vectors[k][component_offset(i, k, arity)] = c;
                    }
                }
                let indices = vectors
                    .iter()
                    .map(|v| self.push_scalars(kind, v))
                    .collect();
                Ok(Staged::Indices(indices))
            }
        }
    }

    fn list<'v>(
        &self,
        table: &TableCodegen,
        cg: &PropertyCodegen,
        value: &'v Value,
    ) -> Result<&'v [Value], WireError> {
        value
            .as_list()
            .ok_or_else(|| self.mismatch(table, cg, &format!("expected a list, got {value:?}")))
    }

    fn discriminant(
        &self,
        table: &TableCodegen,
        cg: &PropertyCodegen,
        enum_name: &str,
        repr: ScalarKind,
        value: &Value,
    ) -> Result<Scalar, WireError> {
        let Value::Enum(member) = value else {
            return Err(self.mismatch(table, cg, &format!("expected {enum_name}, got {value:?}")));
        };
        self.registry
            .enum_def(enum_name)
            .and_then(|e| e.value_of(member))
            .and_then(|v| Scalar::from_i64(repr, v))
            .ok_or_else(|| self.mismatch(table, cg, &format!("'{member}' is not a member of {enum_name}")))
    }

    fn row_of(
        &self,
        table: &TableCodegen,
        cg: &PropertyCodegen,
        target: &str,
        value: &Value,
    ) -> Result<u32, WireError> {
        match value {
            Value::Ref(None) => Ok(NULL_INDEX),
            Value::Ref(Some(guid)) => self
                .row_maps
                .get(target)
                .and_then(|rows| rows.get(guid))
                .copied()
                .ok_or_else(|| WireError::DanglingReference {
                    table: table.table.clone(),
                    property: cg.property.name.clone(),
                    target: target.to_string(),
                    guid: guid.clone(),
                }),
            other => Err(self.mismatch(table, cg, &format!("expected a {target} reference, got {other:?}"))),
        }
    }

    /// Write a sub-structure row into its own table and return its index.
    fn embed(&mut self, table: &str, value: &StructValue) -> Result<u32, WireError> {
        let registry = self.registry;
        let codegen = registry
            .table_codegen(table)
            .ok_or_else(|| WireError::UnknownTable(table.to_string()))?;
        let layout = self.layout(table)?;
        let row = self.encode_row(codegen, layout, |name| value.get(name).cloned())?;
        let pos = self.table_pos(table)?;
        let data = &mut self.tables[pos];
        let index = data.row_count;
        data.rows.extend_from_slice(&row);
        data.row_count += 1;
        Ok(index)
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.string_index.get(s) {
            return i;
        }
        let i = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), i);
        i
    }

    fn push_scalars(&mut self, kind: ScalarKind, scalars: &[Scalar]) -> u32 {
        if scalars.is_empty() {
            return NULL_INDEX;
        }
        let mut data = vec![0u8; scalars.len() * kind.width()];
        for (chunk, s) in data.chunks_exact_mut(kind.width()).zip(scalars) {
            s.write_le(chunk);
        }
        self.push_vector(VectorElement::Scalar(kind), scalars.len(), data)
    }

    fn push_indices(&mut self, indices: Vec<u32>) -> u32 {
        if indices.is_empty() {
            return NULL_INDEX;
        }
        let data = indices.iter().flat_map(|i| i.to_le_bytes()).collect();
        self.push_vector(VectorElement::Index, indices.len(), data)
    }

    fn push_vector(&mut self, element: VectorElement, len: usize, data: Vec<u8>) -> u32 {
        let i = self.vectors.len() as u32;
        self.vectors.push(WireVector {
            element,
            len: len as u32,
            data,
        });
        i
    }

    fn mismatch(&self, table: &TableCodegen, cg: &PropertyCodegen, detail: &str) -> WireError {
        WireError::TypeMismatch {
            table: table.table.clone(),
            property: cg.property.name.clone(),
            detail: detail.to_string(),
        }
    }
}

/// The fixed-width scalars a value occupies on the wire, if it fits `kind`.
fn value_scalars(value: &Value, kind: ScalarKind) -> Option<Vec<Scalar>> {
    match value {
        Value::Scalar(s) if s.kind() == kind => Some(vec![*s]),
        Value::Duration(ms) | Value::DateTime(ms) if kind == ScalarKind::I64 => {
            Some(vec![Scalar::I64(*ms)])
        }
        Value::Composite(components) if components.iter().all(|c| c.kind() == kind) => {
            Some(components.clone())
        }
        _ => None,
    }
}

// ===========================================================================
// Override layer
// ===========================================================================

/// A live value that takes precedence over the baked one.
#[derive(Debug, Clone, PartialEq)]
pub struct Override<T>(pub T);

/// Overrides keyed by `(table, row, property)`. Never touches the buffer.
#[derive(Debug, Clone, Default)]
pub struct OverrideLayer {
    values: HashMap<(String, u32, String), Override<Value>>,
}

impl OverrideLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, table: &str, row: u32, property: &str, value: Value) {
        self.values
            .insert((table.to_string(), row, property.to_string()), Override(value));
    }

    pub fn get(&self, table: &str, row: u32, property: &str) -> Option<&Override<Value>> {
        self.values
            .get(&(table.to_string(), row, property.to_string()))
    }

    /// Drop one override, returning it.
    pub fn remove(&mut self, table: &str, row: u32, property: &str) -> Option<Override<Value>> {
        self.values
            .remove(&(table.to_string(), row, property.to_string()))
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ===========================================================================
// Reader
// ===========================================================================

/// A validated blob plus its override layer.
pub struct BlobReader<'r> {
    registry: &'r SchemaRegistry,
    blob: Blob,
    table_index: HashMap<String, usize>,
    overrides: OverrideLayer,
}

impl<'r> BlobReader<'r> {
    /// Decode and validate a blob. Fails on a bad header, and with
    /// [`WireError::Compatibility`] when it was built for another schema.
    pub fn open(bytes: &[u8], registry: &'r SchemaRegistry) -> Result<Self, WireError> {
        let blob: Blob =
            bitcode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))?;
        blob.header.validate()?;
        verify_data(registry.fingerprint(), Some(Fingerprint(blob.header.fingerprint)))?;

        for t in &blob.tables {
            let expected = registry
                .wire_schema()
                .table(&t.name)
                .ok_or_else(|| WireError::UnknownTable(t.name.clone()))?;
            if expected.record_size != t.record_size as usize
                || t.rows.len() != t.record_size as usize * t.row_count as usize
            {
                return Err(WireError::Corrupt(format!("table '{}' has a bad layout", t.name)));
            }
        }
        let table_index = blob
            .tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        Ok(Self {
            registry,
            blob,
            table_index,
            overrides: OverrideLayer::new(),
        })
    }

    pub fn header(&self) -> BlobHeader {
        self.blob.header
    }

    pub fn table(&self, name: &str) -> Result<TableReader<'_, 'r>, WireError> {
        let data = self
            .table_index
            .get(name)
            .map(|&i| &self.blob.tables[i])
            .ok_or_else(|| WireError::UnknownTable(name.to_string()))?;
        let codegen = self
            .registry
            .table_codegen(name)
            .ok_or_else(|| WireError::UnknownTable(name.to_string()))?;
        let layout = self
            .registry
            .wire_schema()
            .table(name)
            .ok_or_else(|| WireError::UnknownTable(name.to_string()))?;
        Ok(TableReader {
            reader: self,
            data,
            codegen,
            layout,
        })
    }

    pub fn overrides(&self) -> &OverrideLayer {
        &self.overrides
    }

    pub fn set_override(&mut self, table: &str, row: u32, property: &str, value: Value) {
        self.overrides.set(table, row, property, value);
    }

    pub fn remove_override(&mut self, table: &str, row: u32, property: &str) -> Option<Override<Value>> {
        self.overrides.remove(table, row, property)
    }

    pub fn clear_overrides(&mut self) {
        self.overrides.clear();
    }

    fn string(&self, index: u32) -> Result<&str, WireError> {
        self.blob
            .strings
            .get(index as usize)
            .map(String::as_str)
            .ok_or_else(|| WireError::Corrupt(format!("string {index} out of range")))
    }

    fn vector(&self, index: u32, element: VectorElement) -> Result<Option<&WireVector>, WireError> {
        if index == NULL_INDEX {
            return Ok(None);
        }
        let v = self
            .blob
            .vectors
            .get(index as usize)
            .ok_or_else(|| WireError::Corrupt(format!("vector {index} out of range")))?;
        if v.element != element || v.data.len() != v.len as usize * element.width() {
            return Err(WireError::Corrupt(format!("vector {index} has the wrong element type")));
        }
        Ok(Some(v))
    }

    fn vector_scalars(&self, index: u32, kind: ScalarKind) -> Result<Vec<Scalar>, WireError> {
        let Some(v) = self.vector(index, VectorElement::Scalar(kind))? else {
            return Ok(Vec::new());
        };
        v.data
            .chunks_exact(kind.width())
            .map(|chunk| {
                Scalar::read_le(kind, chunk).ok_or_else(|| WireError::Corrupt("short scalar".into()))
            })
            .collect()
    }

    fn vector_indices(&self, index: u32) -> Result<Vec<u32>, WireError> {
        let Some(v) = self.vector(index, VectorElement::Index)? else {
            return Ok(Vec::new());
        };
        Ok(v.data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Accessors for one table of an open blob.
pub struct TableReader<'b, 'r> {
    reader: &'b BlobReader<'r>,
    data: &'b TableData,
    codegen: &'r TableCodegen,
    layout: &'r TableLayout,
}

impl<'b, 'r> TableReader<'b, 'r> {
    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn len(&self) -> u32 {
        self.data.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.data.row_count == 0
    }

    pub fn guid(&self, row: u32) -> Option<Guid> {
        self.data.guids.get(row as usize).map(Guid::new)
    }

    /// Row of the record with `identifier`, by binary search.
    pub fn find(&self, identifier: &str) -> Result<Option<u32>, WireError> {
        let property = self.reader.registry.identifier_property();
        let (mut lo, mut hi) = (0u32, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let Value::Str(id) = self.baked(mid, property)? else {
                return Err(WireError::Corrupt(format!("{}.{property} is not text", self.name())));
            };
            match id.as_str().cmp(identifier) {
                std::cmp::Ordering::Equal => return Ok(Some(mid)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    /// Current value: the override if one is set, else the baked value.
    pub fn get(&self, row: u32, property: &str) -> Result<Value, WireError> {
        if let Some(Override(v)) = self.reader.overrides.get(&self.data.name, row, property) {
            return Ok(v.clone());
        }
        self.baked(row, property)
    }

    /// The value decoded from the buffer, ignoring overrides.
    pub fn baked(&self, row: u32, property: &str) -> Result<Value, WireError> {
        let cg = self
            .codegen
            .property(property)
            .ok_or_else(|| WireError::UnknownProperty {
                table: self.data.name.clone(),
                property: property.to_string(),
            })?;
        let bytes = self.data.row(row).ok_or_else(|| WireError::RowOutOfRange {
            table: self.data.name.clone(),
            row,
            len: self.data.row_count,
        })?;
        self.decode(cg, bytes)
    }

    /// Every stored property of one row, in declaration order.
    pub fn row_values(&self, row: u32) -> Result<StructValue, WireError> {
        let mut out = StructValue::new();
        for cg in &self.codegen.properties {
            out.fields
                .push((cg.property.name.clone(), self.get(row, &cg.property.name)?));
        }
        Ok(out)
    }

    fn slot_bytes<'x>(&self, bytes: &'x [u8], slot: &str) -> Result<&'x [u8], WireError> {
        self.layout
            .field_index(slot)
            .and_then(|i| self.layout.slot(i))
            .and_then(|range| bytes.get(range))
            .ok_or_else(|| WireError::Corrupt(format!("no slot {}.{slot}", self.layout.name)))
    }

    fn slot_index(&self, bytes: &[u8], slot: &str) -> Result<u32, WireError> {
        let b = self.slot_bytes(bytes, slot)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn slot_scalar(&self, bytes: &[u8], slot: &str, kind: ScalarKind) -> Result<Scalar, WireError> {
        let b = self.slot_bytes(bytes, slot)?;
        Scalar::read_le(kind, b).ok_or_else(|| WireError::Corrupt(format!("short slot {slot}")))
    }

    fn decode(&self, cg: &PropertyCodegen, bytes: &[u8]) -> Result<Value, WireError> {
        let reader = self.reader;
        let first = cg
            .write
            .slots
            .first()
            .ok_or_else(|| WireError::Corrupt(format!("{} has no slots", cg.property.name)))?;

        if !cg.list {
            return match &cg.read {
                ReadOp::Text => {
                    let i = self.slot_index(bytes, first)?;
                    let s = if i == NULL_INDEX { "" } else { reader.string(i)? };
                    Ok(Value::Str(s.to_string()))
                }
                ReadOp::Asset => {
                    let i = self.slot_index(bytes, first)?;
                    if i == NULL_INDEX {
                        Ok(Value::Asset(None))
                    } else {
                        Ok(Value::Asset(Some(reader.string(i)?.to_string())))
                    }
                }
                ReadOp::Enum { name, repr } => {
                    let s = self.slot_scalar(bytes, first, *repr)?;
                    self.enum_member(name, s)
                }
                ReadOp::Scalar(kind) => Ok(Value::Scalar(self.slot_scalar(bytes, first, *kind)?)),
                ReadOp::Time(kind) => {
                    let ms = self.slot_scalar(bytes, first, ScalarKind::I64)?.as_i64().unwrap_or(0);
                    Ok(time_value(*kind, ms))
                }
                ReadOp::Ref { target } => self.reference(target, self.slot_index(bytes, first)?),
                ReadOp::Embedded { table } => self.embedded(table, self.slot_index(bytes, first)?),
                ReadOp::Components { shape } => {
                    let kind = shape.component_kind();
                    let components = cg
                        .write
                        .slots
                        .iter()
                        .map(|slot| self.slot_scalar(bytes, slot, kind))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Value::Composite(components))
                }
            };
        }

        let items = match &cg.read {
            ReadOp::Text | ReadOp::Asset => {
                let indices = reader.vector_indices(self.slot_index(bytes, first)?)?;
                let mut items = Vec::with_capacity(indices.len());
                for i in indices {
                    items.push(match (&cg.read, i) {
                        (ReadOp::Asset, NULL_INDEX) => Value::Asset(None),
                        (ReadOp::Asset, i) => Value::Asset(Some(reader.string(i)?.to_string())),
                        (_, i) => Value::Str(reader.string(i)?.to_string()),
                    });
                }
                items
            }
            ReadOp::Enum { name, repr } => reader
                .vector_scalars(self.slot_index(bytes, first)?, *repr)?
                .into_iter()
                .map(|s| self.enum_member(name, s))
                .collect::<Result<_, _>>()?,
            ReadOp::Scalar(kind) => reader
                .vector_scalars(self.slot_index(bytes, first)?, *kind)?
                .into_iter()
                .map(Value::Scalar)
                .collect(),
            ReadOp::Time(kind) => reader
                .vector_scalars(self.slot_index(bytes, first)?, ScalarKind::I64)?
                .into_iter()
                .map(|s| time_value(*kind, s.as_i64().unwrap_or(0)))
                .collect(),
            ReadOp::Ref { target } => reader
                .vector_indices(self.slot_index(bytes, first)?)?
                .into_iter()
                .map(|i| self.reference(target, i))
                .collect::<Result<_, _>>()?,
            ReadOp::Embedded { table } => reader
                .vector_indices(self.slot_index(bytes, first)?)?
                .into_iter()
                .map(|i| self.embedded(table, i))
                .collect::<Result<_, _>>()?,
            ReadOp::Components { shape } => {
                let arity = shape.arity();
                let kind = shape.component_kind();
                let vectors = cg
                    .write
                    .slots
                    .iter()
                    .map(|slot| reader.vector_scalars(self.slot_index(bytes, slot)?, kind))
                    .collect::<Result<Vec<_>, _>>()?;
                let n = vectors.first().map_or(0, |v| v.len() / arity);
                let mut items = Vec::with_capacity(n);
                for i in 0..n {
                    let mut components = Vec::with_capacity(arity);
                    for (k, vector) in vectors.iter().enumerate() {
                        let c = vector
                            .get(component_offset(i, k, arity))
                            .copied()
                            .ok_or_else(|| WireError::Corrupt(format!("{}: short component vector", cg.property.name)))?;
                        components.push(c);
                    }
                    items.push(Value::Composite(components));
                }
                items
            }
        };
        Ok(Value::List(items))
    }

    fn enum_member(&self, name: &str, s: Scalar) -> Result<Value, WireError> {
        s.as_i64()
            .and_then(|v| self.reader.registry.enum_def(name)?.name_of(v))
            .map(|m| Value::Enum(m.to_string()))
            .ok_or_else(|| WireError::Corrupt(format!("{s} is not a member of {name}")))
    }

    fn reference(&self, target: &str, index: u32) -> Result<Value, WireError> {
        if index == NULL_INDEX {
            return Ok(Value::Ref(None));
        }
        let t = self.reader.table(target)?;
        t.guid(index)
            .map(|g| Value::Ref(Some(g)))
            .ok_or_else(|| WireError::RowOutOfRange {
                table: target.to_string(),
                row: index,
                len: t.len(),
            })
    }

    fn embedded(&self, table: &str, index: u32) -> Result<Value, WireError> {
        if index == NULL_INDEX {
            return Ok(Value::Struct(None));
        }
        let t = self.reader.table(table)?;
        let mut out = StructValue::new();
        for cg in &t.codegen.properties {
            if matches!(cg.property.shape, Shape::Identifier) {
                continue;
            }
            out.fields
                .push((cg.property.name.clone(), t.baked(index, &cg.property.name)?));
        }
        Ok(Value::Struct(Some(out)))
    }
}

fn time_value(kind: TimeKind, ms: i64) -> Value {
    match kind {
        TimeKind::Duration => Value::Duration(ms),
        TimeKind::DateTime => Value::DateTime(ms),
    }
}

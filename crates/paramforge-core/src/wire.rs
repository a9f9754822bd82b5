//! Wire schema: tables of fixed-size records with positionally ordered
//! fields.
//!
//! The [`SchemaAssembler`] collects [`SchemaField`]s per table in property
//! declaration order and rejects duplicates. The finished [`WireSchema`]
//! knows every table's byte layout and can render itself as an IDL document
//! for the external schema compiler.

use crate::decl::EnumDeclaration;
use crate::error::SchemaError;
use crate::fingerprint::Fingerprint;
use crate::value::ScalarKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;

/// Width of string, table and vector slots: a `u32` index.
pub const INDEX_WIDTH: usize = 4;

/// Marks a null reference or an absent string/vector.
pub const NULL_INDEX: u32 = u32::MAX;

/// Kind of value a wire field holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireKind {
    Scalar(ScalarKind),
    String,
    /// Row index into another table.
    Table(String),
}

impl WireKind {
    fn idl_name(&self) -> &str {
        match self {
            WireKind::Scalar(kind) => kind.tag(),
            WireKind::String => "string",
            WireKind::Table(target) => target,
        }
    }
}

/// One field of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaField {
    pub table: String,
    pub field: String,
    pub kind: WireKind,
    pub is_array: bool,
}

impl SchemaField {
    pub fn new(table: &str, field: &str, kind: WireKind, is_array: bool) -> Self {
        Self {
            table: table.to_string(),
            field: field.to_string(),
            kind,
            is_array,
        }
    }

    /// Bytes this field occupies in its table's fixed-size record.
    pub fn slot_width(&self) -> usize {
        match (&self.kind, self.is_array) {
            (WireKind::Scalar(kind), false) => kind.width(),
            _ => INDEX_WIDTH,
        }
    }
}

// ===========================================================================
// Assembler
// ===========================================================================

/// Accumulates tables and fields. Tables and fields keep definition order.
#[derive(Debug, Default)]
pub struct SchemaAssembler {
    tables: Vec<(String, bool, Vec<SchemaField>)>,
    defined: HashSet<(String, String)>,
}

impl SchemaAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a table. Record tables are reachable from the root; struct
    /// tables only through the records that embed them.
    pub fn define_table(&mut self, table: &str, is_record: bool) {
        if !self.tables.iter().any(|(name, _, _)| name == table) {
            self.tables.push((table.to_string(), is_record, Vec::new()));
        }
    }

    /// Append a field. Fails if `(table, field)` is already defined.
    pub fn define_field(&mut self, field: SchemaField) -> Result<(), SchemaError> {
        let key = (field.table.clone(), field.field.clone());
        if !self.defined.insert(key) {
            return Err(SchemaError::DuplicateField {
                table: field.table,
                field: field.field,
            });
        }
        self.define_table(&field.table, false);
        if let Some((_, _, fields)) = self.tables.iter_mut().find(|(name, _, _)| *name == field.table) {
            fields.push(field);
        }
        Ok(())
    }

    pub fn finish(self) -> WireSchema {
        let tables = self
            .tables
            .into_iter()
            .map(|(name, is_record, fields)| TableLayout::new(name, is_record, fields))
            .collect();
        WireSchema { tables }
    }
}

// ===========================================================================
// Layout
// ===========================================================================

/// Byte layout of one table's fixed-size record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    pub name: String,
    pub is_record: bool,
    pub fields: Vec<SchemaField>,
    /// Byte offset of each field, parallel to `fields`.
    pub offsets: Vec<usize>,
    pub record_size: usize,
}

impl TableLayout {
    fn new(name: String, is_record: bool, fields: Vec<SchemaField>) -> Self {
        let mut offsets = Vec::with_capacity(fields.len());
        let mut offset = 0;
        for f in &fields {
            offsets.push(offset);
            offset += f.slot_width();
        }
        Self {
            name,
            is_record,
            fields,
            offsets,
            record_size: offset,
        }
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.field == field)
    }

    /// Byte range of field `index` inside one record.
    pub fn slot(&self, index: usize) -> Option<std::ops::Range<usize>> {
        let f = self.fields.get(index)?;
        let start = *self.offsets.get(index)?;
        Some(start..start + f.slot_width())
    }
}

/// The assembled wire schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSchema {
    pub tables: Vec<TableLayout>,
}

impl WireSchema {
    pub fn table(&self, name: &str) -> Option<&TableLayout> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &SchemaField> {
        self.tables.iter().flat_map(|t| t.fields.iter())
    }

    /// Render the schema as an IDL document for the external compiler.
    pub fn render_idl(
        &self,
        namespace: &str,
        enums: &[EnumDeclaration],
        fingerprint: Fingerprint,
    ) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "// Generated. Do not edit.");
        let _ = writeln!(out, "// fingerprint: {fingerprint}");
        let _ = writeln!(out);
        let _ = writeln!(out, "namespace {namespace};");

        for e in enums {
            let _ = writeln!(out);
            let _ = writeln!(out, "enum {} : {} {{", e.name, e.repr.tag());
            for m in &e.members {
                let _ = writeln!(out, "  {} = {},", m.name, m.value);
            }
            let _ = writeln!(out, "}}");
        }

        for t in &self.tables {
            let _ = writeln!(out);
            let _ = writeln!(out, "table {} {{", t.name);
            for f in &t.fields {
                if f.is_array {
                    let _ = writeln!(out, "  {}:[{}];", f.field, f.kind.idl_name());
                } else {
                    let _ = writeln!(out, "  {}:{};", f.field, f.kind.idl_name());
                }
            }
            let _ = writeln!(out, "}}");
        }

        let root = format!("{namespace}Root");
        let _ = writeln!(out);
        let _ = writeln!(out, "table {root} {{");
        let _ = writeln!(out, "  fingerprint:string;");
        for t in self.tables.iter().filter(|t| t.is_record) {
            let _ = writeln!(out, "  {}:[{}];", t.name, t.name);
        }
        let _ = writeln!(out, "}}");
        let _ = writeln!(out);
        let _ = writeln!(out, "root_type {root};");
        out
    }
}

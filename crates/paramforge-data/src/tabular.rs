//! Tab-separated tabular files: one header row, then one row per record.
//!
//! Columns are matched by name, so their order is free. Besides the record
//! type's properties a file may carry a `GUID` column (blank for rows not yet
//! synchronized) and a `ContentHash` marker column, both rewritten after a
//! successful sync. Columns the schema does not know are kept as-is and
//! otherwise ignored.

use paramforge_core::id::Guid;
use paramforge_core::reconcile::TabularRow;
use paramforge_core::record::RecordSet;
use paramforge_core::registry::SchemaRegistry;
use paramforge_core::text::{ReferenceResolver, TextCodec, TextCodecError};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const GUID_COLUMN: &str = "GUID";
pub const MARKER_COLUMN: &str = "ContentHash";

#[derive(Debug, thiserror::Error)]
pub enum TabularError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed table {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },

    #[error("{path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },

    #[error("unknown record type '{0}'")]
    UnknownType(String),

    #[error("cannot export {record_type}.{property}: {source}")]
    Encode {
        record_type: String,
        property: String,
        source: TextCodecError,
    },
}

/// A tabular file in memory: the raw cells, plus the parsed rows.
#[derive(Debug, Clone)]
pub struct TabularTable {
    path: PathBuf,
    header: Vec<String>,
    /// Raw cells, parallel to `rows`, each padded to the header width.
    raw: Vec<Vec<String>>,
    pub rows: Vec<TabularRow>,
}

impl TabularTable {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Read the table for `record_type` from `path`.
    pub fn read(
        path: &Path,
        registry: &SchemaRegistry,
        record_type: &str,
    ) -> Result<Self, TabularError> {
        let file = std::fs::File::open(path).map_err(|source| TabularError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(path, file, registry, record_type)
    }

    /// Parse a table; `path` is only recorded for diagnostics and write-back.
    pub fn from_reader(
        path: &Path,
        reader: impl Read,
        registry: &SchemaRegistry,
        record_type: &str,
    ) -> Result<Self, TabularError> {
        let ty = registry
            .resolved_type(record_type)
            .ok_or_else(|| TabularError::UnknownType(record_type.to_string()))?;
        let csv_err = |source| TabularError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .quoting(false)
            .from_reader(reader);
        let mut records = reader.records();

        let header: Vec<String> = match records.next() {
            Some(r) => r.map_err(csv_err)?.iter().map(|c| c.trim().to_string()).collect(),
            None => Vec::new(),
        };
        let identifier_property = registry.identifier_property();
        let id_col = header
            .iter()
            .position(|h| h == identifier_property)
            .ok_or_else(|| TabularError::MissingColumn {
                path: path.to_path_buf(),
                column: identifier_property.to_string(),
            })?;
        let guid_col = header.iter().position(|h| h == GUID_COLUMN);

        let known: HashSet<&str> = ty.value_properties().map(|p| p.name.as_str()).collect();
        let mut seen = HashSet::new();
        let mut property_cols = Vec::new();
        for (i, name) in header.iter().enumerate() {
            if i == id_col || Some(i) == guid_col || name == MARKER_COLUMN {
                continue;
            }
            if !known.contains(name.as_str()) {
                tracing::warn!(table = %path.display(), column = %name, "unknown column ignored");
            } else if !seen.insert(name.as_str()) {
                tracing::warn!(table = %path.display(), column = %name, "duplicate column ignored");
            } else {
                property_cols.push(i);
            }
        }

        let mut raw = Vec::new();
        let mut rows = Vec::new();
        for (n, record) in records.enumerate() {
            let record = record.map_err(csv_err)?;
            let mut cells: Vec<String> = record.iter().map(str::to_string).collect();
            if cells.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            cells.resize(header.len().max(cells.len()), String::new());
            let line = record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or(n + 2);
            let guid = guid_col.and_then(|c| Guid::from_cell(&cells[c]));
            let row = property_cols.iter().fold(
                TabularRow::new(line, cells[id_col].trim(), guid),
                |row, &c| row.with_cell(&header[c], &cells[c]),
            );
            rows.push(row);
            raw.push(cells);
        }
        tracing::debug!(table = %path.display(), rows = rows.len(), "table read");

        Ok(Self {
            path: path.to_path_buf(),
            header,
            raw,
            rows,
        })
    }

    /// Record each row's GUID and marker in the raw cells, adding the
    /// columns if the file lacked them, and rewrite the file.
    pub fn write_back(&mut self, guids: &[Option<Guid>]) -> Result<(), TabularError> {
        if !self.header.iter().any(|h| h == GUID_COLUMN) {
            self.header.insert(0, GUID_COLUMN.to_string());
            for cells in &mut self.raw {
                cells.insert(0, String::new());
            }
        }
        if !self.header.iter().any(|h| h == MARKER_COLUMN) {
            self.header.push(MARKER_COLUMN.to_string());
        }
        let width = self.header.len();
        let guid_col = self.header.iter().position(|h| h == GUID_COLUMN).unwrap_or(0);
        let marker_col = self
            .header
            .iter()
            .position(|h| h == MARKER_COLUMN)
            .unwrap_or(width - 1);

        for (i, (cells, row)) in self.raw.iter_mut().zip(&mut self.rows).enumerate() {
            cells.resize(width.max(cells.len()), String::new());
            if let Some(Some(guid)) = guids.get(i) {
                row.guid = Some(guid.clone());
            }
            cells[guid_col] = row.guid.as_ref().map(|g| g.to_string()).unwrap_or_default();
            cells[marker_col] = row.content_hash.clone();
        }
        self.write()
    }

    /// Write the table to its path through a sibling temporary file.
    pub fn write(&self) -> Result<(), TabularError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| TabularError::Io { path, source }
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let tmp = self.path.with_extension("tsv.tmp");
        let file = std::fs::File::create(&tmp).map_err(io_err(&tmp))?;
        self.to_writer(file)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        tracing::debug!(table = %self.path.display(), rows = self.rows.len(), "table written");
        Ok(())
    }

    pub fn to_writer(&self, writer: impl Write) -> Result<(), TabularError> {
        let csv_err = |source| TabularError::Csv {
            path: self.path.clone(),
            source,
        };
        let mut out = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(csv::QuoteStyle::Never)
            .terminator(csv::Terminator::Any(b'\n'))
            .flexible(true)
            .from_writer(writer);
        out.write_record(&self.header).map_err(csv_err)?;
        for cells in &self.raw {
            out.write_record(cells).map_err(csv_err)?;
        }
        out.flush().map_err(|source| TabularError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Render structured records as a table: the reverse of a sync, used to
/// create a record type's table for the first time. Rows are ordered by
/// Identifier; unset properties are written as their defaults.
pub fn export_rows(
    path: &Path,
    registry: &SchemaRegistry,
    records: &RecordSet,
    refs: &dyn ReferenceResolver,
) -> Result<TabularTable, TabularError> {
    let record_type = records.record_type();
    let ty = registry
        .resolved_type(record_type)
        .ok_or_else(|| TabularError::UnknownType(record_type.to_string()))?;
    let codec = TextCodec::new(registry, refs);
    let props: Vec<_> = ty.value_properties().collect();

    let mut header = vec![
        GUID_COLUMN.to_string(),
        registry.identifier_property().to_string(),
    ];
    header.extend(props.iter().map(|p| p.name.clone()));
    header.push(MARKER_COLUMN.to_string());

    let mut raw = Vec::new();
    let mut rows = Vec::new();
    for (n, key) in records.keys_by_identifier().into_iter().enumerate() {
        let Some(record) = records.get(key) else { continue };
        let mut row = TabularRow::new(n + 2, &record.identifier, Some(record.guid.clone()));
        for prop in &props {
            let value = match record.values.get(&prop.name) {
                Some(v) => Some(v.clone()),
                None => prop.default_value(registry),
            };
            let cell = match value {
                Some(v) => codec.encode(prop, &v).map_err(|source| TabularError::Encode {
                    record_type: record_type.to_string(),
                    property: prop.name.clone(),
                    source,
                })?,
                None => String::new(),
            };
            row = row.with_cell(&prop.name, &cell);
        }
        let mut cells = vec![record.guid.to_string(), record.identifier.clone()];
        cells.extend(props.iter().map(|p| row.cells.get(&p.name).cloned().unwrap_or_default()));
        cells.push(row.content_hash.clone());
        raw.push(cells);
        rows.push(row);
    }

    Ok(TabularTable {
        path: path.to_path_buf(),
        header,
        raw,
        rows,
    })
}

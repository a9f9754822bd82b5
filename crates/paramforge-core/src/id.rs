use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::fmt;

new_key_type! {
    /// Identifies a record inside a [`RecordSet`](crate::record::RecordSet).
    pub struct RecordKey;
}

/// Stable identity of a structured record. Assigned once, never reused, and
/// the authoritative key for cross-references between records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(String);

impl Guid {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Parse the GUID column of a tabular row. Blank cells carry no GUID.
    pub fn from_cell(cell: &str) -> Option<Self> {
        let trimmed = cell.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// A fresh random GUID in 32-digit hex form.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out GUIDs for records created during reconciliation.
pub trait GuidSource {
    fn next_guid(&mut self) -> Guid;
}

/// Production source: random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomGuids;

impl GuidSource for RandomGuids {
    fn next_guid(&mut self) -> Guid {
        Guid::generate()
    }
}

use crate::id::{Guid, RecordKey};
use crate::text::ReferenceResolver;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::OnceLock;

/// An authored, identity-bearing object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRecord {
    pub guid: Guid,
    pub identifier: String,
    /// Where the record lives in the authoring store, relative to the
    /// store root. Derived from the store layout, not persisted.
    #[serde(skip)]
    pub directory: PathBuf,
    /// Marker of the tabular row this record was last synchronized from.
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl StructuredRecord {
    pub fn new(guid: Guid, identifier: &str) -> Self {
        Self {
            guid,
            identifier: identifier.to_string(),
            directory: PathBuf::new(),
            content_hash: None,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, property: &str, value: Value) -> Self {
        self.values.insert(property.to_string(), value);
        self
    }

    pub fn with_hash(mut self, hash: &str) -> Self {
        self.content_hash = Some(hash.to_string());
        self
    }

    pub fn in_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }
}

// ===========================================================================
// RecordSet
// ===========================================================================

/// All records of one record type, with lazily built lookup indices.
///
/// The GUID and Identifier indices are built on first use and cached until
/// the set is mutated or [`invalidate_indices`](Self::invalidate_indices) is
/// called.
#[derive(Debug, Default)]
pub struct RecordSet {
    record_type: String,
    records: SlotMap<RecordKey, StructuredRecord>,
    by_guid: OnceLock<HashMap<Guid, RecordKey>>,
    by_identifier: OnceLock<HashMap<String, RecordKey>>,
}

impl Clone for RecordSet {
    fn clone(&self) -> Self {
        Self {
            record_type: self.record_type.clone(),
            records: self.records.clone(),
            by_guid: OnceLock::new(),
            by_identifier: OnceLock::new(),
        }
    }
}

impl RecordSet {
    pub fn new(record_type: &str) -> Self {
        Self {
            record_type: record_type.to_string(),
            ..Self::default()
        }
    }

    pub fn from_records(record_type: &str, records: impl IntoIterator<Item = StructuredRecord>) -> Self {
        let mut set = Self::new(record_type);
        for r in records {
            set.insert(r);
        }
        set
    }

    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    pub fn insert(&mut self, record: StructuredRecord) -> RecordKey {
        self.invalidate_indices();
        self.records.insert(record)
    }

    pub fn remove(&mut self, key: RecordKey) -> Option<StructuredRecord> {
        self.invalidate_indices();
        self.records.remove(key)
    }

    pub fn get(&self, key: RecordKey) -> Option<&StructuredRecord> {
        self.records.get(key)
    }

    /// Mutable access. Drops the cached indices, since the GUID or
    /// Identifier may change.
    pub fn get_mut(&mut self, key: RecordKey) -> Option<&mut StructuredRecord> {
        self.invalidate_indices();
        self.records.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordKey, &StructuredRecord)> {
        self.records.iter()
    }

    /// Keys ordered by Identifier, for deterministic traversal.
    pub fn keys_by_identifier(&self) -> Vec<RecordKey> {
        let mut keys: Vec<RecordKey> = self.records.keys().collect();
        keys.sort_by(|a, b| self.records[*a].identifier.cmp(&self.records[*b].identifier));
        keys
    }

    pub fn by_guid(&self, guid: &Guid) -> Option<RecordKey> {
        self.by_guid
            .get_or_init(|| {
                self.records
                    .iter()
                    .map(|(k, r)| (r.guid.clone(), k))
                    .collect()
            })
            .get(guid)
            .copied()
    }

    pub fn by_identifier(&self, identifier: &str) -> Option<RecordKey> {
        self.by_identifier
            .get_or_init(|| {
                self.records
                    .iter()
                    .map(|(k, r)| (r.identifier.clone(), k))
                    .collect()
            })
            .get(identifier)
            .copied()
    }

    pub fn invalidate_indices(&mut self) {
        self.by_guid = OnceLock::new();
        self.by_identifier = OnceLock::new();
    }
}

// ===========================================================================
// RecordCatalog
// ===========================================================================

/// Record sets of every record type. Resolves references between them.
#[derive(Debug, Clone, Default)]
pub struct RecordCatalog {
    sets: BTreeMap<String, RecordSet>,
}

impl RecordCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_set(&mut self, set: RecordSet) {
        self.sets.insert(set.record_type().to_string(), set);
    }

    pub fn set(&self, record_type: &str) -> Option<&RecordSet> {
        self.sets.get(record_type)
    }

    pub fn set_mut(&mut self, record_type: &str) -> Option<&mut RecordSet> {
        self.sets.get_mut(record_type)
    }

    pub fn sets(&self) -> impl Iterator<Item = &RecordSet> {
        self.sets.values()
    }

    pub fn record_count(&self) -> usize {
        self.sets.values().map(RecordSet::len).sum()
    }

    /// Drop every cached index, e.g. at the start of a new run.
    pub fn invalidate_indices(&mut self) {
        for set in self.sets.values_mut() {
            set.invalidate_indices();
        }
    }
}

impl ReferenceResolver for RecordCatalog {
    fn guid_for(&self, record_type: &str, identifier: &str) -> Option<Guid> {
        let set = self.sets.get(record_type)?;
        set.by_identifier(identifier)
            .and_then(|k| set.get(k))
            .map(|r| r.guid.clone())
    }

    fn identifier_for(&self, record_type: &str, guid: &Guid) -> Option<String> {
        let set = self.sets.get(record_type)?;
        set.by_guid(guid)
            .and_then(|k| set.get(k))
            .map(|r| r.identifier.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> RecordSet {
        RecordSet::from_records(
            "Item",
            [
                StructuredRecord::new(Guid::new("g2"), "Gem"),
                StructuredRecord::new(Guid::new("g1"), "Coin"),
            ],
        )
    }

    #[test]
    fn lookups_by_both_keys() {
        let s = set();
        let k = s.by_guid(&Guid::new("g1")).unwrap();
        assert_eq!(s.get(k).unwrap().identifier, "Coin");
        assert_eq!(s.by_identifier("Gem"), s.by_guid(&Guid::new("g2")));
        assert_eq!(s.by_identifier("Ruby"), None);
    }

    #[test]
    fn mutation_invalidates_indices() {
        let mut s = set();
        let k = s.by_identifier("Coin").unwrap();
        s.get_mut(k).unwrap().identifier = "Token".into();
        assert_eq!(s.by_identifier("Coin"), None);
        assert_eq!(s.by_identifier("Token"), Some(k));

        s.remove(k);
        assert_eq!(s.by_guid(&Guid::new("g1")), None);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn keys_by_identifier_are_sorted() {
        let s = set();
        let ids: Vec<&str> = s
            .keys_by_identifier()
            .into_iter()
            .map(|k| s.get(k).unwrap().identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["Coin", "Gem"]);
    }

    #[test]
    fn catalog_resolves_references() {
        let mut c = RecordCatalog::new();
        c.insert_set(set());
        assert_eq!(c.guid_for("Item", "Gem"), Some(Guid::new("g2")));
        assert_eq!(c.identifier_for("Item", &Guid::new("g1")), Some("Coin".into()));
        assert_eq!(c.guid_for("Monster", "Gem"), None);
        assert_eq!(c.record_count(), 2);
    }
}

//! Applies a [`ReconciliationPlan`] to an authoring store.
//!
//! Every row the plan touches is decoded before the store is mutated, so a
//! bad cell leaves the store exactly as it was. Mutations then run in a
//! fixed order: temporary renames, updates, creates, deletes, final renames.

use crate::id::{Guid, RecordKey};
use crate::reconcile::{ReconcileAction, ReconciliationPlan, TabularRow};
use crate::record::{RecordCatalog, RecordSet, StructuredRecord};
use crate::regen::RegenState;
use crate::registry::SchemaRegistry;
use crate::text::{ReferenceResolver, TextCodec, TextCodecError};
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

// ===========================================================================
// Store
// ===========================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no {record_type} record with GUID {guid}")]
    NotFound { record_type: String, guid: Guid },

    #[error("{record_type} already has a record named '{identifier}'")]
    NameTaken {
        record_type: String,
        identifier: String,
    },

    #[error("malformed record at {path}: {detail}")]
    Malformed { path: PathBuf, detail: String },

    #[error("'{identifier}' cannot name a record file")]
    UnsafeIdentifier { identifier: String },
}

/// Persistent home of structured records.
pub trait RecordStore {
    fn load_all(&self, record_type: &str) -> Result<RecordSet, StoreError>;

    fn create(&mut self, record_type: &str, record: &StructuredRecord) -> Result<(), StoreError>;

    /// Overwrite the record with the same GUID. Its Identifier is kept.
    fn update(&mut self, record_type: &str, record: &StructuredRecord) -> Result<(), StoreError>;

    fn rename(&mut self, record_type: &str, guid: &Guid, identifier: &str) -> Result<(), StoreError>;

    fn delete(&mut self, record_type: &str, guid: &Guid) -> Result<(), StoreError>;
}

/// In-memory store, used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    sets: BTreeMap<String, RecordSet>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set(mut self, set: RecordSet) -> Self {
        self.sets.insert(set.record_type().to_string(), set);
        self
    }

    /// A store holding a copy of every set in `catalog`.
    pub fn from_catalog(catalog: &RecordCatalog) -> Self {
        catalog
            .sets()
            .fold(Self::new(), |store, set| store.with_set(set.clone()))
    }

    pub fn set(&self, record_type: &str) -> Option<&RecordSet> {
        self.sets.get(record_type)
    }

    pub fn into_catalog(self) -> RecordCatalog {
        let mut catalog = RecordCatalog::new();
        for set in self.sets.into_values() {
            catalog.insert_set(set);
        }
        catalog
    }

    fn set_mut(&mut self, record_type: &str) -> &mut RecordSet {
        self.sets
            .entry(record_type.to_string())
            .or_insert_with(|| RecordSet::new(record_type))
    }

    fn existing(
        &mut self,
        record_type: &str,
        guid: &Guid,
    ) -> Result<(&mut RecordSet, RecordKey), StoreError> {
        let set = self.set_mut(record_type);
        match set.by_guid(guid) {
            Some(key) => Ok((set, key)),
            None => Err(StoreError::NotFound {
                record_type: record_type.to_string(),
                guid: guid.clone(),
            }),
        }
    }
}

impl RecordStore for MemoryRecordStore {
    fn load_all(&self, record_type: &str) -> Result<RecordSet, StoreError> {
        Ok(self
            .sets
            .get(record_type)
            .cloned()
            .unwrap_or_else(|| RecordSet::new(record_type)))
    }

    fn create(&mut self, record_type: &str, record: &StructuredRecord) -> Result<(), StoreError> {
        let set = self.set_mut(record_type);
        if set.by_identifier(&record.identifier).is_some() {
            return Err(StoreError::NameTaken {
                record_type: record_type.to_string(),
                identifier: record.identifier.clone(),
            });
        }
        set.insert(record.clone());
        Ok(())
    }

    fn update(&mut self, record_type: &str, record: &StructuredRecord) -> Result<(), StoreError> {
        let (set, key) = self.existing(record_type, &record.guid)?;
        if let Some(slot) = set.get_mut(key) {
            let identifier = std::mem::take(&mut slot.identifier);
            *slot = StructuredRecord {
                identifier,
                ..record.clone()
            };
        }
        Ok(())
    }

    fn rename(&mut self, record_type: &str, guid: &Guid, identifier: &str) -> Result<(), StoreError> {
        let (set, key) = self.existing(record_type, guid)?;
        if set.by_identifier(identifier).is_some_and(|k| k != key) {
            return Err(StoreError::NameTaken {
                record_type: record_type.to_string(),
                identifier: identifier.to_string(),
            });
        }
        if let Some(record) = set.get_mut(key) {
            record.identifier = identifier.to_string();
        }
        Ok(())
    }

    fn delete(&mut self, record_type: &str, guid: &Guid) -> Result<(), StoreError> {
        let (set, key) = self.existing(record_type, guid)?;
        set.remove(key);
        Ok(())
    }
}

// ===========================================================================
// References across pending plans
// ===========================================================================

/// Identifier/GUID map of every row being synchronized, so that cells can
/// reference records that only exist once the plans are applied.
#[derive(Debug, Clone, Default)]
pub struct PlannedReferences {
    by_identifier: HashMap<(String, String), Guid>,
    by_guid: HashMap<(String, Guid), String>,
}

impl PlannedReferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rows(&mut self, plan: &ReconciliationPlan, rows: &[TabularRow]) {
        for (row, guid) in rows.iter().zip(plan.row_guids(rows)) {
            let Some(guid) = guid else { continue };
            self.insert(&plan.record_type, &row.identifier, guid);
        }
    }

    pub fn insert(&mut self, record_type: &str, identifier: &str, guid: Guid) {
        self.by_identifier
            .insert((record_type.to_string(), identifier.to_string()), guid.clone());
        self.by_guid
            .insert((record_type.to_string(), guid), identifier.to_string());
    }
}

impl ReferenceResolver for PlannedReferences {
    fn guid_for(&self, record_type: &str, identifier: &str) -> Option<Guid> {
        self.by_identifier
            .get(&(record_type.to_string(), identifier.to_string()))
            .cloned()
    }

    fn identifier_for(&self, record_type: &str, guid: &Guid) -> Option<String> {
        self.by_guid
            .get(&(record_type.to_string(), guid.clone()))
            .cloned()
    }
}

// ===========================================================================
// Executor
// ===========================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("line {line}, column '{property}': {source}")]
pub struct RowDecodeError {
    pub line: usize,
    pub property: String,
    pub source: TextCodecError,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("{} cell(s) failed to decode; store left untouched", .0.len())]
    Decode(Vec<RowDecodeError>),

    #[error("unknown record type '{0}'")]
    UnknownType(String),

    #[error("plan names record {0}, which is not in the loaded set")]
    MissingRecord(Guid),

    #[error("plan names row {0}, which does not exist")]
    MissingRow(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one plan did to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub record_type: String,
    pub updated: usize,
    pub created: usize,
    pub deleted: usize,
    pub renamed: usize,
    pub regen: RegenState,
}

pub struct PlanExecutor<'a> {
    registry: &'a SchemaRegistry,
    refs: &'a dyn ReferenceResolver,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(registry: &'a SchemaRegistry, refs: &'a dyn ReferenceResolver) -> Self {
        Self { registry, refs }
    }

    /// Decode the property cells of one row. Columns absent from the row are
    /// left out of the result.
    pub fn decode_row(
        &self,
        record_type: &str,
        row: &TabularRow,
    ) -> Result<BTreeMap<String, Value>, ExecuteError> {
        let ty = self
            .registry
            .resolved_type(record_type)
            .ok_or_else(|| ExecuteError::UnknownType(record_type.to_string()))?;
        let codec = TextCodec::new(self.registry, self.refs);
        let mut values = BTreeMap::new();
        let mut errors = Vec::new();
        for prop in ty.value_properties() {
            let Some(cell) = row.cells.get(&prop.name) else { continue };
            match codec.decode(prop, cell) {
                Ok(v) => {
                    values.insert(prop.name.clone(), v);
                }
                Err(source) => errors.push(RowDecodeError {
                    line: row.line,
                    property: prop.name.clone(),
                    source,
                }),
            }
        }
        if errors.is_empty() {
            Ok(values)
        } else {
            Err(ExecuteError::Decode(errors))
        }
    }

    /// Decode every row `plan` would write without touching any store.
    pub fn check(&self, plan: &ReconciliationPlan, rows: &[TabularRow]) -> Result<(), ExecuteError> {
        self.decode_plan(plan, rows).map(|_| ())
    }

    /// Decode every row the plan writes, collecting all failures.
    fn decode_plan(
        &self,
        plan: &ReconciliationPlan,
        rows: &[TabularRow],
    ) -> Result<HashMap<usize, BTreeMap<String, Value>>, ExecuteError> {
        let mut decoded = HashMap::new();
        let mut errors = Vec::new();
        for action in &plan.actions {
            let row = match action {
                ReconcileAction::Update { row, .. } | ReconcileAction::Create { row, .. } => *row,
                ReconcileAction::Delete { .. } => continue,
            };
            let source = rows.get(row).ok_or(ExecuteError::MissingRow(row))?;
            match self.decode_row(&plan.record_type, source) {
                Ok(values) => {
                    decoded.insert(row, values);
                }
                Err(ExecuteError::Decode(mut e)) => errors.append(&mut e),
                Err(other) => return Err(other),
            }
        }
        if errors.is_empty() {
            Ok(decoded)
        } else {
            Err(ExecuteError::Decode(errors))
        }
    }

    /// Apply `plan` (computed against `records`) to `store`.
    pub fn apply(
        &self,
        plan: &ReconciliationPlan,
        rows: &[TabularRow],
        records: &RecordSet,
        store: &mut dyn RecordStore,
    ) -> Result<ExecutionReport, ExecuteError> {
        let record_type = plan.record_type.as_str();
        let mut decoded = self.decode_plan(plan, rows)?;
        let mut report = ExecutionReport {
            record_type: record_type.to_string(),
            updated: 0,
            created: 0,
            deleted: 0,
            renamed: 0,
            regen: plan.regen_state(),
        };

        for action in &plan.actions {
            if let ReconcileAction::Update {
                guid,
                rename: Some(r),
                ..
            } = action
            {
                store.rename(record_type, guid, &r.temporary)?;
            }
        }

        for action in &plan.actions {
            let ReconcileAction::Update { guid, row, rename } = action else { continue };
            let key = records
                .by_guid(guid)
                .ok_or_else(|| ExecuteError::MissingRecord(guid.clone()))?;
            let mut record = records
                .get(key)
                .cloned()
                .ok_or_else(|| ExecuteError::MissingRecord(guid.clone()))?;
            if let Some(r) = rename {
                record.identifier = r.temporary.clone();
            }
            record.values.extend(decoded.remove(row).unwrap_or_default());
            record.content_hash = Some(rows[*row].content_hash.clone());
            store.update(record_type, &record)?;
            report.updated += 1;
        }

        for action in &plan.actions {
            let ReconcileAction::Create { row, guid, directory } = action else { continue };
            let source = &rows[*row];
            let mut record = StructuredRecord::new(guid.clone(), &source.identifier)
                .with_hash(&source.content_hash)
                .in_directory(directory.clone());
            if let Some(ty) = self.registry.resolved_type(record_type) {
                for prop in ty.value_properties() {
                    if let Some(v) = prop.default_value(self.registry) {
                        record.values.insert(prop.name.clone(), v);
                    }
                }
            }
            record.values.extend(decoded.remove(row).unwrap_or_default());
            store.create(record_type, &record)?;
            report.created += 1;
        }

        for action in &plan.actions {
            if let ReconcileAction::Delete { guid } = action {
                store.delete(record_type, guid)?;
                report.deleted += 1;
            }
        }

        for r in plan.renames() {
            let guid = plan.actions.iter().find_map(|a| match a {
                ReconcileAction::Update {
                    guid,
                    rename: Some(x),
                    ..
                } if x == r => Some(guid),
                _ => None,
            });
            if let Some(guid) = guid {
                store.rename(record_type, guid, &r.to)?;
                report.renamed += 1;
            }
        }

        tracing::info!(
            record_type,
            updated = report.updated,
            created = report.created,
            deleted = report.deleted,
            renamed = report.renamed,
            "plan applied"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::Reconciler;
    use crate::test_utils::{SequentialGuids, fixture_registry};
    use crate::value::Scalar;

    fn item(guid: &str, id: &str, price: i32) -> StructuredRecord {
        StructuredRecord::new(Guid::new(guid), id)
            .with_hash("old")
            .with_value("price", Value::Scalar(Scalar::I32(price)))
    }

    fn price_row(line: usize, id: &str, guid: &str, price: &str) -> TabularRow {
        TabularRow::new(line, id, Guid::from_cell(guid)).with_cell("price", price)
    }

    fn sync(
        store: &mut MemoryRecordStore,
        rows: &[TabularRow],
    ) -> Result<ExecutionReport, ExecuteError> {
        let reg = fixture_registry();
        let records = store.load_all("Item")?;
        let mut guids = SequentialGuids::new("new");
        let plan = Reconciler::new(&mut guids)
            .reconcile(&records, rows)
            .expect("plan");
        let mut refs = PlannedReferences::new();
        refs.add_rows(&plan, rows);
        PlanExecutor::new(&reg, &refs).apply(&plan, rows, &records, store)
    }

    fn price_of(store: &MemoryRecordStore, id: &str) -> Option<Value> {
        let set = store.set("Item")?;
        let key = set.by_identifier(id)?;
        set.get(key)?.values.get("price").cloned()
    }

    // -----------------------------------------------------------------------
    // Applying plans
    // -----------------------------------------------------------------------

    #[test]
    fn updates_and_creates_write_values() {
        let mut store = MemoryRecordStore::new()
            .with_set(RecordSet::from_records("Item", [item("g1", "Coin", 1)]));
        let rows = [price_row(2, "Coin", "g1", "5"), price_row(3, "Gem", "", "50")];
        let report = sync(&mut store, &rows).unwrap();
        assert_eq!((report.updated, report.created), (1, 1));
        assert_eq!(price_of(&store, "Coin"), Some(Value::Scalar(Scalar::I32(5))));
        assert_eq!(price_of(&store, "Gem"), Some(Value::Scalar(Scalar::I32(50))));

        let set = store.set("Item").unwrap();
        let gem = set.get(set.by_identifier("Gem").unwrap()).unwrap();
        assert_eq!(gem.guid, Guid::new("new-1"));
        assert_eq!(gem.content_hash.as_deref(), Some(rows[1].content_hash.as_str()));
        // Properties without a column take their defaults on create.
        assert_eq!(gem.values.get("rarity"), Some(&Value::Enum("Common".into())));
    }

    #[test]
    fn swapped_identifiers_settle_through_temporaries() {
        let mut store = MemoryRecordStore::new().with_set(RecordSet::from_records(
            "Item",
            [item("g1", "Coin", 1), item("g2", "Gem", 2)],
        ));
        let rows = [price_row(2, "Gem", "g1", "1"), price_row(3, "Coin", "g2", "2")];
        let report = sync(&mut store, &rows).unwrap();
        assert_eq!(report.renamed, 2);
        let set = store.set("Item").unwrap();
        assert_eq!(set.by_identifier("Gem"), set.by_guid(&Guid::new("g1")));
        assert_eq!(set.by_identifier("Coin"), set.by_guid(&Guid::new("g2")));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn deletes_remove_records() {
        let mut store = MemoryRecordStore::new().with_set(RecordSet::from_records(
            "Item",
            [item("g1", "Coin", 1), item("g2", "Gem", 2)],
        ));
        let report = sync(&mut store, &[price_row(2, "Coin", "g1", "1")]).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(report.regen.needs_full());
        assert_eq!(store.set("Item").unwrap().len(), 1);
    }

    #[test]
    fn catalog_copies_are_independent_of_the_source() {
        let mut catalog = RecordCatalog::new();
        catalog.insert_set(RecordSet::from_records(
            "Item",
            [item("g1", "Coin", 1), item("g2", "Gem", 2)],
        ));
        let mut store = MemoryRecordStore::from_catalog(&catalog);
        sync(&mut store, &[price_row(2, "Coin", "g1", "7")]).unwrap();

        assert_eq!(catalog.set("Item").unwrap().len(), 2);
        let after = store.into_catalog();
        let set = after.set("Item").unwrap();
        assert_eq!(set.len(), 1);
        let coin = set.get(set.by_guid(&Guid::new("g1")).unwrap()).unwrap();
        assert_eq!(coin.values.get("price"), Some(&Value::Scalar(Scalar::I32(7))));
    }

    #[test]
    fn decode_failure_leaves_store_untouched() {
        let mut store = MemoryRecordStore::new()
            .with_set(RecordSet::from_records("Item", [item("g1", "Coin", 1)]));
        let before = store.set("Item").unwrap().clone();
        let rows = [price_row(2, "Coin", "g1", "lots"), price_row(3, "Gem", "", "x")];
        let err = sync(&mut store, &rows).unwrap_err();
        let ExecuteError::Decode(errors) = err else {
            panic!("expected decode errors, got {err:?}");
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].line, 2);
        assert_eq!(errors[0].property, "price");

        let after = store.set("Item").unwrap();
        assert_eq!(after.len(), before.len());
        assert_eq!(price_of(&store, "Coin"), Some(Value::Scalar(Scalar::I32(1))));
    }

    #[test]
    fn references_resolve_to_rows_created_in_the_same_sync() {
        let reg = fixture_registry();
        let mut guids = SequentialGuids::new("new");
        let item_rows = [TabularRow::new(2, "Coin", None)];
        let item_plan = Reconciler::new(&mut guids)
            .reconcile(&RecordSet::new("Item"), &item_rows)
            .unwrap();
        let monster_rows = [TabularRow::new(2, "Orc", None).with_cell("drops", "Coin")];
        let monster_plan = Reconciler::new(&mut guids)
            .reconcile(&RecordSet::new("Monster"), &monster_rows)
            .unwrap();

        let mut refs = PlannedReferences::new();
        refs.add_rows(&item_plan, &item_rows);
        refs.add_rows(&monster_plan, &monster_rows);
        let values = PlanExecutor::new(&reg, &refs)
            .decode_row("Monster", &monster_rows[0])
            .unwrap();
        assert_eq!(
            values.get("drops"),
            Some(&Value::List(vec![Value::Ref(Some(Guid::new("new-1")))]))
        );
    }

    // -----------------------------------------------------------------------
    // Memory store
    // -----------------------------------------------------------------------

    #[test]
    fn memory_store_guards_names() {
        let mut store = MemoryRecordStore::new()
            .with_set(RecordSet::from_records("Item", [item("g1", "Coin", 1), item("g2", "Gem", 2)]));
        assert!(matches!(
            store.rename("Item", &Guid::new("g1"), "Gem"),
            Err(StoreError::NameTaken { .. })
        ));
        assert!(matches!(
            store.create("Item", &item("g3", "Coin", 3)),
            Err(StoreError::NameTaken { .. })
        ));
        assert!(matches!(
            store.delete("Item", &Guid::new("g9")),
            Err(StoreError::NotFound { .. })
        ));
        store.rename("Item", &Guid::new("g1"), "Token").unwrap();
        assert!(store.set("Item").unwrap().by_identifier("Token").is_some());
    }
}

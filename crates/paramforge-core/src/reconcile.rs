//! Record reconciliation: matches tabular rows to structured records of one
//! record type and produces a [`ReconciliationPlan`].
//!
//! Stages run in a fixed order and each one consumes the rows it matched:
//!
//! 1. pre-validate the whole batch (blank/duplicate identifiers, unknown
//!    GUIDs, GUIDs claimed by several rows);
//! 2. exact match on GUID and Identifier;
//! 3. GUID-only match, renaming the record;
//! 4. Identifier-only match (GUID backfilled into the row), then pairing of
//!    a lone leftover row with a lone leftover record;
//! 5. create records for the remaining rows;
//! 6. delete records no row claimed.
//!
//! The matcher never touches the authoring store. The plan is applied by
//! [`PlanExecutor`](crate::executor::PlanExecutor).

use crate::fingerprint::FingerprintHasher;
use crate::id::{Guid, GuidSource, RecordKey};
use crate::record::RecordSet;
use crate::regen::{ChangeKind, ChangeSet, RegenState};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ===========================================================================
// Rows
// ===========================================================================

/// One row of the tabular interchange format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabularRow {
    /// Line number in the source file, for diagnostics.
    pub line: usize,
    pub identifier: String,
    pub guid: Option<Guid>,
    /// Hash of the property cells; equal to the record's marker when the
    /// row has not changed since the last sync.
    pub content_hash: String,
    /// Property cells keyed by property name.
    pub cells: BTreeMap<String, String>,
}

impl TabularRow {
    pub fn new(line: usize, identifier: &str, guid: Option<Guid>) -> Self {
        let cells = BTreeMap::new();
        Self {
            line,
            identifier: identifier.to_string(),
            guid,
            content_hash: content_hash(&cells),
            cells,
        }
    }

    pub fn with_cell(mut self, property: &str, text: &str) -> Self {
        self.cells.insert(property.to_string(), text.to_string());
        self.content_hash = content_hash(&self.cells);
        self
    }

    /// Override the computed marker.
    pub fn with_hash(mut self, hash: &str) -> Self {
        self.content_hash = hash.to_string();
        self
    }
}

/// Marker of a row's property cells, as 16 hex digits.
pub fn content_hash(cells: &BTreeMap<String, String>) -> String {
    let mut h = FingerprintHasher::unsalted();
    for (name, cell) in cells {
        h.write_str(name);
        h.write_str(cell);
    }
    h.finish().to_string()
}

// ===========================================================================
// Plan
// ===========================================================================

/// Two-phase rename: `from` goes to `temporary` before any other change is
/// applied, and to `to` once creates and deletes are done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub from: String,
    pub temporary: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Overwrite the record's values from row `row` (an index into the rows
    /// handed to the matcher).
    Update {
        guid: Guid,
        row: usize,
        rename: Option<Rename>,
    },
    Create {
        row: usize,
        guid: Guid,
        directory: PathBuf,
    },
    Delete {
        guid: Guid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub record_type: String,
    pub actions: Vec<ReconcileAction>,
    /// Rows that had no GUID and got one from the record they matched, as
    /// `(row index, GUID)`.
    pub backfilled: Vec<(usize, Guid)>,
    pub force_full_regeneration: bool,
}

impl ReconciliationPlan {
    fn new(record_type: &str) -> Self {
        Self {
            record_type: record_type.to_string(),
            actions: Vec::new(),
            backfilled: Vec::new(),
            force_full_regeneration: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn updates(&self) -> impl Iterator<Item = &ReconcileAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, ReconcileAction::Update { .. }))
    }

    pub fn creates(&self) -> impl Iterator<Item = &ReconcileAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, ReconcileAction::Create { .. }))
    }

    pub fn deletes(&self) -> impl Iterator<Item = &ReconcileAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, ReconcileAction::Delete { .. }))
    }

    pub fn renames(&self) -> impl Iterator<Item = &Rename> {
        self.actions.iter().filter_map(|a| match a {
            ReconcileAction::Update {
                rename: Some(r), ..
            } => Some(r),
            _ => None,
        })
    }

    /// GUID of every row once the plan is applied: the row's own, a
    /// backfilled one, or the one assigned on create.
    pub fn row_guids(&self, rows: &[TabularRow]) -> Vec<Option<Guid>> {
        let mut out: Vec<Option<Guid>> = rows.iter().map(|r| r.guid.clone()).collect();
        for (row, guid) in &self.backfilled {
            if let Some(slot) = out.get_mut(*row) {
                *slot = Some(guid.clone());
            }
        }
        for action in &self.actions {
            if let ReconcileAction::Create { row, guid, .. } = action
                && let Some(slot) = out.get_mut(*row)
            {
                *slot = Some(guid.clone());
            }
        }
        out
    }

    /// What this plan means for the binary data.
    pub fn regen_state(&self) -> RegenState {
        if self.force_full_regeneration {
            return RegenState::NeedsFull;
        }
        let mut changes = ChangeSet::new();
        for action in &self.actions {
            let (guid, kind) = match action {
                ReconcileAction::Update {
                    guid,
                    rename: Some(r),
                    ..
                } => (guid, ChangeKind::Renamed { from: r.from.clone() }),
                ReconcileAction::Update { guid, .. } => (guid, ChangeKind::Updated),
                ReconcileAction::Create { guid, .. } => (guid, ChangeKind::Created),
                ReconcileAction::Delete { .. } => return RegenState::NeedsFull,
            };
            if !changes.record(&self.record_type, guid.clone(), kind) {
                return RegenState::NeedsFull;
            }
        }
        RegenState::incremental(changes)
    }
}

// ===========================================================================
// Errors and cancellation
// ===========================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconciliationError {
    #[error("line {line}: identifier is blank")]
    BlankIdentifier { line: usize },

    #[error("identifier '{identifier}' appears on more than one row (lines {lines:?})")]
    DuplicateIdentifier {
        identifier: String,
        lines: Vec<usize>,
    },

    #[error("line {line}: unknown GUID {guid}")]
    UnknownGuidReference { line: usize, guid: Guid },

    #[error(
        "line {line}: multiple rows claim GUID {guid} but the current record doesn't disambiguate them"
    )]
    GuidConflict { guid: Guid, line: usize },

    #[error("reconciliation cancelled before {0}")]
    Cancelled(String),
}

/// Shared flag checked before each stage.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ===========================================================================
// Matcher
// ===========================================================================

/// Runs the matching stages for one record type.
pub struct Reconciler<'g> {
    guids: &'g mut dyn GuidSource,
    default_directory: Option<PathBuf>,
    cancel: CancelFlag,
}

/// Working state of one pass.
struct Pass<'a> {
    records: &'a RecordSet,
    rows: &'a [TabularRow],
    /// `false` once a row is matched or rejected.
    remaining: Vec<bool>,
    claimed: HashMap<RecordKey, usize>,
    taken_names: HashSet<String>,
    plan: ReconciliationPlan,
    errors: Vec<ReconciliationError>,
}

impl<'g> Reconciler<'g> {
    pub fn new(guids: &'g mut dyn GuidSource) -> Self {
        Self {
            guids,
            default_directory: None,
            cancel: CancelFlag::new(),
        }
    }

    /// Directory for created records when no existing record can lend its
    /// own. Defaults to the record type's name.
    pub fn with_default_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_directory = Some(dir.into());
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    fn checkpoint(&self, stage: &str) -> Result<(), Vec<ReconciliationError>> {
        if self.cancel.is_cancelled() {
            return Err(vec![ReconciliationError::Cancelled(stage.to_string())]);
        }
        Ok(())
    }

    /// Match `rows` against `records`. On any error the plan is discarded
    /// and every error found is returned.
    pub fn reconcile(
        &mut self,
        records: &RecordSet,
        rows: &[TabularRow],
    ) -> Result<ReconciliationPlan, Vec<ReconciliationError>> {
        let record_type = records.record_type();

        self.checkpoint("pre-validation")?;
        let multi_claimed = prevalidate(records, rows)?;

        let mut taken_names: HashSet<String> = rows.iter().map(|r| r.identifier.clone()).collect();
        taken_names.extend(records.iter().map(|(_, r)| r.identifier.clone()));
        let mut pass = Pass {
            records,
            rows,
            remaining: vec![true; rows.len()],
            claimed: HashMap::new(),
            taken_names,
            plan: ReconciliationPlan::new(record_type),
            errors: Vec::new(),
        };

        self.checkpoint("exact match")?;
        pass.exact_matches();
        self.checkpoint("GUID match")?;
        pass.guid_matches(&multi_claimed);
        self.checkpoint("identifier match")?;
        pass.identifier_matches();
        self.checkpoint("create")?;
        let directory = pass
            .borrowed_directory()
            .or_else(|| self.default_directory.clone())
            .unwrap_or_else(|| PathBuf::from(record_type));
        pass.creates(&mut *self.guids, &directory);
        self.checkpoint("delete")?;
        pass.deletes();

        if !pass.errors.is_empty() {
            tracing::warn!(record_type, errors = pass.errors.len(), "reconciliation rejected");
            return Err(pass.errors);
        }
        let plan = pass.plan;
        tracing::debug!(
            record_type,
            updates = plan.updates().count(),
            creates = plan.creates().count(),
            deletes = plan.deletes().count(),
            backfilled = plan.backfilled.len(),
            "reconciliation planned"
        );
        Ok(plan)
    }
}

/// Stage 1. Returns the GUIDs claimed by more than one row.
fn prevalidate(
    records: &RecordSet,
    rows: &[TabularRow],
) -> Result<HashSet<Guid>, Vec<ReconciliationError>> {
    let mut errors = Vec::new();
    let mut lines_by_identifier: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut claims: HashMap<&Guid, usize> = HashMap::new();

    for row in rows {
        if row.identifier.trim().is_empty() {
            errors.push(ReconciliationError::BlankIdentifier { line: row.line });
        } else {
            lines_by_identifier
                .entry(row.identifier.as_str())
                .or_default()
                .push(row.line);
        }
        if let Some(guid) = &row.guid {
            if records.by_guid(guid).is_none() {
                errors.push(ReconciliationError::UnknownGuidReference {
                    line: row.line,
                    guid: guid.clone(),
                });
            }
            *claims.entry(guid).or_default() += 1;
        }
    }
    for (identifier, lines) in lines_by_identifier {
        if lines.len() > 1 {
            errors.push(ReconciliationError::DuplicateIdentifier {
                identifier: identifier.to_string(),
                lines,
            });
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(claims
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(g, _)| g.clone())
        .collect())
}

impl<'a> Pass<'a> {
    fn claim(&mut self, row: usize, key: RecordKey) {
        self.remaining[row] = false;
        self.claimed.insert(key, row);
    }

    fn remaining_rows(&self) -> Vec<usize> {
        (0..self.rows.len()).filter(|&i| self.remaining[i]).collect()
    }

    /// Stage 2.
    fn exact_matches(&mut self) {
        let (records, rows) = (self.records, self.rows);
        for i in self.remaining_rows() {
            let row = &rows[i];
            let Some(guid) = &row.guid else { continue };
            let Some(key) = records.by_guid(guid) else { continue };
            let Some(record) = records.get(key) else { continue };
            if record.identifier != row.identifier {
                continue;
            }
            let unchanged = record.content_hash.as_deref() == Some(row.content_hash.as_str());
            self.claim(i, key);
            if !unchanged {
                self.plan.actions.push(ReconcileAction::Update {
                    guid: guid.clone(),
                    row: i,
                    rename: None,
                });
            }
        }
    }

    /// Stage 3.
    fn guid_matches(&mut self, multi_claimed: &HashSet<Guid>) {
        let (records, rows) = (self.records, self.rows);
        for i in self.remaining_rows() {
            let row = &rows[i];
            let Some(guid) = &row.guid else { continue };
            let Some(key) = records.by_guid(guid) else { continue };
            if self.claimed.contains_key(&key) {
                // Only reachable for multi-claimed GUIDs: every other GUID
                // names a record no other row has touched.
                debug_assert!(multi_claimed.contains(guid));
                self.remaining[i] = false;
                self.errors.push(ReconciliationError::GuidConflict {
                    guid: guid.clone(),
                    line: row.line,
                });
                continue;
            }
            let rename = self.rename_for(key, &row.identifier);
            self.claim(i, key);
            self.plan.actions.push(ReconcileAction::Update {
                guid: guid.clone(),
                row: i,
                rename,
            });
        }
    }

    /// Stage 4.
    fn identifier_matches(&mut self) {
        let (records, rows) = (self.records, self.rows);
        for i in self.remaining_rows() {
            let row = &rows[i];
            let Some(key) = records.by_identifier(&row.identifier) else { continue };
            if self.claimed.contains_key(&key) {
                continue;
            }
            let Some(record) = records.get(key) else { continue };
            let guid = record.guid.clone();
            self.claim(i, key);
            self.plan.backfilled.push((i, guid.clone()));
            self.plan.actions.push(ReconcileAction::Update {
                guid,
                row: i,
                rename: None,
            });
        }

        // A single leftover row and a single leftover record are taken to
        // be the same record under a new name.
        let leftover = self.remaining_rows();
        let unclaimed: Vec<RecordKey> = records
            .keys_by_identifier()
            .into_iter()
            .filter(|k| !self.claimed.contains_key(k))
            .collect();
        if let ([i], [key]) = (leftover.as_slice(), unclaimed.as_slice())
            && rows[*i].guid.is_none()
            && let Some(record) = records.get(*key)
        {
            let (i, key) = (*i, *key);
            let guid = record.guid.clone();
            let rename = self.rename_for(key, &rows[i].identifier);
            self.claim(i, key);
            self.plan.backfilled.push((i, guid.clone()));
            self.plan.actions.push(ReconcileAction::Update {
                guid,
                row: i,
                rename,
            });
        }
    }

    /// Directory of the first claimed record, by row order.
    fn borrowed_directory(&self) -> Option<PathBuf> {
        self.claimed
            .iter()
            .min_by_key(|(_, row)| **row)
            .and_then(|(key, _)| self.records.get(*key))
            .map(|r| r.directory.clone())
            .filter(|d| !d.as_os_str().is_empty())
    }

    /// Stage 5.
    fn creates(&mut self, guids: &mut dyn GuidSource, directory: &std::path::Path) {
        for i in self.remaining_rows() {
            self.remaining[i] = false;
            self.plan.actions.push(ReconcileAction::Create {
                row: i,
                guid: guids.next_guid(),
                directory: directory.to_path_buf(),
            });
        }
    }

    /// Stage 6.
    fn deletes(&mut self) {
        let records = self.records;
        for key in records.keys_by_identifier() {
            if self.claimed.contains_key(&key) {
                continue;
            }
            if let Some(record) = records.get(key) {
                self.plan.actions.push(ReconcileAction::Delete {
                    guid: record.guid.clone(),
                });
                self.plan.force_full_regeneration = true;
            }
        }
    }

    /// Rename plan for a record that is to take `to` as its Identifier.
    fn rename_for(&mut self, key: RecordKey, to: &str) -> Option<Rename> {
        let from = self.records.get(key)?.identifier.clone();
        if from == to {
            return None;
        }
        let temporary = self.temporary_name(to);
        Some(Rename {
            from,
            temporary,
            to: to.to_string(),
        })
    }

    /// `<name>_new`, then `<name>_new2`, `<name>_new3`, ... until unused.
    fn temporary_name(&mut self, name: &str) -> String {
        let mut candidate = format!("{name}_new");
        let mut n = 2;
        while self.taken_names.contains(&candidate) {
            candidate = format!("{name}_new{n}");
            n += 1;
        }
        self.taken_names.insert(candidate.clone());
        candidate
    }
}

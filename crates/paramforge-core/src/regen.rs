use crate::id::Guid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How one record changed since the last data emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Updated,
    Renamed { from: String },
}

/// Pending record changes, keyed by `(record type, GUID)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: BTreeMap<(String, Guid), ChangeKind>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change. Returns `false`, leaving the set untouched, if the
    /// key already carries a different kind of change.
    pub fn record(&mut self, record_type: &str, guid: Guid, kind: ChangeKind) -> bool {
        let key = (record_type.to_string(), guid);
        match self.changes.get(&key) {
            Some(existing) if *existing != kind => false,
            Some(_) => true,
            None => {
                self.changes.insert(key, kind);
                true
            }
        }
    }

    pub fn get(&self, record_type: &str, guid: &Guid) -> Option<&ChangeKind> {
        self.changes.get(&(record_type.to_string(), guid.clone()))
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Guid, &ChangeKind)> {
        self.changes
            .iter()
            .map(|((ty, guid), kind)| (ty.as_str(), guid, kind))
    }

    /// Record types touched by this set, sorted.
    pub fn record_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.changes.keys().map(|(ty, _)| ty.as_str()).collect();
        types.dedup();
        types
    }

    /// Union of two sets, or `None` if any key disagrees on its change kind.
    pub fn union(mut self, other: ChangeSet) -> Option<ChangeSet> {
        for ((ty, guid), kind) in other.changes {
            if !self.record(&ty, guid, kind) {
                return None;
            }
        }
        Some(self)
    }
}

/// What has to be regenerated before the binary data can be trusted again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegenState {
    #[default]
    UpToDate,
    NeedsIncremental(ChangeSet),
    NeedsFull,
}

impl RegenState {
    /// Wrap a change set; an empty one means nothing to do.
    pub fn incremental(changes: ChangeSet) -> Self {
        if changes.is_empty() {
            RegenState::UpToDate
        } else {
            RegenState::NeedsIncremental(changes)
        }
    }

    /// Combine two pending states.
    ///
    /// `UpToDate` is the identity and `NeedsFull` absorbs everything. Two
    /// incremental sets union, and any key on which they disagree escalates
    /// to `NeedsFull`.
    pub fn merge(self, other: RegenState) -> RegenState {
        match (self, other) {
            (RegenState::NeedsFull, _) | (_, RegenState::NeedsFull) => RegenState::NeedsFull,
            (RegenState::UpToDate, s) | (s, RegenState::UpToDate) => s,
            (RegenState::NeedsIncremental(a), RegenState::NeedsIncremental(b)) => {
                a.union(b).map_or(RegenState::NeedsFull, RegenState::incremental)
            }
        }
    }

    pub fn is_up_to_date(&self) -> bool {
        matches!(self, RegenState::UpToDate)
    }

    pub fn needs_full(&self) -> bool {
        matches!(self, RegenState::NeedsFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[(&str, &str, ChangeKind)]) -> ChangeSet {
        let mut s = ChangeSet::new();
        for (ty, guid, kind) in entries {
            assert!(s.record(ty, Guid::new(*guid), kind.clone()));
        }
        s
    }

    #[test]
    fn up_to_date_is_identity() {
        let inc = RegenState::incremental(set(&[("Item", "g1", ChangeKind::Updated)]));
        assert_eq!(RegenState::UpToDate.merge(inc.clone()), inc);
        assert_eq!(inc.clone().merge(RegenState::UpToDate), inc);
    }

    #[test]
    fn full_absorbs() {
        let inc = RegenState::incremental(set(&[("Item", "g1", ChangeKind::Created)]));
        assert!(inc.clone().merge(RegenState::NeedsFull).needs_full());
        assert!(RegenState::NeedsFull.merge(inc).needs_full());
    }

    #[test]
    fn disjoint_sets_union() {
        let a = RegenState::incremental(set(&[("Item", "g1", ChangeKind::Updated)]));
        let b = RegenState::incremental(set(&[("Monster", "g1", ChangeKind::Created)]));
        match a.merge(b) {
            RegenState::NeedsIncremental(s) => {
                assert_eq!(s.len(), 2);
                assert_eq!(s.record_types(), vec!["Item", "Monster"]);
            }
            other => panic!("expected incremental, got {other:?}"),
        }
    }

    #[test]
    fn same_change_twice_is_idempotent() {
        let a = RegenState::incremental(set(&[("Item", "g1", ChangeKind::Updated)]));
        assert_eq!(a.clone().merge(a.clone()), a);
    }

    #[test]
    fn conflicting_kinds_escalate() {
        let a = RegenState::incremental(set(&[("Item", "g1", ChangeKind::Updated)]));
        let b = RegenState::incremental(set(&[(
            "Item",
            "g1",
            ChangeKind::Renamed { from: "Coin".into() },
        )]));
        assert_eq!(a.merge(b), RegenState::NeedsFull);
    }

    #[test]
    fn empty_change_set_is_up_to_date() {
        assert!(RegenState::incremental(ChangeSet::new()).is_up_to_date());
    }
}

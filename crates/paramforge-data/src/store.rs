//! File-backed record store: one RON file per record at
//! `<root>/<directory>/<Identifier>.ron`, where `directory` starts with the
//! record type's name.

use crate::loader::{DataLoadError, deserialize_file, serialize_file};
use paramforge_core::executor::{RecordStore, StoreError};
use paramforge_core::id::Guid;
use paramforge_core::record::{RecordSet, StructuredRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const RECORD_EXTENSION: &str = "ron";

pub struct FsRecordStore {
    root: PathBuf,
    /// Last known file of each record, filled by `load_all`.
    locations: Mutex<HashMap<(String, Guid), PathBuf>>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn store_error(e: DataLoadError) -> StoreError {
    match e {
        DataLoadError::Parse { file, detail } | DataLoadError::Invalid { file, detail } => {
            StoreError::Malformed { path: file, detail }
        }
        DataLoadError::Io(source) => StoreError::Io {
            path: PathBuf::new(),
            source,
        },
        other => StoreError::Malformed {
            path: PathBuf::new(),
            detail: other.to_string(),
        },
    }
}

impl FsRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locations: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File that would hold `identifier`. The identifier must stay a single
    /// file name inside `directory`.
    fn file_for(&self, directory: &Path, identifier: &str) -> Result<PathBuf, StoreError> {
        let unsafe_name = identifier.is_empty()
            || identifier.contains(['/', '\\'])
            || identifier.contains("..")
            || identifier == ".";
        if unsafe_name {
            return Err(StoreError::UnsafeIdentifier {
                identifier: identifier.to_string(),
            });
        }
        Ok(self
            .root
            .join(directory)
            .join(format!("{identifier}.{RECORD_EXTENSION}")))
    }

    fn remember(&self, record_type: &str, guid: &Guid, path: PathBuf) {
        if let Ok(mut map) = self.locations.lock() {
            map.insert((record_type.to_string(), guid.clone()), path);
        }
    }

    fn forget(&self, record_type: &str, guid: &Guid) {
        if let Ok(mut map) = self.locations.lock() {
            map.remove(&(record_type.to_string(), guid.clone()));
        }
    }

    /// File currently holding the record, rescanning the type's directory
    /// when the cached location is stale.
    fn locate(&self, record_type: &str, guid: &Guid) -> Result<PathBuf, StoreError> {
        let cached = self
            .locations
            .lock()
            .ok()
            .and_then(|map| map.get(&(record_type.to_string(), guid.clone())).cloned());
        if let Some(path) = cached.filter(|p| p.is_file()) {
            return Ok(path);
        }
        self.load_all(record_type)?;
        self.locations
            .lock()
            .ok()
            .and_then(|map| map.get(&(record_type.to_string(), guid.clone())).cloned())
            .ok_or_else(|| StoreError::NotFound {
                record_type: record_type.to_string(),
                guid: guid.clone(),
            })
    }

    fn read_record(&self, path: &Path) -> Result<StructuredRecord, StoreError> {
        let mut record: StructuredRecord = deserialize_file(path).map_err(store_error)?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if record.identifier != stem {
            return Err(StoreError::Malformed {
                path: path.to_path_buf(),
                detail: format!(
                    "identifier '{}' does not match the file name",
                    record.identifier
                ),
            });
        }
        record.directory = path
            .parent()
            .and_then(|p| p.strip_prefix(&self.root).ok())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(record)
    }

    fn write_record(&self, path: &Path, record: &StructuredRecord) -> Result<(), StoreError> {
        serialize_file(path, record).map_err(|e| match e {
            DataLoadError::Io(source) => StoreError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => store_error(other),
        })
    }
}

/// Every record file under `dir`, depth first, sorted per directory.
fn record_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), StoreError> {
    if !dir.is_dir() {
        return Ok(());
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_error(dir))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            record_files(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION) {
            out.push(path);
        }
    }
    Ok(())
}

impl RecordStore for FsRecordStore {
    fn load_all(&self, record_type: &str) -> Result<RecordSet, StoreError> {
        let mut files = Vec::new();
        record_files(&self.root.join(record_type), &mut files)?;
        let mut set = RecordSet::new(record_type);
        for path in files {
            let record = self.read_record(&path)?;
            self.remember(record_type, &record.guid, path);
            set.insert(record);
        }
        tracing::debug!(record_type, records = set.len(), "records loaded");
        Ok(set)
    }

    fn create(&mut self, record_type: &str, record: &StructuredRecord) -> Result<(), StoreError> {
        let path = self.file_for(&record.directory, &record.identifier)?;
        if path.exists() {
            return Err(StoreError::NameTaken {
                record_type: record_type.to_string(),
                identifier: record.identifier.clone(),
            });
        }
        self.write_record(&path, record)?;
        self.remember(record_type, &record.guid, path);
        Ok(())
    }

    fn update(&mut self, record_type: &str, record: &StructuredRecord) -> Result<(), StoreError> {
        let path = self.locate(record_type, &record.guid)?;
        let current = self.read_record(&path)?;
        let updated = StructuredRecord {
            identifier: current.identifier,
            directory: current.directory,
            ..record.clone()
        };
        self.write_record(&path, &updated)
    }

    fn rename(&mut self, record_type: &str, guid: &Guid, identifier: &str) -> Result<(), StoreError> {
        let path = self.locate(record_type, guid)?;
        let mut record = self.read_record(&path)?;
        if record.identifier == identifier {
            return Ok(());
        }
        let target = self.file_for(&record.directory, identifier)?;
        if target.exists() {
            return Err(StoreError::NameTaken {
                record_type: record_type.to_string(),
                identifier: identifier.to_string(),
            });
        }
        record.identifier = identifier.to_string();
        self.write_record(&target, &record)?;
        std::fs::remove_file(&path).map_err(io_error(&path))?;
        self.remember(record_type, guid, target);
        Ok(())
    }

    fn delete(&mut self, record_type: &str, guid: &Guid) -> Result<(), StoreError> {
        let path = self.locate(record_type, guid)?;
        std::fs::remove_file(&path).map_err(io_error(&path))?;
        self.forget(record_type, guid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::tests::{cleanup, make_test_dir};
    use paramforge_core::test_utils::{fixture_catalog, int};
    use std::fs;

    fn seeded(suffix: &str) -> (PathBuf, FsRecordStore) {
        let dir = make_test_dir(suffix);
        let mut store = FsRecordStore::new(&dir);
        let catalog = fixture_catalog();
        for set in catalog.sets() {
            for (_, record) in set.iter() {
                store.create(set.record_type(), record).unwrap();
            }
        }
        (dir, store)
    }

    // -----------------------------------------------------------------------
    // Layout
    // -----------------------------------------------------------------------

    #[test]
    fn records_round_trip_through_files() {
        let (dir, store) = seeded("store_round_trip");
        assert!(dir.join("Item").join("Coin.ron").is_file());

        let catalog = fixture_catalog();
        let monsters = store.load_all("Monster").unwrap();
        let orc = monsters.get(monsters.by_identifier("Orc").unwrap()).unwrap();
        let original = catalog.set("Monster").unwrap();
        let expected = original.get(original.by_identifier("Orc").unwrap()).unwrap();
        assert_eq!(orc, expected);
        cleanup(&dir);
    }

    #[test]
    fn nested_directories_are_kept() {
        let dir = make_test_dir("store_nested");
        let mut store = FsRecordStore::new(&dir);
        let record = StructuredRecord::new(Guid::new("g1"), "Sword").in_directory("Item/weapons");
        store.create("Item", &record).unwrap();
        let set = store.load_all("Item").unwrap();
        let loaded = set.get(set.by_guid(&Guid::new("g1")).unwrap()).unwrap();
        assert_eq!(loaded.directory, PathBuf::from("Item/weapons"));
        cleanup(&dir);
    }

    #[test]
    fn file_name_must_match_identifier() {
        let (dir, store) = seeded("store_mismatch");
        fs::rename(dir.join("Item").join("Coin.ron"), dir.join("Item").join("Token.ron")).unwrap();
        assert!(matches!(store.load_all("Item"), Err(StoreError::Malformed { .. })));
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    #[test]
    fn rename_moves_the_file() {
        let (dir, mut store) = seeded("store_rename");
        store.load_all("Item").unwrap();
        store.rename("Item", &Guid::new("g-coin"), "Token").unwrap();
        assert!(!dir.join("Item").join("Coin.ron").exists());
        assert!(dir.join("Item").join("Token.ron").is_file());
        assert!(matches!(
            store.rename("Item", &Guid::new("g-coin"), "Gem"),
            Err(StoreError::NameTaken { .. })
        ));
        cleanup(&dir);
    }

    #[test]
    fn update_keeps_identifier_and_location() {
        let (dir, mut store) = seeded("store_update");
        let replacement = StructuredRecord::new(Guid::new("g-gem"), "ignored")
            .with_hash("h")
            .with_value("price", int(75));
        store.update("Item", &replacement).unwrap();
        let set = store.load_all("Item").unwrap();
        let gem = set.get(set.by_identifier("Gem").unwrap()).unwrap();
        assert_eq!(gem.values.get("price"), Some(&int(75)));
        assert_eq!(gem.content_hash.as_deref(), Some("h"));
        assert!(set.by_identifier("ignored").is_none());
        cleanup(&dir);
    }

    #[test]
    fn delete_and_missing_records() {
        let (dir, mut store) = seeded("store_delete");
        store.delete("Item", &Guid::new("g-gem")).unwrap();
        assert_eq!(store.load_all("Item").unwrap().len(), 1);
        assert!(matches!(
            store.delete("Item", &Guid::new("g-gem")),
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.load_all("Nothing").unwrap().is_empty());
        cleanup(&dir);
    }

    #[test]
    fn identifiers_cannot_leave_the_records_directory() {
        let (dir, mut store) = seeded("store_unsafe_names");
        for name in ["../Escaped", "nested/Name", "back\\slash", ".."] {
            let record = StructuredRecord::new(Guid::new("g-new"), name).in_directory("Item");
            assert!(matches!(
                store.create("Item", &record),
                Err(StoreError::UnsafeIdentifier { .. })
            ));
        }
        store.load_all("Item").unwrap();
        assert!(matches!(
            store.rename("Item", &Guid::new("g-coin"), "../../Coin"),
            Err(StoreError::UnsafeIdentifier { .. })
        ));
        assert!(!dir.join("Escaped.ron").exists());
        assert!(dir.join("Item").join("Coin.ron").is_file());
        cleanup(&dir);
    }
}

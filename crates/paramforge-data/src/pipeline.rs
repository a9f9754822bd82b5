//! Generation entry points: validate the schema, emit code, emit data, and
//! synchronize tabular files with the record store.

use crate::artifacts::{ArtifactError, ArtifactSet, GenerationManifest};
use crate::compiler::{ExternalProcessError, SchemaCompiler};
use crate::config::PipelineConfig;
use crate::loader::{DataLoadError, serialize_to_string};
use crate::schema::load_schema;
use crate::store::FsRecordStore;
use crate::tabular::{TabularError, TabularTable, export_rows};
use paramforge_core::blob::{BlobBuilder, WireError};
use paramforge_core::error::SchemaError;
use paramforge_core::executor::{
    ExecuteError, ExecutionReport, MemoryRecordStore, PlanExecutor, PlannedReferences, RecordStore,
    RowDecodeError, StoreError,
};
use paramforge_core::fingerprint::{self, CompatibilityError, Fingerprint};
use paramforge_core::id::RandomGuids;
use paramforge_core::reconcile::{CancelFlag, ReconciliationError, ReconciliationPlan, Reconciler};
use paramforge_core::record::{RecordCatalog, RecordSet};
use paramforge_core::regen::RegenState;
use paramforge_core::registry::SchemaRegistry;
use std::fmt;
use std::path::{Path, PathBuf};

pub const SCHEMA_FILE: &str = "schema.fbs";
pub const CODEGEN_PLAN_FILE: &str = "codegen_plan.ron";
pub const DATA_FILE: &str = "params.bin";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Load(#[from] DataLoadError),

    #[error("schema has {} error(s): {}", .0.len(), join(.0))]
    Schema(Vec<SchemaError>),

    #[error(transparent)]
    Tabular(#[from] TabularError),

    #[error("reconciliation failed with {} error(s): {}", .0.len(), join_tagged(.0))]
    Reconcile(Vec<(String, ReconciliationError)>),

    #[error("{} cell(s) failed to decode: {}", .0.len(), join_tagged(.0))]
    Decode(Vec<(String, RowDecodeError)>),

    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wire(#[from] WireError),

    /// The records as they would be after the sync do not bake; nothing was
    /// changed.
    #[error("sync rejected, store left untouched: {0}")]
    Rejected(#[source] WireError),

    #[error(transparent)]
    Process(#[from] ExternalProcessError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Compatibility(#[from] CompatibilityError),

    #[error("cancelled before {0}")]
    Cancelled(&'static str),
}

fn join<E: fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_tagged<E: fmt::Display>(errors: &[(String, E)]) -> String {
    errors
        .iter()
        .map(|(ty, e)| format!("{ty}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Resolve the declarations in `config.schema_dir`, reporting every
/// resolution error at once.
pub fn validate_schema(config: &PipelineConfig) -> Result<SchemaRegistry, PipelineError> {
    let builder = load_schema(&config.schema_dir)?;
    let registry = builder
        .build(config.resolve_options())
        .map_err(PipelineError::Schema)?;
    tracing::info!(
        types = registry.types().len(),
        enums = registry.enums().len(),
        fingerprint = %registry.fingerprint(),
        "schema resolved"
    );
    Ok(registry)
}

// ===========================================================================
// Reports
// ===========================================================================

/// Result of one code or data emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    pub fingerprint: Fingerprint,
    /// Committed files, relative to the output directory.
    pub artifacts: Vec<PathBuf>,
    /// Nothing was written because the artifacts were already current.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub tables: Vec<ExecutionReport>,
    /// Record types whose table did not exist and was written from the store.
    pub exported: Vec<String>,
    pub regen: RegenState,
    /// Data emitted because of this sync, if any.
    pub data: Option<Emission>,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.exported.is_empty()
            && self
                .tables
                .iter()
                .all(|t| t.updated + t.created + t.deleted + t.renamed == 0)
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for t in &self.tables {
            writeln!(
                f,
                "{}: {} updated, {} created, {} deleted, {} renamed",
                t.record_type, t.updated, t.created, t.deleted, t.renamed
            )?;
        }
        for ty in &self.exported {
            writeln!(f, "{ty}: table exported")?;
        }
        let regen = match &self.regen {
            RegenState::UpToDate => "up to date".to_string(),
            RegenState::NeedsIncremental(changes) => format!("{} record(s) changed", changes.len()),
            RegenState::NeedsFull => "full rebuild".to_string(),
        };
        write!(f, "data: {regen}")?;
        if let Some(data) = &self.data {
            write!(f, ", written for schema {}", data.fingerprint)?;
        }
        Ok(())
    }
}

// ===========================================================================
// Pipeline
// ===========================================================================

/// One table being synchronized.
struct TableSync {
    table: TabularTable,
    records: RecordSet,
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: SchemaRegistry,
    cancel: CancelFlag,
}

impl Pipeline {
    /// Resolve the schema named by `config`.
    pub fn load(config: PipelineConfig) -> Result<Self, PipelineError> {
        let registry = validate_schema(&config)?;
        Ok(Self {
            config,
            registry,
            cancel: CancelFlag::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Flag that stops a running sync before its next stage.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn check_cancelled(&self, before: &'static str) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            tracing::warn!(before, "pipeline cancelled");
            return Err(PipelineError::Cancelled(before));
        }
        Ok(())
    }

    pub fn manifest(&self) -> Result<GenerationManifest, PipelineError> {
        Ok(GenerationManifest::load(&self.config.output_dir)?)
    }

    /// Check that the generated code and data match the current schema.
    pub fn verify(&self) -> Result<(), PipelineError> {
        let manifest = self.manifest()?;
        fingerprint::verify(self.registry.fingerprint(), &manifest.checkpoints)?;
        Ok(())
    }

    /// Write the schema description and codegen plan, and run the schema
    /// compiler if one is configured. Nothing in the output directory
    /// changes unless every step succeeds.
    pub fn emit_code(&self) -> Result<Emission, PipelineError> {
        let output = &self.config.output_dir;
        let current = self.registry.fingerprint();
        let mut manifest = self.manifest()?;
        if manifest.checkpoints.code == Some(current) && manifest.code_artifacts_present(output) {
            tracing::info!(fingerprint = %current, "generated code is current");
            return Ok(Emission {
                fingerprint: current,
                artifacts: manifest.code_artifacts,
                skipped: true,
            });
        }

        let mut set = ArtifactSet::begin(output)?;
        let schema = set.write(SCHEMA_FILE, self.registry.render_idl(&self.config.namespace).as_bytes())?;
        let plan = self.registry.codegen_plan(&self.config.namespace);
        let plan_text = serialize_to_string(Path::new(CODEGEN_PLAN_FILE), &plan)?;
        set.write(CODEGEN_PLAN_FILE, plan_text.as_bytes())?;
        if let Some(compiler) = &self.config.schema_compiler {
            SchemaCompiler::from_config(compiler).compile(&schema, set.staging_dir())?;
        }
        let artifacts = set.commit()?;

        manifest.checkpoints.code = Some(current);
        manifest.code_artifacts = artifacts.clone();
        manifest.save(output)?;
        tracing::info!(fingerprint = %current, files = artifacts.len(), "code emitted");
        Ok(Emission {
            fingerprint: current,
            artifacts,
            skipped: false,
        })
    }

    fn load_catalog(&self, store: &FsRecordStore) -> Result<RecordCatalog, PipelineError> {
        let mut catalog = RecordCatalog::new();
        for ty in self.registry.record_types() {
            catalog.insert_set(store.load_all(&ty.name)?);
        }
        Ok(catalog)
    }

    /// Bake every record in the store into the binary data file.
    pub fn emit_data(&self) -> Result<Emission, PipelineError> {
        let store = FsRecordStore::new(&self.config.records_dir);
        let catalog = self.load_catalog(&store)?;
        let bytes = BlobBuilder::new(&self.registry).build(&catalog)?;

        let output = &self.config.output_dir;
        let mut set = ArtifactSet::begin(output)?;
        set.write(DATA_FILE, &bytes)?;
        let artifacts = set.commit()?;

        let current = self.registry.fingerprint();
        let mut manifest = self.manifest()?;
        manifest.checkpoints.data = Some(current);
        manifest.data_artifacts = artifacts.clone();
        manifest.save(output)?;
        tracing::info!(
            fingerprint = %current,
            records = catalog.record_count(),
            bytes = bytes.len(),
            "data emitted"
        );
        Ok(Emission {
            fingerprint: current,
            artifacts,
            skipped: false,
        })
    }

    /// Bring the record store in line with every record type's table, then
    /// rewrite the tables with their GUIDs and markers.
    ///
    /// Types without a table get one exported from the store instead. The
    /// binary data is re-emitted whenever records changed or the last data
    /// was built for another schema. Every check, including a trial bake of
    /// the resulting records, runs before the first file is written.
    pub fn sync_tables(&self) -> Result<SyncReport, PipelineError> {
        let mut store = FsRecordStore::new(&self.config.records_dir);
        let catalog = self.load_catalog(&store)?;

        let mut work = Vec::new();
        let mut missing = Vec::new();
        for set in catalog.sets() {
            let record_type = set.record_type();
            let path = self.config.table_path(record_type);
            if path.is_file() {
                let table = TabularTable::read(&path, &self.registry, record_type)?;
                work.push(TableSync {
                    table,
                    records: set.clone(),
                });
            } else {
                missing.push((path, set));
            }
        }

        self.check_cancelled("reconciliation")?;
        let plans = self.reconcile_all(&work)?;

        self.check_cancelled("execution")?;
        let mut refs = PlannedReferences::new();
        for set in catalog.sets() {
            for (_, record) in set.iter() {
                refs.insert(set.record_type(), &record.identifier, record.guid.clone());
            }
        }
        for (w, plan) in work.iter().zip(&plans) {
            refs.add_rows(plan, &w.table.rows);
        }
        let executor = PlanExecutor::new(&self.registry, &refs);
        let mut decode_errors = Vec::new();
        for (w, plan) in work.iter().zip(&plans) {
            match executor.check(plan, &w.table.rows) {
                Ok(()) => {}
                Err(ExecuteError::Decode(errors)) => decode_errors
                    .extend(errors.into_iter().map(|e| (plan.record_type.clone(), e))),
                Err(other) => return Err(other.into()),
            }
        }
        if !decode_errors.is_empty() {
            return Err(PipelineError::Decode(decode_errors));
        }
        if plans.iter().any(|p| !p.is_empty()) {
            self.trial_bake(&executor, &catalog, &work, &plans)?;
        }

        let mut exported = Vec::new();
        for (path, set) in missing {
            self.export_table(&path, set, &catalog, &mut store)?;
            exported.push(set.record_type().to_string());
        }

        let mut tables = Vec::new();
        let mut regen = RegenState::UpToDate;
        for (w, plan) in work.iter_mut().zip(&plans) {
            let report = executor.apply(plan, &w.table.rows, &w.records, &mut store)?;
            if !plan.is_empty() || !plan.backfilled.is_empty() {
                w.table.write_back(&plan.row_guids(&w.table.rows))?;
            }
            regen = regen.merge(report.regen.clone());
            tables.push(report);
        }
        if !exported.is_empty() {
            regen = regen.merge(RegenState::NeedsFull);
        }

        let current = self.registry.fingerprint();
        if let Err(e) = fingerprint::verify_data(current, self.manifest()?.checkpoints.data) {
            tracing::info!(reason = %e, "binary data is stale");
            regen = regen.merge(RegenState::NeedsFull);
        }
        let data = if regen.is_up_to_date() {
            None
        } else {
            Some(self.emit_data()?)
        };

        let report = SyncReport {
            tables,
            exported,
            regen,
            data,
        };
        tracing::info!(tables = report.tables.len(), noop = report.is_noop(), "tables synchronized");
        Ok(report)
    }

    /// Apply every plan to an in-memory copy of the store and bake the
    /// result, so that a sync which would leave the records unbakeable (a
    /// reference to a deleted record, say) fails before any change.
    fn trial_bake(
        &self,
        executor: &PlanExecutor<'_>,
        catalog: &RecordCatalog,
        work: &[TableSync],
        plans: &[ReconciliationPlan],
    ) -> Result<(), PipelineError> {
        let mut trial = MemoryRecordStore::from_catalog(catalog);
        for (w, plan) in work.iter().zip(plans) {
            executor.apply(plan, &w.table.rows, &w.records, &mut trial)?;
        }
        match BlobBuilder::new(&self.registry).build(&trial.into_catalog()) {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "sync rejected by trial bake");
                Err(PipelineError::Rejected(e))
            }
        }
    }

    /// Write `set` out as a new table and stamp each record with its row's
    /// marker, so the next sync sees the rows as unchanged.
    fn export_table(
        &self,
        path: &Path,
        set: &RecordSet,
        catalog: &RecordCatalog,
        store: &mut FsRecordStore,
    ) -> Result<(), PipelineError> {
        let record_type = set.record_type();
        let table = export_rows(path, &self.registry, set, catalog)?;
        table.write()?;
        for row in &table.rows {
            let Some(record) = row
                .guid
                .as_ref()
                .and_then(|g| set.by_guid(g))
                .and_then(|key| set.get(key))
            else {
                continue;
            };
            if record.content_hash.as_deref() != Some(row.content_hash.as_str()) {
                let mut stamped = record.clone();
                stamped.content_hash = Some(row.content_hash.clone());
                store.update(record_type, &stamped)?;
            }
        }
        tracing::info!(record_type, records = set.len(), "table exported");
        Ok(())
    }

    /// Reconcile every table. Record types are independent, so with the
    /// `parallel` feature they run on the rayon pool.
    fn reconcile_all(&self, work: &[TableSync]) -> Result<Vec<ReconciliationPlan>, PipelineError> {
        let cancel = &self.cancel;
        let reconcile_one = |w: &TableSync| {
            let mut guids = RandomGuids;
            Reconciler::new(&mut guids)
                .with_cancel_flag(cancel.clone())
                .reconcile(&w.records, &w.table.rows)
        };

        #[cfg(feature = "parallel")]
        let results: Vec<_> = {
            use rayon::prelude::*;
            work.par_iter().map(reconcile_one).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let results: Vec<_> = work.iter().map(reconcile_one).collect();

        let mut plans = Vec::new();
        let mut errors = Vec::new();
        for (w, result) in work.iter().zip(results) {
            let record_type = w.records.record_type();
            match result {
                Ok(plan) => plans.push(plan),
                Err(e) => {
                    tracing::warn!(record_type, errors = e.len(), "reconciliation failed");
                    errors.extend(e.into_iter().map(|e| (record_type.to_string(), e)));
                }
            }
        }
        if errors.is_empty() {
            Ok(plans)
        } else {
            Err(PipelineError::Reconcile(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::tests::{cleanup, make_test_dir};
    use paramforge_core::blob::BlobReader;
    use paramforge_core::id::Guid;
    use paramforge_core::test_utils::int;
    use std::fs;

    const SCHEMA: &str = r#"(
        enums: [(name: "Rarity", members: ["Common", "Rare"])],
        types: [
            (name: "Item", kind: record, properties: [
                (name: "price", type: "int"),
                (name: "rarity", type: "Rarity"),
            ]),
            (name: "Monster", kind: record, properties: [
                (name: "hp", type: "int"),
                (name: "drops", type: "List<Item>"),
            ]),
        ],
    )"#;

    fn project(suffix: &str, schema: &str) -> (PathBuf, PipelineConfig) {
        let dir = make_test_dir(suffix);
        fs::create_dir_all(dir.join("schema")).unwrap();
        fs::write(dir.join("schema").join("params.ron"), schema).unwrap();
        fs::create_dir_all(dir.join("tables")).unwrap();
        (dir.clone(), PipelineConfig::new(&dir))
    }

    fn write_table(config: &PipelineConfig, record_type: &str, text: &str) {
        fs::write(config.table_path(record_type), text).unwrap();
    }

    fn read_table(config: &PipelineConfig, record_type: &str) -> String {
        fs::read_to_string(config.table_path(record_type)).unwrap()
    }

    // -----------------------------------------------------------------------
    // Schema and code
    // -----------------------------------------------------------------------

    #[test]
    fn schema_errors_are_all_reported() {
        let (dir, config) = project(
            "pipeline_bad_schema",
            r#"(types: [(name: "Item", kind: record, properties: [
                (name: "weight", type: "double"),
                (name: "owner", type: "Nobody"),
            ])])"#,
        );
        match Pipeline::load(config) {
            Err(PipelineError::Schema(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected schema errors, got {:?}", other.map(|_| ())),
        }
        cleanup(&dir);
    }

    #[test]
    fn emit_code_is_idempotent() {
        let (dir, config) = project("pipeline_code", SCHEMA);
        let pipeline = Pipeline::load(config).unwrap();
        let first = pipeline.emit_code().unwrap();
        assert!(!first.skipped);
        let output = &pipeline.config().output_dir;
        let idl = fs::read_to_string(output.join(SCHEMA_FILE)).unwrap();
        assert!(idl.contains("table Item"));
        assert!(output.join(CODEGEN_PLAN_FILE).is_file());

        let second = pipeline.emit_code().unwrap();
        assert!(second.skipped);
        assert_eq!(second.artifacts, first.artifacts);

        fs::remove_file(output.join(SCHEMA_FILE)).unwrap();
        assert!(!pipeline.emit_code().unwrap().skipped);
        cleanup(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn failed_compiler_keeps_previous_artifacts() {
        use crate::config::SchemaCompilerConfig;

        let (dir, mut config) = project("pipeline_compiler_fail", SCHEMA);
        let pipeline = Pipeline::load(config.clone()).unwrap();
        pipeline.emit_code().unwrap();
        let output = config.output_dir.clone();
        fs::write(output.join(SCHEMA_FILE), "previous").unwrap();

        // Force a rebuild by invalidating the code checkpoint.
        let mut manifest = pipeline.manifest().unwrap();
        manifest.checkpoints.code = None;
        manifest.save(&output).unwrap();

        config.schema_compiler = Some(SchemaCompilerConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "exit 1".into(), "compiler".into()],
            timeout_secs: 10,
        });
        let pipeline = Pipeline::load(config).unwrap();
        assert!(matches!(
            pipeline.emit_code(),
            Err(PipelineError::Process(ExternalProcessError::Failed { .. }))
        ));
        assert_eq!(fs::read_to_string(output.join(SCHEMA_FILE)).unwrap(), "previous");
        assert_eq!(pipeline.manifest().unwrap().checkpoints.code, None);
        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    #[test]
    fn first_sync_creates_records_and_data() {
        let (dir, config) = project("pipeline_first_sync", SCHEMA);
        write_table(&config, "Item", "Identifier\tprice\trarity\nCoin\t10\tCommon\nGem\t50\tRare\n");
        write_table(&config, "Monster", "Identifier\thp\tdrops\nOrc\t30\tCoin|Gem\n");
        let pipeline = Pipeline::load(config.clone()).unwrap();

        let report = pipeline.sync_tables().unwrap();
        assert_eq!(report.tables.iter().map(|t| t.created).sum::<usize>(), 3);
        assert!(report.exported.is_empty());
        assert!(report.data.is_some());
        assert!(config.records_dir.join("Item").join("Coin.ron").is_file());
        assert!(config.records_dir.join("Monster").join("Orc.ron").is_file());

        let table = read_table(&config, "Item");
        assert!(table.starts_with("GUID\tIdentifier\tprice\trarity\tContentHash\n"));
        for line in table.lines().skip(1) {
            assert!(!line.starts_with('\t'), "row without GUID: {line:?}");
        }

        let bytes = fs::read(config.output_dir.join(DATA_FILE)).unwrap();
        let reader = BlobReader::open(&bytes, pipeline.registry()).unwrap();
        let items = reader.table("Item").unwrap();
        let gem = items.find("Gem").unwrap().unwrap();
        assert_eq!(items.get(gem, "price").unwrap(), int(50));
        assert!(pipeline.manifest().unwrap().checkpoints.data.is_some());
        cleanup(&dir);
    }

    #[test]
    fn second_sync_is_a_noop() {
        let (dir, config) = project("pipeline_noop", SCHEMA);
        write_table(&config, "Item", "Identifier\tprice\trarity\nCoin\t10\tCommon\n");
        write_table(&config, "Monster", "Identifier\thp\tdrops\n");
        let pipeline = Pipeline::load(config.clone()).unwrap();
        pipeline.sync_tables().unwrap();
        let before = read_table(&config, "Item");

        let report = pipeline.sync_tables().unwrap();
        assert!(report.is_noop());
        assert!(report.regen.is_up_to_date());
        assert!(report.data.is_none());
        assert_eq!(read_table(&config, "Item"), before);
        cleanup(&dir);
    }

    #[test]
    fn edits_renames_and_deletes_flow_to_the_store() {
        let (dir, config) = project("pipeline_edits", SCHEMA);
        write_table(&config, "Item", "Identifier\tprice\trarity\nCoin\t10\tCommon\nGem\t50\tRare\n");
        write_table(&config, "Monster", "Identifier\thp\tdrops\n");
        let pipeline = Pipeline::load(config.clone()).unwrap();
        pipeline.sync_tables().unwrap();

        // Rename Coin to Token (keeping its GUID), reprice it, and drop Gem.
        let table = read_table(&config, "Item");
        let coin_line = table.lines().find(|l| l.contains("\tCoin\t")).unwrap();
        let coin_guid = coin_line.split('\t').next().unwrap().to_string();
        write_table(
            &config,
            "Item",
            &format!("GUID\tIdentifier\tprice\trarity\n{coin_guid}\tToken\t12\tCommon\n"),
        );

        let report = pipeline.sync_tables().unwrap();
        let items = report.tables.iter().find(|t| t.record_type == "Item").unwrap();
        assert_eq!((items.updated, items.renamed, items.deleted), (1, 1, 1));
        assert!(report.regen.needs_full());

        let item_dir = config.records_dir.join("Item");
        assert!(item_dir.join("Token.ron").is_file());
        assert!(!item_dir.join("Coin.ron").exists());
        assert!(!item_dir.join("Gem.ron").exists());

        let store = FsRecordStore::new(&config.records_dir);
        let set = store.load_all("Item").unwrap();
        let token = set.get(set.by_guid(&Guid::new(coin_guid)).unwrap()).unwrap();
        assert_eq!(token.identifier, "Token");
        assert_eq!(token.values.get("price"), Some(&int(12)));
        cleanup(&dir);
    }

    #[test]
    fn missing_tables_are_exported_from_the_store() {
        let (dir, config) = project("pipeline_export", SCHEMA);
        write_table(&config, "Item", "Identifier\tprice\trarity\nCoin\t10\tCommon\n");
        let pipeline = Pipeline::load(config.clone()).unwrap();
        let report = pipeline.sync_tables().unwrap();
        assert_eq!(report.exported, vec!["Monster".to_string()]);
        assert_eq!(
            read_table(&config, "Monster"),
            "GUID\tIdentifier\thp\tdrops\tContentHash\n"
        );
        cleanup(&dir);
    }

    #[test]
    fn bad_cells_abort_before_any_write() {
        let (dir, config) = project("pipeline_bad_cells", SCHEMA);
        write_table(&config, "Item", "Identifier\tprice\trarity\nCoin\tten\tCommon\n");
        write_table(&config, "Monster", "Identifier\thp\tdrops\nOrc\t30\tDragon\n");
        let pipeline = Pipeline::load(config.clone()).unwrap();
        match pipeline.sync_tables() {
            Err(PipelineError::Decode(errors)) => {
                let types: Vec<&str> = errors.iter().map(|(t, _)| t.as_str()).collect();
                assert_eq!(types, vec!["Item", "Monster"]);
            }
            other => panic!("expected decode errors, got {other:?}"),
        }
        assert!(!config.records_dir.join("Item").exists());
        assert!(!read_table(&config, "Item").starts_with("GUID"));
        cleanup(&dir);
    }

    #[test]
    fn deleting_a_referenced_record_leaves_the_store_untouched() {
        let (dir, config) = project("pipeline_dangling", SCHEMA);
        write_table(&config, "Item", "Identifier\tprice\trarity\nCoin\t10\tCommon\nGem\t50\tRare\n");
        write_table(&config, "Monster", "Identifier\thp\tdrops\nOrc\t30\tCoin|Gem\n");
        let pipeline = Pipeline::load(config.clone()).unwrap();
        pipeline.sync_tables().unwrap();

        // Orc still drops Gem, but Gem's row is gone and Coin is repriced.
        let synced = read_table(&config, "Item");
        let coin_guid = synced
            .lines()
            .find(|l| l.contains("\tCoin\t"))
            .and_then(|l| l.split('\t').next())
            .unwrap()
            .to_string();
        let edited = format!("GUID\tIdentifier\tprice\trarity\n{coin_guid}\tCoin\t99\tCommon\n");
        write_table(&config, "Item", &edited);
        let data_before = fs::read(config.output_dir.join(DATA_FILE)).unwrap();

        match pipeline.sync_tables() {
            Err(PipelineError::Rejected(WireError::DanglingReference { .. })) => {}
            other => panic!("expected a dangling reference, got {other:?}"),
        }
        let item_dir = config.records_dir.join("Item");
        assert!(item_dir.join("Gem.ron").is_file());
        let store = FsRecordStore::new(&config.records_dir);
        let items = store.load_all("Item").unwrap();
        let coin = items.get(items.by_identifier("Coin").unwrap()).unwrap();
        assert_eq!(coin.values.get("price"), Some(&int(10)));
        assert_eq!(read_table(&config, "Item"), edited);
        assert_eq!(fs::read(config.output_dir.join(DATA_FILE)).unwrap(), data_before);
        cleanup(&dir);
    }

    #[test]
    fn exported_tables_sync_without_changes() {
        let (dir, config) = project("pipeline_export_resync", SCHEMA);
        write_table(&config, "Item", "Identifier\tprice\trarity\nCoin\t10\tCommon\n");
        write_table(&config, "Monster", "Identifier\thp\tdrops\nOrc\t30\tCoin\n");
        let pipeline = Pipeline::load(config.clone()).unwrap();
        pipeline.sync_tables().unwrap();

        fs::remove_file(config.table_path("Monster")).unwrap();
        let report = pipeline.sync_tables().unwrap();
        assert_eq!(report.exported, vec!["Monster".to_string()]);

        let report = pipeline.sync_tables().unwrap();
        let monsters = report.tables.iter().find(|t| t.record_type == "Monster").unwrap();
        assert_eq!(monsters.updated, 0);
        assert!(report.is_noop());
        assert!(report.data.is_none());
        cleanup(&dir);
    }

    #[test]
    fn duplicate_identifiers_fail_reconciliation() {
        let (dir, config) = project("pipeline_dupes", SCHEMA);
        write_table(&config, "Item", "Identifier\tprice\trarity\nCoin\t1\tCommon\nCoin\t2\tCommon\n");
        write_table(&config, "Monster", "Identifier\thp\tdrops\n");
        let pipeline = Pipeline::load(config).unwrap();
        let err = pipeline.sync_tables().unwrap_err();
        assert!(matches!(err, PipelineError::Reconcile(ref e) if e.len() == 1));
        assert!(err.to_string().contains("Item"));
        cleanup(&dir);
    }

    #[test]
    fn cancelled_sync_stops_before_reconciling() {
        let (dir, config) = project("pipeline_cancel", SCHEMA);
        write_table(&config, "Item", "Identifier\tprice\trarity\nCoin\t10\tCommon\n");
        let pipeline = Pipeline::load(config.clone()).unwrap();
        pipeline.cancel_flag().cancel();
        assert!(matches!(
            pipeline.sync_tables(),
            Err(PipelineError::Cancelled("reconciliation"))
        ));
        assert!(!config.records_dir.join("Item").exists());
        assert!(!config.table_path("Monster").exists());
        cleanup(&dir);
    }

    #[test]
    fn verify_tracks_both_checkpoints() {
        let (dir, config) = project("pipeline_verify", SCHEMA);
        write_table(&config, "Item", "Identifier\tprice\trarity\n");
        write_table(&config, "Monster", "Identifier\thp\tdrops\n");
        let pipeline = Pipeline::load(config).unwrap();
        assert!(matches!(
            pipeline.verify(),
            Err(PipelineError::Compatibility(CompatibilityError::Missing { artifact: "code" }))
        ));
        pipeline.emit_code().unwrap();
        pipeline.sync_tables().unwrap();
        pipeline.verify().unwrap();
        cleanup(&dir);
    }

    #[test]
    fn report_renders_counts() {
        let report = SyncReport {
            tables: vec![ExecutionReport {
                record_type: "Item".into(),
                updated: 1,
                created: 2,
                deleted: 0,
                renamed: 0,
                regen: RegenState::UpToDate,
            }],
            exported: vec!["Monster".into()],
            regen: RegenState::NeedsFull,
            data: None,
        };
        assert_eq!(
            report.to_string(),
            "Item: 1 updated, 2 created, 0 deleted, 0 renamed\nMonster: table exported\ndata: full rebuild"
        );
    }
}

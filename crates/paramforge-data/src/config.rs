//! Pipeline configuration, read from `paramforge.{ron,toml,json}`.

use crate::loader::{DataLoadError, deserialize_file, require_data_file};
use paramforge_core::resolver::ResolveOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base name of the config file.
pub const CONFIG_BASE_NAME: &str = "paramforge";

/// How to invoke the external schema compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCompilerConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl SchemaCompilerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Declaration files.
    pub schema_dir: PathBuf,
    /// One `<RecordType>.tsv` per record type.
    #[serde(default = "default_tables_dir")]
    pub tables_dir: PathBuf,
    /// Root of the structured record store.
    #[serde(default = "default_records_dir")]
    pub records_dir: PathBuf,
    /// Generated schema, codegen plan, binary data, and manifest.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_identifier_property")]
    pub identifier_property: String,
    #[serde(default)]
    pub asset_linking: bool,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub schema_compiler: Option<SchemaCompilerConfig>,
}

fn default_tables_dir() -> PathBuf {
    PathBuf::from("tables")
}

fn default_records_dir() -> PathBuf {
    PathBuf::from("records")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("generated")
}

fn default_identifier_property() -> String {
    "Identifier".to_string()
}

fn default_namespace() -> String {
    "Params".to_string()
}

impl PipelineConfig {
    /// Config with every optional field defaulted, rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            schema_dir: root.join("schema"),
            tables_dir: root.join(default_tables_dir()),
            records_dir: root.join(default_records_dir()),
            output_dir: root.join(default_output_dir()),
            identifier_property: default_identifier_property(),
            asset_linking: false,
            namespace: default_namespace(),
            schema_compiler: None,
        }
    }

    /// Read the config file in `dir`. Relative paths in it are taken
    /// relative to `dir`.
    pub fn load(dir: &Path) -> Result<Self, DataLoadError> {
        let path = require_data_file(dir, CONFIG_BASE_NAME)?;
        let mut config: PipelineConfig = deserialize_file(&path)?;
        config.rebase(dir);
        if config.identifier_property.trim().is_empty() {
            return Err(DataLoadError::Invalid {
                file: path,
                detail: "identifier_property is blank".to_string(),
            });
        }
        tracing::debug!(config = %path.display(), "pipeline config loaded");
        Ok(config)
    }

    fn rebase(&mut self, dir: &Path) {
        for p in [
            &mut self.schema_dir,
            &mut self.tables_dir,
            &mut self.records_dir,
            &mut self.output_dir,
        ] {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        }
        if let Some(compiler) = &mut self.schema_compiler
            && compiler.program.components().count() > 1
            && compiler.program.is_relative()
        {
            compiler.program = dir.join(&compiler.program);
        }
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            identifier_property: self.identifier_property.clone(),
            asset_linking: self.asset_linking,
        }
    }

    /// Path of the tabular file for `record_type`.
    pub fn table_path(&self, record_type: &str) -> PathBuf {
        self.tables_dir.join(format!("{record_type}.tsv"))
    }
}

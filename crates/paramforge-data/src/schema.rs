//! Serde structs for schema declaration files.
//!
//! A schema directory holds any number of RON/TOML/JSON files, each with
//! optional `enums` and `types` lists. Files are read in file-name order and
//! their declarations registered in that order, which fixes the declaration
//! order the fingerprint depends on.

use crate::loader::{DataLoadError, deserialize_file, list_data_files};
use paramforge_core::decl::{EnumDeclaration, PropertyDeclaration, TypeDeclaration, TypeKind};
use paramforge_core::registry::SchemaRegistryBuilder;
use paramforge_core::value::ScalarKind;
use serde::Deserialize;
use std::path::Path;

// ===========================================================================
// File structs
// ===========================================================================

/// One declaration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaFile {
    #[serde(default)]
    pub enums: Vec<EnumData>,
    #[serde(default)]
    pub types: Vec<TypeData>,
}

/// A type declaration in a data file.
#[derive(Debug, Clone, Deserialize)]
pub struct TypeData {
    pub name: String,
    pub kind: TypeKind,
    #[serde(default)]
    pub extends: Vec<String>,
    #[serde(default)]
    pub properties: Vec<PropertyData>,
}

/// A property on a declared type. `type` may be a plain tag with `list`, or
/// a `List<T>` / `T[]` signature.
#[derive(Debug, Clone, Deserialize)]
pub struct PropertyData {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub list: bool,
}

/// An enum member, in short form (`"Common"`) or with an explicit value.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnumMemberData {
    Name(String),
    Full { name: String, value: i64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnumData {
    pub name: String,
    /// Integer type tag; `int` when absent.
    #[serde(default)]
    pub repr: Option<String>,
    pub members: Vec<EnumMemberData>,
}

// ===========================================================================
// Conversion
// ===========================================================================

impl PropertyData {
    pub fn to_declaration(&self) -> PropertyDeclaration {
        if self.list {
            PropertyDeclaration::list(&self.name, self.type_tag.trim())
        } else {
            PropertyDeclaration::from_signature(&self.name, &self.type_tag)
        }
    }
}

impl TypeData {
    pub fn to_declaration(&self) -> TypeDeclaration {
        let mut decl = TypeDeclaration::new(&self.name, self.kind);
        for parent in &self.extends {
            decl = decl.extends(parent);
        }
        for prop in &self.properties {
            decl = decl.property(prop.to_declaration());
        }
        decl
    }
}

impl EnumData {
    /// `None` when `repr` names something other than a scalar type. Whether
    /// the scalar is an integer is checked by the registry.
    pub fn to_declaration(&self) -> Option<EnumDeclaration> {
        let mut decl = EnumDeclaration::new(&self.name);
        if let Some(tag) = &self.repr {
            decl = decl.repr(ScalarKind::from_tag(tag.trim())?);
        }
        for member in &self.members {
            decl = match member {
                EnumMemberData::Name(name) => decl.member(name),
                EnumMemberData::Full { name, value } => decl.member_with_value(name, *value),
            };
        }
        Some(decl)
    }
}

// ===========================================================================
// Loading
// ===========================================================================

/// Register every declaration found in `schema_dir`.
///
/// Files are processed in name order; within a file, enums are registered
/// before types. Resolution errors surface later, from `build`.
pub fn load_schema(schema_dir: &Path) -> Result<SchemaRegistryBuilder, DataLoadError> {
    let mut builder = SchemaRegistryBuilder::new();
    let files = list_data_files(schema_dir)?;
    for path in &files {
        let file: SchemaFile = deserialize_file(path)?;
        for data in &file.enums {
            let decl = data.to_declaration().ok_or_else(|| DataLoadError::Invalid {
                file: path.clone(),
                detail: format!(
                    "enum '{}' has repr '{}', which is not a builtin scalar",
                    data.name,
                    data.repr.as_deref().unwrap_or_default()
                ),
            })?;
            builder.register_enum(decl);
        }
        for data in &file.types {
            builder.register_type(data.to_declaration());
        }
    }
    tracing::debug!(dir = %schema_dir.display(), files = files.len(), "declarations loaded");
    Ok(builder)
}

//! Declared schema: record types, embeddable sub-structures, interfaces,
//! enums, and their property declarations.
//!
//! Declarations are plain data, built once (usually by the loader from data
//! files) and never mutated after the registry is built.

use crate::value::ScalarKind;
use serde::{Deserialize, Serialize};

/// What a declared type is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    /// Top-level record type: instances carry a GUID and an Identifier.
    Record,
    /// Embeddable sub-structure, stored inline in its owner.
    Struct,
    /// Abstract property bundle that other types extend.
    Interface,
}

impl TypeKind {
    pub fn tag(self) -> &'static str {
        match self {
            TypeKind::Record => "record",
            TypeKind::Struct => "struct",
            TypeKind::Interface => "interface",
        }
    }
}

/// A named, typed member on a declared type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyDeclaration {
    pub name: String,
    /// Builtin type name or the name of a declared type/enum.
    pub type_tag: String,
    pub list: bool,
}

impl PropertyDeclaration {
    pub fn new(name: &str, type_tag: &str) -> Self {
        Self {
            name: name.to_string(),
            type_tag: type_tag.to_string(),
            list: false,
        }
    }

    pub fn list(name: &str, type_tag: &str) -> Self {
        Self {
            name: name.to_string(),
            type_tag: type_tag.to_string(),
            list: true,
        }
    }

    /// Build a declaration from a host-style signature: `T`, `List<T>`, or `T[]`.
    pub fn from_signature(name: &str, signature: &str) -> Self {
        let signature = signature.trim();
        if let Some(inner) = signature
            .strip_prefix("List<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            return Self::list(name, inner.trim());
        }
        if let Some(inner) = signature.strip_suffix("[]") {
            return Self::list(name, inner.trim());
        }
        Self::new(name, signature)
    }

    /// The signature as written back in diagnostics, e.g. `List<int>`.
    pub fn signature(&self) -> String {
        if self.list {
            format!("List<{}>", self.type_tag)
        } else {
            self.type_tag.clone()
        }
    }
}

/// A declared record type, sub-structure, or interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDeclaration {
    pub name: String,
    pub kind: TypeKind,
    pub extends: Vec<String>,
    pub properties: Vec<PropertyDeclaration>,
}

impl TypeDeclaration {
    pub fn new(name: &str, kind: TypeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            extends: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn record(name: &str) -> Self {
        Self::new(name, TypeKind::Record)
    }

    pub fn structure(name: &str) -> Self {
        Self::new(name, TypeKind::Struct)
    }

    pub fn interface(name: &str) -> Self {
        Self::new(name, TypeKind::Interface)
    }

    pub fn extends(mut self, parent: &str) -> Self {
        self.extends.push(parent.to_string());
        self
    }

    pub fn property(mut self, decl: PropertyDeclaration) -> Self {
        self.properties.push(decl);
        self
    }
}

/// One member of a declared enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumMember {
    pub name: String,
    pub value: i64,
}

/// A declared enumeration with an integer wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDeclaration {
    pub name: String,
    pub repr: ScalarKind,
    pub members: Vec<EnumMember>,
}

impl EnumDeclaration {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            repr: ScalarKind::I32,
            members: Vec::new(),
        }
    }

    pub fn repr(mut self, repr: ScalarKind) -> Self {
        self.repr = repr;
        self
    }

    /// Append a member numbered one past the previous member (0 for the first).
    pub fn member(self, name: &str) -> Self {
        let value = self.members.last().map(|m| m.value + 1).unwrap_or(0);
        self.member_with_value(name, value)
    }

    pub fn member_with_value(mut self, name: &str, value: i64) -> Self {
        self.members.push(EnumMember {
            name: name.to_string(),
            value,
        });
        self
    }

    pub fn value_of(&self, member: &str) -> Option<i64> {
        self.members.iter().find(|m| m.name == member).map(|m| m.value)
    }

    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.value == value)
            .map(|m| m.name.as_str())
    }
}

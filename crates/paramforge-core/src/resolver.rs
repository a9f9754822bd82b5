//! Type Descriptor Resolver: classifies each declared property into exactly
//! one [`PropertyType`] variant.
//!
//! Classification is first-match over [`RULES`], in order. Later rules assume
//! the earlier ones did not match, so the order is part of the contract: a
//! declared enum named `Color` is an enum, not the builtin color shape.
//!
//! This module also owns the two graph walks that must succeed before any
//! code is generated: the `extends` closure (with inheritance-cycle
//! detection) and the acyclicity check over embeddable sub-structures.

use crate::decl::{EnumDeclaration, PropertyDeclaration, TypeDeclaration, TypeKind};
use crate::error::SchemaError;
use crate::property::{PropertyType, ValueType};
use crate::value::{CompositeShape, ScalarKind, TimeKind};
use std::collections::{BTreeMap, HashMap, HashSet};

// ===========================================================================
// Options and declaration lookup
// ===========================================================================

/// Knobs that change how declarations resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Name of the property that holds a record's human key.
    pub identifier_property: String,
    /// Whether `AssetRef` properties are allowed.
    pub asset_linking: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            identifier_property: "Identifier".to_string(),
            asset_linking: false,
        }
    }
}

/// All declared types and enums, in registration order, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    types: Vec<TypeDeclaration>,
    type_index: HashMap<String, usize>,
    enums: Vec<EnumDeclaration>,
    enum_index: HashMap<String, usize>,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a type. Returns `false` if the name is already taken.
    pub fn add_type(&mut self, decl: TypeDeclaration) -> bool {
        if self.is_declared(&decl.name) {
            return false;
        }
        self.type_index.insert(decl.name.clone(), self.types.len());
        self.types.push(decl);
        true
    }

    /// Add an enum. Returns `false` if the name is already taken.
    pub fn add_enum(&mut self, decl: EnumDeclaration) -> bool {
        if self.is_declared(&decl.name) {
            return false;
        }
        self.enum_index.insert(decl.name.clone(), self.enums.len());
        self.enums.push(decl);
        true
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.type_index.contains_key(name) || self.enum_index.contains_key(name)
    }

    pub fn type_decl(&self, name: &str) -> Option<&TypeDeclaration> {
        self.type_index.get(name).map(|&i| &self.types[i])
    }

    pub fn enum_decl(&self, name: &str) -> Option<&EnumDeclaration> {
        self.enum_index.get(name).map(|&i| &self.enums[i])
    }

    pub fn types(&self) -> &[TypeDeclaration] {
        &self.types
    }

    pub fn enums(&self) -> &[EnumDeclaration] {
        &self.enums
    }
}

// ===========================================================================
// Classification rules
// ===========================================================================

/// Everything a rule may look at besides the declaration itself.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub decls: &'a Declarations,
    pub owner: &'a TypeDeclaration,
    pub options: &'a ResolveOptions,
}

type Rule = fn(&ResolveContext<'_>, &PropertyDeclaration) -> Option<PropertyType>;

/// Classification rules in precedence order.
pub const RULES: [(&str, Rule); 9] = [
    ("identifier", identifier_rule),
    ("string", string_rule),
    ("localized-text", localized_text_rule),
    ("enum", enum_rule),
    ("scalar", scalar_rule),
    ("time", time_rule),
    ("nested-reference", nested_reference_rule),
    ("multi-component", composite_rule),
    ("asset", asset_rule),
];

/// Classify one property declaration. Fails with `UnsupportedType` naming the
/// declared type when no rule matches.
pub fn resolve(
    ctx: &ResolveContext<'_>,
    decl: &PropertyDeclaration,
) -> Result<PropertyType, SchemaError> {
    RULES
        .iter()
        .find_map(|(_, rule)| rule(ctx, decl))
        .ok_or_else(|| SchemaError::UnsupportedType {
            owner: ctx.owner.name.clone(),
            property: decl.name.clone(),
            type_name: decl.signature(),
        })
}

/// Name of the rule that classifies `decl`, for diagnostics.
pub fn matching_rule(ctx: &ResolveContext<'_>, decl: &PropertyDeclaration) -> Option<&'static str> {
    RULES
        .iter()
        .find(|(_, rule)| rule(ctx, decl).is_some())
        .map(|(name, _)| *name)
}

fn with_cardinality(decl: &PropertyDeclaration, vt: ValueType) -> PropertyType {
    if decl.list {
        PropertyType::list(&decl.name, vt)
    } else {
        PropertyType::single(&decl.name, vt)
    }
}

fn identifier_rule(ctx: &ResolveContext<'_>, decl: &PropertyDeclaration) -> Option<PropertyType> {
    let is_identifier = ctx.owner.kind == TypeKind::Record
        && decl.name == ctx.options.identifier_property
        && decl.type_tag == "string"
        && !decl.list;
    is_identifier.then(|| PropertyType::identifier(&decl.name))
}

fn string_rule(_: &ResolveContext<'_>, decl: &PropertyDeclaration) -> Option<PropertyType> {
    (decl.type_tag == "string").then(|| with_cardinality(decl, ValueType::String))
}

fn localized_text_rule(_: &ResolveContext<'_>, decl: &PropertyDeclaration) -> Option<PropertyType> {
    (decl.type_tag == "LocalizedText").then(|| with_cardinality(decl, ValueType::LocalizedText))
}

fn enum_rule(ctx: &ResolveContext<'_>, decl: &PropertyDeclaration) -> Option<PropertyType> {
    ctx.decls
        .enum_decl(&decl.type_tag)
        .map(|e| with_cardinality(decl, ValueType::Enum(e.name.clone())))
}

fn scalar_rule(_: &ResolveContext<'_>, decl: &PropertyDeclaration) -> Option<PropertyType> {
    ScalarKind::from_tag(&decl.type_tag).map(|k| with_cardinality(decl, ValueType::Scalar(k)))
}

fn time_rule(_: &ResolveContext<'_>, decl: &PropertyDeclaration) -> Option<PropertyType> {
    TimeKind::from_tag(&decl.type_tag).map(|k| with_cardinality(decl, ValueType::Time(k)))
}

fn nested_reference_rule(
    ctx: &ResolveContext<'_>,
    decl: &PropertyDeclaration,
) -> Option<PropertyType> {
    let target = ctx.decls.type_decl(&decl.type_tag)?;
    let vt = match target.kind {
        TypeKind::Record => ValueType::RecordRef(target.name.clone()),
        TypeKind::Struct => ValueType::Embedded(target.name.clone()),
        TypeKind::Interface => return None,
    };
    Some(with_cardinality(decl, vt))
}

fn composite_rule(_: &ResolveContext<'_>, decl: &PropertyDeclaration) -> Option<PropertyType> {
    CompositeShape::from_tag(&decl.type_tag).map(|s| with_cardinality(decl, ValueType::Composite(s)))
}

fn asset_rule(ctx: &ResolveContext<'_>, decl: &PropertyDeclaration) -> Option<PropertyType> {
    (ctx.options.asset_linking && decl.type_tag == "AssetRef")
        .then(|| with_cardinality(decl, ValueType::Asset))
}

// ===========================================================================
// Inheritance closure
// ===========================================================================

/// Properties of `ty` including everything inherited through `extends`.
///
/// Ancestors come first (depth-first, in `extends` order, each visited once),
/// then the type's own properties. Record types without an explicit
/// identifier property get one prepended.
pub fn effective_properties(
    decls: &Declarations,
    ty: &TypeDeclaration,
    options: &ResolveOptions,
) -> Result<Vec<PropertyDeclaration>, SchemaError> {
    let mut out = Vec::new();
    let mut path = vec![ty.name.clone()];
    let mut visited = HashSet::new();
    for parent in &ty.extends {
        collect_inherited(decls, &ty.name, parent, &mut path, &mut visited, &mut out)?;
    }
    out.extend(ty.properties.iter().cloned());

    if ty.kind == TypeKind::Record {
        match out.iter().find(|p| p.name == options.identifier_property) {
            None => out.insert(0, PropertyDeclaration::new(&options.identifier_property, "string")),
            Some(p) if p.type_tag != "string" || p.list => {
                return Err(SchemaError::InvalidIdentifier {
                    owner: ty.name.clone(),
                    property: p.name.clone(),
                    type_name: p.signature(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(out)
}

fn collect_inherited(
    decls: &Declarations,
    owner: &str,
    name: &str,
    path: &mut Vec<String>,
    visited: &mut HashSet<String>,
    out: &mut Vec<PropertyDeclaration>,
) -> Result<(), SchemaError> {
    if let Some(pos) = path.iter().position(|n| n == name) {
        let mut cycle = path[pos..].to_vec();
        cycle.push(name.to_string());
        return Err(SchemaError::CircularInheritance(cycle));
    }
    if !visited.insert(name.to_string()) {
        return Ok(());
    }
    let parent = decls
        .type_decl(name)
        .ok_or_else(|| SchemaError::UnknownType {
            owner: owner.to_string(),
            name: name.to_string(),
        })?;

    path.push(name.to_string());
    for grandparent in &parent.extends {
        collect_inherited(decls, name, grandparent, path, visited, out)?;
    }
    path.pop();

    out.extend(parent.properties.iter().cloned());
    Ok(())
}

// ===========================================================================
// Acyclicity of embeddable sub-structures
// ===========================================================================

/// Reject embeddable sub-structures that contain themselves.
///
/// An edge `A -> B` exists when struct `A` (including everything it inherits)
/// has a non-list property of struct type `B`. List properties are skipped:
/// the indirection collection breaks the containment chain.
pub fn check_embedding_acyclic(
    decls: &Declarations,
    options: &ResolveOptions,
) -> Result<(), SchemaError> {
    let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for ty in decls.types().iter().filter(|t| t.kind == TypeKind::Struct) {
        let edges = effective_properties(decls, ty, options)?
            .into_iter()
            .filter(|p| !p.list)
            .filter(|p| {
                decls
                    .type_decl(&p.type_tag)
                    .is_some_and(|t| t.kind == TypeKind::Struct)
                    && decls.enum_decl(&p.type_tag).is_none()
            })
            .map(|p| p.type_tag)
            .collect();
        graph.insert(ty.name.clone(), edges);
    }

    let mut done = HashSet::new();
    for start in graph.keys() {
        let mut path = Vec::new();
        visit_struct(start, &graph, &mut path, &mut done)?;
    }
    Ok(())
}

fn visit_struct(
    node: &str,
    graph: &BTreeMap<String, Vec<String>>,
    path: &mut Vec<String>,
    done: &mut HashSet<String>,
) -> Result<(), SchemaError> {
    if let Some(pos) = path.iter().position(|n| n == node) {
        let mut cycle = path[pos..].to_vec();
        cycle.push(node.to_string());
        return Err(SchemaError::CircularReference(cycle));
    }
    if done.contains(node) {
        return Ok(());
    }
    path.push(node.to_string());
    for next in graph.get(node).into_iter().flatten() {
        visit_struct(next, graph, path, done)?;
    }
    path.pop();
    done.insert(node.to_string());
    Ok(())
}

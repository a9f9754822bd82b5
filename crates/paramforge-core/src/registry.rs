use crate::codegen::{CodegenPlan, TableCodegen, plan_property};
use crate::decl::{EnumDeclaration, PropertyDeclaration, TypeDeclaration, TypeKind};
use crate::error::SchemaError;
use crate::fingerprint::{Fingerprint, FingerprintHasher};
use crate::property::PropertyType;
use crate::resolver::{
    Declarations, ResolveContext, ResolveOptions, check_embedding_acyclic, effective_properties,
    resolve,
};
use crate::wire::{SchemaAssembler, WireSchema};
use std::collections::{HashMap, HashSet};

/// A declared type after inheritance and resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedType {
    pub name: String,
    pub kind: TypeKind,
    /// Effective declarations, ancestors first.
    pub declarations: Vec<PropertyDeclaration>,
    /// Resolved properties, parallel to `declarations`.
    pub properties: Vec<PropertyType>,
}

impl ResolvedType {
    pub fn property(&self, name: &str) -> Option<&PropertyType> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn is_record(&self) -> bool {
        self.kind == TypeKind::Record
    }

    /// Properties stored as record values (everything but the identifier).
    pub fn value_properties(&self) -> impl Iterator<Item = &PropertyType> {
        self.properties.iter().filter(|p| !p.is_identifier())
    }
}

// ===========================================================================
// Builder
// ===========================================================================

/// Collects declarations, then resolves them into a [`SchemaRegistry`].
#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    decls: Declarations,
    errors: Vec<SchemaError>,
}

impl SchemaRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_type(&mut self, decl: TypeDeclaration) -> &mut Self {
        let name = decl.name.clone();
        if !self.decls.add_type(decl) {
            self.errors.push(SchemaError::DuplicateType(name));
        }
        self
    }

    pub fn register_enum(&mut self, decl: EnumDeclaration) -> &mut Self {
        if let Err(e) = validate_enum(&decl) {
            self.errors.push(e);
            return self;
        }
        let name = decl.name.clone();
        if !self.decls.add_enum(decl) {
            self.errors.push(SchemaError::DuplicateType(name));
        }
        self
    }

    /// Resolve everything registered so far.
    ///
    /// Runs the inheritance closure, the embedding acyclicity check,
    /// per-property resolution, schema assembly and fingerprinting, in that
    /// order. Every error of the failing phase is returned.
    pub fn build(self, options: ResolveOptions) -> Result<SchemaRegistry, Vec<SchemaError>> {
        let Self { decls, mut errors } = self;
        if !errors.is_empty() {
            return Err(errors);
        }

        // Inheritance closure.
        let mut closures = Vec::with_capacity(decls.types().len());
        for ty in decls.types() {
            match effective_properties(&decls, ty, &options) {
                Ok(props) => {
                    let mut seen = HashSet::new();
                    for p in &props {
                        if !seen.insert(p.name.as_str()) {
                            errors.push(SchemaError::DuplicateField {
                                table: ty.name.clone(),
                                field: p.name.clone(),
                            });
                        }
                    }
                    closures.push(props);
                }
                Err(e) => {
                    if !errors.contains(&e) {
                        errors.push(e);
                    }
                }
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        check_embedding_acyclic(&decls, &options).map_err(|e| vec![e])?;

        // Resolution.
        let mut types = Vec::with_capacity(closures.len());
        for (ty, declarations) in decls.types().iter().zip(closures) {
            let ctx = ResolveContext {
                decls: &decls,
                owner: ty,
                options: &options,
            };
            let mut properties = Vec::with_capacity(declarations.len());
            for d in &declarations {
                match resolve(&ctx, d) {
                    Ok(p) => properties.push(p),
                    Err(e) => errors.push(e),
                }
            }
            types.push(ResolvedType {
                name: ty.name.clone(),
                kind: ty.kind,
                declarations,
                properties,
            });
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        // Assembly.
        let mut assembler = SchemaAssembler::new();
        let mut tables = Vec::new();
        for ty in types.iter().filter(|t| t.kind != TypeKind::Interface) {
            assembler.define_table(&ty.name, ty.is_record());
            let mut table = TableCodegen {
                table: ty.name.clone(),
                kind: ty.kind,
                properties: Vec::with_capacity(ty.properties.len()),
            };
            for p in &ty.properties {
                let cg = plan_property(&ty.name, p, &decls);
                for f in &cg.fields {
                    if let Err(e) = assembler.define_field(f.clone()) {
                        errors.push(e);
                    }
                }
                table.properties.push(cg);
            }
            tables.push(table);
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        let wire = assembler.finish();

        let mut hasher = FingerprintHasher::new();
        for ty in &types {
            hasher.write_type(&ty.name, ty.kind, &ty.declarations);
        }
        for e in decls.enums() {
            hasher.write_enum(e);
        }
        let fingerprint = hasher.finish();

        let type_index = types
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        tracing::info!(
            types = types.len(),
            records = types.iter().filter(|t| t.is_record()).count(),
            enums = decls.enums().len(),
            %fingerprint,
            "schema resolved"
        );

        Ok(SchemaRegistry {
            options,
            decls,
            types,
            type_index,
            tables,
            wire,
            fingerprint,
        })
    }
}

fn validate_enum(decl: &EnumDeclaration) -> Result<(), SchemaError> {
    let invalid = |reason: String| SchemaError::InvalidEnum {
        name: decl.name.clone(),
        reason,
    };
    if !decl.repr.is_integer() {
        return Err(invalid(format!("repr '{}' is not an integer type", decl.repr.tag())));
    }
    if decl.members.is_empty() {
        return Err(invalid("no members".to_string()));
    }
    let mut names = HashSet::new();
    for m in &decl.members {
        if !names.insert(m.name.as_str()) {
            return Err(invalid(format!("duplicate member '{}'", m.name)));
        }
        if crate::value::Scalar::from_i64(decl.repr, m.value).is_none() {
            return Err(invalid(format!(
                "member '{}' = {} does not fit in {}",
                m.name,
                m.value,
                decl.repr.tag()
            )));
        }
    }
    Ok(())
}

// ===========================================================================
// Registry
// ===========================================================================

/// Immutable, fully resolved schema. Built once per run and passed by
/// reference to every consumer.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    options: ResolveOptions,
    decls: Declarations,
    types: Vec<ResolvedType>,
    type_index: HashMap<String, usize>,
    tables: Vec<TableCodegen>,
    wire: WireSchema,
    fingerprint: Fingerprint,
}

impl SchemaRegistry {
    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    pub fn identifier_property(&self) -> &str {
        &self.options.identifier_property
    }

    pub fn declarations(&self) -> &Declarations {
        &self.decls
    }

    pub fn types(&self) -> &[ResolvedType] {
        &self.types
    }

    pub fn resolved_type(&self, name: &str) -> Option<&ResolvedType> {
        self.type_index.get(name).map(|&i| &self.types[i])
    }

    pub fn record_types(&self) -> impl Iterator<Item = &ResolvedType> {
        self.types.iter().filter(|t| t.is_record())
    }

    pub fn enum_def(&self, name: &str) -> Option<&EnumDeclaration> {
        self.decls.enum_decl(name)
    }

    pub fn enums(&self) -> &[EnumDeclaration] {
        self.decls.enums()
    }

    pub fn wire_schema(&self) -> &WireSchema {
        &self.wire
    }

    pub fn table_codegen(&self, table: &str) -> Option<&TableCodegen> {
        self.tables.iter().find(|t| t.table == table)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn codegen_plan(&self, namespace: &str) -> CodegenPlan {
        CodegenPlan {
            namespace: namespace.to_string(),
            fingerprint: self.fingerprint,
            tables: self.tables.clone(),
        }
    }

    pub fn render_idl(&self, namespace: &str) -> String {
        self.wire
            .render_idl(namespace, self.decls.enums(), self.fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;
    use crate::property::{Shape, ValueType};
    use crate::value::ScalarKind;

    fn item() -> TypeDeclaration {
        TypeDeclaration::record("Item")
            .property(PropertyDeclaration::new("price", "int"))
            .property(PropertyDeclaration::new("rarity", "Rarity"))
    }

    fn rarity() -> EnumDeclaration {
        EnumDeclaration::new("Rarity").member("Common").member("Rare")
    }

    fn build(types: Vec<TypeDeclaration>, enums: Vec<EnumDeclaration>) -> Result<SchemaRegistry, Vec<SchemaError>> {
        let mut b = SchemaRegistryBuilder::new();
        for e in enums {
            b.register_enum(e);
        }
        for t in types {
            b.register_type(t);
        }
        b.build(ResolveOptions::default())
    }

    // -----------------------------------------------------------------------
    // Happy path
    // -----------------------------------------------------------------------

    #[test]
    fn builds_tables_for_records_and_structs_only() {
        let reg = build(
            vec![
                TypeDeclaration::interface("Priced").property(PropertyDeclaration::new("cost", "int")),
                TypeDeclaration::structure("Stats").extends("Priced"),
                item().property(PropertyDeclaration::new("stats", "Stats")),
            ],
            vec![rarity()],
        )
        .unwrap();

        let tables: Vec<&str> = reg.wire_schema().tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tables, vec!["Stats", "Item"]);
        assert_eq!(reg.record_types().count(), 1);

        let item = reg.resolved_type("Item").unwrap();
        let names: Vec<&str> = item.properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Identifier", "price", "rarity", "stats"]);
        assert_eq!(item.properties[0].shape, Shape::Identifier);
        assert_eq!(
            item.property("stats").unwrap().shape,
            Shape::Single(ValueType::Embedded("Stats".into()))
        );
        assert_eq!(item.value_properties().count(), 3);
    }

    #[test]
    fn fingerprint_matches_direct_computation() {
        let mut decls = Declarations::new();
        decls.add_enum(rarity());
        decls.add_type(item());
        let direct = fingerprint::fingerprint(&decls, &ResolveOptions::default()).unwrap();
        let reg = build(vec![item()], vec![rarity()]).unwrap();
        assert_eq!(reg.fingerprint(), direct);
    }

    #[test]
    fn codegen_plan_covers_every_property() {
        let reg = build(vec![item()], vec![rarity()]).unwrap();
        let plan = reg.codegen_plan("Params");
        assert_eq!(plan.tables.len(), 1);
        assert_eq!(plan.tables[0].properties.len(), 3);
        assert_eq!(plan.fingerprint, reg.fingerprint());
        assert!(reg.render_idl("Params").contains("table Item {"));
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[test]
    fn all_unsupported_types_are_reported() {
        let errs = build(
            vec![TypeDeclaration::record("Item")
                .property(PropertyDeclaration::new("a", "double"))
                .property(PropertyDeclaration::new("b", "decimal"))],
            vec![],
        )
        .unwrap_err();
        assert_eq!(errs.len(), 2);
        assert!(errs.iter().all(|e| matches!(e, SchemaError::UnsupportedType { .. })));
    }

    #[test]
    fn non_string_identifier_is_rejected() {
        let errs = build(
            vec![TypeDeclaration::record("Item").property(PropertyDeclaration::new("Identifier", "int"))],
            vec![],
        )
        .unwrap_err();
        assert_eq!(
            errs,
            vec![SchemaError::InvalidIdentifier {
                owner: "Item".into(),
                property: "Identifier".into(),
                type_name: "int".into(),
            }]
        );
    }

    #[test]
    fn duplicate_inherited_field_is_rejected() {
        let errs = build(
            vec![
                TypeDeclaration::interface("Priced").property(PropertyDeclaration::new("price", "int")),
                item().extends("Priced"),
            ],
            vec![rarity()],
        )
        .unwrap_err();
        assert_eq!(
            errs,
            vec![SchemaError::DuplicateField {
                table: "Item".into(),
                field: "price".into()
            }]
        );
    }

    #[test]
    fn composite_field_names_can_collide() {
        let errs = build(
            vec![TypeDeclaration::record("Item")
                .property(PropertyDeclaration::new("pos", "Vector2"))
                .property(PropertyDeclaration::new("pos_x", "float"))],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(&errs[0], SchemaError::DuplicateField { field, .. } if field == "pos_x"));
    }

    #[test]
    fn embedding_cycle_stops_the_build() {
        let errs = build(
            vec![
                TypeDeclaration::structure("A").property(PropertyDeclaration::new("b", "B")),
                TypeDeclaration::structure("B").property(PropertyDeclaration::new("a", "A")),
            ],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(&errs[0], SchemaError::CircularReference(_)));
    }

    #[test]
    fn duplicate_names_and_bad_enums() {
        let errs = build(
            vec![item(), TypeDeclaration::record("Item")],
            vec![
                rarity(),
                EnumDeclaration::new("Empty"),
                EnumDeclaration::new("Tiny").repr(ScalarKind::U8).member_with_value("Big", 300),
                EnumDeclaration::new("Twice").member("A").member("A"),
            ],
        )
        .unwrap_err();
        assert_eq!(errs.len(), 4);
        assert!(errs.contains(&SchemaError::DuplicateType("Item".into())));
        assert_eq!(
            errs.iter()
                .filter(|e| matches!(e, SchemaError::InvalidEnum { .. }))
                .count(),
            3
        );
    }
}

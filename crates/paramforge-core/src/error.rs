/// Errors that make a declared schema unusable. All of them are fatal to the
/// generation pass that found them; no partial schema is produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// No PropertyType variant accepts the declared type.
    #[error("unsupported type '{type_name}' for property '{owner}.{property}'")]
    UnsupportedType {
        owner: String,
        property: String,
        type_name: String,
    },

    /// A (table, field) pair was defined twice.
    #[error("duplicate field '{field}' in table '{table}'")]
    DuplicateField { table: String, field: String },

    /// Embeddable sub-structures contain each other without list indirection.
    #[error("circular reference between embeddable types: {}", .0.join(" -> "))]
    CircularReference(Vec<String>),

    /// A type transitively extends itself.
    #[error("circular inheritance: {}", .0.join(" -> "))]
    CircularInheritance(Vec<String>),

    /// `extends` names a type that is not declared, or is an enum.
    #[error("type '{owner}' extends unknown type '{name}'")]
    UnknownType { owner: String, name: String },

    /// Two declarations (types or enums) share a name.
    #[error("duplicate type name '{0}'")]
    DuplicateType(String),

    #[error("invalid enum '{name}': {reason}")]
    InvalidEnum { name: String, reason: String },

    /// A record declares its identifier property as something other than a
    /// single string.
    #[error("identifier '{owner}.{property}' must be a single string, found '{type_name}'")]
    InvalidIdentifier {
        owner: String,
        property: String,
        type_name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_names_the_full_path() {
        let e = SchemaError::CircularReference(vec!["A".into(), "B".into(), "A".into()]);
        assert_eq!(
            e.to_string(),
            "circular reference between embeddable types: A -> B -> A"
        );
    }

    #[test]
    fn unsupported_type_carries_context() {
        let e = SchemaError::UnsupportedType {
            owner: "Item".into(),
            property: "weight".into(),
            type_name: "double".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("Item.weight"));
        assert!(msg.contains("double"));
    }
}

//! Compatibility fingerprint of the declared schema.
//!
//! The fingerprint is a 64-bit FNV-1a hash over every type's effective
//! properties (in declaration order) and every enum. It is baked into both
//! generated code and generated data; loaders compare all three before
//! trusting a blob.

use crate::decl::{EnumDeclaration, PropertyDeclaration, TypeKind};
use crate::error::SchemaError;
use crate::resolver::{Declarations, ResolveOptions, effective_properties};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bumped whenever the hashed layout or the wire format changes meaning.
pub const FINGERPRINT_SALT: &str = "paramforge-schema-v1";

/// Hash of the full declared schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16).map(Fingerprint)
    }
}

// Persisted as the hex string so manifests stay readable.
impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ===========================================================================
// Hashing
// ===========================================================================

/// Incremental FNV-1a hasher. Strings are length-prefixed so that
/// `("ab", "c")` and `("a", "bc")` hash differently.
#[derive(Debug, Clone)]
pub struct FingerprintHasher(u64);

impl FingerprintHasher {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    /// A hasher already seeded with [`FINGERPRINT_SALT`].
    pub fn new() -> Self {
        let mut h = Self::unsalted();
        h.write_str(FINGERPRINT_SALT);
        h
    }

    pub fn unsalted() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_u64(s.len() as u64);
        self.write(s.as_bytes());
    }

    pub fn write_type(&mut self, name: &str, kind: TypeKind, properties: &[PropertyDeclaration]) {
        self.write_str(name);
        self.write_str(kind.tag());
        self.write_u64(properties.len() as u64);
        for p in properties {
            self.write_str(&p.name);
            self.write_str(&p.type_tag);
            self.write(&[u8::from(p.list)]);
        }
    }

    pub fn write_enum(&mut self, decl: &EnumDeclaration) {
        self.write_str(&decl.name);
        self.write_str(decl.repr.tag());
        self.write_u64(decl.members.len() as u64);
        for m in &decl.members {
            self.write_str(&m.name);
            self.write_u64(m.value as u64);
        }
    }

    pub fn finish(&self) -> Fingerprint {
        Fingerprint(self.0)
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Fingerprint a set of declarations directly, without building a registry.
pub fn fingerprint(
    decls: &Declarations,
    options: &ResolveOptions,
) -> Result<Fingerprint, SchemaError> {
    let mut hasher = FingerprintHasher::new();
    for ty in decls.types() {
        let props = effective_properties(decls, ty, options)?;
        hasher.write_type(&ty.name, ty.kind, &props);
    }
    for e in decls.enums() {
        hasher.write_enum(e);
    }
    Ok(hasher.finish())
}

// ===========================================================================
// Checkpoints
// ===========================================================================

/// Fingerprints baked into the last generated code and data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoints {
    #[serde(default)]
    pub code: Option<Fingerprint>,
    #[serde(default)]
    pub data: Option<Fingerprint>,
}

/// Generated artifacts are out of date with the declared schema.
///
/// Not fatal: callers answer it with a full regeneration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompatibilityError {
    #[error("no {artifact} has been generated yet")]
    Missing { artifact: &'static str },

    #[error("generated code was built for schema {found}, current schema is {expected}")]
    CodeMismatch {
        expected: Fingerprint,
        found: Fingerprint,
    },

    #[error("generated data was built for schema {found}, current schema is {expected}")]
    DataMismatch {
        expected: Fingerprint,
        found: Fingerprint,
    },
}

/// Check `current == code == data`. Code is checked first.
pub fn verify(current: Fingerprint, checkpoints: &Checkpoints) -> Result<(), CompatibilityError> {
    let code = checkpoints
        .code
        .ok_or(CompatibilityError::Missing { artifact: "code" })?;
    if code != current {
        return Err(CompatibilityError::CodeMismatch {
            expected: current,
            found: code,
        });
    }
    verify_data(current, checkpoints.data)
}

/// Check only the data checkpoint, as a blob loader does.
pub fn verify_data(
    current: Fingerprint,
    data: Option<Fingerprint>,
) -> Result<(), CompatibilityError> {
    let data = data.ok_or(CompatibilityError::Missing { artifact: "data" })?;
    if data != current {
        return Err(CompatibilityError::DataMismatch {
            expected: current,
            found: data,
        });
    }
    Ok(())
}

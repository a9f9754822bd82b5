//! Paramforge Core -- schema resolution, codecs, and record reconciliation
//! for game parameter data.
//!
//! Designers author parameters in tabular files; the game reads them from a
//! compact binary buffer. This crate holds everything between the two that
//! does not touch the filesystem.
//!
//! # Pipeline
//!
//! 1. **Resolve** -- Declared types and enums are registered with a
//!    [`registry::SchemaRegistryBuilder`] and resolved into an immutable
//!    [`registry::SchemaRegistry`]: one [`property::PropertyType`] per
//!    property, a [`wire::WireSchema`], a per-table [`codegen::TableCodegen`]
//!    plan, and a [`fingerprint::Fingerprint`].
//! 2. **Reconcile** -- Tabular rows are matched to existing
//!    [`record::StructuredRecord`]s by [`reconcile::Reconciler`], producing a
//!    plan of updates, creates, deletes, and renames.
//! 3. **Apply** -- [`executor::PlanExecutor`] decodes cells with the
//!    [`text::TextCodec`] and applies the plan to a [`executor::RecordStore`].
//! 4. **Bake** -- [`blob::BlobBuilder`] serializes a [`record::RecordCatalog`]
//!    into the binary buffer, read back through [`blob::BlobReader`].
//!
//! # Key Types
//!
//! - [`property::PropertyType`] -- Resolved property and its codegen strategy.
//! - [`resolver::RULES`] -- Ordered resolution rules; the first match wins.
//! - [`regen::RegenState`] -- Whether binary data must be rebuilt, and how.
//! - [`fingerprint::Checkpoints`] -- Fingerprints the code and data artifacts
//!   were produced from.

pub mod blob;
pub mod codegen;
pub mod decl;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod id;
pub mod property;
pub mod reconcile;
pub mod record;
pub mod regen;
pub mod registry;
pub mod resolver;
pub mod text;
pub mod value;
pub mod wire;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

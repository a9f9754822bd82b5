//! File-system side of the parameter pipeline: declaration and config
//! loading, tabular files, the file-backed record store, the external
//! schema compiler, and the generation entry points.

pub mod artifacts;
pub mod compiler;
pub mod config;
pub mod loader;
pub mod pipeline;
pub mod schema;
pub mod store;
pub mod tabular;

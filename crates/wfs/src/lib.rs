#![forbid(unsafe_code)]
//! WitnessFS public API facade.
//!
//! Re-exports the `wfs-core` surface through a stable external
//! interface. This is the crate downstream consumers (CLI, extraction
//! tools) depend on.

pub use wfs_core::*;

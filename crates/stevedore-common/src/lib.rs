//! # stevedore-common
//!
//! Shared entity types, configuration models, and constants used across the
//! Stevedore workspace.
//!
//! This crate is the leaf of the dependency graph — it depends on no other
//! internal crate and provides the domain primitives (container, pod, and
//! volume configuration and runtime-state records) that the entity store
//! persists and the rest of the engine consumes.

pub mod config;
pub mod constants;
pub mod types;

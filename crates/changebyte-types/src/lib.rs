//! Shared changebyte data model and error taxonomy.
//!
//! This crate is dependency-boundary-safe for the engine, the state backend,
//! and connector implementations.

pub mod envelope;
pub mod error;
pub mod event;
pub mod record;
pub mod state;

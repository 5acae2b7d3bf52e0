//! Shared types for the ClueGetter policy engine
//!
//! This crate provides the pieces every other crate needs: the error type,
//! the configuration structures, and the small domain types (addresses,
//! verdicts) that cross crate boundaries.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{Address, Verdict};

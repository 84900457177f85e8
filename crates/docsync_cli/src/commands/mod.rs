//! CLI command implementations.

pub mod pending;
pub mod replicate;
pub mod reset;

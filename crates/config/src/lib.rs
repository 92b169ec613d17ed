//! Configuration for camfleet
//!
//! Loads the declarative source list and supervisor settings from TOML, with environment overrides.

pub mod config;

pub use config::*;

//! Configuration and shared types
//!
//! Data model, error type, and the JSON-loaded service configuration.

pub mod settings;
pub mod types;

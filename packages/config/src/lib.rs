// ABOUTME: Configuration for the Lab sandbox orchestrator
// ABOUTME: Environment variable names, parsing helpers and the settings consumed by the core

pub mod constants;
pub mod env;
pub mod settings;

pub use settings::{ConfigError, OrchestratorSettings};

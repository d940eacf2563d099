/// Environment variable overrides.
pub mod config;
/// TOML configuration with hot reload.
pub mod toml_config;

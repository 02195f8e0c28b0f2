//! Configuration model for the intercepting forward proxy: a flat key
//! table, a TOML file loader, and a CLI overlay.

pub mod cli;
pub mod config;
pub mod engine_kind;
pub mod loader;
pub mod logmask;

pub use cli::Cli;
pub use config::{ProxyConfig, ScoreboardConfig, ValidateError};
pub use engine_kind::EngineKind;
pub use loader::ConfigLoader;
pub use logmask::LogMask;

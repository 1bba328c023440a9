//! Configuration module for modelvault
//!
//! Loads config from `$XDG_CONFIG_HOME/modelvault/config.toml` or the platform config dir.
//! Falls back to embedded defaults if the file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//!
//! # Example
//!
//! ```no_run
//! use modelvault::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Checkpoints: {}", config.paths.checkpoints.display());
//! println!("Device: {}", config.runtime.device);
//! ```

pub mod schema;

pub use schema::{Config, DownloadConfig, PathsConfig, RuntimeConfig};

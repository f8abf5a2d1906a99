//! Configuration for the replication core.
//!
//! Tuning values (distance bands, activation radii, interpolation delays,
//! snapshot cadence) persist to disk as RON. Supports CLI overrides via clap,
//! hot-reload detection, and forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE_NAME, ClientConfig, Config, DebugConfig, InterpolationConfig, NetworkConfig,
    RetryConfig, ServerConfig, SnapshotConfig,
};
pub use error::ConfigError;

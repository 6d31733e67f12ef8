//! Configuration for the delve client.
//!
//! Settings persist to disk as a RON file, with CLI overrides via clap and
//! hot-reload detection. Every section is `#[serde(default)]` so older
//! files keep loading when new fields appear.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, NetworkConfig, SessionConfig};
pub use error::ConfigError;

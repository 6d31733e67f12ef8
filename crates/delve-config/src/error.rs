//! Errors from reading and writing `config.ron`.

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Read(#[source] std::io::Error),

    #[error("could not write config file: {0}")]
    Write(#[source] std::io::Error),

    #[error("config file is not valid RON: {0}")]
    Parse(#[source] ron::error::SpannedError),

    #[error("could not serialize config: {0}")]
    Serialize(#[source] ron::Error),

    /// The OS did not expose a configuration directory.
    #[error("no configuration directory on this platform")]
    NoConfigDir,
}

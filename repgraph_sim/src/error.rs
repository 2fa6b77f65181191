//! Simulator errors.

use repgraph_core::ConfigError;
use repgraph_env::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Replication graph is disabled by configuration")]
    GraphDisabled,

    #[error("Type registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Failed to read config {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid velocity distribution: {0}")]
    Velocity(#[from] rand_distr::NormalError),

    #[error("Invalid graph config: {0}")]
    Config(#[from] ConfigError),
}

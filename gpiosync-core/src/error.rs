//! Error types for gpiosync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from loading, validating or saving the agent
/// configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the file path and serde_yaml's line context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// No config file at the expected path.
    #[error("config not found at {path}; run `gpiosync init` first")]
    ConfigNotFound { path: PathBuf },

    /// The file parsed but describes an agent that cannot run.
    #[error("invalid config: {0}")]
    Invalid(String),
}

use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime, transports and control protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] gpiosync_core::ConfigError),

    #[error("engine error: {0}")]
    Engine(#[from] gpiosync_engine::EngineError),

    #[error("storage error: {0}")]
    Storage(#[from] gpiosync_engine::StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MQTT setup failed for {link} link: {reason}")]
    Mqtt {
        link: gpiosync_core::LinkId,
        reason: String,
    },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

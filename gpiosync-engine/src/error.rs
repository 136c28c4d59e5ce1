//! Error types for gpiosync-engine.
//!
//! Only [`EngineError`] is fatal. Everything else is handled where it occurs
//! and surfaces through `tracing`, never as a published message.

use std::path::PathBuf;

use thiserror::Error;

use gpiosync_core::types::{LinkId, PinId};

/// The persistent store could not be opened, read or committed.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The namespace file exists but is not a valid state document.
    #[error("state store JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A pin could not be configured, driven or read.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("pin {pin} is not a valid output")]
    InvalidPin { pin: PinId },

    #[error("GPIO I/O error on pin {pin} at {path}: {source}")]
    Io {
        pin: PinId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pin {pin} reported unexpected value '{value}'")]
    UnexpectedValue { pin: PinId, value: String },
}

/// A publish or subscribe on one link did not go out.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The link is disconnected. Expected, and simply skipped by callers.
    #[error("{0} link is not connected")]
    Unavailable(LinkId),

    #[error("publish on {link} link failed: {reason}")]
    Publish { link: LinkId, reason: String },

    #[error("subscribe on {link} link failed: {reason}")]
    Subscribe { link: LinkId, reason: String },
}

/// Why an inbound command was discarded.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Topic did not match `<device-id>/gpio/<pin-id>/set`.
    #[error("topic '{topic}' is not a command topic")]
    Parse { topic: String },

    #[error("pin {pin} is not a valid output")]
    Validation { pin: PinId },

    #[error("unknown command '{payload}' for pin {pin}")]
    UnknownAction { pin: PinId, payload: String },

    /// Message arrived on a telemetry-only link.
    #[error("commands are not accepted on the {0} link")]
    NotCommandLink(LinkId),

    /// The pin write failed; nothing was persisted or published.
    #[error("hardware error: {0}")]
    Hardware(#[from] HardwareError),
}

/// Startup failures. Continuing past any of these would leave pins in an
/// unknown state, so the daemon aborts.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configured pin {pin} is not a valid output")]
    InvalidConfiguredPin { pin: PinId },

    #[error("failed to restore pin {pin} at boot: {source}")]
    Boot {
        pin: PinId,
        #[source]
        source: HardwareError,
    },
}

/// Convenience constructor for [`StorageError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.into(),
        source,
    }
}

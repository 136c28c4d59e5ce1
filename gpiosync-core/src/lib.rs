//! gpiosync core library: domain types, topic scheme, agent configuration.
//!
//! - [`types`]: pins, levels, actions, links, inbound events
//! - [`topics`]: the fixed topic naming scheme and command-topic parser
//! - [`config`]: `config.yaml` load / save / init
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod topics;
pub mod types;

pub use config::{AgentConfig, GpioBackend, GpioConfig, LinkConfig, StorageConfig};
pub use error::ConfigError;
pub use topics::TopicScheme;
pub use types::{Action, ConnectionState, Level, LinkEvent, LinkId, PinId, QoS};

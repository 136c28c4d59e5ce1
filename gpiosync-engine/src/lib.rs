//! # gpiosync-engine
//!
//! Device-side state sync: persisted pin levels, output drivers, the link
//! abstraction, the liveness reporter and the [`SyncEngine`] that ties them
//! together.
//!
//! The engine is transport-agnostic. A daemon feeds it [`LinkEvent`]s from
//! its transports and hands it [`ChannelLink`] implementations to publish on.
//!
//! [`LinkEvent`]: gpiosync_core::LinkEvent

pub mod engine;
pub mod error;
pub mod link;
pub mod pin;
pub mod reporter;
pub mod store;

pub use engine::{
    log_rejection, Applied, EngineParts, EngineStatus, LinkStatus, PinStatus, ReporterStatus,
    SyncEngine, COMMAND_LINK,
};
pub use error::{CommandError, EngineError, HardwareError, LinkError, StorageError};
pub use link::{ChannelLink, ConnectionCell, MemoryLink, MessageId, Published};
pub use pin::{PinController, SimulatedPins, SysfsPins};
pub use reporter::{LivenessReporter, ReporterState};
pub use store::{storage_key, FileStore, StateStore};

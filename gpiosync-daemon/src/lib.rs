//! gpiosync agent daemon: MQTT transports, the engine task and the control
//! socket.

mod error;
pub mod mqtt;
pub mod paths;
pub mod processor;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use mqtt::{MqttDriver, MqttLink};
pub use protocol::{
    request_set, request_status, request_stop, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{build_controller, check_config, run, start_blocking};

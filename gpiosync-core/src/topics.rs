//! Topic naming scheme.
//!
//! ```text
//! <device-id>/gpio/<pin-id>/set      command topic (subscribed on the cloud link)
//! <device-id>/gpio/<pin-id>/state    retained state topic
//! <device-id>/system/status          online / offline / heartbeat
//! ```
//!
//! These strings are an interoperability contract with dashboards and
//! brokers already in the field; they must not change.

use crate::types::PinId;

/// Status payload published (retained) when the cloud link comes up.
pub const STATUS_ONLINE: &str = "online";
/// Status payload used for the last will and on graceful shutdown.
pub const STATUS_OFFLINE: &str = "offline";
/// Periodic liveness payload, never retained.
pub const HEARTBEAT: &str = "heartbeat";

const GPIO_SEGMENT: &str = "/gpio/";
const COMMAND_SUFFIX: &str = "/set";
const STATE_SUFFIX: &str = "/state";

/// Builds and parses the topics for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    device_id: String,
    command_prefix: String,
}

impl TopicScheme {
    pub fn new(device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        let command_prefix = format!("{device_id}{GPIO_SEGMENT}");
        Self {
            device_id,
            command_prefix,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn command_topic(&self, pin: PinId) -> String {
        format!("{}{pin}{COMMAND_SUFFIX}", self.command_prefix)
    }

    pub fn state_topic(&self, pin: PinId) -> String {
        format!("{}{pin}{STATE_SUFFIX}", self.command_prefix)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/system/status", self.device_id)
    }

    /// Single-level wildcard filter matching every pin's command topic.
    pub fn command_filter(&self) -> String {
        format!("{}+{COMMAND_SUFFIX}", self.command_prefix)
    }

    /// Extract the pin id from a command topic.
    ///
    /// Strips the fixed prefix, requires one or more ASCII digits, then the
    /// fixed suffix with nothing after it. Any mismatch yields `None`.
    pub fn parse_command_topic(&self, topic: &str) -> Option<PinId> {
        let rest = topic.strip_prefix(self.command_prefix.as_str())?;
        let digits = rest.strip_suffix(COMMAND_SUFFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u32>().ok().map(PinId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn scheme() -> TopicScheme {
        TopicScheme::new("esp32_02")
    }

    #[test]
    fn builds_fixed_topics() {
        let s = scheme();
        assert_eq!(s.command_topic(PinId(2)), "esp32_02/gpio/2/set");
        assert_eq!(s.state_topic(PinId(2)), "esp32_02/gpio/2/state");
        assert_eq!(s.status_topic(), "esp32_02/system/status");
        assert_eq!(s.command_filter(), "esp32_02/gpio/+/set");
    }

    #[rstest]
    #[case("esp32_02/gpio/2/set", Some(2))]
    #[case("esp32_02/gpio/33/set", Some(33))]
    #[case("esp32_02/gpio/007/set", Some(7))]
    #[case("esp32_02/gpio//set", None)]
    #[case("esp32_02/gpio/x/set", None)]
    #[case("esp32_02/gpio/-1/set", None)]
    #[case("esp32_02/gpio/+2/set", None)]
    #[case("esp32_02/gpio/2/state", None)]
    #[case("esp32_02/gpio/2/set/extra", None)]
    #[case("esp32_01/gpio/2/set", None)]
    #[case("prefix/esp32_02/gpio/2/set", None)]
    #[case("esp32_02/gpio/99999999999/set", None)]
    fn parses_command_topics(#[case] topic: &str, #[case] expected: Option<u32>) {
        assert_eq!(scheme().parse_command_topic(topic), expected.map(PinId));
    }

    #[test]
    fn built_command_topic_parses_back() {
        let s = scheme();
        let topic = s.command_topic(PinId(25));
        assert_eq!(s.parse_command_topic(&topic), Some(PinId(25)));
    }
}

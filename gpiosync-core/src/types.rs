//! Domain types shared by the engine, the daemon and the CLI.
//!
//! Wire tokens (`ON`, `OFF`, `TOGGLE`) are case-sensitive ASCII and are
//! produced/consumed only through the helpers on [`Level`] and [`Action`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Platform pin number of a digital output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PinId(pub u32);

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for PinId {
    fn from(n: u32) -> Self {
        Self(n)
    }
}

impl FromStr for PinId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(Self)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Logic level of an output pin. `Off` is the default for a pin with no
/// persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    #[default]
    Off,
    On,
}

impl Level {
    /// Any non-zero byte is `On`.
    pub fn from_bit(bit: u8) -> Self {
        if bit == 0 {
            Level::Off
        } else {
            Level::On
        }
    }

    pub fn as_bit(self) -> u8 {
        match self {
            Level::Off => 0,
            Level::On => 1,
        }
    }

    pub fn is_on(self) -> bool {
        self == Level::On
    }

    pub fn toggled(self) -> Self {
        match self {
            Level::Off => Level::On,
            Level::On => Level::Off,
        }
    }

    /// The literal token published on a state topic.
    pub fn as_payload(self) -> &'static str {
        match self {
            Level::Off => "OFF",
            Level::On => "ON",
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::On
        } else {
            Level::Off
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_payload())
    }
}

/// A decoded command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    On,
    Off,
    Toggle,
}

impl Action {
    /// Decode a raw command payload. Matching is exact and case-sensitive;
    /// anything else is `None`.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            b"ON" => Some(Action::On),
            b"OFF" => Some(Action::Off),
            b"TOGGLE" => Some(Action::Toggle),
            _ => None,
        }
    }

    /// Level this action produces given the pin's current physical level.
    pub fn resolve(self, current: Level) -> Level {
        match self {
            Action::On => Level::On,
            Action::Off => Level::Off,
            Action::Toggle => current.toggled(),
        }
    }

    pub fn as_token(self) -> &'static str {
        match self {
            Action::On => "ON",
            Action::Off => "OFF",
            Action::Toggle => "TOGGLE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::from_payload(s.as_bytes())
            .ok_or_else(|| format!("unknown action '{s}'; expected: ON, OFF, TOGGLE"))
    }
}

/// Identity of one message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkId {
    Cloud,
    Local,
}

impl LinkId {
    pub const ALL: [LinkId; 2] = [LinkId::Cloud, LinkId::Local];
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkId::Cloud => write!(f, "cloud"),
            LinkId::Local => write!(f, "local"),
        }
    }
}

/// Connectivity of a link as last reported by its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// Notification from a transport to the engine. The only way link health or
/// inbound traffic reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected(LinkId),
    Disconnected(LinkId),
    Message {
        link: LinkId,
        topic: String,
        payload: Vec<u8>,
    },
}

impl LinkEvent {
    pub fn link(&self) -> LinkId {
        match self {
            LinkEvent::Connected(link) | LinkEvent::Disconnected(link) => *link,
            LinkEvent::Message { link, .. } => *link,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

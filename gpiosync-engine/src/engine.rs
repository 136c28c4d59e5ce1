//! The sync engine: command intake and dual-link state propagation.
//!
//! [`SyncEngine`] is driven by one consumer (`&mut self`, no interior
//! locking). Every accepted command runs write, then persist, then publish
//! to every connected link, in that order, so a persistence or publish
//! failure only degrades durability or observability, never the effect on
//! the pin.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use gpiosync_core::topics::{TopicScheme, STATUS_OFFLINE, STATUS_ONLINE};
use gpiosync_core::types::{Action, ConnectionState, Level, LinkEvent, LinkId, PinId, QoS};

use crate::error::{CommandError, EngineError, LinkError};
use crate::link::ChannelLink;
use crate::pin::PinController;
use crate::reporter::{LivenessReporter, ReporterState};
use crate::store::StateStore;

/// The only link commands are accepted on. The local link is telemetry-only.
pub const COMMAND_LINK: LinkId = LinkId::Cloud;

/// Collaborators injected at construction.
pub struct EngineParts {
    pub topics: TopicScheme,
    /// Pins restored at boot and announced on connect.
    pub pins: Vec<PinId>,
    pub controller: Arc<dyn PinController>,
    pub store: Arc<dyn StateStore>,
    pub cloud: Arc<dyn ChannelLink>,
    pub local: Arc<dyn ChannelLink>,
    pub heartbeat_interval: Duration,
}

struct LinkSlot {
    link: Arc<dyn ChannelLink>,
    // Last transition reported through a LinkEvent.
    state: ConnectionState,
}

/// Outcome of an accepted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Applied {
    pub pin: PinId,
    pub level: Level,
    /// `false` when the store rejected the write; the level still applies.
    pub persisted: bool,
    /// Links that accepted the state publish.
    pub published: Vec<LinkId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinStatus {
    pub pin: PinId,
    pub level: Level,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub link: LinkId,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReporterStatus {
    pub state: ReporterState,
    pub bound_link: Option<LinkId>,
    pub heartbeats: u64,
}

/// Point-in-time view of the engine, served by the daemon's `status` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub device_id: String,
    pub pins: Vec<PinStatus>,
    pub links: Vec<LinkStatus>,
    pub reporter: ReporterStatus,
}

pub struct SyncEngine {
    topics: TopicScheme,
    pins: Vec<PinId>,
    controller: Arc<dyn PinController>,
    store: Arc<dyn StateStore>,
    links: BTreeMap<LinkId, LinkSlot>,
    levels: BTreeMap<PinId, Level>,
    reporter: LivenessReporter,
}

impl SyncEngine {
    pub fn new(parts: EngineParts) -> Self {
        let mut links = BTreeMap::new();
        for link in [parts.cloud, parts.local] {
            links.insert(
                link.id(),
                LinkSlot {
                    link,
                    state: ConnectionState::Disconnected,
                },
            );
        }
        Self {
            topics: parts.topics,
            pins: parts.pins,
            controller: parts.controller,
            store: parts.store,
            links,
            levels: BTreeMap::new(),
            reporter: LivenessReporter::new(parts.heartbeat_interval),
        }
    }

    /// Restore every configured pin from the store and drive it.
    ///
    /// Runs before any link connects: nothing is published and nothing is
    /// re-persisted. Any failure here is fatal.
    pub fn boot(&mut self) -> Result<(), EngineError> {
        for &pin in &self.pins {
            if !self.controller.is_valid_output(pin) {
                return Err(EngineError::InvalidConfiguredPin { pin });
            }
            let level = self.store.get(pin);
            self.controller
                .write(pin, level)
                .map_err(|source| EngineError::Boot { pin, source })?;
            self.levels.insert(pin, level);
            tracing::info!(pin = %pin, level = %level, "pin restored");
        }
        Ok(())
    }

    /// Dispatch one transport notification. Rejected commands are logged
    /// here and go no further.
    pub fn handle_event(&mut self, event: LinkEvent) -> Option<Applied> {
        match event {
            LinkEvent::Connected(link) => {
                self.on_connected(link);
                None
            }
            LinkEvent::Disconnected(link) => {
                self.on_disconnected(link);
                None
            }
            LinkEvent::Message {
                link,
                topic,
                payload,
            } => match self.handle_message(link, &topic, &payload) {
                Ok(applied) => Some(applied),
                Err(err) => {
                    log_rejection(&err);
                    None
                }
            },
        }
    }

    /// Command intake: parse the topic, validate the pin, decode the payload,
    /// then apply.
    pub fn handle_message(
        &mut self,
        link: LinkId,
        topic: &str,
        payload: &[u8],
    ) -> Result<Applied, CommandError> {
        if link != COMMAND_LINK {
            return Err(CommandError::NotCommandLink(link));
        }
        let pin = self
            .topics
            .parse_command_topic(topic)
            .ok_or_else(|| CommandError::Parse {
                topic: topic.to_string(),
            })?;
        if !self.controller.is_valid_output(pin) {
            return Err(CommandError::Validation { pin });
        }
        let action = Action::from_payload(payload).ok_or_else(|| CommandError::UnknownAction {
            pin,
            payload: String::from_utf8_lossy(payload).into_owned(),
        })?;
        self.execute(pin, action)
    }

    /// Apply `action` to `pin` as if it had arrived on the command topic.
    pub fn apply_action(&mut self, pin: PinId, action: Action) -> Result<Applied, CommandError> {
        if !self.controller.is_valid_output(pin) {
            return Err(CommandError::Validation { pin });
        }
        self.execute(pin, action)
    }

    fn execute(&mut self, pin: PinId, action: Action) -> Result<Applied, CommandError> {
        let level = match action {
            Action::Toggle => action.resolve(self.current_level(pin)),
            other => other.resolve(Level::Off),
        };
        tracing::info!(pin = %pin, action = %action, level = %level, "applying command");
        self.write_persist_publish(pin, level)
    }

    // Physical level read back from the pin, falling back to the last level
    // this engine applied when the read fails.
    fn current_level(&self, pin: PinId) -> Level {
        match self.controller.read(pin) {
            Ok(level) => level,
            Err(err) => {
                let fallback = self.levels.get(&pin).copied().unwrap_or_default();
                tracing::warn!(pin = %pin, error = %err, fallback = %fallback, "pin read-back failed");
                fallback
            }
        }
    }

    fn write_persist_publish(&mut self, pin: PinId, level: Level) -> Result<Applied, CommandError> {
        self.controller.write(pin, level)?;

        let persisted = match self.store.set(pin, level) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(pin = %pin, level = %level, error = %err, "failed to persist pin state");
                false
            }
        };
        self.levels.insert(pin, level);

        let topic = self.topics.state_topic(pin);
        let mut published = Vec::new();
        for (&id, slot) in &self.links {
            if !slot.state.is_connected() {
                continue;
            }
            if publish_logged(slot.link.as_ref(), &topic, level.as_payload(), QoS::AtLeastOnce, true) {
                published.push(id);
            }
        }

        Ok(Applied {
            pin,
            level,
            persisted,
            published,
        })
    }

    fn on_connected(&mut self, id: LinkId) {
        let Some(slot) = self.links.get_mut(&id) else {
            return;
        };
        slot.state = ConnectionState::Connected;
        let link = Arc::clone(&slot.link);
        tracing::info!(link = %id, "link connected");

        if id == COMMAND_LINK {
            publish_logged(
                link.as_ref(),
                &self.topics.status_topic(),
                STATUS_ONLINE,
                QoS::AtLeastOnce,
                true,
            );
            let filter = self.topics.command_filter();
            if let Err(err) = link.subscribe(&filter, QoS::AtMostOnce) {
                tracing::warn!(link = %id, filter = %filter, error = %err, "command subscription failed");
            }
        }

        // Re-announce retained state on the link that just came up.
        for (&pin, &level) in &self.levels {
            publish_logged(
                link.as_ref(),
                &self.topics.state_topic(pin),
                level.as_payload(),
                QoS::AtLeastOnce,
                true,
            );
        }

        if id == COMMAND_LINK {
            self.reporter.start(link, self.topics.status_topic());
        }
    }

    fn on_disconnected(&mut self, id: LinkId) {
        // The reporter must be idle before any other disconnect handling.
        if self.reporter.bound_link() == Some(id) {
            self.reporter.stop();
        }
        if let Some(slot) = self.links.get_mut(&id) {
            slot.state = ConnectionState::Disconnected;
            tracing::warn!(link = %id, "link disconnected");
        }
    }

    /// Stop the reporter, then announce `offline` on the command link if it
    /// is connected. Returns whether the announcement went out.
    pub fn shutdown(&mut self) -> bool {
        self.reporter.stop();
        let Some(slot) = self.links.get(&COMMAND_LINK) else {
            return false;
        };
        if !slot.state.is_connected() {
            return false;
        }
        publish_logged(
            slot.link.as_ref(),
            &self.topics.status_topic(),
            STATUS_OFFLINE,
            QoS::AtLeastOnce,
            true,
        )
    }

    pub fn level(&self, pin: PinId) -> Option<Level> {
        self.levels.get(&pin).copied()
    }

    pub fn link_state(&self, link: LinkId) -> ConnectionState {
        self.links
            .get(&link)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    pub fn reporter_state(&self) -> ReporterState {
        self.reporter.state()
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            device_id: self.topics.device_id().to_string(),
            pins: self
                .levels
                .iter()
                .map(|(&pin, &level)| PinStatus { pin, level })
                .collect(),
            links: self
                .links
                .iter()
                .map(|(&link, slot)| LinkStatus {
                    link,
                    state: slot.state,
                })
                .collect(),
            reporter: ReporterStatus {
                state: self.reporter.state(),
                bound_link: self.reporter.bound_link(),
                heartbeats: self.reporter.heartbeats_sent(),
            },
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device_id", &self.topics.device_id())
            .field("levels", &self.levels)
            .field("reporter", &self.reporter)
            .finish_non_exhaustive()
    }
}

/// Publish and log the outcome. A disconnected link is expected and only
/// traced at debug.
fn publish_logged(link: &dyn ChannelLink, topic: &str, payload: &str, qos: QoS, retain: bool) -> bool {
    match link.publish(topic, payload.as_bytes(), qos, retain) {
        Ok(id) => {
            tracing::debug!(link = %link.id(), topic, payload, message_id = id.0, "published");
            true
        }
        Err(err @ LinkError::Unavailable(_)) => {
            tracing::debug!(link = %link.id(), topic, error = %err, "skipped publish");
            false
        }
        Err(err) => {
            tracing::warn!(link = %link.id(), topic, error = %err, "publish failed");
            false
        }
    }
}

/// Log a rejected command at the level its class warrants.
pub fn log_rejection(err: &CommandError) {
    match err {
        CommandError::Parse { .. } | CommandError::NotCommandLink(_) => {
            tracing::debug!(error = %err, "command discarded");
        }
        CommandError::Validation { .. } | CommandError::UnknownAction { .. } => {
            tracing::warn!(error = %err, "command rejected");
        }
        CommandError::Hardware(_) => {
            tracing::error!(error = %err, "command aborted");
        }
    }
}

//! Message-channel abstraction.
//!
//! A [`ChannelLink`] is one broker connection. Its connection state is owned
//! by the link and driven by the transport's own event stream; the engine
//! only learns about transitions through [`LinkEvent`]s and never changes
//! them.
//!
//! [`LinkEvent`]: gpiosync_core::types::LinkEvent

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use gpiosync_core::types::{ConnectionState, LinkId, QoS};

use crate::error::LinkError;

/// Per-link identifier assigned to each accepted publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u64);

/// One publish/subscribe connection.
///
/// `publish` and `subscribe` never block and never queue while disconnected:
/// a disconnected link returns [`LinkError::Unavailable`].
pub trait ChannelLink: Send + Sync {
    fn id(&self) -> LinkId;

    fn state(&self) -> ConnectionState;

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, LinkError>;

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), LinkError>;
}

/// Connection flag and message-id counter shared by link implementations.
#[derive(Debug, Default)]
pub struct ConnectionCell {
    connected: AtomicBool,
    next_id: AtomicU64,
}

impl ConnectionCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionState {
        if self.connected.load(Ordering::Acquire) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Record a transition. Returns the previous state.
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        let was = self
            .connected
            .swap(state.is_connected(), Ordering::AcqRel);
        if was {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn next_message_id(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// A publish accepted by a [`MemoryLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub id: MessageId,
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

/// In-process link that records traffic instead of sending it.
///
/// The daemon uses it for links disabled in the config (it simply never
/// connects); tests drive its state directly.
#[derive(Debug)]
pub struct MemoryLink {
    id: LinkId,
    cell: ConnectionCell,
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    fail_publishes: AtomicBool,
}

impl MemoryLink {
    pub fn new(id: LinkId) -> Self {
        Self {
            id,
            cell: ConnectionCell::new(),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            fail_publishes: AtomicBool::new(false),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.cell.set(state);
    }

    /// Make every subsequent publish fail as if the transport queue were full.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::Release);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Published messages whose topic equals `topic`.
    pub fn published_on(&self, topic: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl ChannelLink for MemoryLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        self.cell.get()
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, LinkError> {
        if !self.cell.get().is_connected() {
            return Err(LinkError::Unavailable(self.id));
        }
        if self.fail_publishes.load(Ordering::Acquire) {
            return Err(LinkError::Publish {
                link: self.id,
                reason: "request queue full".to_string(),
            });
        }
        let id = self.cell.next_message_id();
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Published {
                id,
                topic: topic.to_string(),
                payload: String::from_utf8_lossy(payload).into_owned(),
                qos,
                retain,
            });
        Ok(id)
    }

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), LinkError> {
        if !self.cell.get().is_connected() {
            return Err(LinkError::Unavailable(self.id));
        }
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((filter.to_string(), qos));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_link_refuses_without_queueing() {
        let link = MemoryLink::new(LinkId::Local);
        let err = link
            .publish("t", b"ON", QoS::AtLeastOnce, true)
            .unwrap_err();
        assert!(matches!(err, LinkError::Unavailable(LinkId::Local)));

        link.set_state(ConnectionState::Connected);
        assert!(link.published().is_empty(), "nothing was queued");
    }

    #[test]
    fn message_ids_increase_per_link() {
        let link = MemoryLink::new(LinkId::Cloud);
        link.set_state(ConnectionState::Connected);
        let a = link.publish("t", b"1", QoS::AtMostOnce, false).unwrap();
        let b = link.publish("t", b"2", QoS::AtMostOnce, false).unwrap();
        assert!(b > a);
    }

    #[test]
    fn connection_cell_reports_previous_state() {
        let cell = ConnectionCell::new();
        assert_eq!(cell.set(ConnectionState::Connected), ConnectionState::Disconnected);
        assert_eq!(cell.set(ConnectionState::Connected), ConnectionState::Connected);
        assert_eq!(cell.set(ConnectionState::Disconnected), ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Disconnected);
    }
}
